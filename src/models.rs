use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message observed in an account's mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    pub date_received: DateTime<Utc>,
    pub labels: Vec<String>,
}

/// Kind of action a rule triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Label,
}

/// A declarative subject-substring predicate mapped to an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub subject_contains: String,
    #[serde(default = "default_action_kind")]
    pub action: ActionKind,
    pub label: String,
}

fn default_action_kind() -> ActionKind {
    ActionKind::Label
}

impl Rule {
    pub fn label(subject_contains: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            subject_contains: subject_contains.into(),
            action: ActionKind::Label,
            label: label.into(),
        }
    }

    /// The concrete action request this rule issues when it matches
    pub fn to_action(&self) -> Action {
        match self.action {
            ActionKind::Label => Action::Label(self.label.clone()),
        }
    }
}

/// An action request sent to a provider session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Apply the named label (created on demand by the provider)
    Label(String),
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Label(name) => write!(f, "label '{}'", name),
        }
    }
}
