//! Subject-substring rule evaluation

use crate::models::{Action, Message, Rule};

/// A rule that matched a message, with the action it requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    pub action: Action,
}

/// Return every rule whose fragment occurs in the message subject.
///
/// Matching is case-insensitive substring containment. Matches come back in
/// rule declaration order and no rule shadows another.
pub fn evaluate<'a>(message: &Message, rules: &'a [Rule]) -> Vec<RuleMatch<'a>> {
    let subject = message.subject.to_lowercase();

    rules
        .iter()
        .filter(|rule| subject.contains(&rule.subject_contains.to_lowercase()))
        .map(|rule| RuleMatch {
            rule,
            action: rule.to_action(),
        })
        .collect()
}
