use anyhow::Result;
use clap::Parser;
use mail_poller::cli::{Cli, Commands};
use mail_poller::config::Config;
use mail_poller::gmail::GmailSessionFactory;
use mail_poller::provider::SessionFactory;
use mail_poller::scheduler::Scheduler;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Exit with proper code on error
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        eprintln!("\nFor help, run: mail-poller --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Install default crypto provider for rustls
    // On non-Windows platforms, use aws-lc-rs; on Windows, use ring
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match &cli.command {
        Commands::Run => run_scheduler(&cli).await,
        Commands::InitConfig { output, force } => {
            let path = output.as_ref().unwrap_or(&cli.config);
            if path.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
            }
            Config::create_example(path).await?;
            println!("Wrote example configuration to {:?}", path);
            Ok(())
        }
        Commands::Check => check(&cli).await,
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_directive = if verbose {
        "mail_poller=debug,info"
    } else {
        "mail_poller=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_scheduler(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let scheduler = Scheduler::new(config, Arc::new(GmailSessionFactory))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    tracing::info!("Mail poller starting...");
    let result = scheduler.start(cancel.clone()).await;

    // Loops still running after an error observe this and unwind
    cancel.cancel();
    scheduler.stop().await;

    result?;
    tracing::info!("Mail poller stopped");
    Ok(())
}

async fn check(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let factory = GmailSessionFactory;

    let mut problems = 0;
    for account in &config.accounts {
        let status = if !account.enabled {
            "disabled".to_string()
        } else {
            match factory.create(account) {
                Ok(_) => "ok".to_string(),
                Err(e) => {
                    problems += 1;
                    e.to_string()
                }
            }
        };
        println!("{:<20} {:<8} {}", account.id, account.provider.to_string(), status);
    }

    println!(
        "\n{} account(s), {} rule(s), polling every {:?}",
        config.accounts.len(),
        config.poll.rules.len(),
        config.poll.interval()
    );

    if problems > 0 {
        anyhow::bail!("{} enabled account(s) have invalid credentials", problems);
    }
    Ok(())
}

/// Cancel the token on Ctrl-C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
