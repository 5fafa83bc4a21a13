//! loopwatch: watches project artifact directories and streams classified
//! change events to WebSocket subscribers.

use clap::Parser;
use loopwatch_core::{StaticProjects, classify};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let command = args
        .command
        .unwrap_or_else(|| cli::Command::Daemon(cli::DaemonOpts::default()));

    match command {
        cli::Command::Daemon(opts) => {
            let filter = std::env::var("LOOPWATCH_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .init();

            tracing::info!("loopwatch daemon starting");

            let config = opts.resolve_config()?;
            let projects = StaticProjects::new(config.projects.clone());
            if projects.is_empty() {
                tracing::warn!("no projects configured; serving without watches");
            }
            loopwatch_daemon::daemon::run_daemon(config, &projects).await?;
        }
        cli::Command::Classify(opts) => {
            let path = if opts.path.is_absolute() {
                opts.path
            } else {
                opts.root.join(&opts.path)
            };
            println!("{}", classify(&opts.root, &path));
        }
    }

    Ok(())
}
