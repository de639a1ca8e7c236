// ABOUTME: CLI entry point for pg-switchover
// ABOUTME: Parses commands and routes to the switchover engine

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pg_switchover::switchover::{changelog, cutover};
use pg_switchover::{postgres, scan_tables, CancellationToken, StandaloneGroup, Switchover};

#[derive(Parser)]
#[command(name = "pg-switchover")]
#[command(about = "Zero-downtime PostgreSQL switchover", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full switchover from source to destination
    Execute {
        /// Source database URL (the current authoritative database)
        #[arg(long, env = "SWITCHOVER_SOURCE_URL")]
        source: String,
        /// Destination database URL (the freshly provisioned database)
        #[arg(long, env = "SWITCHOVER_DEST_URL")]
        dest: String,
    },
    /// Install the change log and state tables and mark the switchover in progress
    Init {
        #[arg(long, env = "SWITCHOVER_SOURCE_URL")]
        source: String,
    },
    /// Print the current switchover state and change-log backlog
    Status {
        #[arg(long, env = "SWITCHOVER_SOURCE_URL")]
        source: String,
    },
    /// Remove capture triggers and return the state to idle
    Reset {
        #[arg(long, env = "SWITCHOVER_SOURCE_URL")]
        source: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log; default is info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Execute { source, dest } => {
            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping after current step");
                    ctrl_c_cancel.cancel();
                }
            });

            let group = Arc::new(StandaloneGroup::new());
            let switchover = Switchover::new(source, dest, group);
            switchover.execute(&cancel).await?;
            println!("Switchover complete: destination is now authoritative.");
            Ok(())
        }
        Commands::Init { source } => {
            let mut client = postgres::connect_with_retry(&source)
                .await
                .context("connect source")?;
            changelog::ensure_switchover_state(&client).await?;
            cutover::mark_in_progress(&mut client).await?;
            println!("Switchover marked in progress.");
            Ok(())
        }
        Commands::Status { source } => {
            let client = postgres::connect_with_retry(&source)
                .await
                .context("connect source")?;
            let state = cutover::read_state(&client).await?;
            let backlog: i64 = client
                .query_one("SELECT count(*) FROM change_log", &[])
                .await
                .map(|row| row.get(0))
                .unwrap_or(0);
            println!("State: {}", state);
            println!("Change-log backlog: {} rows", backlog);
            Ok(())
        }
        Commands::Reset { source } => {
            let mut client = postgres::connect_with_retry(&source)
                .await
                .context("connect source")?;
            let tables = scan_tables(&client).await?;
            changelog::disable_change_log(&tables, &client).await?;
            cutover::mark_idle(&mut client).await?;
            println!("Switchover reset: capture removed, state idle.");
            Ok(())
        }
    }
}
