use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sz_cli::app::{build_finalizer, device_logs, open_database};
use sz_cli::commands::{ingest, recover, run, sample, status, tick};
use sz_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout().lock();
    match &cli.command {
        Some(Commands::Ingest { file }) => {
            let input = ingest::read_input(file.as_deref())?;
            let (db, config) = open_database(cli.config.as_deref())?;
            ingest::run(&mut stdout, device_logs(&db, &config), &input).await?;
        }
        Some(Commands::Tick) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            let finalizer = build_finalizer(&db, &config)?;
            tick::run(&mut stdout, &finalizer, Utc::now()).await?;
        }
        Some(Commands::Run) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            let finalizer = build_finalizer(&db, &config)?;
            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };
            let schedule = run::Schedule {
                tick: config.tick_interval(),
                housekeeping: config.recover_interval(),
                retention: config.journal_retention(),
            };
            run::run(&finalizer, schedule, shutdown).await?;
        }
        Some(Commands::Recover) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            let finalizer = build_finalizer(&db, &config)?;
            let failed = recover::run(&mut stdout, &finalizer).await?;
            if failed > 0 {
                anyhow::bail!("{failed} workflows are still pending");
            }
        }
        Some(Commands::Status) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config)?;
        }
        Some(Commands::Sample { devices }) => {
            sample::run(&mut stdout, *devices, Utc::now())?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
