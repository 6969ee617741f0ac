//! codemap-cache CLI entry point

use std::io::Write;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use codemap_cache::cli::Cli;
use codemap_cache::commands::{self, CommandContext};
use codemap_cache::{CacheConfig, CacheError, CacheFacade};

/// Ctrl-C arrived while work was in flight
#[derive(Debug, thiserror::Error)]
#[error("interrupted; in-flight clones and builds were marked failed")]
struct Interrupted;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    if e.downcast_ref::<Interrupted>().is_some() {
        return ExitCode::from(130);
    }
    match e.downcast_ref::<CacheError>() {
        Some(cache_error) => cache_error.exit_code(),
        None => ExitCode::FAILURE,
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CacheConfig::load(cli.config.as_deref())?;
    init_logging(&config.logging.level, cli.verbose);

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(run_async(cli, config))
}

/// Logs go to stderr so stdout carries only command output
fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("codemap_cache={}", level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run_async(cli: Cli, config: CacheConfig) -> anyhow::Result<()> {
    let facade = CacheFacade::open(config)?;
    // Reclassifies orphaned work while this process lingers.
    facade.spawn_sweeper();
    let ctx = CommandContext::from_cli(cli.format, cli.verbose);

    let work = async {
        let output = commands::run_command(&cli.command, &facade, &ctx).await?;
        print!("{}", output);
        let _ = std::io::stdout().flush();

        // Clones and builds launched here die with the process.
        if facade.has_background_work() {
            tracing::info!("Waiting for background work to finish (Ctrl-C to abandon)");
            facade.wait_for_background().await;
        }
        Ok::<(), CacheError>(())
    };

    tokio::select! {
        result = work => result.map_err(anyhow::Error::from),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            let report = facade.shutdown()?;
            tracing::warn!(
                clones = report.clones,
                builds = report.builds,
                updates = report.updates,
                "Interrupted"
            );
            Err(Interrupted.into())
        }
    }
}
