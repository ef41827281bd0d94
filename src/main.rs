#![allow(clippy::uninlined_format_args)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use postal_resolver::infrastructure::config::AppConfig;
use postal_resolver::infrastructure::logging::{init_logging_with_config, log_system_info};
use postal_resolver::resolver::BatchRunner;

/// Resolve a list of postal codes against an interactive lookup page
#[derive(Parser, Debug)]
#[command(name = "postal-resolver", version, about)]
struct Cli {
    /// Input file with postal codes in the first column (.csv, .tsv, .xlsx, .xls, .ods)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output file (.csv or .tsv); defaults to result_<input>.csv next to the input
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Configuration file (TOML or JSON)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Worker pool size
    #[arg(long)]
    workers: Option<usize>,

    /// Attempts per key before it is recorded as SKIPPED
    #[arg(long)]
    max_retries: Option<u32>,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.resolver.max_workers = workers;
    }
    if let Some(max_retries) = cli.max_retries {
        config.resolver.max_retries = max_retries;
    }
    config.validate()?;

    init_logging_with_config(config.logging.clone())?;
    log_system_info();

    let runner = BatchRunner::from_config(config).context("Failed to set up the page driver")?;
    let job = runner.job();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Ctrl-C received, finishing in-flight keys before exiting");
                job.request_stop();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let summary = runner
        .run(&cli.input, cli.output.as_deref())
        .await
        .with_context(|| format!("Batch over {:?} failed", cli.input))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Run {}", summary.run_id);
        println!("  keys in input : {}", summary.total);
        println!("  resumed       : {}", summary.resumed);
        println!("  processed     : {}", summary.processed);
        println!("  skipped       : {}", summary.skipped);
        println!("  output        : {}", summary.output.display());
        println!("  elapsed       : {:.1}s", summary.elapsed.as_secs_f64());
        if summary.stopped {
            println!("  stopped early, rerun with the same output to resume");
        }
    }
    info!("Done");
    Ok(())
}
