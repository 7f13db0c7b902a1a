//! This file defines the ensemblist binary entry point.

use std::process::ExitCode;
use std::time::SystemTime;

use ensemblist::cache_root::CacheRoot;
use ensemblist::cli;
use ensemblist::error::{log_error, EnsembleError};
use ensemblist::metrics;
use ensemblist::pipeline::Pipeline;
use ensemblist::stats_cache::StatsCache;
use ensemblist::tracing;

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing();
    metrics::register_metrics();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log_error(&err, false);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &cli::CommandLineArgs) -> Result<(), EnsembleError> {
    let config = args.to_config()?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    if args.prune {
        let root = CacheRoot::open(&config.cache.root)?;
        let report = StatsCache::new(&root).prune(
            config.cache.max_age(),
            config.cache.size_limit,
            SystemTime::now(),
        )?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let evaluation = Pipeline::new(config).run().await?;
    println!("{}", serde_json::to_string_pretty(&evaluation.summary())?);
    if args.print_metrics {
        print!("{}", metrics::gather());
    }
    Ok(())
}
