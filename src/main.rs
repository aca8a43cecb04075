use std::sync::{atomic::AtomicBool, Arc};

use aptcrawl::runner::{Runner, RunnerOptionsBuilder};
use clap::{Parser, Subcommand};
use log::debug;
use signal_hook::consts::{SIGINT, SIGTERM};

/// Paths and browser mode come from APTCRAWL_HOME, APTCRAWL_HEADLESS and IN_DOCKER.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Long-term repair plan board crawler", long_about = None)]
struct Args {
    #[command(subcommand)]
    phase: Phase,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Harvest the listing into output/metadata.csv
    Metadata,
    /// Visit every public post and download its attachments
    Crawl,
    /// Convert downloaded attachments into tables under output/parsed
    Parse,
    /// Run metadata, crawl and parse in sequence
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let options = RunnerOptionsBuilder::default_builder().build()?;
    debug!("starting {:?} with {:#?}", args.phase, options);

    let should_terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

    let runner = Runner::new(options, should_terminate);

    match args.phase {
        Phase::Metadata => {
            runner.run_metadata().await?;
        }
        Phase::Crawl => {
            runner.run_crawl().await?;
        }
        Phase::Parse => {
            runner.run_parse()?;
        }
        Phase::All => runner.run_all().await?,
    }

    if runner.terminated() {
        println!("Terminated, progress is checkpointed");
    }
    Ok(())
}
