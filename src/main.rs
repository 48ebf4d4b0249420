mod config;
mod control;
mod error;
mod probe;
mod record;
mod store;
mod tracker;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use simple_logger::SimpleLogger;

use crate::probe::HttpProbe;
use crate::store::{InitOutcome, RecordStore};
use crate::tracker::Tracker;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let cli = config::Cli::parse();

    // Load configuration
    let config = config::load_config(&cli)?;

    SimpleLogger::new()
        .with_level(config.level_filter()?)
        .init()
        .context("Failed to initialise logger")?;

    info!("Starting speedtrack");

    // Installed before any file or network work so an early Ctrl+C still
    // ends the loop cleanly.
    let (stop_handle, stop_signal) = control::stop_channel();
    if !cli.once {
        control::watch_interrupts(stop_handle).context("Failed to install Ctrl+C handler")?;
    }

    let store = RecordStore::new(&config.log_file);
    match store.ensure_initialized().await? {
        InitOutcome::Created => {
            println!("File {} successfully created.", store.path().display());
        }
        InitOutcome::AlreadyPresent => {
            println!("The file is already created");
            match store.count_records().await {
                Ok(count) => info!("Resuming with {} recorded attempts", count),
                Err(e) => warn!("Existing results log could not be read: {}", e),
            }
        }
    }

    let probe = HttpProbe::new(config.probe.clone())?;
    let mut tracker = Tracker::new(probe, store, Box::new(std::io::stdout()));

    if cli.once {
        let speed = tracker.measure_once().await?;
        tracker.report(speed);
        return Ok(());
    }

    tracker
        .run_tracking(config.interval(), stop_signal)
        .await
        .context("Tracking aborted: results log is not writable")?;

    Ok(())
}
