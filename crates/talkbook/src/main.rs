//! Talkbook: a terminal player for talking books.
//!
//! `talkbook play <manifest.json>` plays a book fragment by fragment, from the
//! local cache when a complete copy exists and over HTTP range requests
//! otherwise, and remembers the listening position between runs.
//! `talkbook devices` lists the available output devices.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use talkbook::cli::{Args, Command};
use talkbook::config::{FileConfig, resolve};
use talkbook::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,talkbook=info,talkbook_engine=info")
        }))
        .init();

    match &args.cmd {
        Command::Devices => runtime::list_devices(),
        Command::Play {
            manifest,
            speed,
            sleep_minutes,
        } => {
            let file = match &args.config {
                Some(path) => FileConfig::load(path)?,
                None => FileConfig::default(),
            };
            let config = resolve(&file, &args);
            let sleep = sleep_minutes.map(|m| Duration::from_secs(m * 60));
            runtime::run_play(config, manifest, *speed, sleep)
        }
    }
}
