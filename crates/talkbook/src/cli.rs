use std::path::PathBuf;

use clap::{Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "talkbook", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Output queue size in seconds
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// Directory holding cached copies of book resources
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Directory where listening positions are kept
    #[arg(long)]
    pub bookmark_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List output devices and exit
    Devices,

    /// Play a book described by a JSON manifest
    Play {
        /// Manifest with `id`, `name` and `resources`
        manifest: PathBuf,

        /// Start at this speed instead of the saved one
        #[arg(long)]
        speed: Option<f32>,

        /// Pause after this many minutes of listening
        #[arg(long)]
        sleep_minutes: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_overrides() {
        let args = Args::try_parse_from([
            "talkbook",
            "--device",
            "USB",
            "play",
            "book.json",
            "--speed",
            "1.5",
        ])
        .unwrap();
        assert_eq!(args.device.as_deref(), Some("USB"));
        match args.cmd {
            Command::Play {
                manifest, speed, ..
            } => {
                assert_eq!(manifest, PathBuf::from("book.json"));
                assert_eq!(speed, Some(1.5));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
