//! Host configuration.
//!
//! An optional TOML file is layered over the engine defaults, then command-line
//! flags are layered over that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use talkbook_engine::{PlayerConfig, StreamConfig};

use crate::cli::Args;

const DEFAULT_BOOKMARK_DIR: &str = ".talkbook/bookmarks";

/// Configuration file schema; every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Output device by substring match.
    pub device: Option<String>,
    /// Output queue size in seconds.
    pub buffer_seconds: Option<f32>,
    /// Frames moved per playback iteration.
    pub chunk_frames: Option<usize>,
    /// Root of the local resource cache.
    pub cache_dir: Option<String>,
    /// Where listening positions are stored.
    pub bookmark_dir: Option<String>,
    /// Extensions played as plain audio.
    pub plain_extensions: Option<Vec<String>>,
    /// Extensions played through the cipher container.
    pub encrypted_extensions: Option<Vec<String>>,
    /// Four 32-bit words of the container key.
    pub container_key: Option<[u32; 4]>,
    pub speed_step: Option<f32>,
    pub volume_step: Option<f32>,
    pub min_volume: Option<f32>,
    pub max_volume: Option<f32>,
    /// Range reader settings.
    pub stream: Option<StreamSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamSection {
    pub chunk_size: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg =
            toml::from_str::<FileConfig>(&raw).with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Fully resolved host settings.
#[derive(Clone, Debug)]
pub struct HostConfig {
    pub player: PlayerConfig,
    pub bookmark_dir: PathBuf,
}

/// Layer `file` and then `args` over the engine defaults.
pub fn resolve(file: &FileConfig, args: &Args) -> HostConfig {
    let mut player = PlayerConfig::default();

    if let Some(v) = file.chunk_frames {
        player.chunk_frames = v.max(1);
    }
    if let Some(v) = args.buffer_seconds.or(file.buffer_seconds) {
        player.buffer_seconds = v;
    }
    if let Some(v) = file.speed_step {
        player.speed_step = v;
    }
    if let Some(v) = file.volume_step {
        player.volume_step = v;
    }
    if let Some(v) = file.min_volume {
        player.min_volume = v.clamp(0.0, 1.0);
    }
    if let Some(v) = file.max_volume {
        player.max_volume = v.clamp(player.min_volume, 1.0);
    }
    if let Some(v) = &file.plain_extensions {
        player.plain_extensions = v.clone();
    }
    if let Some(v) = &file.encrypted_extensions {
        player.encrypted_extensions = v.clone();
    }
    player.container_key = file.container_key;
    player.cache_dir = args
        .cache_dir
        .clone()
        .or_else(|| non_empty(file.cache_dir.as_deref()).map(PathBuf::from));
    player.default_device = normalize_device_name(args.device.clone().or_else(|| file.device.clone()));

    if let Some(stream) = &file.stream {
        player.stream = StreamConfig {
            chunk_size: stream.chunk_size.unwrap_or(player.stream.chunk_size).max(1),
            timeout: stream
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(player.stream.timeout),
            max_attempts: stream.max_attempts.unwrap_or(player.stream.max_attempts).max(1),
        };
    }

    let bookmark_dir = args
        .bookmark_dir
        .clone()
        .or_else(|| non_empty(file.bookmark_dir.as_deref()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BOOKMARK_DIR));

    HostConfig {
        player,
        bookmark_dir,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| non_empty(Some(&name)).map(str::to_string))
}
