use std::path::PathBuf;
use std::time::Duration;

/// Range-reader tuning for one fragment's byte stream.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Bytes requested per range fetch.
    pub chunk_size: usize,
    /// Timeout for one fetch attempt.
    pub timeout: Duration,
    /// Attempts per fill before the session is marked failed.
    pub max_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Engine-wide settings, constructed once and handed to the player.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Frames moved per playback-loop iteration (post-stretch).
    pub chunk_frames: usize,
    /// Output queue size in seconds.
    pub buffer_seconds: f32,
    /// Range reader settings.
    pub stream: StreamConfig,
    pub min_speed: f32,
    pub max_speed: f32,
    /// Increment used by `change_speed` callers such as the CLI.
    pub speed_step: f32,
    pub min_pitch: f32,
    pub max_pitch: f32,
    pub min_volume: f32,
    pub max_volume: f32,
    /// Increment used by `change_volume` callers such as the CLI.
    pub volume_step: f32,
    /// Root of the local cache; `Resource::local_path` is resolved against it.
    pub cache_dir: Option<PathBuf>,
    /// Extensions played as plain compressed audio.
    pub plain_extensions: Vec<String>,
    /// Extensions played through the block cipher container.
    pub encrypted_extensions: Vec<String>,
    /// Key for encrypted payloads.
    pub container_key: Option<[u32; 4]>,
    /// Output device used when the player is opened.
    pub default_device: Option<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 2048,
            buffer_seconds: 1.0,
            stream: StreamConfig::default(),
            min_speed: 0.5,
            max_speed: 3.0,
            speed_step: 0.1,
            min_pitch: 0.5,
            max_pitch: 2.0,
            min_volume: 0.0,
            max_volume: 1.0,
            volume_step: 0.05,
            cache_dir: None,
            plain_extensions: vec!["mp3".to_string()],
            encrypted_extensions: vec!["lkf".to_string()],
            container_key: None,
            default_device: None,
        }
    }
}

impl PlayerConfig {
    pub fn clamp_speed(&self, speed: f32) -> f32 {
        clamp_to_grid(speed, self.min_speed, self.max_speed, 1.0)
    }

    pub fn clamp_pitch(&self, pitch: f32) -> f32 {
        clamp_to_grid(pitch, self.min_pitch, self.max_pitch, 1.0)
    }

    pub fn clamp_volume(&self, volume: f32) -> f32 {
        clamp_to_grid(volume, self.min_volume, self.max_volume, self.max_volume)
    }
}

/// Round to hundredths and clamp; non-finite input falls back to `fallback`.
///
/// Rounding keeps repeated `+0.1` steps on exact values (1.0 -> 1.3, never 1.3000001).
fn clamp_to_grid(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    let value = if value.is_finite() { value } else { fallback };
    let rounded = (value * 100.0).round() / 100.0;
    rounded.clamp(min, max)
}
