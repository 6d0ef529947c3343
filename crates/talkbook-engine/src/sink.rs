//! Output sink contract consumed by the fragment.

use crate::codec::AudioFormat;
use crate::error::Result;

/// Full scale of the per-channel volume register.
pub const VOLUME_MAX: u16 = u16::MAX;

/// One open output stream, exclusively owned by the live fragment.
///
/// All methods take `&self`: control calls arrive from other threads while the
/// worker is parked inside [`OutputSink::write`].
pub trait OutputSink: Send + Sync {
    /// Rate the sink plays at; the stretch stage converts to it.
    fn sample_rate(&self) -> u32;

    /// Interleaved channel count accepted by `write`.
    fn channels(&self) -> usize;

    /// Queue interleaved samples, blocking while the device buffer is full.
    ///
    /// Returns early without error when `stop` discards the pending audio.
    fn write(&self, samples: &[f32]) -> Result<()>;

    /// Hold or resume output without discarding buffered audio.
    fn pause(&self, paused: bool);

    /// Drop buffered audio, abort an in-flight `write` and return to running.
    fn stop(&self);

    /// Block until everything written has been consumed or `stop` was called.
    fn drain(&self);

    /// Current `(left, right)` levels on the `0..=VOLUME_MAX` scale.
    fn volume(&self) -> (u16, u16);

    fn set_volume(&self, left: u16, right: u16);

    /// Move the stream to another device; `None` selects the host default.
    ///
    /// On failure the sink keeps playing on the previous device.
    fn set_output_device(&self, name: Option<&str>) -> Result<()>;

    /// Name of the device currently playing.
    fn device_name(&self) -> Option<String>;
}

/// Opens sinks for newly constructed fragments.
pub trait SinkFactory: Send + Sync {
    fn open(
        &self,
        format: &AudioFormat,
        device: Option<&str>,
        buffer_seconds: f32,
    ) -> Result<Box<dyn OutputSink>>;
}

/// Map a `[0, 1]` multiplier onto the volume register.
pub fn volume_to_level(volume: f32) -> u16 {
    let v = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
    (v * VOLUME_MAX as f32).round() as u16
}

/// Inverse of [`volume_to_level`].
pub fn level_to_volume(level: u16) -> f32 {
    level as f32 / VOLUME_MAX as f32
}
