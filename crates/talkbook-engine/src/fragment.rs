//! One playable resource: codec -> time stretch -> output sink.
//!
//! The worker owns the loop in [`Fragment::run`]; every other method is a
//! control call that may arrive from any thread. Two locks guard the mutable
//! parts, always taken in this order:
//! - `decoder`: codec and stretch stage, held while producing a chunk
//! - `state`: pause/rewind flags, write accounting and the seek epoch
//!
//! Neither lock is held across [`OutputSink::write`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use symphonia::core::io::MediaSource;
use symphonia::core::probe::Hint;

use crate::codec::{AudioFormat, Codec, SymphoniaCodec};
use crate::context::PlayerContext;
use crate::error::{PlayerError, Result};
use crate::sink::{OutputSink, volume_to_level};
use crate::status::StatusObserver;
use crate::stretch::{TimeStretch, WsolaStretch};

/// Bound on one idle wait while paused.
const PAUSED_WAIT: Duration = Duration::from_millis(50);

/// Bytes per sample of the nominal 16-bit PCM timeline.
const NOMINAL_SAMPLE_BYTES: u64 = 2;

/// Playback parameters a fragment starts with.
#[derive(Clone, Debug)]
pub struct FragmentSettings {
    pub speed: f32,
    pub pitch: f32,
    /// Multiplier in `[0, 1]`.
    pub volume: f32,
    pub device: Option<String>,
}

impl Default for FragmentSettings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            volume: 1.0,
            device: None,
        }
    }
}

/// Why [`Fragment::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every decoded frame reached the sink.
    Finished,
    /// [`Fragment::stop`] was called.
    Stopped,
}

struct DecodeState {
    codec: Box<dyn Codec>,
    stretch: Box<dyn TimeStretch>,
    /// End of stream seen and the stretch stage flushed.
    flushed: bool,
    /// Unit decoded during construction, fed before anything else.
    pending_first: Option<Vec<f32>>,
}

struct ControlState {
    paused: bool,
    /// Audio queued before a seek may still be in the sink.
    pending_rewind: bool,
    /// Bumped by every seek; chunks taken under an older epoch are stale.
    epoch: u64,
    /// Source frames written so far (fractional under stretching).
    written_frames: f64,
    speed: f32,
    pitch: f32,
}

/// A live codec/stretch/sink chain for one playlist entry.
pub struct Fragment {
    index: usize,
    format: AudioFormat,
    duration: Duration,
    chunk_frames: usize,
    sink: Box<dyn OutputSink>,
    decoder: Mutex<DecodeState>,
    state: Mutex<ControlState>,
    wake: Condvar,
    playing: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Fragment {
    /// Probe `source` and build the chain.
    pub fn open(
        index: usize,
        source: Box<dyn MediaSource>,
        hint: Hint,
        ctx: &PlayerContext,
        settings: &FragmentSettings,
    ) -> Result<Self> {
        let codec = SymphoniaCodec::open(source, hint)?;
        Self::from_codec(index, Box::new(codec), ctx, settings)
    }

    /// Build the chain around an already opened codec.
    ///
    /// Decodes one unit to learn the stream format before the sink is opened.
    pub fn from_codec(
        index: usize,
        mut codec: Box<dyn Codec>,
        ctx: &PlayerContext,
        settings: &FragmentSettings,
    ) -> Result<Self> {
        let first = codec
            .decode()?
            .ok_or_else(|| PlayerError::Format("stream holds no decodable audio".to_string()))?;
        let format = codec
            .format()
            .ok_or_else(|| PlayerError::Format("stream format unknown".to_string()))?;
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(PlayerError::Format(format!(
                "unusable stream format: {} Hz, {} channels",
                format.sample_rate, format.channels
            )));
        }

        let sink = open_sink(ctx, &format, settings.device.as_deref())?;
        let stretch = WsolaStretch::new(
            format.channels,
            format.sample_rate,
            sink.sample_rate(),
            settings.speed,
            settings.pitch,
        )?;
        let level = volume_to_level(settings.volume);
        sink.set_volume(level, level);

        let duration = estimate_duration(&format, codec.total_frames(), codec.byte_len());
        tracing::info!(
            index,
            rate = format.sample_rate,
            channels = format.channels,
            bitrate = format.bitrate,
            duration_ms = duration.as_millis() as u64,
            device = ?sink.device_name(),
            "fragment opened"
        );

        Ok(Self {
            index,
            format,
            duration,
            chunk_frames: ctx.config.chunk_frames.max(1),
            sink,
            decoder: Mutex::new(DecodeState {
                codec,
                stretch: Box::new(stretch),
                flushed: false,
                pending_first: Some(first),
            }),
            state: Mutex::new(ControlState {
                paused: false,
                pending_rewind: false,
                epoch: 0,
                written_frames: 0.0,
                speed: settings.speed,
                pitch: settings.pitch,
            }),
            wake: Condvar::new(),
            playing: AtomicBool::new(true),
        })
    }

    /// Playback loop; blocks until the fragment ends or is stopped.
    pub fn run(&self, observer: &dyn StatusObserver) -> Result<RunOutcome> {
        while self.playing.load(Ordering::Acquire) {
            {
                let st = lock(&self.state);
                if st.paused {
                    let _ = self
                        .wake
                        .wait_timeout(st, PAUSED_WAIT)
                        .unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
            }

            let (chunk, source_frames, epoch) = {
                let mut dec = lock(&self.decoder);
                let Some((chunk, source_frames)) = self.next_chunk(&mut dec)? else {
                    break;
                };
                let epoch = lock(&self.state).epoch;
                (chunk, source_frames, epoch)
            };

            self.sink.write(&chunk)?;

            let position = {
                let mut st = lock(&self.state);
                if st.epoch != epoch {
                    tracing::trace!(index = self.index, "dropping chunk written across a seek");
                    if st.paused {
                        st.pending_rewind = true;
                    } else {
                        self.sink.stop();
                    }
                    continue;
                }
                st.written_frames += source_frames;
                self.frames_to_duration(st.written_frames)
            };
            observer.elapsed(position);
        }

        if !self.playing.load(Ordering::Acquire) {
            return Ok(RunOutcome::Stopped);
        }
        self.sink.drain();
        if self.playing.load(Ordering::Acquire) {
            tracing::debug!(index = self.index, "fragment finished");
            Ok(RunOutcome::Finished)
        } else {
            Ok(RunOutcome::Stopped)
        }
    }

    /// Decode until a full chunk is ready; `None` once everything was taken.
    /// The chunk comes with the source frames it represents.
    fn next_chunk(&self, dec: &mut DecodeState) -> Result<Option<(Vec<f32>, f64)>> {
        while dec.stretch.available_frames() < self.chunk_frames && !dec.flushed {
            if !self.playing.load(Ordering::Acquire) {
                return Ok(None);
            }
            let unit = match dec.pending_first.take() {
                Some(first) => Some(first),
                None => dec.codec.decode()?,
            };
            match unit {
                Some(samples) => dec.stretch.put(&samples)?,
                None => {
                    dec.stretch.flush()?;
                    dec.flushed = true;
                }
            }
        }
        if dec.stretch.available_frames() == 0 {
            return Ok(None);
        }
        Ok(Some(dec.stretch.take(self.chunk_frames)))
    }

    /// Pause or resume. Returns `false` when the state did not change.
    pub fn pause(&self, paused: bool) -> bool {
        let changed = {
            let mut st = lock(&self.state);
            self.apply_pause(&mut st, paused)
        };
        self.wake.notify_all();
        changed
    }

    fn apply_pause(&self, st: &mut ControlState, paused: bool) -> bool {
        if st.paused == paused {
            return false;
        }
        st.paused = paused;
        if st.pending_rewind {
            st.pending_rewind = false;
            self.sink.stop();
        } else {
            self.sink.pause(paused);
        }
        true
    }

    /// Reposition on the source timeline; returns once the codec has seeked.
    pub fn set_position(&self, target: Duration) -> Result<()> {
        let target_frame = (target.as_secs_f64() * self.format.sample_rate as f64).round() as u64;

        let mut dec = lock(&self.decoder);
        let was_paused = {
            let mut st = lock(&self.state);
            if st.written_frames.round() as u64 == target_frame {
                return Ok(());
            }
            let was_paused = st.paused;
            if !was_paused {
                st.paused = true;
                self.sink.pause(true);
            }
            st.pending_rewind = true;
            st.epoch += 1;
            was_paused
        };

        dec.stretch.clear();
        dec.pending_first = None;
        dec.flushed = false;
        let seeked = dec.codec.seek(target_frame);

        {
            let mut st = lock(&self.state);
            if seeked.is_ok() {
                st.written_frames = target_frame as f64;
            }
            if !was_paused {
                self.apply_pause(&mut st, false);
            }
        }
        drop(dec);
        self.wake.notify_all();

        tracing::debug!(index = self.index, target_ms = target.as_millis() as u64, "fragment seeked");
        seeked
    }

    /// Effective from the next chunk.
    pub fn set_speed(&self, speed: f32) {
        let mut dec = lock(&self.decoder);
        dec.stretch.set_speed(speed);
        lock(&self.state).speed = speed;
    }

    /// Effective from the next chunk.
    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        let mut dec = lock(&self.decoder);
        dec.stretch.set_pitch(pitch)?;
        lock(&self.state).pitch = pitch;
        Ok(())
    }

    /// Applied by the sink immediately.
    pub fn set_volume(&self, volume: f32) {
        let level = volume_to_level(volume);
        self.sink.set_volume(level, level);
    }

    /// Move output to another device; keeps the current one on failure.
    pub fn set_output_device(&self, name: Option<&str>) -> Result<()> {
        self.sink.set_output_device(name)
    }

    /// Make `run` return; unblocks a write parked in a paused sink.
    pub fn stop(&self) {
        self.playing.store(false, Ordering::Release);
        self.sink.stop();
        self.wake.notify_all();
    }

    pub fn position(&self) -> Duration {
        self.frames_to_duration(lock(&self.state).written_frames)
    }

    /// Nominal 16-bit PCM bytes represented by the audio written so far.
    pub fn bytes_written(&self) -> u64 {
        let frames = lock(&self.state).written_frames.max(0.0) as u64;
        frames * self.format.channels as u64 * NOMINAL_SAMPLE_BYTES
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn speed(&self) -> f32 {
        lock(&self.state).speed
    }

    pub fn pitch(&self) -> f32 {
        lock(&self.state).pitch
    }

    pub fn device_name(&self) -> Option<String> {
        self.sink.device_name()
    }

    fn frames_to_duration(&self, frames: f64) -> Duration {
        Duration::from_secs_f64(frames.max(0.0) / self.format.sample_rate as f64)
    }
}

/// Open on `device`, falling back once to the default device.
fn open_sink(
    ctx: &PlayerContext,
    format: &AudioFormat,
    device: Option<&str>,
) -> Result<Box<dyn OutputSink>> {
    let buffer_seconds = ctx.config.buffer_seconds;
    match ctx.sinks.open(format, device, buffer_seconds) {
        Ok(sink) => Ok(sink),
        Err(err) if device.is_some() => {
            tracing::warn!(device, "output device unavailable, using default: {err}");
            ctx.sinks.open(format, None, buffer_seconds)
        }
        Err(err) => Err(err),
    }
}

/// Exact when the container reports a frame count, else bytes over bitrate.
fn estimate_duration(format: &AudioFormat, total_frames: Option<u64>, byte_len: Option<u64>) -> Duration {
    if let Some(frames) = total_frames {
        return Duration::from_secs_f64(frames as f64 / format.sample_rate as f64);
    }
    match byte_len {
        Some(bytes) if format.bitrate > 0 => {
            Duration::from_secs_f64(bytes as f64 * 8.0 / format.bitrate as f64)
        }
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::test_support::{
        ClockSinkFactory, RecordingObserver, ramp_sample, test_config, wait_for, write_wav,
    };

    const RATE: u32 = 8_000;

    fn wav_hint() -> Hint {
        let mut hint = Hint::new();
        hint.with_extension("wav");
        hint
    }

    fn open_wav(
        dir: &std::path::Path,
        seconds: f64,
        sinks: Arc<ClockSinkFactory>,
        settings: &FragmentSettings,
    ) -> Result<Fragment> {
        let path = write_wav(dir, "frag.wav", RATE, 1, seconds);
        let ctx = PlayerContext::new(test_config()).with_sinks(sinks);
        Fragment::open(0, Box::new(File::open(path).unwrap()), wav_hint(), &ctx, settings)
    }

    fn spawn_run(fragment: Arc<Fragment>) -> thread::JoinHandle<Result<RunOutcome>> {
        thread::spawn(move || fragment.run(&RecordingObserver::default()))
    }

    #[test]
    fn open_learns_format_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let fragment = open_wav(dir.path(), 2.0, sinks, &FragmentSettings::default()).unwrap();

        assert_eq!(fragment.format().sample_rate, RATE);
        assert_eq!(fragment.format().channels, 1);
        assert_eq!(fragment.duration(), Duration::from_secs(2));
        assert_eq!(fragment.position(), Duration::ZERO);
    }

    #[test]
    fn garbage_payload_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.wav");
        std::fs::write(&path, vec![0x5a; 4096]).unwrap();
        let ctx = PlayerContext::new(test_config()).with_sinks(Arc::new(ClockSinkFactory::default()));

        let err = Fragment::open(
            0,
            Box::new(File::open(path).unwrap()),
            wav_hint(),
            &ctx,
            &FragmentSettings::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PlayerError::Format(_)), "{err:?}");
    }

    #[test]
    fn run_plays_to_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let fragment = open_wav(dir.path(), 0.5, sinks.clone(), &FragmentSettings::default()).unwrap();
        let observer = RecordingObserver::default();

        let started = Instant::now();
        let outcome = fragment.run(&observer).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(fragment.position(), Duration::from_millis(500));
        assert_eq!(fragment.bytes_written(), 4_000 * 2);
        assert!(elapsed >= Duration::from_millis(450), "{elapsed:?}");
        assert!(observer.elapsed_calls() >= 5);
        let played = sinks.log.get().played_frames;
        assert!((3_500..=4_000).contains(&played), "{played}");
    }

    #[test]
    fn set_position_is_exact_and_discards_stale_audio() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let fragment =
            Arc::new(open_wav(dir.path(), 3.0, sinks.clone(), &FragmentSettings::default()).unwrap());
        let worker = spawn_run(fragment.clone());

        assert!(wait_for(Duration::from_secs(2), || fragment.position() > Duration::from_millis(150)));
        fragment.set_position(Duration::from_secs(2)).unwrap();
        assert_eq!(fragment.position(), Duration::from_secs(2));
        assert!(!fragment.is_paused());

        thread::sleep(Duration::from_millis(150));
        let expected = ramp_sample(16_000, 0) as f32 / 32_768.0;
        let first = sinks.log.first_sample_of_latest_generation().unwrap();
        assert!((first - expected).abs() < 1e-3, "first {first} expected {expected}");
        assert!(fragment.position() >= Duration::from_secs(2));

        fragment.stop();
        assert_eq!(worker.join().unwrap().unwrap(), RunOutcome::Stopped);
    }

    #[test]
    fn set_position_to_current_offset_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let fragment = open_wav(dir.path(), 1.0, sinks.clone(), &FragmentSettings::default()).unwrap();

        fragment.set_position(Duration::ZERO).unwrap();
        assert_eq!(sinks.log.get().stops, 0);
        assert!(!fragment.is_paused());
    }

    #[test]
    fn seek_while_paused_rewinds_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let fragment = open_wav(dir.path(), 2.0, sinks.clone(), &FragmentSettings::default()).unwrap();

        assert!(fragment.pause(true));
        fragment.set_position(Duration::from_secs(1)).unwrap();
        assert!(fragment.is_paused());
        assert_eq!(sinks.log.get().stops, 0);

        assert!(fragment.pause(false));
        assert_eq!(sinks.log.get().stops, 1);
        assert!(!fragment.pause(false));
        assert_eq!(sinks.log.get().stops, 1);
    }

    #[test]
    fn pause_holds_position() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let fragment =
            Arc::new(open_wav(dir.path(), 3.0, sinks.clone(), &FragmentSettings::default()).unwrap());
        let worker = spawn_run(fragment.clone());

        assert!(wait_for(Duration::from_secs(2), || fragment.position() > Duration::ZERO));
        assert!(fragment.pause(true));
        assert!(!fragment.pause(true));
        thread::sleep(Duration::from_millis(120));
        let held = fragment.position();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fragment.position(), held);

        fragment.stop();
        assert_eq!(worker.join().unwrap().unwrap(), RunOutcome::Stopped);
    }

    #[test]
    fn stop_while_paused_unblocks_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let fragment =
            Arc::new(open_wav(dir.path(), 3.0, sinks, &FragmentSettings::default()).unwrap());
        let worker = spawn_run(fragment.clone());

        assert!(wait_for(Duration::from_secs(2), || fragment.position() > Duration::ZERO));
        fragment.pause(true);
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        fragment.stop();
        assert_eq!(worker.join().unwrap().unwrap(), RunOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn speed_scales_wall_clock_time() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let settings = FragmentSettings {
            speed: 2.0,
            ..FragmentSettings::default()
        };
        let fragment = open_wav(dir.path(), 1.0, sinks, &settings).unwrap();

        let started = Instant::now();
        assert_eq!(fragment.run(&RecordingObserver::default()).unwrap(), RunOutcome::Finished);
        let elapsed = started.elapsed();

        assert!(
            elapsed >= Duration::from_millis(400) && elapsed <= Duration::from_millis(750),
            "{elapsed:?}"
        );
        let position = fragment.position().as_secs_f64();
        assert!((position - 1.0).abs() < 0.1, "{position}");
    }

    #[test]
    fn position_lands_on_duration_after_a_speed_change() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let settings = FragmentSettings {
            speed: 1.5,
            ..FragmentSettings::default()
        };
        let fragment = Arc::new(open_wav(dir.path(), 1.0, sinks, &settings).unwrap());
        let worker = spawn_run(fragment.clone());

        assert!(wait_for(Duration::from_secs(2), || fragment.position() > Duration::from_millis(200)));
        fragment.set_speed(3.0);
        assert_eq!(worker.join().unwrap().unwrap(), RunOutcome::Finished);

        let position = fragment.position().as_secs_f64();
        assert!((position - 1.0).abs() < 0.005, "{position}");
    }

    #[test]
    fn missing_device_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory {
            missing: vec!["usb".to_string()],
            ..ClockSinkFactory::default()
        });
        let settings = FragmentSettings {
            device: Some("usb".to_string()),
            ..FragmentSettings::default()
        };
        let fragment = open_wav(dir.path(), 0.5, sinks.clone(), &settings).unwrap();

        assert_eq!(fragment.device_name(), None);
        assert_eq!(sinks.log.get().open_attempts, vec![Some("usb".to_string()), None]);
    }

    #[test]
    fn broken_output_is_a_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory {
            broken: true,
            ..ClockSinkFactory::default()
        });
        let err = open_wav(dir.path(), 0.5, sinks, &FragmentSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, PlayerError::Device(_)), "{err:?}");
    }

    #[test]
    fn failed_device_switch_keeps_current_device() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory {
            missing: vec!["missing-device".to_string()],
            ..ClockSinkFactory::default()
        });
        let settings = FragmentSettings {
            device: Some("speakers".to_string()),
            ..FragmentSettings::default()
        };
        let fragment = open_wav(dir.path(), 0.5, sinks.clone(), &settings).unwrap();

        assert!(fragment.set_output_device(Some("missing-device")).is_err());
        assert_eq!(fragment.device_name(), Some("speakers".to_string()));
        assert_eq!(fragment.run(&RecordingObserver::default()).unwrap(), RunOutcome::Finished);
    }

    #[test]
    fn volume_goes_to_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = Arc::new(ClockSinkFactory::default());
        let settings = FragmentSettings {
            volume: 0.5,
            ..FragmentSettings::default()
        };
        let fragment = open_wav(dir.path(), 0.5, sinks.clone(), &settings).unwrap();
        assert_eq!(sinks.log.get().volume, (volume_to_level(0.5), volume_to_level(0.5)));

        fragment.set_volume(0.0);
        assert_eq!(sinks.log.get().volume, (0, 0));
    }

    #[test]
    fn duration_falls_back_to_bitrate() {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 2,
            bitrate: 128_000,
        };
        assert_eq!(
            estimate_duration(&format, None, Some(160_000)),
            Duration::from_secs(10)
        );
        assert_eq!(
            estimate_duration(&format, Some(88_200), Some(160_000)),
            Duration::from_secs(2)
        );
        assert_eq!(estimate_duration(&format, None, None), Duration::ZERO);
    }
}
