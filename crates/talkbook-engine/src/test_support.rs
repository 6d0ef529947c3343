//! Fakes shared by the engine's unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use talkbook_types::{FragmentEndReason, Resource};

use crate::codec::AudioFormat;
use crate::config::{PlayerConfig, StreamConfig};
use crate::error::{PlayerError, Result};
use crate::sink::{OutputSink, SinkFactory, VOLUME_MAX};
use crate::status::StatusObserver;
use crate::stream::{RangeTransport, TransportFactory};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Distinct, deterministic PCM value for every frame/channel pair.
pub(crate) fn ramp_sample(frame: u64, channel: usize) -> i16 {
    ((frame % 30_000) as i64 - 15_000 + channel as i64 * 3) as i16
}

/// 16-bit PCM WAV holding `frames` of [`ramp_sample`].
pub(crate) fn wav_bytes(rate: u32, channels: u16, frames: usize) -> Vec<u8> {
    let data_len = frames * channels as usize * 2;
    let mut out = Vec::with_capacity(44 + data_len);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&rate.to_le_bytes());
    out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
    out.extend_from_slice(&(channels * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    for frame in 0..frames as u64 {
        for ch in 0..channels as usize {
            out.extend_from_slice(&ramp_sample(frame, ch).to_le_bytes());
        }
    }
    out
}

/// Write a ramp WAV of `seconds` into `dir`.
pub(crate) fn write_wav(dir: &Path, name: &str, rate: u32, channels: u16, seconds: f64) -> PathBuf {
    let path = dir.join(name);
    let frames = (rate as f64 * seconds) as usize;
    std::fs::write(&path, wav_bytes(rate, channels, frames)).unwrap();
    path
}

/// Engine config tuned for fast tests on 8 kHz material.
pub(crate) fn test_config() -> PlayerConfig {
    PlayerConfig {
        chunk_frames: 400,
        buffer_seconds: 0.2,
        stream: StreamConfig {
            chunk_size: 16 * 1024,
            timeout: Duration::from_millis(200),
            max_attempts: 3,
        },
        plain_extensions: vec!["wav".to_string()],
        encrypted_extensions: vec!["lkf".to_string()],
        ..PlayerConfig::default()
    }
}

/// Injected behavior for the next fetch.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Fault {
    Ok,
    /// Fail without delivering bytes.
    Fail,
    /// Deliver `n` bytes, then fail.
    Partial(usize),
    Protocol,
    /// Deliver the bytes without reporting a total length.
    Unsized,
}

/// In-memory transport with a queue of injected faults.
pub(crate) struct ScriptedTransport {
    data: Arc<Vec<u8>>,
    handle: ScriptHandle,
}

/// Test-side view of a [`ScriptedTransport`] after it moved into a source.
#[derive(Clone, Default)]
pub(crate) struct ScriptHandle {
    faults: Arc<Mutex<VecDeque<Fault>>>,
    calls: Arc<AtomicUsize>,
    last_start: Arc<Mutex<Option<u64>>>,
}

impl ScriptHandle {
    pub(crate) fn push(&self, fault: Fault) {
        lock(&self.faults).push_back(fault);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_start(&self) -> Option<u64> {
        *lock(&self.last_start)
    }
}

impl ScriptedTransport {
    pub(crate) fn new(data: Vec<u8>) -> (Self, ScriptHandle) {
        let handle = ScriptHandle::default();
        (
            Self {
                data: Arc::new(data),
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl RangeTransport for ScriptedTransport {
    fn fetch(&self, start: u64, len: usize, out: &mut Vec<u8>) -> Result<Option<u64>> {
        self.handle.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.handle.last_start) = Some(start);
        let fault = lock(&self.handle.faults).pop_front().unwrap_or(Fault::Ok);

        let total = self.data.len() as u64;
        let begin = start.min(total) as usize;
        let end = (start.saturating_add(len as u64)).min(total) as usize;
        let slice = &self.data[begin..end];
        match fault {
            Fault::Ok => {
                out.extend_from_slice(slice);
                Ok(Some(total))
            }
            Fault::Fail => Err(PlayerError::TransientIo("injected failure".to_string())),
            Fault::Partial(n) => {
                out.extend_from_slice(&slice[..n.min(slice.len())]);
                Err(PlayerError::TransientIo("injected reset".to_string()))
            }
            Fault::Protocol => Err(PlayerError::Protocol("injected status 403".to_string())),
            Fault::Unsized => {
                out.extend_from_slice(slice);
                Ok(None)
            }
        }
    }
}

/// Serves registered payloads by remote URI.
#[derive(Default)]
pub(crate) struct MemoryTransports {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryTransports {
    pub(crate) fn insert(&self, uri: &str, data: Vec<u8>) {
        lock(&self.payloads).insert(uri.to_string(), data);
    }
}

impl TransportFactory for MemoryTransports {
    fn connect(&self, resource: &Resource, _config: &StreamConfig) -> Result<Box<dyn RangeTransport>> {
        let data = lock(&self.payloads)
            .get(&resource.remote_uri)
            .cloned()
            .ok_or_else(|| PlayerError::Protocol(format!("404 for {}", resource.remote_uri)))?;
        Ok(Box::new(ScriptedTransport::new(data).0))
    }
}

/// [`MemoryTransports`] whose sessions take `delay` to connect.
pub(crate) struct SlowTransports {
    pub inner: MemoryTransports,
    pub delay: Duration,
}

impl TransportFactory for SlowTransports {
    fn connect(&self, resource: &Resource, config: &StreamConfig) -> Result<Box<dyn RangeTransport>> {
        std::thread::sleep(self.delay);
        self.inner.connect(resource, config)
    }
}

/// Everything the fake sinks observed.
#[derive(Debug, Default)]
pub(crate) struct SinkLogState {
    pub open_attempts: Vec<Option<String>>,
    pub switches: Vec<Option<String>>,
    pub stops: usize,
    pub played_frames: u64,
    pub volume: (u16, u16),
    /// `(generation, first sample)` of every write.
    pub writes: Vec<(u64, f32)>,
    pub live: usize,
    pub max_live: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SinkLog {
    state: Mutex<SinkLogState>,
}

impl SinkLog {
    pub(crate) fn get(&self) -> MutexGuard<'_, SinkLogState> {
        lock(&self.state)
    }

    /// First sample of the earliest write in the most recent generation.
    pub(crate) fn first_sample_of_latest_generation(&self) -> Option<f32> {
        let st = self.get();
        let latest = st.writes.last()?.0;
        st.writes.iter().find(|(g, _)| *g == latest).map(|(_, s)| *s)
    }
}

struct ClockState {
    paused: bool,
    generation: u64,
    device: Option<String>,
}

/// Sink whose writes take exactly as long as the audio they carry.
pub(crate) struct ClockSink {
    rate: u32,
    channels: usize,
    missing: Vec<String>,
    log: Arc<SinkLog>,
    state: Mutex<ClockState>,
    cv: Condvar,
}

impl OutputSink for ClockSink {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&self, samples: &[f32]) -> Result<()> {
        let frames = samples.len() / self.channels;
        let generation = lock(&self.state).generation;
        self.log
            .get()
            .writes
            .push((generation, samples.first().copied().unwrap_or(0.0)));

        let total = Duration::from_secs_f64(frames as f64 / self.rate as f64);
        let mut played = Duration::ZERO;
        let mut last = Instant::now();
        loop {
            let st = lock(&self.state);
            let now = Instant::now();
            if !st.paused {
                let step = (now - last).min(total - played);
                played += step;
                self.log.get().played_frames += (step.as_secs_f64() * self.rate as f64) as u64;
            }
            last = now;
            if st.generation != generation || played >= total {
                return Ok(());
            }
            let wait = if st.paused {
                Duration::from_millis(5)
            } else {
                (total - played).min(Duration::from_millis(5))
            };
            let _ = self.cv.wait_timeout(st, wait);
        }
    }

    fn pause(&self, paused: bool) {
        lock(&self.state).paused = paused;
        self.cv.notify_all();
    }

    fn stop(&self) {
        {
            let mut st = lock(&self.state);
            st.generation += 1;
            st.paused = false;
        }
        self.log.get().stops += 1;
        self.cv.notify_all();
    }

    fn drain(&self) {}

    fn volume(&self) -> (u16, u16) {
        self.log.get().volume
    }

    fn set_volume(&self, left: u16, right: u16) {
        self.log.get().volume = (left, right);
    }

    fn set_output_device(&self, name: Option<&str>) -> Result<()> {
        if let Some(name) = name {
            if self.missing.iter().any(|m| m == name) {
                return Err(PlayerError::Device(format!("no output device matched: {name}")));
            }
        }
        lock(&self.state).device = name.map(str::to_string);
        self.log.get().switches.push(name.map(str::to_string));
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        lock(&self.state).device.clone()
    }
}

impl Drop for ClockSink {
    fn drop(&mut self) {
        self.log.get().live -= 1;
    }
}

/// Opens [`ClockSink`]s; devices listed in `missing` fail to open.
#[derive(Default)]
pub(crate) struct ClockSinkFactory {
    pub log: Arc<SinkLog>,
    /// Output rate; `None` plays at the source rate.
    pub rate: Option<u32>,
    pub missing: Vec<String>,
    /// Fail every open, including the default device.
    pub broken: bool,
}

impl SinkFactory for ClockSinkFactory {
    fn open(
        &self,
        format: &AudioFormat,
        device: Option<&str>,
        _buffer_seconds: f32,
    ) -> Result<Box<dyn OutputSink>> {
        self.log.get().open_attempts.push(device.map(str::to_string));
        if self.broken || device.is_some_and(|d| self.missing.iter().any(|m| m == d)) {
            return Err(PlayerError::Device(format!("cannot open {device:?}")));
        }
        {
            let mut log = self.log.get();
            log.live += 1;
            log.max_live = log.max_live.max(log.live);
            log.volume = (VOLUME_MAX, VOLUME_MAX);
        }
        Ok(Box::new(ClockSink {
            rate: self.rate.unwrap_or(format.sample_rate),
            channels: format.channels,
            missing: self.missing.clone(),
            log: self.log.clone(),
            state: Mutex::new(ClockState {
                paused: false,
                generation: 0,
                device: device.map(str::to_string),
            }),
            cv: Condvar::new(),
        }))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StatusEvent {
    Started {
        index: usize,
        count: usize,
        duration: Duration,
    },
    Ended {
        index: usize,
        reason: FragmentEndReason,
    },
}

/// Observer keeping every fragment boundary event.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<StatusEvent>>,
    elapsed_calls: AtomicUsize,
}

impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<StatusEvent> {
        lock(&self.events).clone()
    }

    pub(crate) fn elapsed_calls(&self) -> usize {
        self.elapsed_calls.load(Ordering::SeqCst)
    }
}

impl StatusObserver for RecordingObserver {
    fn fragment_started(&self, index: usize, count: usize, duration: Duration) {
        lock(&self.events).push(StatusEvent::Started {
            index,
            count,
            duration,
        });
    }

    fn elapsed(&self, _position: Duration) {
        self.elapsed_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn fragment_ended(&self, index: usize, reason: FragmentEndReason) {
        lock(&self.events).push(StatusEvent::Ended { index, reason });
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
