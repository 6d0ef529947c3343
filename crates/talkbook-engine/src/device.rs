//! CPAL output: device selection and the [`CpalSink`] implementation.
//!
//! The cpal stream lives on a dedicated device thread (streams are not `Send`
//! on every host). The real-time callback:
//! - refills a small local buffer from the shared queue without blocking
//! - applies basic channel mapping (mono<->stereo, best-effort otherwise)
//! - applies the per-channel volume and converts to the device sample format

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::codec::AudioFormat;
use crate::error::{PlayerError, Result};
use crate::queue::{PushOutcome, SharedAudio, calc_max_buffered_samples};
use crate::sink::{OutputSink, SinkFactory, VOLUME_MAX};

/// Frames pulled from the queue per callback refill.
const REFILL_MAX_FRAMES: usize = 1024;

/// Pick the first output device whose name contains `needle` (case-insensitive),
/// or the host default when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let devices = host
            .output_devices()
            .map_err(|e| PlayerError::Device(format!("no output devices: {e}")))?;
        for d in devices {
            if device_label(&d).is_some_and(|n| matches_device_name(&n, needle)) {
                return Ok(d);
            }
        }
        return Err(PlayerError::Device(format!("no output device matched: {needle}")));
    }

    host.default_output_device()
        .ok_or_else(|| PlayerError::Device("no default output device".to_string()))
}

/// Choose the best output config for a target sample rate.
///
/// Prefers the highest supported rate that is `<= target_rate`, then the
/// lowest rate above it, then the sample format with the best rank.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| PlayerError::Device(format!("query output configs: {e}")))?
        .collect();

    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;

    for range in ranges {
        let min = range.min_sample_rate();
        let max = range.max_sample_rate();
        let rate = pick_rate_for_range(min, max, target_rate);
        let below = target_rate.map(|t| rate <= t).unwrap_or(true);
        let format_rank = sample_format_rank(range.sample_format());
        let cfg = range.with_sample_rate(rate);
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, cfg));
        }
    }

    best.map(|b| b.3)
        .ok_or_else(|| PlayerError::Device("no supported output configs".to_string()))
}

/// Prefer a fixed buffer size if the device advertises one.
///
/// Returns `None` when the device only supports the default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 16_384;
            let chosen = if *max > MAX_FRAMES {
                if *min > MAX_FRAMES { *min } else { MAX_FRAMES }
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) if target < min => min,
        Some(target) if target > max => max,
        Some(target) => target,
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

fn device_label(device: &cpal::Device) -> Option<String> {
    device.description().ok().map(|d| d.name().to_string())
}

/// Output device metadata for the host's device listing.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub min_rate: u32,
    pub max_rate: u32,
}

/// Enumerate output devices on the default host.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().as_ref().and_then(device_label);
    let devices = host
        .output_devices()
        .map_err(|e| PlayerError::Device(format!("no output devices: {e}")))?;

    let mut out = Vec::new();
    for d in devices {
        let Some(name) = device_label(&d) else {
            continue;
        };
        let mut min_rate = u32::MAX;
        let mut max_rate = 0u32;
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
            }
        }
        if max_rate == 0 || max_rate < min_rate {
            match d.default_output_config() {
                Ok(cfg) => {
                    min_rate = cfg.sample_rate();
                    max_rate = min_rate;
                }
                Err(_) => {
                    tracing::warn!(device = %name, "skipping device without usable sample rates");
                    continue;
                }
            }
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

/// State shared between the sink handle and the real-time callback.
struct SinkControl {
    paused: AtomicBool,
    /// `left << 16 | right`.
    volume: AtomicU32,
    /// Bumped by `stop` so the callback drops its local buffer.
    flushes: AtomicU64,
    next_stream_id: AtomicU64,
    active_stream: AtomicU64,
}

impl SinkControl {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            volume: AtomicU32::new(pack_volume(VOLUME_MAX, VOLUME_MAX)),
            flushes: AtomicU64::new(0),
            next_stream_id: AtomicU64::new(0),
            active_stream: AtomicU64::new(0),
        }
    }

    fn levels(&self) -> (u16, u16) {
        unpack_volume(self.volume.load(Ordering::Relaxed))
    }

    fn gains(&self) -> (f32, f32) {
        let (l, r) = self.levels();
        (l as f32 / VOLUME_MAX as f32, r as f32 / VOLUME_MAX as f32)
    }
}

fn pack_volume(left: u16, right: u16) -> u32 {
    (left as u32) << 16 | right as u32
}

fn unpack_volume(packed: u32) -> (u16, u16) {
    ((packed >> 16) as u16, (packed & 0xffff) as u16)
}

enum DeviceCommand {
    Switch {
        name: Option<String>,
        reply: Sender<Result<String>>,
    },
}

/// [`OutputSink`] playing through cpal on a dedicated device thread.
pub struct CpalSink {
    queue: Arc<SharedAudio>,
    control: Arc<SinkControl>,
    sample_rate: u32,
    channels: usize,
    device_name: Mutex<Option<String>>,
    commands: Option<Sender<DeviceCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Open a stream on `device` (or the default) close to the format's rate.
    pub fn open(format: &AudioFormat, device: Option<&str>, buffer_seconds: f32) -> Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let control = Arc::new(SinkControl::new());

        let request = DeviceRequest {
            name: device.map(str::to_string),
            target_rate: format.sample_rate,
            channels: format.channels.max(1),
            buffer_seconds,
        };
        let thread_control = control.clone();
        let handle = thread::Builder::new()
            .name("talkbook-audio".to_string())
            .spawn(move || device_thread(request, thread_control, ready_tx, cmd_rx))
            .map_err(|e| PlayerError::Device(format!("spawn audio thread: {e}")))?;

        let (queue, sample_rate, name) = match ready_rx.recv() {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(PlayerError::Device("audio thread exited during setup".to_string()));
            }
        };

        tracing::info!(
            device = %name,
            rate_hz = sample_rate,
            source_rate_hz = format.sample_rate,
            channels = format.channels,
            "output opened"
        );

        Ok(Self {
            channels: queue.channels(),
            queue,
            control,
            sample_rate,
            device_name: Mutex::new(Some(name)),
            commands: Some(cmd_tx),
            thread: Some(handle),
        })
    }
}

impl OutputSink for CpalSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&self, samples: &[f32]) -> Result<()> {
        match self.queue.push_interleaved_blocking(samples) {
            PushOutcome::Complete | PushOutcome::Cleared => Ok(()),
            PushOutcome::Closed => Err(PlayerError::Device("output stream closed".to_string())),
        }
    }

    fn pause(&self, paused: bool) {
        self.control.paused.store(paused, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.control.flushes.fetch_add(1, Ordering::Relaxed);
        self.queue.clear();
        self.control.paused.store(false, Ordering::Relaxed);
    }

    fn drain(&self) {
        self.queue.wait_until_empty(Duration::from_millis(20));
    }

    fn volume(&self) -> (u16, u16) {
        self.control.levels()
    }

    fn set_volume(&self, left: u16, right: u16) {
        self.control
            .volume
            .store(pack_volume(left, right), Ordering::Relaxed);
    }

    fn set_output_device(&self, name: Option<&str>) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| PlayerError::Device("output stream closed".to_string()))?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        commands
            .send(DeviceCommand::Switch {
                name: name.map(str::to_string),
                reply: reply_tx,
            })
            .map_err(|_| PlayerError::Device("audio thread is gone".to_string()))?;
        let label = reply_rx
            .recv()
            .map_err(|_| PlayerError::Device("audio thread is gone".to_string()))??;
        tracing::info!(device = %label, "output device switched");
        *self.device_name.lock().unwrap_or_else(PoisonError::into_inner) = Some(label);
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        self.device_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.queue.close();
        self.commands.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::warn!("audio thread panicked");
            }
        }
    }
}

/// Factory handing out [`CpalSink`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpalSinkFactory;

impl SinkFactory for CpalSinkFactory {
    fn open(
        &self,
        format: &AudioFormat,
        device: Option<&str>,
        buffer_seconds: f32,
    ) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(CpalSink::open(format, device, buffer_seconds)?))
    }
}

struct DeviceRequest {
    name: Option<String>,
    target_rate: u32,
    channels: usize,
    buffer_seconds: f32,
}

type Opened = (Arc<SharedAudio>, u32, String);

/// Owns the cpal stream for the lifetime of one sink.
fn device_thread(
    request: DeviceRequest,
    control: Arc<SinkControl>,
    ready: Sender<Result<Opened>>,
    commands: Receiver<DeviceCommand>,
) {
    let host = cpal::default_host();
    let opened = (|| -> Result<(cpal::Stream, Arc<SharedAudio>, u32, String)> {
        let device = pick_device(&host, request.name.as_deref())?;
        let config = pick_output_config(&device, Some(request.target_rate))?;
        let rate = config.sample_rate();
        let queue = Arc::new(SharedAudio::new(
            request.channels,
            calc_max_buffered_samples(rate, request.channels, request.buffer_seconds),
        ));
        let stream = start_stream(&device, &config, &queue, &control)?;
        let label = device_label(&device).unwrap_or_else(|| "unknown".to_string());
        Ok((stream, queue, rate, label))
    })();

    let (mut stream, queue, rate) = match opened {
        Ok((stream, queue, rate, label)) => {
            let _ = ready.send(Ok((queue.clone(), rate, label)));
            (stream, queue, rate)
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::Switch { name, reply } => {
                let switched = pick_device(&host, name.as_deref()).and_then(|device| {
                    let config = pick_output_config(&device, Some(rate))?;
                    if config.sample_rate() != rate {
                        return Err(PlayerError::Device(format!(
                            "device does not support {rate} Hz"
                        )));
                    }
                    let new_stream = start_stream(&device, &config, &queue, &control)?;
                    let label = device_label(&device).unwrap_or_else(|| "unknown".to_string());
                    Ok((new_stream, label))
                });
                let result = match switched {
                    Ok((new_stream, label)) => {
                        stream = new_stream;
                        Ok(label)
                    }
                    Err(e) => {
                        tracing::warn!("output device switch failed, keeping current device: {e}");
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
        }
    }
    drop(stream);
}

fn start_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    queue: &Arc<SharedAudio>,
    control: &Arc<SinkControl>,
) -> Result<cpal::Stream> {
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = pick_buffer_size(config) {
        stream_config.buffer_size = buf;
    }
    let id = control.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;
    let stream = build_output_stream(
        device,
        &stream_config,
        config.sample_format(),
        queue,
        control,
        id,
    )?;
    stream
        .play()
        .map_err(|e| PlayerError::Device(format!("start output stream: {e}")))?;
    control.active_stream.store(id, Ordering::Relaxed);
    Ok(stream)
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SharedAudio>,
    control: &Arc<SinkControl>,
    id: u64,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, control, id),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, control, id),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, control, id),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, control, id),
        other => Err(PlayerError::Device(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SharedAudio>,
    control: &Arc<SinkControl>,
    id: u64,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = (config.channels as usize).max(1);
    let mut st = PlaybackState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
        flushes: control.flushes.load(Ordering::Relaxed),
    };

    let queue_cb = queue.clone();
    let control_cb = control.clone();
    let queue_err = queue.clone();
    let control_err = control.clone();

    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        if matches!(err, cpal::StreamError::DeviceNotAvailable)
            && control_err.active_stream.load(Ordering::Relaxed) == id
        {
            queue_err.close();
        }
    };

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
                let flushes = control_cb.flushes.load(Ordering::Relaxed);
                if flushes != st.flushes {
                    st.flushes = flushes;
                    st.src.clear();
                    st.pos = 0;
                }
                if control_cb.paused.load(Ordering::Relaxed) {
                    data.fill(silence);
                    return;
                }

                let (left, right) = control_cb.gains();
                let frames = data.len() / channels_out;
                for frame in 0..frames {
                    if st.pos >= st.src.len() {
                        st.pos = 0;
                        st.src.clear();
                        match queue_cb.pop_nonblocking(REFILL_MAX_FRAMES) {
                            Some(v) => st.src = v,
                            None => {
                                data[frame * channels_out..].fill(silence);
                                break;
                            }
                        }
                    }
                    for ch in 0..channels_out {
                        let gain = if ch == 1 { right } else { left };
                        let sample = next_sample_mapped_from_vec(&mut st, channels_out, ch) * gain;
                        data[frame * channels_out + ch] =
                            <T as cpal::Sample>::from_sample::<f32>(sample);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| PlayerError::Device(format!("build output stream: {e}")))?;

    Ok(stream)
}

/// Local buffer owned by the callback so it rarely touches the queue lock.
struct PlaybackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
    flushes: u64,
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped_from_vec(st: &mut PlaybackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &PlaybackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (1, 1) => get_src(0, st),
        (2, 2) => get_src(dst_ch.min(1), st),
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, 2) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(src_channels: usize, src: Vec<f32>) -> PlaybackState {
        PlaybackState {
            pos: 0,
            src_channels,
            src,
            flushes: 0,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn pick_rate_for_range_prefers_target_when_in_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
    }

    #[test]
    fn pick_rate_for_range_clamps_to_bounds() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn is_better_candidate_orders_by_below_rate_then_rank() {
        assert!(is_better_candidate(true, 48_000, 1, false, 48_000, 1));
        assert!(is_better_candidate(true, 96_000, 2, true, 48_000, 2));
        assert!(is_better_candidate(true, 48_000, 0, true, 48_000, 2));
    }

    #[test]
    fn volume_packs_both_channels() {
        let packed = pack_volume(0x1234, 0xfedc);
        assert_eq!(unpack_volume(packed), (0x1234, 0xfedc));
    }

    #[test]
    fn mono_source_is_duplicated_to_stereo() {
        let mut st = state(1, vec![0.25, -0.5]);
        let frame0 = [
            next_sample_mapped_from_vec(&mut st, 2, 0),
            next_sample_mapped_from_vec(&mut st, 2, 1),
        ];
        let frame1 = [
            next_sample_mapped_from_vec(&mut st, 2, 0),
            next_sample_mapped_from_vec(&mut st, 2, 1),
        ];
        assert_eq!(frame0, [0.25, 0.25]);
        assert_eq!(frame1, [-0.5, -0.5]);
        assert_eq!(next_sample_mapped_from_vec(&mut st, 2, 0), 0.0);
    }

    #[test]
    fn stereo_source_is_averaged_to_mono() {
        let mut st = state(2, vec![0.2, 0.4]);
        let v = next_sample_mapped_from_vec(&mut st, 1, 0);
        assert!((v - 0.3).abs() < 1e-6);
        assert_eq!(st.pos, 2);
    }
}
