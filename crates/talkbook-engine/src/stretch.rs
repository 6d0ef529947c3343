//! Time-stretch stage.
//!
//! Two steps, both operating on interleaved `f32`:
//! - WSOLA changes tempo by `speed / pitch` without touching the sample rate
//! - a Rubato sinc resampler applies `pitch` and the source -> device rate
//!   conversion in one pass (ratio `out_rate / in_rate / pitch`)
//!
//! Together the output plays `1 / speed` as long as the source at the
//! requested pitch, at the device rate.
//!
//! Every output frame carries the number of source frames it stands for, fixed
//! when the stage produced it. A speed change therefore never re-prices audio
//! that was already stretched.

use std::collections::VecDeque;
use std::f64::consts::PI;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{PlayerError, Result};

/// WSOLA analysis window length.
const WINDOW_SECONDS: f64 = 0.03;
/// Correlation is evaluated on every n-th frame of the overlap.
const CORRELATION_STRIDE: usize = 2;
/// Input frames per resampler call.
const RESAMPLE_CHUNK: usize = 1024;

/// Speed/pitch stage between the decoder and the output sink.
pub trait TimeStretch: Send {
    /// Effective for the next `put`.
    fn set_speed(&mut self, speed: f32);

    /// Effective for the next `put`.
    fn set_pitch(&mut self, pitch: f32) -> Result<()>;

    /// Feed interleaved source samples.
    fn put(&mut self, samples: &[f32]) -> Result<()>;

    /// Output frames ready to be taken.
    fn available_frames(&self) -> usize;

    /// Remove up to `max_frames` interleaved output frames, together with the
    /// source frames they represent.
    fn take(&mut self, max_frames: usize) -> (Vec<f32>, f64);

    /// End of input: make everything still buffered available.
    fn flush(&mut self) -> Result<()>;

    /// Drop all buffered input and output.
    fn clear(&mut self);
}

/// Source frames carried by buffered frames, in runs of equal weight.
#[derive(Debug, Default)]
struct Credits {
    runs: VecDeque<(usize, f64)>,
}

impl Credits {
    fn push(&mut self, frames: usize, per_frame: f64) {
        if frames == 0 {
            return;
        }
        match self.runs.back_mut() {
            Some((n, w)) if (*w - per_frame).abs() < 1e-12 => *n += frames,
            _ => self.runs.push_back((frames, per_frame)),
        }
    }

    /// Remove `frames` from the front; returns the source frames they carried.
    fn pop(&mut self, mut frames: usize) -> f64 {
        let mut total = 0.0;
        while frames > 0 {
            let Some((n, w)) = self.runs.front_mut() else {
                break;
            };
            let k = frames.min(*n);
            total += k as f64 * *w;
            *n -= k;
            frames -= k;
            if *n == 0 {
                self.runs.pop_front();
            }
        }
        total
    }

    /// Drop the last `frames`, moving what they carried onto the last kept one.
    fn truncate(&mut self, mut frames: usize) {
        let mut dropped = 0.0;
        while frames > 0 {
            let Some((n, w)) = self.runs.back_mut() else {
                break;
            };
            let k = frames.min(*n);
            dropped += k as f64 * *w;
            *n -= k;
            frames -= k;
            if *n == 0 {
                self.runs.pop_back();
            }
        }
        self.absorb(dropped);
    }

    /// Add `extra` source frames to the last buffered frame.
    fn absorb(&mut self, extra: f64) {
        if extra == 0.0 {
            return;
        }
        let Some((n, w)) = self.runs.back_mut() else {
            return;
        };
        let last = *w + extra;
        *n -= 1;
        if *n == 0 {
            self.runs.pop_back();
        }
        self.runs.push_back((1, last));
    }

    fn clear(&mut self) {
        self.runs.clear();
    }
}

/// Tempo change by waveform-similarity overlap-add.
struct Wsola {
    channels: usize,
    window: usize,
    hop: usize,
    search: usize,
    fade_in: Vec<f32>,
    fade_out: Vec<f32>,
    tempo: f64,
    input: Vec<f32>,
    /// Nominal start of the next analysis window, in frames into `input`.
    analysis: f64,
    /// Frame where the last chosen window naturally continues.
    natural: Option<usize>,
    /// Faded-out second half of the last chosen window.
    tail: Vec<f32>,
}

impl Wsola {
    fn new(channels: usize, rate: u32, tempo: f64) -> Self {
        let mut window = ((rate as f64 * WINDOW_SECONDS) as usize).max(16);
        window -= window % 2;
        let hop = window / 2;
        let hann: Vec<f32> = (0..window)
            .map(|n| (0.5 - 0.5 * (2.0 * PI * n as f64 / window as f64).cos()) as f32)
            .collect();
        Self {
            channels,
            window,
            hop,
            search: window / 4,
            fade_in: hann[..hop].to_vec(),
            fade_out: hann[hop..].to_vec(),
            tempo,
            input: Vec::new(),
            analysis: 0.0,
            natural: None,
            tail: Vec::with_capacity(hop * channels),
        }
    }

    fn passthrough(&self) -> bool {
        (self.tempo - 1.0).abs() < 1e-3
    }

    fn frames(&self) -> usize {
        self.input.len() / self.channels
    }

    /// Source frames behind each frame `process` emits at the current tempo.
    fn source_per_frame(&self) -> f64 {
        if self.passthrough() { 1.0 } else { self.tempo }
    }

    /// Frame at which unprocessed input resumes.
    fn resume_frame(&self) -> usize {
        self.natural
            .unwrap_or(self.analysis.floor() as usize)
            .min(self.frames())
    }

    fn set_tempo(&mut self, tempo: f64) {
        let was_passthrough = self.passthrough();
        self.tempo = tempo;
        if !was_passthrough && self.passthrough() {
            let start = self.resume_frame();
            self.input.drain(..start * self.channels);
            self.analysis = 0.0;
            self.natural = None;
            self.tail.clear();
        }
    }

    fn reset(&mut self) {
        self.input.clear();
        self.analysis = 0.0;
        self.natural = None;
        self.tail.clear();
    }

    fn process(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        if self.passthrough() {
            out.append(&mut self.input);
            out.extend_from_slice(samples);
            return;
        }
        self.input.extend_from_slice(samples);
        while self.step(out).is_some() {}
    }

    /// Emit one output hop. Returns the frames compacted away, or `None` when
    /// more input is needed.
    fn step(&mut self, out: &mut Vec<f32>) -> Option<usize> {
        let ch = self.channels;
        let nominal = self.analysis.round() as usize;
        let needed = match self.natural {
            Some(natural) => (nominal + self.search + self.window).max(natural + self.hop),
            None => nominal + self.window,
        };
        if self.frames() < needed {
            return None;
        }

        let chosen = match self.natural {
            Some(natural) => self.best_start(nominal, natural),
            None => nominal,
        };

        for f in 0..self.hop {
            for c in 0..ch {
                let x = self.input[(chosen + f) * ch + c];
                let v = if self.tail.is_empty() {
                    x
                } else {
                    self.tail[f * ch + c] + x * self.fade_in[f]
                };
                out.push(v);
            }
        }

        self.tail.clear();
        for f in 0..self.hop {
            for c in 0..ch {
                self.tail
                    .push(self.input[(chosen + self.hop + f) * ch + c] * self.fade_out[f]);
            }
        }
        self.natural = Some(chosen + self.hop);
        self.analysis += self.hop as f64 * self.tempo;
        Some(self.compact())
    }

    /// Window start near `nominal` whose head best matches the natural continuation.
    fn best_start(&self, nominal: usize, natural: usize) -> usize {
        let ch = self.channels;
        let lo = nominal.saturating_sub(self.search);
        let hi = nominal + self.search;
        let mut best = nominal;
        let mut best_score = f32::NEG_INFINITY;
        for start in lo..=hi {
            let mut corr = 0.0f32;
            let mut energy = 1e-9f32;
            for f in (0..self.hop).step_by(CORRELATION_STRIDE) {
                for c in 0..ch {
                    let a = self.input[(start + f) * ch + c];
                    let b = self.input[(natural + f) * ch + c];
                    corr += a * b;
                    energy += a * a;
                }
            }
            let score = corr / energy.sqrt();
            if score > best_score {
                best_score = score;
                best = start;
            }
        }
        best
    }

    /// Drop input no future window can reach.
    fn compact(&mut self) -> usize {
        let reachable = (self.analysis.floor() as usize).saturating_sub(self.search);
        let keep_from = match self.natural {
            Some(natural) => reachable.min(natural),
            None => reachable,
        }
        .min(self.frames());
        if keep_from > 0 {
            self.input.drain(..keep_from * self.channels);
            self.analysis -= keep_from as f64;
            self.natural = self.natural.map(|n| n - keep_from);
        }
        keep_from
    }

    /// Stretch what is left, padding with silence until the nominal position
    /// passes the end of the input. Returns the source frames emitted.
    fn flush(&mut self, out: &mut Vec<f32>) -> f64 {
        if self.passthrough() {
            let frames = self.frames();
            out.append(&mut self.input);
            return frames as f64;
        }
        let remaining = (self.frames() as f64 - self.analysis).max(0.0);
        let mut end = self.frames() as f64;
        let pad = (self.window + 2 * self.search) * self.channels;
        self.input.resize(self.input.len() + pad, 0.0);
        while self.analysis < end {
            match self.step(out) {
                Some(dropped) => end -= dropped as f64,
                None => break,
            }
        }
        self.reset();
        remaining
    }
}

/// Sinc resampler for pitch and device rate; passthrough at ratio 1.
struct PitchStage {
    channels: usize,
    ratio: f64,
    resampler: Option<Async<f32>>,
    pending: Vec<f32>,
    out_buf: Vec<f32>,
    /// Leading output frames still to drop (filter delay).
    delay_left: usize,
    in_frames: u64,
    out_frames: u64,
    /// Source frames behind `pending`.
    credits: Credits,
    /// Source frames of input whose output was swallowed by the filter delay.
    carry: f64,
}

impl PitchStage {
    fn new(channels: usize, ratio: f64) -> Result<Self> {
        let mut stage = Self {
            channels,
            ratio,
            resampler: None,
            pending: Vec::new(),
            out_buf: Vec::new(),
            delay_left: 0,
            in_frames: 0,
            out_frames: 0,
            credits: Credits::default(),
            carry: 0.0,
        };
        stage.rebuild()?;
        Ok(stage)
    }

    fn rebuild(&mut self) -> Result<()> {
        self.in_frames = 0;
        self.out_frames = 0;
        self.carry = 0.0;
        if (self.ratio - 1.0).abs() < 1e-6 {
            self.resampler = None;
            self.delay_left = 0;
            return Ok(());
        }

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let resampler = Async::<f32>::new_sinc(
            self.ratio,
            1.1,
            &params,
            RESAMPLE_CHUNK,
            self.channels,
            FixedAsync::Input,
        )
        .map_err(|e| PlayerError::Format(format!("resampler init error: {e}")))?;

        self.delay_left = resampler.output_delay();
        self.out_buf = vec![0.0; resampler.output_frames_max() * self.channels];
        self.resampler = Some(resampler);
        Ok(())
    }

    fn set_ratio(&mut self, ratio: f64) -> Result<()> {
        if (ratio - self.ratio).abs() < 1e-9 {
            return Ok(());
        }
        self.ratio = ratio;
        self.rebuild()
    }

    fn reset(&mut self) -> Result<()> {
        self.pending.clear();
        self.credits.clear();
        self.rebuild()
    }

    /// Resample `samples`, each frame standing for `per_frame` source frames.
    fn process(
        &mut self,
        samples: &[f32],
        per_frame: f64,
        out: &mut VecDeque<f32>,
        out_credits: &mut Credits,
    ) -> Result<()> {
        let frames = samples.len() / self.channels;
        if self.resampler.is_none() {
            // Input parked before the ratio returned to 1 goes out first.
            if !self.pending.is_empty() {
                let parked = self.pending.len() / self.channels;
                let credit = self.credits.pop(parked);
                out.extend(self.pending.drain(..));
                out_credits.push(parked, credit / parked as f64);
            }
            out.extend(samples.iter().copied());
            out_credits.push(frames, per_frame);
            return Ok(());
        }
        self.pending.extend_from_slice(samples);
        self.credits.push(frames, per_frame);
        let chunk_samples = RESAMPLE_CHUNK * self.channels;
        while self.pending.len() >= chunk_samples {
            let chunk: Vec<f32> = self.pending.drain(..chunk_samples).collect();
            let credit = self.credits.pop(RESAMPLE_CHUNK);
            self.run(&chunk, None, credit, out, out_credits)?;
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut VecDeque<f32>, out_credits: &mut Credits) -> Result<()> {
        if self.resampler.is_none() {
            return Ok(());
        }
        let pending_frames = self.pending.len() / self.channels;
        let credit = self.credits.pop(pending_frames);
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.resize(RESAMPLE_CHUNK * self.channels, 0.0);
        self.run(&chunk, Some(pending_frames), credit, out, out_credits)?;

        let expected = (self.in_frames as f64 * self.ratio).round() as u64;
        let silence = vec![0.0f32; RESAMPLE_CHUNK * self.channels];
        let mut rounds = 0;
        while self.out_frames < expected && rounds < 4 {
            self.run(&silence, Some(0), 0.0, out, out_credits)?;
            rounds += 1;
        }
        if self.out_frames > expected {
            let excess = (self.out_frames - expected) as usize;
            let keep = out.len().saturating_sub(excess * self.channels);
            out.truncate(keep);
            out_credits.truncate(excess);
        }
        out_credits.absorb(std::mem::take(&mut self.carry));
        self.rebuild()
    }

    fn run(
        &mut self,
        chunk: &[f32],
        partial: Option<usize>,
        credit: f64,
        out: &mut VecDeque<f32>,
        out_credits: &mut Credits,
    ) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        let channels = self.channels;
        let input = InterleavedSlice::new(chunk, channels, RESAMPLE_CHUNK)
            .map_err(|e| PlayerError::Format(format!("interleaved slice (input) error: {e}")))?;
        let capacity = self.out_buf.len() / channels;
        let mut output = InterleavedSlice::new_mut(&mut self.out_buf, channels, capacity)
            .map_err(|e| PlayerError::Format(format!("interleaved slice (output) error: {e}")))?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial,
        };
        let (_, produced) = resampler
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .map_err(|e| PlayerError::Format(format!("resampler process error: {e}")))?;

        self.in_frames += partial.unwrap_or(RESAMPLE_CHUNK) as u64;
        let skip = self.delay_left.min(produced);
        self.delay_left -= skip;
        let emitted = produced - skip;
        self.out_frames += emitted as u64;
        out.extend(self.out_buf[skip * channels..produced * channels].iter().copied());
        let credit = credit + std::mem::take(&mut self.carry);
        if emitted > 0 {
            out_credits.push(emitted, credit / emitted as f64);
        } else {
            self.carry = credit;
        }
        Ok(())
    }
}

/// [`TimeStretch`] built from WSOLA plus a sinc resampler.
pub struct WsolaStretch {
    channels: usize,
    in_rate: u32,
    out_rate: u32,
    speed: f32,
    pitch: f32,
    wsola: Wsola,
    resample: PitchStage,
    scratch: Vec<f32>,
    output: VecDeque<f32>,
    credits: Credits,
}

impl WsolaStretch {
    pub fn new(channels: usize, in_rate: u32, out_rate: u32, speed: f32, pitch: f32) -> Result<Self> {
        if channels == 0 || in_rate == 0 || out_rate == 0 {
            return Err(PlayerError::Format(format!(
                "invalid stretch format: {channels} channels, {in_rate} -> {out_rate} Hz"
            )));
        }
        let speed = sanitize(speed);
        let pitch = sanitize(pitch);
        Ok(Self {
            channels,
            in_rate,
            out_rate,
            speed,
            pitch,
            wsola: Wsola::new(channels, in_rate, speed as f64 / pitch as f64),
            resample: PitchStage::new(channels, resample_ratio(in_rate, out_rate, pitch))?,
            scratch: Vec::new(),
            output: VecDeque::new(),
            credits: Credits::default(),
        })
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }
}

impl TimeStretch for WsolaStretch {
    fn set_speed(&mut self, speed: f32) {
        self.speed = sanitize(speed);
        self.wsola.set_tempo(self.speed as f64 / self.pitch as f64);
    }

    fn set_pitch(&mut self, pitch: f32) -> Result<()> {
        self.pitch = sanitize(pitch);
        self.wsola.set_tempo(self.speed as f64 / self.pitch as f64);
        self.resample
            .set_ratio(resample_ratio(self.in_rate, self.out_rate, self.pitch))
    }

    fn put(&mut self, samples: &[f32]) -> Result<()> {
        self.scratch.clear();
        let per_frame = self.wsola.source_per_frame();
        self.wsola.process(samples, &mut self.scratch);
        self.resample
            .process(&self.scratch, per_frame, &mut self.output, &mut self.credits)
    }

    fn available_frames(&self) -> usize {
        self.output.len() / self.channels
    }

    fn take(&mut self, max_frames: usize) -> (Vec<f32>, f64) {
        let frames = self.available_frames().min(max_frames);
        let samples = self.output.drain(..frames * self.channels).collect();
        (samples, self.credits.pop(frames))
    }

    fn flush(&mut self) -> Result<()> {
        self.scratch.clear();
        let source = self.wsola.flush(&mut self.scratch);
        let frames = self.scratch.len() / self.channels;
        if frames == 0 {
            self.credits.absorb(source);
        } else {
            self.resample.process(
                &self.scratch,
                source / frames as f64,
                &mut self.output,
                &mut self.credits,
            )?;
        }
        self.resample.flush(&mut self.output, &mut self.credits)
    }

    fn clear(&mut self) {
        self.wsola.reset();
        if let Err(e) = self.resample.reset() {
            tracing::warn!("resampler reset failed: {e}");
        }
        self.scratch.clear();
        self.output.clear();
        self.credits.clear();
    }
}

fn sanitize(v: f32) -> f32 {
    if v.is_finite() && v > 0.0 { v } else { 1.0 }
}

fn resample_ratio(in_rate: u32, out_rate: u32, pitch: f32) -> f64 {
    out_rate as f64 / in_rate as f64 / pitch as f64
}
