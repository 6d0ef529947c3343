//! Pull-style decode stage.
//!
//! Uses Symphonia to:
//! - probe the container behind a [`MediaSource`]
//! - decode one packet per call into interleaved `f32` samples
//! - seek to an exact frame, discarding the decoder's lead-in

use std::io;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::{Error as SymphoniaError, SeekErrorKind};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::error::{PlayerError, Result};

/// Consecutive undecodable packets tolerated before the stream is rejected.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 3;

/// Stream properties learned from the first decoded unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: usize,
    /// Bits per second, estimated from the first packet.
    pub bitrate: u32,
}

/// Decoder seam used by the fragment.
pub trait Codec: Send {
    /// Known once the first unit has been decoded.
    fn format(&self) -> Option<AudioFormat>;

    /// Decode one unit of interleaved samples; `None` at end of stream.
    fn decode(&mut self) -> Result<Option<Vec<f32>>>;

    /// Reposition so the next decoded sample is exactly `frame`.
    fn seek(&mut self, frame: u64) -> Result<()>;

    /// Exact frame count when the container reports it.
    fn total_frames(&self) -> Option<u64>;

    /// Size of the underlying payload in bytes.
    fn byte_len(&self) -> Option<u64>;
}

/// [`Codec`] backed by Symphonia's default probe and codec registry.
pub struct SymphoniaCodec {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    sample_rate: Option<u32>,
    total_frames: Option<u64>,
    byte_len: Option<u64>,
    format: Option<AudioFormat>,
    /// Frames still to drop after an accurate seek.
    skip_frames: u64,
    at_end: bool,
}

impl SymphoniaCodec {
    /// Probe `source` and prepare a decoder for its default track.
    pub fn open(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let byte_len = source.byte_len();
        let mss = MediaSourceStream::new(source, Default::default());

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| match e {
                SymphoniaError::IoError(ref io_err) if carries_player_error(io_err) => {
                    PlayerError::from_io(io_err)
                }
                other => PlayerError::Format(format!("probe failed: {other}")),
            })?;

        let format_reader = probed.format;
        let track = format_reader
            .default_track()
            .ok_or_else(|| PlayerError::Format("no default audio track".to_string()))?;
        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| PlayerError::Format(format!("unsupported codec: {e}")))?;

        tracing::debug!(
            codec = codec_name_from_params(&codec_params).unwrap_or("unknown"),
            rate = ?codec_params.sample_rate,
            frames = ?codec_params.n_frames,
            "codec opened"
        );

        Ok(Self {
            format_reader,
            decoder,
            track_id,
            time_base: codec_params.time_base,
            sample_rate: codec_params.sample_rate,
            total_frames: codec_params.n_frames,
            byte_len,
            format: None,
            skip_frames: 0,
            at_end: false,
        })
    }

    fn frames_to_ts(&self, frames: u64) -> u64 {
        match (self.time_base, self.sample_rate) {
            (Some(tb), Some(rate)) if rate > 0 => {
                let rate = rate as u64;
                let time = Time::new(frames / rate, (frames % rate) as f64 / rate as f64);
                tb.calc_timestamp(time)
            }
            _ => frames,
        }
    }

    fn ts_to_frames(&self, ts: u64) -> u64 {
        match (self.time_base, self.sample_rate) {
            (Some(tb), Some(rate)) if rate > 0 => {
                let time = tb.calc_time(ts);
                time.seconds * rate as u64 + (time.frac * rate as f64).round() as u64
            }
            _ => ts,
        }
    }
}

impl Codec for SymphoniaCodec {
    fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn decode(&mut self) -> Result<Option<Vec<f32>>> {
        if self.at_end {
            return Ok(None);
        }
        let mut decode_errors = 0u32;
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if is_end_of_stream(&e) => {
                    self.at_end = true;
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    tracing::debug!("decoder reset required");
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(map_symphonia_error(e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(msg)) => {
                    decode_errors += 1;
                    tracing::warn!(ts = packet.ts(), "skipping undecodable packet: {msg}");
                    if decode_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                        return Err(PlayerError::Format(format!(
                            "{decode_errors} consecutive decode errors: {msg}"
                        )));
                    }
                    continue;
                }
                Err(SymphoniaError::IoError(e)) if is_end_of_stream(&e) => {
                    self.at_end = true;
                    return Ok(None);
                }
                Err(e) => return Err(map_symphonia_error(e)),
            };
            decode_errors = 0;

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let channels = spec.channels.count().max(1);

            if self.format.is_none() {
                let bitrate = estimate_bitrate(packet.buf().len(), packet.dur(), spec.rate);
                self.format = Some(AudioFormat {
                    sample_rate: spec.rate,
                    channels,
                    bitrate,
                });
                if self.sample_rate.is_none() {
                    self.sample_rate = Some(spec.rate);
                }
            }

            let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            let mut samples = sample_buf.samples().to_vec();

            if self.skip_frames > 0 {
                let drop = (self.skip_frames as usize).min(frames);
                samples.drain(..drop * channels);
                self.skip_frames -= drop as u64;
                if samples.is_empty() {
                    continue;
                }
            }
            return Ok(Some(samples));
        }
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let ts = self.frames_to_ts(frame);
        let seeked = match self.format_reader.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts,
                track_id: self.track_id,
            },
        ) {
            Ok(seeked) => seeked,
            Err(SymphoniaError::SeekError(SeekErrorKind::OutOfRange)) => {
                self.decoder.reset();
                self.skip_frames = 0;
                self.at_end = true;
                return Ok(());
            }
            Err(SymphoniaError::SeekError(kind)) => {
                return Err(PlayerError::State(format!("seek to frame {frame} failed: {kind:?}")));
            }
            Err(e) => return Err(map_symphonia_error(e)),
        };

        self.decoder.reset();
        self.at_end = false;
        self.skip_frames = self.ts_to_frames(seeked.required_ts.saturating_sub(seeked.actual_ts));
        tracing::trace!(
            frame,
            required_ts = seeked.required_ts,
            actual_ts = seeked.actual_ts,
            skip = self.skip_frames,
            "codec seeked"
        );
        Ok(())
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn byte_len(&self) -> Option<u64> {
        self.byte_len
    }
}

fn carries_player_error(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.downcast_ref::<PlayerError>().is_some())
}

fn is_end_of_stream(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::UnexpectedEof && !carries_player_error(err)
}

fn map_symphonia_error(err: SymphoniaError) -> PlayerError {
    match err {
        SymphoniaError::IoError(e) => PlayerError::from_io(&e),
        SymphoniaError::DecodeError(msg) => PlayerError::Format(format!("decode error: {msg}")),
        SymphoniaError::Unsupported(what) => PlayerError::Format(format!("unsupported: {what}")),
        SymphoniaError::LimitError(what) => PlayerError::Format(format!("limit exceeded: {what}")),
        SymphoniaError::SeekError(kind) => PlayerError::State(format!("seek failed: {kind:?}")),
        other => PlayerError::Format(other.to_string()),
    }
}

/// Bits per second of one packet; zero when the packet carries no duration.
fn estimate_bitrate(packet_bytes: usize, packet_frames: u64, rate: u32) -> u32 {
    if packet_frames == 0 || rate == 0 {
        return 0;
    }
    let bits = packet_bytes as u128 * 8 * rate as u128 / packet_frames as u128;
    u32::try_from(bits).unwrap_or(u32::MAX)
}

/// Best-effort codec label used in logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}
