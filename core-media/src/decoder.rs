//! Source decoding
//!
//! Every supported container is demuxed and decoded through Symphonia into
//! interleaved 16-bit PCM. Decoding is fully deterministic, which is what
//! keeps the normalized output content-addressed.

use crate::error::{ConversionError, Result};
use std::io::Cursor;
use std::time::Duration;
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, instrument, warn};

/// Consecutive undecodable packets tolerated before the payload is declared corrupt.
const MAX_CONSECUTIVE_ERRORS: usize = 10;

/// Decoded audio, interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl PcmAudio {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    pub fn frames(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() as u64 / u64::from(self.channels)
    }

    /// Playback length derived from the frame count.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.frames() * 1_000 / u64::from(self.sample_rate))
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> PcmAudio {
        if self.channels <= 1 {
            return self.clone();
        }
        let width = usize::from(self.channels);
        let samples = self
            .samples
            .chunks_exact(width)
            .map(|frame| average(frame.iter().copied()))
            .collect();
        PcmAudio::new(self.sample_rate, 1, samples)
    }

    /// Fold more than two channels into a stereo pair.
    ///
    /// Even-indexed channels feed the left output, odd-indexed the right.
    /// Mono and stereo sources are returned unchanged.
    pub fn to_at_most_stereo(&self) -> PcmAudio {
        if self.channels <= 2 {
            return self.clone();
        }
        let width = usize::from(self.channels);
        let mut samples = Vec::with_capacity(self.frames() as usize * 2);
        for frame in self.samples.chunks_exact(width) {
            samples.push(average(frame.iter().step_by(2).copied()));
            samples.push(average(frame.iter().skip(1).step_by(2).copied()));
        }
        PcmAudio::new(self.sample_rate, 2, samples)
    }
}

fn average(values: impl Iterator<Item = i16>) -> i16 {
    let (sum, count) = values.fold((0i64, 0i64), |(sum, count), v| (sum + i64::from(v), count + 1));
    if count == 0 {
        0
    } else {
        (sum / count) as i16
    }
}

/// Decode `payload` completely.
///
/// `extension` is the source file extension, used only as a probe hint.
pub fn decode(payload: &[u8], extension: Option<&str>) -> Result<PcmAudio> {
    decode_limited(payload, extension, None)
}

/// Like [`decode`], but fails fast with `DurationExceeded` when the container
/// declares a length above `max_duration`. Sources that declare no length are
/// decoded in full; callers still check the decoded duration.
#[instrument(skip(payload), fields(len = payload.len()))]
pub fn decode_limited(
    payload: &[u8],
    extension: Option<&str>,
    max_duration: Option<Duration>,
) -> Result<PcmAudio> {
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let source = Box::new(Cursor::new(payload.to_vec())) as Box<dyn MediaSource>;
    let stream = MediaSourceStream::new(source, Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| match e {
            SymphoniaError::Unsupported(reason) => {
                ConversionError::UnsupportedFormat(reason.to_string())
            }
            other => ConversionError::CorruptPayload(format!("Failed to read container: {}", other)),
        })?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ConversionError::UnsupportedFormat("No audio track".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    if let (Some(max), Some(frames), Some(rate)) =
        (max_duration, track.codec_params.n_frames, sample_rate)
    {
        let declared = Duration::from_millis(frames * 1_000 / u64::from(rate.max(1)));
        if declared > max {
            debug!(
                declared_ms = declared.as_millis() as u64,
                "Container declares a length above the limit"
            );
            return Err(ConversionError::DurationExceeded {
                actual: declared,
                max,
            });
        }
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| match e {
            SymphoniaError::Unsupported(reason) => {
                ConversionError::UnsupportedFormat(reason.to_string())
            }
            other => ConversionError::CorruptPayload(format!("Failed to create decoder: {}", other)),
        })?;

    let mut samples: Vec<i16> = Vec::new();
    let mut channels: Option<u16> = None;
    let mut buffer: Option<(SampleBuffer<i16>, SignalSpec, usize)> = None;
    let mut consecutive_errors = 0;

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                debug!("Track list changed, stopping at current position");
                break;
            }
            Err(e) => {
                return Err(ConversionError::CorruptPayload(format!(
                    "Failed to read packet: {}",
                    e
                )))
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => {
                consecutive_errors = 0;
                decoded
            }
            Err(SymphoniaError::DecodeError(err)) => {
                consecutive_errors += 1;
                warn!(attempt = consecutive_errors, "Skipping undecodable packet: {}", err);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(ConversionError::CorruptPayload(format!(
                        "{} consecutive packets failed to decode",
                        MAX_CONSECUTIVE_ERRORS
                    )));
                }
                continue;
            }
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                return Err(ConversionError::CorruptPayload(format!(
                    "Failed to decode packet: {}",
                    e
                )))
            }
        };

        if decoded.frames() == 0 {
            continue;
        }

        let spec = *decoded.spec();
        let capacity = decoded.capacity();
        let reusable = matches!(&buffer, Some((_, s, c)) if *s == spec && *c >= capacity);
        if !reusable {
            buffer = Some((SampleBuffer::<i16>::new(capacity as u64, spec), spec, capacity));
        }
        if let Some((sample_buffer, _, _)) = buffer.as_mut() {
            sample_buffer.copy_interleaved_ref(decoded);
            samples.extend_from_slice(sample_buffer.samples());
        }

        channels = Some(spec.channels.count() as u16);
        sample_rate = Some(spec.rate);
    }

    let channels = channels.unwrap_or(0);
    let sample_rate = sample_rate.unwrap_or(0);
    if channels == 0 || sample_rate == 0 || samples.is_empty() {
        return Err(ConversionError::CorruptPayload(
            "Stream contains no audio frames".to_string(),
        ));
    }

    let audio = PcmAudio::new(sample_rate, channels, samples);
    debug!(
        sample_rate = audio.sample_rate,
        channels = audio.channels,
        frames = audio.frames(),
        "Decoded source audio"
    );
    Ok(audio)
}
