//! Format conversion into device encodings

use crate::container::{write_aiff, write_wav};
use crate::decoder::{decode_limited, PcmAudio};
use crate::error::{ConversionError, Result};
use bridge_traits::MediaKind;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Device-ready payload produced by [`FormatConverter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPayload {
    pub kind: MediaKind,
    pub bytes: Bytes,
    /// Lowercase hex SHA-256 of `bytes`.
    pub fingerprint: String,
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: u16,
}

impl NormalizedPayload {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    pub fn extension(&self) -> &'static str {
        container_extension(self.kind)
    }

    /// Device storage path, derived from the fingerprint.
    pub fn locator(&self) -> String {
        locator_for(self.kind, &self.fingerprint)
    }
}

pub fn container_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Song => "wav",
        MediaKind::Ringtone => "aiff",
    }
}

pub fn locator_for(kind: MediaKind, fingerprint: &str) -> String {
    match kind {
        MediaKind::Song => {
            let shard = fingerprint.get(..2).unwrap_or(fingerprint);
            format!("Media/Music/{}/{}.wav", shard, fingerprint)
        }
        MediaKind::Ringtone => format!("Media/Ringtones/{}.aiff", fingerprint),
    }
}

/// Content fingerprint of normalized bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Transcodes source audio into the device encoding for a media kind.
///
/// Identical source bytes and kind always yield byte-identical output.
#[derive(Debug, Clone)]
pub struct FormatConverter {
    ringtone_max_duration: Duration,
}

impl FormatConverter {
    pub fn new(ringtone_max_duration: Duration) -> Self {
        Self {
            ringtone_max_duration,
        }
    }

    pub fn ringtone_max_duration(&self) -> Duration {
        self.ringtone_max_duration
    }

    /// Convert on the blocking pool.
    ///
    /// `file_name` is the submitted name of the source; only its extension
    /// is used, as a container hint.
    pub async fn convert(
        &self,
        payload: Bytes,
        file_name: Option<String>,
        kind: MediaKind,
    ) -> Result<NormalizedPayload> {
        let converter = self.clone();
        tokio::task::spawn_blocking(move || {
            converter.convert_blocking(&payload, file_name.as_deref(), kind)
        })
        .await
        .map_err(|e| ConversionError::Internal(e.to_string()))?
    }

    #[instrument(skip(self, payload), fields(len = payload.len(), kind = %kind))]
    pub fn convert_blocking(
        &self,
        payload: &[u8],
        file_name: Option<&str>,
        kind: MediaKind,
    ) -> Result<NormalizedPayload> {
        let extension = file_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        let limit = match kind {
            MediaKind::Ringtone => Some(self.ringtone_max_duration),
            MediaKind::Song => None,
        };
        let source = decode_limited(payload, extension.as_deref(), limit)?;
        let duration = source.duration();

        let (audio, bytes) = match kind {
            MediaKind::Song => {
                let audio = source.to_at_most_stereo();
                let bytes = write_wav(&audio)?;
                (audio, bytes)
            }
            MediaKind::Ringtone => {
                if duration > self.ringtone_max_duration {
                    debug!(
                        duration_ms = duration.as_millis() as u64,
                        "Ringtone source exceeds maximum length"
                    );
                    return Err(ConversionError::DurationExceeded {
                        actual: duration,
                        max: self.ringtone_max_duration,
                    });
                }
                let audio = source.to_mono();
                let bytes = write_aiff(&audio);
                (audio, bytes)
            }
        };

        let normalized = finish(kind, audio, duration, bytes);
        info!(
            fingerprint = %normalized.fingerprint,
            duration_ms = normalized.duration_ms(),
            size = normalized.bytes.len(),
            "Converted payload"
        );
        Ok(normalized)
    }
}

fn finish(kind: MediaKind, audio: PcmAudio, duration: Duration, bytes: Vec<u8>) -> NormalizedPayload {
    NormalizedPayload {
        kind,
        fingerprint: fingerprint(&bytes),
        bytes: Bytes::from(bytes),
        duration,
        sample_rate: audio.sample_rate,
        channels: audio.channels,
    }
}
