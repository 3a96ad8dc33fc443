//! # Media Conversion
//!
//! Decodes submitted audio and re-encodes it into the containers the device
//! library accepts.
//!
//! - Songs: 16-bit PCM WAV, source sample rate, at most two channels
//! - Ringtones: 16-bit PCM AIFF, mono, bounded duration
//!
//! Output is content-addressed. The fingerprint of a [`NormalizedPayload`] is
//! the SHA-256 of its bytes and doubles as the device-side identity of the
//! record.

pub mod container;
pub mod converter;
pub mod decoder;
pub mod error;

pub use converter::{fingerprint, locator_for, FormatConverter, NormalizedPayload};
pub use decoder::PcmAudio;
pub use error::{ConversionError, Result};
