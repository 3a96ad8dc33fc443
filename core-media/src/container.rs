//! Device container writers
//!
//! Songs are stored as RIFF/WAVE (written with hound), ringtones as AIFF.
//! Both carry 16-bit PCM with fixed header layouts so identical audio always
//! serializes to identical bytes.

use crate::decoder::PcmAudio;
use crate::error::{ConversionError, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

const BITS_PER_SAMPLE: u16 = 16;

/// Serialize as 16-bit little-endian PCM WAV.
pub fn write_wav(audio: &PcmAudio) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    };

    let mut out = Vec::with_capacity(44 + audio.samples.len() * 2);
    let mut writer = WavWriter::new(Cursor::new(&mut out), spec).map_err(wav_error)?;
    let mut samples = writer.get_i16_writer(audio.samples.len() as u32);
    for &sample in &audio.samples {
        samples.write_sample(sample);
    }
    samples.flush().map_err(wav_error)?;
    writer.finalize().map_err(wav_error)?;
    Ok(out)
}

fn wav_error(e: hound::Error) -> ConversionError {
    ConversionError::Internal(format!("WAV encoding failed: {}", e))
}

/// Serialize as 16-bit big-endian PCM AIFF.
pub fn write_aiff(audio: &PcmAudio) -> Vec<u8> {
    let data_len = (audio.samples.len() * 2) as u32;
    let comm_len = 18u32;
    let ssnd_len = 8 + data_len;
    let form_len = 4 + (8 + comm_len) + (8 + ssnd_len);

    let mut out = Vec::with_capacity(8 + form_len as usize);
    out.extend_from_slice(b"FORM");
    out.extend_from_slice(&form_len.to_be_bytes());
    out.extend_from_slice(b"AIFF");

    out.extend_from_slice(b"COMM");
    out.extend_from_slice(&comm_len.to_be_bytes());
    out.extend_from_slice(&audio.channels.to_be_bytes());
    out.extend_from_slice(&(audio.frames() as u32).to_be_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_be_bytes());
    out.extend_from_slice(&extended_sample_rate(audio.sample_rate));

    out.extend_from_slice(b"SSND");
    out.extend_from_slice(&ssnd_len.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // offset
    out.extend_from_slice(&0u32.to_be_bytes()); // block size
    for sample in &audio.samples {
        out.extend_from_slice(&sample.to_be_bytes());
    }
    out
}

/// Integer sample rate as an IEEE 754 80-bit extended float.
fn extended_sample_rate(rate: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    if rate == 0 {
        return out;
    }
    let shift = rate.leading_zeros();
    let exponent = (16_383 + 31 - shift) as u16;
    let mantissa = u64::from(rate) << (32 + shift);
    out[..2].copy_from_slice(&exponent.to_be_bytes());
    out[2..].copy_from_slice(&mantissa.to_be_bytes());
    out
}
