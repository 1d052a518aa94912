//! # Sample Processing
//!
//! Low-level sample conversions used by the transcoder:
//! - **Decoding**: raw little-endian bytes (s16 or f32) into 16-bit samples
//! - **Format conversion**: float ↔ 16-bit PCM
//! - **Resampling**: deterministic linear interpolation between sample rates
//! - **Containers**: RIFF/WAVE wrapping of 16-bit mono PCM
//!
//! Everything here is a pure function of its inputs, so the same buffer always
//! produces byte-identical output.

use crate::error::{SynthError, SynthResult};
use crate::protocol::SampleFormat;
use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;

/// Decode raw little-endian sample bytes into 16-bit signed samples.
///
/// ## Parameters:
/// - **data**: assembled audio bytes, mono
/// - **format**: sample encoding announced by the server
///
/// ## Errors:
/// A trailing partial sample means frames were lost or cut, and is reported
/// as a transcode error instead of being silently dropped.
pub fn decode_samples(data: &[u8], format: SampleFormat) -> SynthResult<Vec<i16>> {
    let width = format.width();
    if data.len() % width != 0 {
        return Err(SynthError::Transcode(format!(
            "audio length {} is not a multiple of the {}-byte sample width",
            data.len(),
            width
        )));
    }

    let count = data.len() / width;
    match format {
        SampleFormat::S16 => {
            let mut samples = vec![0i16; count];
            LittleEndian::read_i16_into(data, &mut samples);
            Ok(samples)
        }
        SampleFormat::F32 => {
            let mut floats = vec![0f32; count];
            LittleEndian::read_f32_into(data, &mut floats);
            Ok(float_to_pcm(&floats))
        }
    }
}

/// Encode 16-bit samples as raw little-endian bytes.
pub fn encode_pcm_le(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

/// Convert 32-bit float samples to 16-bit PCM.
///
/// ## Conversion:
/// Values are clamped to [-1.0, 1.0] first, then scaled by 32767 so that full
/// scale maps onto the symmetric 16-bit range. NaN becomes silence.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            if sample.is_nan() {
                return 0;
            }
            let scaled = sample.clamp(-1.0, 1.0) * 32767.0;
            scaled.round() as i16
        })
        .collect()
}

/// Resample mono 16-bit audio with linear interpolation.
///
/// ## Method:
/// Output sample `i` sits at source position `i * from / to`. The value is
/// interpolated between the two neighbouring source samples using integer
/// arithmetic only, so results never depend on floating point rounding and
/// are byte-identical across runs and platforms.
///
/// ## Output length:
/// `floor(len * to / from)`, at least 1 when the input is non-empty.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() || from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let from = from_rate as u64;
    let to = to_rate as u64;
    let out_len = ((samples.len() as u64 * to) / from).max(1) as usize;
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len as u64 {
        let position = i * from;
        let index = (position / to) as usize;
        let frac = (position % to) as i64;

        let a = samples[index.min(last)] as i64;
        let b = samples[(index + 1).min(last)] as i64;
        let value = a + ((b - a) * frac) / to as i64;
        out.push(value as i16);
    }

    out
}

/// Wrap mono 16-bit PCM samples in a RIFF/WAVE container.
pub fn wav_from_pcm(samples: Vec<i16>, sample_rate: u32) -> SynthResult<Vec<u8>> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let track = wav::BitDepth::Sixteen(samples);

    let mut cursor = Cursor::new(Vec::new());
    wav::write(header, &track, &mut cursor)
        .map_err(|e| SynthError::Transcode(format!("failed to write WAV container: {}", e)))?;

    Ok(cursor.into_inner())
}
