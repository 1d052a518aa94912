//! G.711 μ-law companding.
//!
//! Each 16-bit sample becomes one byte: a sign bit, a 3-bit segment
//! (exponent) and a 4-bit step within the segment, with all bits inverted.
//! Decoding returns the midpoint of the quantization interval, so for samples
//! within the clip range the error is at most half a step, `4 << exponent`.

/// Largest magnitude that is encoded without clipping.
pub const CLIP: i32 = 32_635;

/// Added to the magnitude so that every segment starts on a power of two.
pub const BIAS: i32 = 0x84;

/// Compress one 16-bit sample into a μ-law byte.
pub fn encode_sample(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    let biased = magnitude.min(CLIP) + BIAS;
    // biased is in [0x84, 0x7FFF], so its highest set bit is 7..=14
    let exponent = (31 - (biased as u32).leading_zeros()) as i32 - 7;
    let mantissa = (biased >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Expand one μ-law byte back into a 16-bit sample.
pub fn decode_sample(byte: u8) -> i16 {
    let code = !byte;
    let exponent = ((code >> 4) & 0x07) as i32;
    let mantissa = (code & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if code & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Largest reconstruction error for a given μ-law byte, for in-range input.
pub fn max_error(byte: u8) -> i32 {
    let exponent = ((!byte >> 4) & 0x07) as i32;
    4 << exponent
}

pub fn encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_sample(s)).collect()
}

pub fn decode(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_sample(b)).collect()
}
