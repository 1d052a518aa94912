//! # Audio Reassembly and Transcoding
//!
//! Everything that happens to audio between the wire and the caller.
//!
//! ## Key Components:
//! - **Assembly Buffer**: collects the binary frames of the active request
//! - **Processor**: sample decoding, resampling, WAV container
//! - **μ-law**: G.711 companding for telephony output
//! - **Transcode**: target selection, the pure conversion, and the worker pool
//!
//! ## Source Audio:
//! - **Channels**: mono
//! - **Encoding**: little-endian `f32` or `s16`, announced by the `meta` frame
//! - **Sample Rate**: announced by `meta`, typically 24 kHz

pub mod buffer; // Per-request chunk accumulation
pub mod mulaw; // G.711 μ-law
pub mod processor; // Sample conversions
pub mod transcode; // Target encodings and offload pool
