//! # Transcoding
//!
//! Turns the assembled audio of one request into the encoding the caller
//! asked for.
//!
//! ## Targets:
//! - **pcm**: raw 16-bit little-endian mono
//! - **wav**: the same samples inside a RIFF/WAVE container
//! - **mulaw**: 8-bit G.711 μ-law, 8 kHz unless a rate is requested
//!
//! [`transcode`] is a pure function. [`TranscodePool`] runs it on tokio's
//! blocking threads, with at most `workers` jobs at once, so large buffers
//! never stall the manager's event loop.

use crate::audio::{mulaw, processor};
use crate::error::{SynthError, SynthResult};
use crate::protocol::SampleFormat;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Telephony rate used for μ-law when no rate is requested.
pub const MULAW_DEFAULT_RATE: u32 = 8_000;

/// Output encodings the client can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Pcm,
    Wav,
    Mulaw,
}

impl OutputFormat {
    /// Name sent to the peer in the request frame.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Pcm => "pcm",
            OutputFormat::Wav => "wav",
            OutputFormat::Mulaw => "mulaw",
        }
    }

    /// File extension used when saving output.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Pcm => "pcm",
            OutputFormat::Wav => "wav",
            OutputFormat::Mulaw => "ulaw",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcm" | "pcm16" | "s16le" => Ok(OutputFormat::Pcm),
            "wav" | "wave" => Ok(OutputFormat::Wav),
            "mulaw" | "ulaw" | "mu-law" => Ok(OutputFormat::Mulaw),
            other => Err(SynthError::Config(format!(
                "Unsupported output format '{}' (expected pcm, wav or mulaw)",
                other
            ))),
        }
    }
}

/// How the assembled bytes are encoded, as announced by `meta` (or assumed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
}

/// What the caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscodeTarget {
    pub format: OutputFormat,
    /// Output rate; `None` keeps the source rate (8 kHz for μ-law)
    pub sample_rate: Option<u32>,
}

impl TranscodeTarget {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            sample_rate: None,
        }
    }

    /// Rate of the produced audio for a given source.
    pub fn output_rate(&self, source: &SourceFormat) -> u32 {
        match (self.sample_rate, self.format) {
            (Some(rate), _) => rate,
            (None, OutputFormat::Mulaw) => MULAW_DEFAULT_RATE,
            (None, _) => source.sample_rate,
        }
    }

    /// True when the source bytes are already in the target encoding.
    pub fn is_passthrough(&self, source: &SourceFormat) -> bool {
        self.format == OutputFormat::Pcm
            && source.sample_format == SampleFormat::S16
            && self.output_rate(source) == source.sample_rate
    }

    /// Whether this conversion is heavy enough to run off the event loop.
    pub fn needs_offload(&self, source: &SourceFormat) -> bool {
        !self.is_passthrough(source)
    }
}

/// Transcoded audio handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub sample_rate: u32,
}

/// Convert assembled source bytes into the target encoding.
///
/// ## Pipeline:
/// 1. Decode s16/f32 little-endian into 16-bit samples
/// 2. Resample if the output rate differs from the source rate
/// 3. Encode: raw PCM, WAV container, or μ-law bytes
///
/// The same inputs always give byte-identical output.
pub fn transcode(
    data: Vec<u8>,
    source: SourceFormat,
    target: TranscodeTarget,
) -> SynthResult<EncodedAudio> {
    let output_rate = target.output_rate(&source);

    if target.is_passthrough(&source) {
        if data.len() % 2 != 0 {
            return Err(SynthError::Transcode(format!(
                "audio length {} is not a multiple of the 2-byte sample width",
                data.len()
            )));
        }
        return Ok(EncodedAudio {
            bytes: data,
            format: OutputFormat::Pcm,
            sample_rate: output_rate,
        });
    }

    let samples = processor::decode_samples(&data, source.sample_format)?;
    let samples = if output_rate != source.sample_rate {
        processor::resample_linear(&samples, source.sample_rate, output_rate)
    } else {
        samples
    };

    let bytes = match target.format {
        OutputFormat::Pcm => processor::encode_pcm_le(&samples),
        OutputFormat::Wav => processor::wav_from_pcm(samples, output_rate)?,
        OutputFormat::Mulaw => mulaw::encode(&samples),
    };

    Ok(EncodedAudio {
        bytes,
        format: target.format,
        sample_rate: output_rate,
    })
}

/// Bounded pool that runs transcode jobs on blocking threads.
#[derive(Debug, Clone)]
pub struct TranscodePool {
    permits: Arc<Semaphore>,
}

impl TranscodePool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Number of jobs that could start right now without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one transcode job, waiting for a free worker first.
    pub async fn run(
        &self,
        data: Vec<u8>,
        source: SourceFormat,
        target: TranscodeTarget,
    ) -> SynthResult<EncodedAudio> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SynthError::Transcode("transcode pool is shut down".to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            transcode(data, source, target)
        })
        .await
        .map_err(|e| SynthError::Transcode(format!("transcode worker failed: {}", e)))?
    }
}
