//! # Wire Protocol and Framing
//!
//! Message types exchanged with the synthesis service over the WebSocket, and
//! the tagged frame type every inbound unit is turned into at the transport
//! boundary.
//!
//! ## Message Flow (per request):
//! - **Client → Server**: one JSON text frame ([`SynthesisRequest`])
//! - **Server → Client**:
//!   1. at most one `meta` text frame, before any audio
//!   2. zero or more binary frames of raw audio, in generation order
//!   3. exactly one `done` text frame, carrying an optional error
//!
//! An empty input short-circuits on the server: only
//! `{"type":"done","error":"empty text"}` comes back.

use crate::error::{SynthError, SynthResult};
use serde::{Deserialize, Serialize};

/// The single control message sent for each request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text to synthesize
    pub text: String,
    /// Voice identifier (e.g. `af_heart`)
    pub voice: String,
    /// Speed multiplier, 1.0 = normal
    pub speed: f32,
    /// Output encoding the caller asked for (`pcm`, `wav`, `mulaw`)
    pub format: String,
}

/// Sample encoding of the raw audio the server streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 32-bit little-endian float in [-1.0, 1.0]
    F32,
    /// 16-bit little-endian signed integer
    S16,
}

impl SampleFormat {
    /// Bytes per sample (mono).
    pub fn width(self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::S16 => 2,
        }
    }
}

/// Session metadata announced by the server before the first audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub sample_rate: u32,
    #[serde(default = "mono")]
    pub channels: u16,
    pub sample_format: SampleFormat,
}

fn mono() -> u16 {
    1
}

/// Informational timing signal. Not needed for correctness, only logged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    #[serde(default)]
    pub segment: Option<u32>,
    #[serde(default)]
    pub elapsed_ms: Option<f64>,
    #[serde(default)]
    pub audio_ms: Option<f64>,
}

/// Terminal frame of a request.
///
/// All numeric fields default to zero because the empty-text short circuit
/// sends nothing but `type` and `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneInfo {
    #[serde(default)]
    pub total_ms: f64,
    #[serde(default)]
    pub audio_ms: f64,
    #[serde(default)]
    pub segments: u32,
    #[serde(default)]
    pub rtf: f64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Typed control messages from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Sample rate and format for the audio that follows
    Meta(StreamMeta),
    /// Progress report while synthesis is running
    Progress(ProgressInfo),
    /// End of the current request, success or failure
    Done(DoneInfo),
}

impl ControlFrame {
    /// Parse a text frame. Anything that is not a known control message is a
    /// protocol error; there is no fallback to treating text as audio.
    pub fn parse(text: &str) -> SynthResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            SynthError::Protocol(format!("unrecognized control frame ({}): {}", e, preview(text)))
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlFrame::Meta(_) => "meta",
            ControlFrame::Progress(_) => "progress",
            ControlFrame::Done(_) => "done",
        }
    }
}

/// One unit received from the transport, already classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlFrame),
    Binary(Vec<u8>),
}

impl InboundFrame {
    /// Classify a text unit.
    pub fn from_text(text: &str) -> SynthResult<Self> {
        ControlFrame::parse(text).map(InboundFrame::Control)
    }
}

/// First few characters of a frame, for log messages.
fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    if text.len() <= LIMIT {
        return text.to_string();
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
