//! Request bookkeeping: what callers submit, what they get back, and the
//! queues that keep both in FIFO order.

use crate::audio::transcode::{EncodedAudio, OutputFormat, TranscodeTarget};
use crate::config::RequestDefaults;
use crate::error::SynthResult;
use crate::protocol::SynthesisRequest;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

pub type RequestId = Uuid;

/// Engine voice for an OpenAI-style voice name; any other name is passed
/// through unchanged.
pub fn resolve_voice(voice: &str) -> &str {
    match voice {
        "alloy" => "am_v0adam",
        "ash" => "af_v0nicole",
        "coral" => "bf_v0emma",
        "echo" => "af_v0bella",
        "fable" => "af_sarah",
        "onyx" => "bm_george",
        "nova" => "bf_isabella",
        "sage" => "am_michael",
        "shimmer" => "af_sky",
        other => other,
    }
}

/// Per-request overrides; anything left `None` comes from configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisOptions {
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub format: Option<OutputFormat>,
    /// Output sample rate; defaults to the configured rate, else the source
    /// rate (8 kHz for μ-law)
    pub sample_rate: Option<u32>,
}

impl SynthesisOptions {
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }
}

/// Timing reported by the peer plus what the client measured itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisStats {
    /// Peer-side synthesis time
    pub total_ms: f64,
    /// Duration of the generated audio
    pub audio_ms: f64,
    pub segments: u32,
    /// Real-time factor (synthesis time / audio time)
    pub rtf: f64,
    /// Dispatch to first binary frame; `None` when no audio arrived
    pub time_to_first_audio: Option<Duration>,
    /// Dispatch to `done`
    pub wall_time: Duration,
}

/// Successful result of one `submit`.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub id: RequestId,
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub sample_rate: u32,
    pub stats: SynthesisStats,
}

impl SynthesizedAudio {
    pub(crate) fn new(id: RequestId, audio: EncodedAudio, stats: SynthesisStats) -> Self {
        Self {
            id,
            bytes: audio.bytes,
            format: audio.format,
            sample_rate: audio.sample_rate,
            stats,
        }
    }
}

pub(crate) type Responder = oneshot::Sender<SynthResult<SynthesizedAudio>>;

/// A submitted request waiting for dispatch.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub id: RequestId,
    pub wire: SynthesisRequest,
    pub target: TranscodeTarget,
    pub responder: Responder,
    pub submitted_at: Instant,
}

impl PendingRequest {
    pub fn new(
        text: String,
        options: SynthesisOptions,
        defaults: &RequestDefaults,
        responder: Responder,
    ) -> Self {
        let format = options.format.unwrap_or(defaults.format);
        let voice = options.voice.as_deref().unwrap_or(&defaults.voice);
        Self {
            id: Uuid::new_v4(),
            wire: SynthesisRequest {
                text,
                voice: resolve_voice(voice).to_string(),
                speed: options.speed.unwrap_or(defaults.speed),
                format: format.as_str().to_string(),
            },
            target: TranscodeTarget {
                format,
                sample_rate: options.sample_rate.or(defaults.sample_rate),
            },
            responder,
            submitted_at: Instant::now(),
        }
    }
}

/// A request that left the dispatcher, waiting for its turn to be resolved.
#[derive(Debug)]
pub(crate) struct Completion {
    pub id: RequestId,
    pub responder: Responder,
    pub format: OutputFormat,
    pub submitted_at: Instant,
    /// `None` while an offloaded transcode is still running
    pub outcome: Option<SynthResult<SynthesizedAudio>>,
}

/// Outcomes in dispatch order.
///
/// Callers are only ever resolved from the head, so a fast inline result can
/// never overtake a slower offloaded one that was dispatched earlier.
#[derive(Debug, Default)]
pub(crate) struct CompletionQueue {
    entries: VecDeque<Completion>,
}

impl CompletionQueue {
    pub fn push(
        &mut self,
        request: PendingRequest,
        outcome: Option<SynthResult<SynthesizedAudio>>,
    ) {
        self.entries.push_back(Completion {
            id: request.id,
            responder: request.responder,
            format: request.target.format,
            submitted_at: request.submitted_at,
            outcome,
        });
    }

    /// Fill in the outcome of an offloaded job. Returns false for unknown ids.
    pub fn fulfil(&mut self, id: RequestId, outcome: SynthResult<SynthesizedAudio>) -> bool {
        match self.entries.iter_mut().find(|c| c.id == id && c.outcome.is_none()) {
            Some(completion) => {
                completion.outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the head if its outcome is known.
    pub fn pop_ready(&mut self) -> Option<(Completion, SynthResult<SynthesizedAudio>)> {
        if self.entries.front()?.outcome.is_none() {
            return None;
        }
        let mut completion = self.entries.pop_front()?;
        let outcome = completion.outcome.take()?;
        Some((completion, outcome))
    }

    /// Remove every entry, ready or not. Used on close, where nothing may be
    /// resolved except with the close error.
    pub fn drain_all(&mut self) -> Vec<Completion> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::error::SynthError;

    type Outcome = oneshot::Receiver<SynthResult<SynthesizedAudio>>;

    fn pending(text: &str) -> (PendingRequest, Outcome) {
        let (tx, rx) = oneshot::channel();
        let defaults = ManagerConfig::default().defaults;
        (
            PendingRequest::new(text.to_string(), SynthesisOptions::default(), &defaults, tx),
            rx,
        )
    }

    fn audio(id: RequestId) -> SynthesizedAudio {
        SynthesizedAudio {
            id,
            bytes: vec![1, 2],
            format: OutputFormat::Pcm,
            sample_rate: 24_000,
            stats: SynthesisStats {
                total_ms: 0.0,
                audio_ms: 0.0,
                segments: 1,
                rtf: 0.0,
                time_to_first_audio: None,
                wall_time: Duration::ZERO,
            },
        }
    }

    #[test]
    fn defaults_fill_missing_options() {
        let (request, _rx) = pending("hello");
        assert_eq!(request.wire.voice, "af_heart");
        assert_eq!(request.wire.speed, 1.0);
        assert_eq!(request.wire.format, "wav");
        assert_eq!(request.target.format, OutputFormat::Wav);
        assert_eq!(request.target.sample_rate, None);
    }

    #[test]
    fn options_override_defaults() {
        let (tx, _rx) = oneshot::channel();
        let defaults = ManagerConfig::default().defaults;
        let options = SynthesisOptions::default()
            .voice("bf_emma")
            .speed(1.25)
            .format(OutputFormat::Mulaw)
            .sample_rate(16_000);

        let request = PendingRequest::new("hi".into(), options, &defaults, tx);
        assert_eq!(request.wire.voice, "bf_emma");
        assert_eq!(request.wire.format, "mulaw");
        assert_eq!(request.target.sample_rate, Some(16_000));
    }

    #[test]
    fn openai_voice_names_map_to_engine_voices() {
        assert_eq!(resolve_voice("nova"), "bf_isabella");
        assert_eq!(resolve_voice("alloy"), "am_v0adam");
        assert_eq!(resolve_voice("af_heart"), "af_heart");

        let (tx, _rx) = oneshot::channel();
        let defaults = ManagerConfig::default().defaults;
        let options = SynthesisOptions::default().voice("shimmer");
        let request = PendingRequest::new("hi".into(), options, &defaults, tx);
        assert_eq!(request.wire.voice, "af_sky");
    }

    #[test]
    fn configured_output_rate_applies_unless_overridden() {
        let mut defaults = ManagerConfig::default().defaults;
        defaults.sample_rate = Some(22_050);

        let (tx, _rx) = oneshot::channel();
        let request = PendingRequest::new("a".into(), SynthesisOptions::default(), &defaults, tx);
        assert_eq!(request.target.sample_rate, Some(22_050));

        let (tx, _rx) = oneshot::channel();
        let options = SynthesisOptions::default().sample_rate(8_000);
        let request = PendingRequest::new("b".into(), options, &defaults, tx);
        assert_eq!(request.target.sample_rate, Some(8_000));
    }

    #[test]
    fn head_blocks_until_its_outcome_arrives() {
        let mut queue = CompletionQueue::default();
        let (first, _rx1) = pending("first");
        let (second, _rx2) = pending("second");
        let first_id = first.id;
        let second_id = second.id;

        queue.push(first, None);
        queue.push(second, Some(Ok(audio(second_id))));

        // Second is ready but must wait behind first
        assert!(queue.pop_ready().is_none());

        assert!(queue.fulfil(first_id, Ok(audio(first_id))));
        let (head, _) = queue.pop_ready().unwrap();
        assert_eq!(head.id, first_id);
        let (next, _) = queue.pop_ready().unwrap();
        assert_eq!(next.id, second_id);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn fulfil_ignores_unknown_ids() {
        let mut queue = CompletionQueue::default();
        assert!(!queue.fulfil(Uuid::new_v4(), Err(SynthError::Closed)));
    }

    #[test]
    fn drain_all_takes_ready_and_pending_entries() {
        let mut queue = CompletionQueue::default();
        let (first, _rx1) = pending("first");
        let (second, _rx2) = pending("second");
        let second_id = second.id;
        queue.push(first, None);
        queue.push(second, Some(Ok(audio(second_id))));

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.len(), 0);
        assert!(queue.pop_ready().is_none());
    }
}
