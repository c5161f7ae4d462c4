//! Collaborator seams and the messages that flow between pipeline stages.
//!
//! The pipeline never talks to a device, model, or engine directly. Capture,
//! recognition, generation, synthesis and playback are all behind the traits
//! below so they can be swapped (and faked in tests). Every blocking call is
//! made from `spawn_blocking`, so implementations are free to block.

use crate::audio::CaptureSink;
use crate::error::VoiceResult;
use crate::state::TurnId;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tempfile::TempPath;

/// One user utterance: pre-roll frames followed by every frame until voice ended.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Mono f32 PCM at `sample_rate`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// When voice_started was handled.
    pub started_at: DateTime<Utc>,
    /// How many leading frames came from the pre-roll ring.
    pub pre_roll_frames: usize,
    pub frames: usize,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.samples.len() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

/// Recognized text for one utterance. Never empty once it reaches a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub turn: TurnId,
    pub prompt: String,
    pub max_tokens: u32,
}

/// Output of the generation worker. Each request produces zero or more
/// fragments followed by one `End`, which is also sent after a generator
/// failure. A cancelled request stops without `End`.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    Fragment { turn: TurnId, text: String },
    End { turn: TurnId },
}

impl TokenEvent {
    pub fn turn(&self) -> TurnId {
        match self {
            TokenEvent::Fragment { turn, .. } | TokenEvent::End { turn } => *turn,
        }
    }
}

/// A trimmed, non-empty unit of text handed to synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub turn: TurnId,
    /// Position within the reply, from zero.
    pub index: u32,
    pub text: String,
}

/// Synthesized audio in whichever form the engine produced it.
#[derive(Debug)]
pub enum ClipData {
    /// Encoded container bytes (WAV, MP3, ...).
    Encoded(Vec<u8>),
    /// Audio file on disk, removed when the clip is dropped.
    File(TempPath),
    /// Nothing audible; plays for the given duration.
    Silence(Duration),
}

/// Synthesized audio for one sentence.
#[derive(Debug)]
pub struct AudioClip {
    pub turn: TurnId,
    pub sentence: u32,
    pub data: ClipData,
}

/// Microphone (or any other PCM producer).
pub trait AudioSource: Send {
    /// Begin delivering mono samples at the configured rate into `sink`.
    /// Must return promptly; delivery happens on the source's own thread.
    fn open(&mut self, sink: CaptureSink) -> VoiceResult<()>;

    /// Stop delivering. Idempotent.
    fn close(&mut self);
}

/// Speech recognizer. Empty or whitespace-only text means "nothing recognized".
pub trait Recognizer: Send + Sync {
    fn recognize(&self, utterance: &Utterance) -> VoiceResult<String>;
}

/// Lazily produced text fragments of one reply.
pub type FragmentStream<'a> = Box<dyn Iterator<Item = VoiceResult<String>> + Send + 'a>;

/// Streaming text generator.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str, max_tokens: u32) -> VoiceResult<FragmentStream<'_>>;
}

/// Text-to-speech engine.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str) -> VoiceResult<ClipData>;
}

/// A clip that has started playing.
pub trait PlaybackHandle: Send {
    fn is_finished(&self) -> bool;

    /// Halt immediately. Idempotent.
    fn stop(&mut self);
}

/// Audio output.
pub trait AudioSink: Send + Sync {
    /// Start playing `clip` and return without waiting for it to finish.
    fn play(&self, clip: &ClipData) -> VoiceResult<Box<dyn PlaybackHandle>>;
}
