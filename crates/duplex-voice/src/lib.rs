//! # Duplex Voice - turn-taking voice conversation with barge-in
//!
//! Listens on a microphone, decides when the user has finished speaking,
//! transcribes the utterance, streams a reply from a text generator, speaks it
//! sentence by sentence, and stops talking the moment the user starts again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Voice Pipeline                              │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌────────────────┐    │
//! │  │ Audio In  │ → │  Fanout  │ → │   VAD    │ → │ Utterance +    │    │
//! │  │  (cpal)   │   │          │ → │ (energy) │   │ Recognition    │    │
//! │  └───────────┘   └──────────┘   └────┬─────┘   └───────┬────────┘    │
//! │                                 barge-in          transcripts        │
//! │                                      ↓                 ↓             │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────────────────────────┐     │
//! │  │ Audio Out │ ← │ Synthesis│ ← │      Turn Orchestrator       │ ⇄ Generator
//! │  │  (rodio)  │   │ (Piper)  │   │ (sentences, cancellation)    │     │
//! │  └───────────┘   └──────────┘   └──────────────────────────────┘     │
//! │                     SharedState: IDLE → LISTENING ⇄ THINKING ⇄ SPEAKING
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod playback;
pub mod state;
pub mod stt;
pub mod synthesis;
pub mod tts;
pub mod utterance;
pub mod vad;

pub use audio::{AudioFanout, AudioFrame, CaptureSink, FrameAssembler, PreRollRing};
pub use backend::{
    AudioClip, AudioSink, AudioSource, ClipData, FragmentStream, GenerationRequest, Generator,
    PlaybackHandle, Recognizer, Sentence, Synthesizer, TokenEvent, Transcript, Utterance,
};
pub use capture::{list_devices, AudioDevices, CpalSource};
pub use config::VoiceConfig;
pub use error::{VoiceError, VoiceResult};
pub use llm::{EchoGenerator, OllamaGenerator};
pub use orchestrator::{SentenceSegmenter, TurnOrchestrator};
pub use pipeline::{Backends, PipelineHandle, VoicePipeline};
pub use playback::{NullSink, RodioSink};
pub use state::{BotState, SharedState, StateTransition, TurnId};
pub use stt::{HttpRecognizer, SilentRecognizer};
pub use tts::{PiperSynthesizer, SilenceSynthesizer};
pub use utterance::UtteranceBuffer;
pub use vad::{VadDetector, VadEvent};
