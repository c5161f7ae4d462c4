//! Configuration surface for the voice pipeline.
//!
//! Loaded with the `config` crate. Precedence: built-in defaults < TOML file
//! (`DUPLEX_CONFIG` path, default `config/duplex.toml`, optional) < environment
//! variables of the form `DUPLEX__SECTION__KEY` (e.g. `DUPLEX__VAD__SILENCE_MS=500`).

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file (extension resolved by the `config` crate).
pub const DEFAULT_CONFIG_PATH: &str = "config/duplex";

/// Audio capture format shared by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Duration of one frame in milliseconds (default: 20, i.e. 320 samples at 16kHz)
    pub frame_ms: u32,

    /// Audio retained before voice_started (default: 200ms)
    pub pre_roll_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 20,
            pre_roll_ms: 200,
        }
    }
}

impl AudioConfig {
    /// Samples per frame.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }

    /// Pre-roll ring capacity in frames (at least one).
    pub fn pre_roll_frames(&self) -> usize {
        frames_for(self.pre_roll_ms, self.frame_ms)
    }
}

/// Energy VAD tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// How long to listen to background noise before detecting (default: 800ms)
    pub calibration_ms: u32,

    /// Speech threshold = baseline energy x this factor (default: 2.0)
    pub threshold_factor: f32,

    /// Loud audio must persist this long before voice_started (default: 200ms)
    pub min_speech_ms: u32,

    /// Quiet time after speech before voice_ended (default: 400ms)
    pub silence_ms: u32,

    /// Longest utterance before a forced voice_ended (default: 30s)
    pub max_utterance_ms: u32,

    /// Frame read timeout while detecting (default: 100ms)
    pub poll_timeout_ms: u32,

    /// Consecutive empty one-second reads that abort calibration (default: 3)
    pub calibration_max_timeouts: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            calibration_ms: 800,
            threshold_factor: 2.0,
            min_speech_ms: 200,
            silence_ms: 400,
            max_utterance_ms: 30_000,
            poll_timeout_ms: 100,
            calibration_max_timeouts: 3,
        }
    }
}

/// Bounded channel capacities, one per stage boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Frames from the device callback; full means the frame is dropped (default: 100)
    pub capture: usize,
    /// Fanout copy for the VAD (default: 100)
    pub vad: usize,
    /// Fanout copy for the utterance buffer (default: 100)
    pub utterance: usize,
    /// voice_started / voice_ended events (default: 100)
    pub vad_events: usize,
    /// Finished utterances waiting for recognition (default: 4)
    pub utterances: usize,
    /// Recognized transcripts waiting for the orchestrator (default: 16)
    pub transcripts: usize,
    /// Prompts waiting for the generator (default: 4)
    pub generation_requests: usize,
    /// Streamed reply fragments (default: 256)
    pub tokens: usize,
    /// Sentences waiting for synthesis (default: 32)
    pub sentences: usize,
    /// Synthesized clips waiting for the speaker; full means the clip is dropped (default: 16)
    pub playback: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capture: 100,
            vad: 100,
            utterance: 100,
            vad_events: 100,
            utterances: 4,
            transcripts: 16,
            generation_requests: 4,
            tokens: 256,
            sentences: 32,
            playback: 16,
        }
    }
}

impl ChannelConfig {
    fn all(&self) -> [(&'static str, usize); 10] {
        [
            ("capture", self.capture),
            ("vad", self.vad),
            ("utterance", self.utterance),
            ("vad_events", self.vad_events),
            ("utterances", self.utterances),
            ("transcripts", self.transcripts),
            ("generation_requests", self.generation_requests),
            ("tokens", self.tokens),
            ("sentences", self.sentences),
            ("playback", self.playback),
        ]
    }
}

/// Reply generation (Ollama-compatible server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Cap on generated tokens per turn (default: 160)
    pub max_tokens: u32,

    /// Server root, `/api/generate` is appended (default: http://localhost:11434)
    pub base_url: String,

    /// Model tag (default: mistral:7b-instruct-q4_0)
    pub model: String,

    /// Sampling temperature (default: 0.3)
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 160,
            base_url: "http://localhost:11434".to_string(),
            model: "mistral:7b-instruct-q4_0".to_string(),
            temperature: 0.3,
        }
    }
}

/// Piper voice parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Piper executable, looked up on PATH (default: piper)
    pub piper_exe: String,
    /// Path to the `.onnx` voice model. Without it the silent synthesizer is used.
    pub piper_model: Option<String>,
    /// Speaker index for multi-speaker models (default: 0)
    pub speaker_id: u32,
    /// Speaking rate; larger is slower (default: 1.0)
    pub length_scale: f32,
    /// Expressiveness (default: 0.667)
    pub noise_scale: f32,
    /// Output volume, 1.0 = unchanged (default: 1.0)
    pub volume: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            piper_exe: "piper".to_string(),
            piper_model: None,
            speaker_id: 0,
            length_scale: 1.0,
            noise_scale: 0.667,
            volume: 1.0,
        }
    }
}

/// OpenAI-compatible transcription endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// API root, `/audio/transcriptions` is appended (default: https://api.openai.com/v1)
    pub base_url: String,
    /// Falls back to `STT_API_KEY`, then `OPENAI_API_KEY`. Without a key the
    /// silent recognizer is used.
    pub api_key: Option<String>,
    /// Transcription model (default: whisper-1)
    pub model: String,
    /// ISO-639-1 hint, `None` lets the server detect it (default: en)
    pub language: Option<String>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            language: Some("en".to_string()),
        }
    }
}

/// Worker cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Orchestrator loop period (default: 10ms)
    pub tick_ms: u64,
    /// Inbound channel wait for every other worker (default: 100ms)
    pub worker_poll_ms: u64,
    /// Cancel check interval while a clip plays (default: 5ms)
    pub playback_poll_ms: u64,
    /// Bound on joining workers at shutdown (default: 2s)
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            worker_poll_ms: 100,
            playback_poll_ms: 5,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl RuntimeConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    pub fn playback_poll(&self) -> Duration {
        Duration::from_millis(self.playback_poll_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub channels: ChannelConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
    pub recognition: RecognitionConfig,
    pub runtime: RuntimeConfig,
}

impl VoiceConfig {
    /// Load config from file and environment. Precedence: env `DUPLEX__*` > file at
    /// `DUPLEX_CONFIG` (or `config/duplex.toml`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("DUPLEX_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("DUPLEX")
                    .separator("__")
                    .try_parsing(true),
            );

        let built: VoiceConfig = builder.build()?.try_deserialize()?;
        built.validate()?;
        Ok(built)
    }

    /// Load from an explicit TOML file, without environment overrides.
    pub fn from_file(path: &Path) -> VoiceResult<Self> {
        let built: VoiceConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        built.validate()?;
        Ok(built)
    }

    /// Parse from TOML text (used by tests and embedders).
    pub fn from_toml_str(toml: &str) -> VoiceResult<Self> {
        let built: VoiceConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        built.validate()?;
        Ok(built)
    }

    /// Reject values that would stall or divide by zero somewhere downstream.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.audio.sample_rate == 0 {
            return Err(VoiceError::Config("audio.sample_rate must be > 0".to_string()));
        }
        if self.audio.frame_ms == 0 || self.audio.frame_samples() == 0 {
            return Err(VoiceError::Config(format!(
                "audio.frame_ms ({}) yields no samples at {} Hz",
                self.audio.frame_ms, self.audio.sample_rate
            )));
        }
        if !(self.vad.threshold_factor > 0.0) {
            return Err(VoiceError::Config(format!(
                "vad.threshold_factor must be > 0, got {}",
                self.vad.threshold_factor
            )));
        }
        if self.vad.poll_timeout_ms == 0 {
            return Err(VoiceError::Config("vad.poll_timeout_ms must be > 0".to_string()));
        }
        for (name, capacity) in self.channels.all() {
            if capacity == 0 {
                return Err(VoiceError::Config(format!(
                    "channels.{name} capacity must be > 0"
                )));
            }
        }
        if self.generation.max_tokens == 0 {
            return Err(VoiceError::Config("generation.max_tokens must be > 0".to_string()));
        }
        if !(0.0..=2.0).contains(&self.synthesis.volume) {
            return Err(VoiceError::Config(format!(
                "synthesis.volume must be within 0.0..=2.0, got {}",
                self.synthesis.volume
            )));
        }
        let runtime = &self.runtime;
        if runtime.tick_ms == 0 || runtime.worker_poll_ms == 0 || runtime.playback_poll_ms == 0 {
            return Err(VoiceError::Config("runtime periods must be > 0".to_string()));
        }
        Ok(())
    }

    /// Frames consumed by VAD calibration (at least one).
    pub fn calibration_frames(&self) -> usize {
        frames_for(self.vad.calibration_ms, self.audio.frame_ms)
    }
}

fn frames_for(duration_ms: u32, frame_ms: u32) -> usize {
    if frame_ms == 0 {
        return 1;
    }
    ((duration_ms / frame_ms) as usize).max(1)
}
