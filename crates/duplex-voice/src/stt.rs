//! **Speech-to-Text** — turn an [`Utterance`] into text.
//!
//! [`HttpRecognizer`] talks to any OpenAI-compatible `/audio/transcriptions`
//! endpoint (OpenAI Whisper, a local whisper server, ...). [`SilentRecognizer`]
//! is a stand-in that recognizes nothing, or a fixed phrase.

use crate::backend::{Recognizer, Utterance};
use crate::config::RecognitionConfig;
use crate::error::{VoiceError, VoiceResult};
use std::io::Cursor;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Encode mono f32 PCM as a 16-bit WAV file in memory.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| VoiceError::Recognition(format!("WAV encode failed: {}", e));
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_err)?;
        for &s in samples {
            let clamped = s.clamp(-1.0, 1.0);
            writer
                .write_sample((clamped * i16::MAX as f32).round() as i16)
                .map_err(wav_err)?;
        }
        writer.finalize().map_err(wav_err)?;
    }
    Ok(cursor.into_inner())
}

/// OpenAI-compatible transcription API.
#[derive(Debug)]
pub struct HttpRecognizer {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// whisper-1, gpt-4o-transcribe, ...
    pub model: String,
    pub language: Option<String>,
    /// Built on first use, from a blocking thread.
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpRecognizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language: None,
            client: OnceLock::new(),
        }
    }

    /// Build from config. The key falls back to `STT_API_KEY` / `OPENAI_API_KEY`.
    pub fn from_config(config: &RecognitionConfig) -> VoiceResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("STT_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config(
                    "recognition requires recognition.api_key, STT_API_KEY or OPENAI_API_KEY"
                        .to_string(),
                )
            })?;
        let mut recognizer = Self::new(config.base_url.clone(), api_key, config.model.clone());
        recognizer.language = config.language.clone();
        Ok(recognizer)
    }

    pub fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'))
    }

    fn client(&self) -> VoiceResult<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Recognizer for HttpRecognizer {
    fn recognize(&self, utterance: &Utterance) -> VoiceResult<String> {
        if utterance.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&utterance.samples, utterance.sample_rate)?;
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let res = self
            .client()?
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Recognition(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res
            .json()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!(chars = text.len(), "transcription received");
        Ok(text)
    }
}

/// Recognizes nothing, or always the same phrase. For dry runs and tests.
#[derive(Debug, Default, Clone)]
pub struct SilentRecognizer {
    pub response: Option<String>,
}

impl SilentRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self { response: Some(s.into()) }
    }
}

impl Recognizer for SilentRecognizer {
    fn recognize(&self, _utterance: &Utterance) -> VoiceResult<String> {
        Ok(self.response.clone().unwrap_or_default())
    }
}
