//! Streaming text generation.
//!
//! [`OllamaGenerator`] streams from a local Ollama server (`/api/generate`,
//! newline-delimited JSON). The response body is read line by line as the
//! caller pulls fragments, so dropping the stream early closes the request.

use crate::backend::{FragmentStream, Generator};
use crate::config::GenerationConfig;
use crate::error::{VoiceError, VoiceResult};
use serde::Deserialize;
use serde_json::json;
use std::io::{BufRead, BufReader, Read};
use std::sync::OnceLock;
use std::time::Duration;

/// Stop sequence that keeps the model from writing the user's next line.
pub const STOP_SEQUENCE: &str = "User:";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrap the user's words in the voice-assistant prompt.
pub fn build_prompt(user_text: &str) -> String {
    format!(
        "You are a kind, concise assistant in a voice conversation.\n\
         Respond naturally and briefly.\n\n\
         User: {}\nAssistant:",
        user_text.trim()
    )
}

/// One line of Ollama's streaming response.
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Iterator over the fragments of an NDJSON generate stream.
pub struct NdjsonFragments<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: Read> NdjsonFragments<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            done: false,
        }
    }
}

impl<R: Read> Iterator for NdjsonFragments<R> {
    type Item = VoiceResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        while !self.done {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(VoiceError::Generation(format!("stream read failed: {}", e))));
                }
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let chunk: GenerateChunk = match serde_json::from_str(line) {
                Ok(c) => c,
                Err(e) => {
                    self.done = true;
                    return Some(Err(VoiceError::Generation(format!("bad stream line: {}", e))));
                }
            };
            if let Some(error) = chunk.error {
                self.done = true;
                return Some(Err(VoiceError::Generation(error)));
            }
            self.done = chunk.done;
            if !chunk.response.is_empty() {
                return Some(Ok(chunk.response));
            }
        }
        None
    }
}

/// Ollama `/api/generate` with `stream: true`.
#[derive(Debug)]
pub struct OllamaGenerator {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    client: OnceLock<reqwest::blocking::Client>,
}

impl OllamaGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            temperature: 0.3,
            client: OnceLock::new(),
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        let mut generator = Self::new(config.base_url.clone(), config.model.clone());
        generator.temperature = config.temperature;
        generator
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }

    /// Request body for one reply.
    pub fn request_body(&self, prompt: &str, max_tokens: u32) -> serde_json::Value {
        json!({
            "model": self.model,
            "prompt": build_prompt(prompt),
            "stream": true,
            "options": {
                "num_predict": max_tokens,
                "temperature": self.temperature,
                "stop": [STOP_SEQUENCE],
            }
        })
    }

    fn client(&self) -> VoiceResult<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        // No overall timeout: a reply streams for as long as the model talks.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()
            .map_err(|e| VoiceError::Generation(e.to_string()))?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Generator for OllamaGenerator {
    fn generate(&self, prompt: &str, max_tokens: u32) -> VoiceResult<FragmentStream<'_>> {
        let res = self
            .client()?
            .post(self.endpoint())
            .json(&self.request_body(prompt, max_tokens))
            .send()
            .map_err(|e| VoiceError::Generation(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Generation(format!("LLM API error {}: {}", status, body)));
        }
        Ok(Box::new(NdjsonFragments::new(res)))
    }
}

/// Repeats the user's words back, one word per fragment. For dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoGenerator;

impl Generator for EchoGenerator {
    fn generate(&self, prompt: &str, max_tokens: u32) -> VoiceResult<FragmentStream<'_>> {
        let mut words: Vec<String> = std::iter::once("You said:".to_string())
            .chain(prompt.split_whitespace().map(str::to_string))
            .take(max_tokens as usize)
            .map(|w| format!(" {}", w))
            .collect();
        if let Some(last) = words.last_mut() {
            if !last.ends_with(['.', '!', '?']) {
                last.push('.');
            }
        }
        Ok(Box::new(words.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_prompt_wraps_user_text() {
        let p = build_prompt("  what time is it? ");
        assert!(p.starts_with("You are a kind, concise assistant"));
        assert!(p.ends_with("User: what time is it?\nAssistant:"));
    }

    #[test]
    fn request_body_carries_limits() {
        let g = OllamaGenerator::new("http://localhost:11434/", "mistral");
        assert_eq!(g.endpoint(), "http://localhost:11434/api/generate");
        let body = g.request_body("hi", 160);
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_predict"], 160);
        assert_eq!(body["options"]["stop"][0], "User:");
    }

    #[test]
    fn ndjson_stream_yields_fragments_until_done() {
        let body = concat!(
            "{\"response\":\"Hello\",\"done\":false}\n",
            "\n",
            "{\"response\":\" there.\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
            "{\"response\":\"ignored\",\"done\":false}\n",
        );
        let fragments: Vec<String> = NdjsonFragments::new(Cursor::new(body))
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(fragments, vec!["Hello", " there."]);
    }

    #[test]
    fn ndjson_error_line_ends_the_stream() {
        let body = "{\"response\":\"Hi\"}\n{\"error\":\"model not found\"}\n{\"response\":\"x\"}\n";
        let mut stream = NdjsonFragments::new(Cursor::new(body));
        assert_eq!(stream.next().unwrap().unwrap(), "Hi");
        assert!(matches!(
            stream.next(),
            Some(Err(VoiceError::Generation(m))) if m == "model not found"
        ));
        assert!(stream.next().is_none());
    }

    #[test]
    fn echo_generator_respects_token_budget() {
        let echo = |budget: u32| -> Vec<String> {
            let generator = EchoGenerator;
            let stream = generator.generate("good morning", budget).unwrap();
            stream.map(|f| f.unwrap()).collect()
        };
        let all = echo(16);
        assert_eq!(all.concat(), " You said: good morning.");

        let short = echo(2);
        assert_eq!(short.concat(), " You said: good.");
    }
}
