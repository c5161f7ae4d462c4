//! **Text-to-Speech** with the Piper command-line synthesizer.
//!
//! Each sentence runs one Piper process: text on stdin, WAV written to a temp
//! file. The file lives as long as the clip and is removed when the clip is
//! dropped, whether it was played or discarded.

use crate::backend::{ClipData, Synthesizer};
use crate::config::SynthesisConfig;
use crate::error::{VoiceError, VoiceResult};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Piper's own defaults; flags are only passed when a value differs.
const PIPER_DEFAULT_LENGTH_SCALE: f32 = 1.0;
const PIPER_DEFAULT_NOISE_SCALE: f32 = 0.667;

#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    pub exe: PathBuf,
    pub model: PathBuf,
    pub speaker_id: u32,
    pub length_scale: f32,
    pub noise_scale: f32,
}

impl PiperSynthesizer {
    pub fn new(exe: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            model: model.into(),
            speaker_id: 0,
            length_scale: PIPER_DEFAULT_LENGTH_SCALE,
            noise_scale: PIPER_DEFAULT_NOISE_SCALE,
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> VoiceResult<Self> {
        let model = config
            .piper_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config("synthesis.piper_model is required for Piper".to_string())
            })?;
        Ok(Self {
            exe: PathBuf::from(&config.piper_exe),
            model: PathBuf::from(model),
            speaker_id: config.speaker_id,
            length_scale: config.length_scale,
            noise_scale: config.noise_scale,
        })
    }

    /// Command-line arguments for one run writing to `output`.
    pub fn args(&self, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--model".into(),
            self.model.clone().into(),
            "--output_file".into(),
            output.into(),
            "--speaker".into(),
            self.speaker_id.to_string().into(),
        ];
        if (self.length_scale - PIPER_DEFAULT_LENGTH_SCALE).abs() > f32::EPSILON {
            args.push("--length_scale".into());
            args.push(self.length_scale.to_string().into());
        }
        if (self.noise_scale - PIPER_DEFAULT_NOISE_SCALE).abs() > 1e-6 {
            args.push("--noise_scale".into());
            args.push(self.noise_scale.to_string().into());
        }
        args
    }
}

impl Synthesizer for PiperSynthesizer {
    fn synthesize(&self, text: &str) -> VoiceResult<ClipData> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Synthesis("nothing to synthesize".to_string()));
        }
        let output = tempfile::Builder::new()
            .prefix("duplex-tts-")
            .suffix(".wav")
            .tempfile()?
            .into_temp_path();

        let mut child = Command::new(&self.exe)
            .args(self.args(&output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                VoiceError::Synthesis(format!("cannot start {}: {}", self.exe.display(), e))
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
        }
        let result = child.wait_with_output()?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(VoiceError::Synthesis(format!(
                "piper exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }
        debug!(chars = text.len(), file = %output.display(), "piper wrote clip");
        Ok(ClipData::File(output))
    }
}

/// Produces a silent clip of fixed length for every sentence.
#[derive(Debug, Clone, Copy)]
pub struct SilenceSynthesizer {
    pub clip: Duration,
}

impl SilenceSynthesizer {
    pub fn new(clip: Duration) -> Self {
        Self { clip }
    }
}

impl Default for SilenceSynthesizer {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl Synthesizer for SilenceSynthesizer {
    fn synthesize(&self, _text: &str) -> VoiceResult<ClipData> {
        Ok(ClipData::Silence(self.clip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn default_scales_are_not_passed() {
        let piper = PiperSynthesizer::new("piper", "voice.onnx");
        let args = strings(piper.args(Path::new("/tmp/out.wav")));
        assert_eq!(
            args,
            vec!["--model", "voice.onnx", "--output_file", "/tmp/out.wav", "--speaker", "0"]
        );
    }

    #[test]
    fn changed_scales_are_passed() {
        let mut piper = PiperSynthesizer::new("piper", "voice.onnx");
        piper.length_scale = 1.2;
        piper.noise_scale = 0.5;
        piper.speaker_id = 3;
        let args = strings(piper.args(Path::new("out.wav")));
        assert!(args.windows(2).any(|w| w == ["--length_scale", "1.2"]));
        assert!(args.windows(2).any(|w| w == ["--noise_scale", "0.5"]));
        assert!(args.windows(2).any(|w| w == ["--speaker", "3"]));
    }

    #[test]
    fn test_model_is_required() {
        let err = PiperSynthesizer::from_config(&SynthesisConfig::default()).unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn missing_executable_is_a_synthesis_error() {
        let piper = PiperSynthesizer::new("/nonexistent/piper-binary", "voice.onnx");
        assert!(matches!(piper.synthesize("Hello."), Err(VoiceError::Synthesis(_))));
    }

    #[test]
    fn silence_synthesizer_returns_fixed_clip() {
        let clip = SilenceSynthesizer::new(Duration::from_millis(80)).synthesize("Hi.").unwrap();
        assert!(matches!(clip, ClipData::Silence(d) if d == Duration::from_millis(80)));
    }
}
