//! Microphone capture with CPAL.
//!
//! The cpal `Stream` is not `Send` on every platform, so it is built, played and
//! dropped on a dedicated thread. The callback converts whatever the device
//! delivers (any channel count, any rate, F32 or I16) to mono at the pipeline
//! rate and pushes it into the [`CaptureSink`] without ever blocking.

use crate::audio::CaptureSink;
use crate::backend::AudioSource;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use serde::Serialize;
use std::sync::mpsc as std_mpsc;
use std::thread;
use tracing::{info, warn};

/// Report a growing drop count every this many frames.
const DROP_REPORT_INTERVAL: u64 = 100;

/// Default input device, opened on [`AudioSource::open`].
pub struct CpalSource {
    sample_rate: u32,
    running: Option<CaptureThread>,
}

struct CaptureThread {
    stop_tx: std_mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

impl CpalSource {
    /// `sample_rate` is the rate frames are delivered at, whatever the device runs at.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            running: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }
}

impl AudioSource for CpalSource {
    fn open(&mut self, sink: CaptureSink) -> VoiceResult<()> {
        if self.running.is_some() {
            return Err(VoiceError::AudioDevice("capture already open".to_string()));
        }
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let target_rate = self.sample_rate;

        let join = thread::Builder::new()
            .name("duplex-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(target_rate, sink) {
                    Ok((stream, device)) => {
                        let _ = ready_tx.send(Ok(device));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Either an explicit stop or the source being dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(device)) => {
                info!("✅ Audio capture started on {} ({}Hz)", device, target_rate);
                self.running = Some(CaptureThread { stop_tx, join });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => Err(VoiceError::AudioDevice(
                "capture thread exited during startup".to_string(),
            )),
        }
    }

    fn close(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop_tx.send(());
            let _ = running.join.join();
            info!("⏹️ Audio capture stopped");
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input_stream(target_rate: u32, mut sink: CaptureSink) -> VoiceResult<(Stream, String)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let config = device.default_input_config()?;
    let device_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let stream_config: StreamConfig = config.clone().into();
    info!(
        "🎤 Input device {}: {}Hz, {} channels, {:?}",
        name,
        device_rate,
        channels,
        config.sample_format()
    );
    let mut resampler = MonoResampler::new(channels, device_rate, target_rate);

    let mut reported = 0u64;
    let mut push = move |mono: &[f32]| {
        sink.push_samples(mono);
        let dropped = sink.dropped();
        if dropped >= reported + DROP_REPORT_INTERVAL {
            reported = dropped;
            warn!("Capture: {} frames dropped, fanout is behind", dropped);
        }
    };
    let on_error = |err: cpal::StreamError| warn!("Audio stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push(&resampler.process(data));
            },
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                push(&resampler.process(&samples));
            },
            on_error,
            None,
        )?,
        other => {
            return Err(VoiceError::AudioDevice(format!(
                "Unsupported sample format {other:?} (need F32 or I16)"
            )))
        }
    };
    stream.play()?;
    Ok((stream, name))
}

/// Mixes interleaved callback buffers down to mono and resamples them
/// (nearest sample) to the pipeline rate.
///
/// The position is carried across buffers, so callback sizes that do not
/// divide the rate ratio never drift or drop samples at buffer edges.
#[derive(Debug, Clone)]
pub struct MonoResampler {
    channels: usize,
    from_rate: u64,
    to_rate: u64,
    /// Mono input samples seen so far.
    consumed: u64,
    /// Output samples produced so far.
    emitted: u64,
}

impl MonoResampler {
    pub fn new(channels: usize, from_rate: u32, to_rate: u32) -> Self {
        Self {
            channels,
            from_rate: from_rate as u64,
            to_rate: to_rate as u64,
            consumed: 0,
            emitted: 0,
        }
    }

    /// Convert one interleaved buffer.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.channels == 0 || samples.is_empty() || self.from_rate == 0 || self.to_rate == 0 {
            return Vec::new();
        }
        let mono: Vec<f32> = if self.channels == 1 {
            samples.to_vec()
        } else {
            samples
                .chunks_exact(self.channels)
                .map(|c| c.iter().sum::<f32>() / self.channels as f32)
                .collect()
        };
        if self.from_rate == self.to_rate {
            return mono;
        }

        let end = self.consumed + mono.len() as u64;
        let expected = mono.len() as u64 * self.to_rate / self.from_rate + 1;
        let mut out = Vec::with_capacity(expected as usize);
        loop {
            let src = self.emitted * self.from_rate / self.to_rate;
            if src >= end {
                break;
            }
            out.push(mono[(src - self.consumed) as usize]);
            self.emitted += 1;
        }
        self.consumed = end;
        out
    }
}

/// Audio devices seen by the default host.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioDevices {
    pub default_input: Option<String>,
    pub default_output: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl AudioDevices {
    pub fn has_input(&self) -> bool {
        self.default_input.is_some()
    }

    pub fn has_output(&self) -> bool {
        self.default_output.is_some()
    }
}

/// Pre-flight check: enumerate devices without opening any stream.
pub fn list_devices() -> VoiceResult<AudioDevices> {
    let host = cpal::default_host();
    let inputs: Vec<String> = host.input_devices()?.filter_map(|d| d.name().ok()).collect();
    let outputs: Vec<String> = host.output_devices()?.filter_map(|d| d.name().ok()).collect();
    Ok(AudioDevices {
        default_input: host.default_input_device().and_then(|d| d.name().ok()),
        default_output: host.default_output_device().and_then(|d| d.name().ok()),
        inputs,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_is_averaged_to_mono() {
        let mut resampler = MonoResampler::new(2, 16000, 16000);
        assert_eq!(resampler.process(&[0.25, 0.75, -1.0, 1.0]), vec![0.5, 0.0]);
    }

    #[test]
    fn test_downsampling_picks_nearest_samples() {
        let samples: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let mut resampler = MonoResampler::new(1, 48000, 16000);
        assert_eq!(resampler.process(&samples), vec![0.0, 3.0]);
    }

    #[test]
    fn test_uneven_buffers_do_not_drift() {
        // 44.1kHz callbacks of 441 samples: ten of them are exactly 4410 input
        // samples, which must become exactly 1600 output samples at 16kHz.
        let mut resampler = MonoResampler::new(1, 44100, 16000);
        let mut produced = Vec::new();
        for buffer in 0..10 {
            let samples: Vec<f32> = (0..441).map(|i| (buffer * 441 + i) as f32).collect();
            produced.extend(resampler.process(&samples));
        }
        assert_eq!(produced.len(), 1600);
        // Same picks as resampling the whole signal in one go.
        let whole: Vec<f32> = (0..4410).map(|i| i as f32).collect();
        assert_eq!(produced, MonoResampler::new(1, 44100, 16000).process(&whole));
    }

    #[test]
    fn test_degenerate_input_is_empty() {
        assert!(MonoResampler::new(1, 16000, 16000).process(&[]).is_empty());
        assert!(MonoResampler::new(0, 16000, 16000).process(&[1.0]).is_empty());
    }

    #[test]
    #[ignore] // Requires an audio device
    fn opens_and_closes_default_microphone() {
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let mut source = CpalSource::new(16000);
        source.open(CaptureSink::new(320, tx)).unwrap();
        assert!(source.is_open());
        source.close();
        assert!(!source.is_open());
    }
}
