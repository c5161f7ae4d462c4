//! **Speaker output** — clip playback with an immediate stop.
//!
//! [`RodioSink`] plays every clip on its own `rodio::Sink`, so stopping one clip
//! (barge-in) never disturbs the output stream. The `OutputStream` itself is
//! not `Send`; a keeper thread owns it for the lifetime of the sink and only
//! the `Send + Sync` handle is shared.
//!
//! [`NullSink`] plays nothing and finishes each clip after its natural
//! duration, for dry runs without a speaker.

use crate::backend::{AudioSink, ClipData, PlaybackHandle};
use crate::error::{VoiceError, VoiceResult};
use rodio::source::Zero;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Default output device.
pub struct RodioSink {
    handle: OutputStreamHandle,
    volume: f32,
    /// Dropping this ends the keeper thread and closes the output stream.
    _keeper: std_mpsc::Sender<()>,
}

impl RodioSink {
    /// Open the default output device. `volume` is a linear gain (1.0 = unchanged).
    pub fn open_default(volume: f32) -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<OutputStreamHandle>>();
        let (keeper_tx, keeper_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("duplex-speaker".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    let _ = keeper_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                }
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| {
                VoiceError::Playback("speaker thread exited during startup".to_string())
            })??;
        info!("🔊 Speaker ready (volume {})", volume);
        Ok(Self {
            handle,
            volume,
            _keeper: keeper_tx,
        })
    }

    fn append(&self, sink: &Sink, clip: &ClipData) -> VoiceResult<()> {
        match clip {
            ClipData::Encoded(bytes) => {
                let source = Decoder::new(Cursor::new(bytes.clone()))
                    .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
                sink.append(source.convert_samples::<f32>());
            }
            ClipData::File(path) => {
                let file = File::open(path).map_err(|e| {
                    VoiceError::Playback(format!("Cannot open clip {}: {}", path.display(), e))
                })?;
                let source = Decoder::new(BufReader::new(file))
                    .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
                sink.append(source.convert_samples::<f32>());
            }
            ClipData::Silence(duration) => {
                sink.append(Zero::<f32>::new(1, 16000).take_duration(*duration));
            }
        }
        Ok(())
    }
}

impl AudioSink for RodioSink {
    fn play(&self, clip: &ClipData) -> VoiceResult<Box<dyn PlaybackHandle>> {
        let sink = Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        sink.set_volume(self.volume);
        self.append(&sink, clip)?;
        Ok(Box::new(RodioPlayback { sink }))
    }
}

struct RodioPlayback {
    sink: Sink,
}

impl PlaybackHandle for RodioPlayback {
    fn is_finished(&self) -> bool {
        self.sink.empty()
    }

    fn stop(&mut self) {
        self.sink.stop();
    }
}

/// Plays nothing; each clip "finishes" after its audio duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NullSink {
    pub fn new() -> Self {
        Self
    }
}

/// Duration of a clip without decoding more than its header.
pub fn clip_duration(clip: &ClipData) -> VoiceResult<Duration> {
    fn wav_duration<R: std::io::Read>(reader: hound::WavReader<R>) -> Duration {
        let rate = reader.spec().sample_rate.max(1) as u64;
        Duration::from_nanos(reader.duration() as u64 * 1_000_000_000 / rate)
    }
    let bad = |e: hound::Error| VoiceError::Playback(format!("Decode failed: {}", e));
    match clip {
        ClipData::Silence(d) => Ok(*d),
        ClipData::Encoded(bytes) => {
            let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(bad)?;
            Ok(wav_duration(reader))
        }
        ClipData::File(path) => Ok(wav_duration(hound::WavReader::open(path).map_err(bad)?)),
    }
}

impl AudioSink for NullSink {
    fn play(&self, clip: &ClipData) -> VoiceResult<Box<dyn PlaybackHandle>> {
        let duration = clip_duration(clip)?;
        Ok(Box::new(TimedPlayback {
            ends_at: Instant::now() + duration,
            stopped: false,
        }))
    }
}

struct TimedPlayback {
    ends_at: Instant,
    stopped: bool,
}

impl PlaybackHandle for TimedPlayback {
    fn is_finished(&self) -> bool {
        self.stopped || Instant::now() >= self.ends_at
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
