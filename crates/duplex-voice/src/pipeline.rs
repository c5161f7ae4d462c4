//! Wires every worker together with bounded channels.
//!
//! ```text
//! AudioSource ─► capture ─► fanout ─┬─► VAD ──events──► utterance ─► recognition ─┐
//!                                   └─► utterance (frames)                        │
//!                                                                     transcripts ▼
//!  generation ─► tokens ─► orchestrator ─► sentences ─► synthesis ─► handoff ─► playback
//!      ▲                        │                                                  │
//!      └──────── requests ──────┘                                          speaker ◄┘
//! ```

use crate::audio::{run_fanout, AudioFanout, AudioFrame, CaptureSink};
use crate::backend::{AudioSink, AudioSource, Generator, Recognizer, Synthesizer};
use crate::config::VoiceConfig;
use crate::error::VoiceResult;
use crate::orchestrator::{GenerationWorker, TurnOrchestrator};
use crate::state::SharedState;
use crate::synthesis::{PlaybackStage, SynthesisStage};
use crate::utterance::{RecognitionWorker, UtteranceBuffer, UtteranceWorker};
use crate::vad::VadWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The five collaborators the pipeline drives.
pub struct Backends {
    pub source: Box<dyn AudioSource>,
    pub recognizer: Arc<dyn Recognizer>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Arc<dyn AudioSink>,
}

pub struct VoicePipeline;

impl VoicePipeline {
    /// Spawn every worker, open the audio source and move to LISTENING.
    ///
    /// Must be called from within a Tokio runtime. If the source cannot be
    /// opened the already spawned workers are told to stop and the error is
    /// returned.
    pub fn start(
        config: VoiceConfig,
        shared: SharedState,
        backends: Backends,
    ) -> VoiceResult<PipelineHandle> {
        config.validate()?;
        let Backends {
            mut source,
            recognizer,
            generator,
            synthesizer,
            sink,
        } = backends;

        let caps = &config.channels;
        let poll = config.runtime.worker_poll();

        let (capture_tx, capture_rx) = mpsc::channel(caps.capture);
        let mut fanout = AudioFanout::new();
        let vad_frames = fanout.add_consumer("vad", caps.vad);
        let utterance_frames = fanout.add_consumer("utterance", caps.utterance);
        let (vad_events_tx, vad_events_rx) = mpsc::channel(caps.vad_events);
        let (observer_tx, observer_rx) = mpsc::channel(caps.vad_events);
        let (utterances_tx, utterances_rx) = mpsc::channel(caps.utterances);
        let (transcripts_tx, transcripts_rx) = mpsc::channel(caps.transcripts);
        let (requests_tx, requests_rx) = mpsc::channel(caps.generation_requests);
        let (tokens_tx, tokens_rx) = mpsc::channel(caps.tokens);
        let (sentences_tx, sentences_rx) = mpsc::channel(caps.sentences);
        let (clips_tx, clips_rx) = mpsc::channel(caps.playback);

        let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::with_capacity(9);

        workers.push((
            "fanout",
            tokio::spawn(run_fanout(fanout, capture_rx, shared.clone(), poll)),
        ));
        workers.push((
            "vad",
            tokio::spawn(
                VadWorker {
                    config: config.vad.clone(),
                    calibration_frames: config.calibration_frames(),
                    shared: shared.clone(),
                    frames_rx: vad_frames,
                    events_tx: vad_events_tx,
                    observer_tx: Some(observer_tx),
                }
                .run(),
            ),
        ));
        workers.push((
            "utterance",
            tokio::spawn(
                UtteranceWorker {
                    buffer: UtteranceBuffer::new(
                        config.audio.pre_roll_frames(),
                        config.audio.sample_rate,
                    ),
                    shared: shared.clone(),
                    frames_rx: utterance_frames,
                    events_rx: vad_events_rx,
                    utterances_tx,
                    poll,
                }
                .run(),
            ),
        ));
        workers.push((
            "recognition",
            tokio::spawn(
                RecognitionWorker {
                    recognizer,
                    shared: shared.clone(),
                    utterances_rx,
                    transcripts_tx,
                    poll,
                }
                .run(),
            ),
        ));
        workers.push((
            "orchestrator",
            tokio::spawn(
                TurnOrchestrator::new(
                    shared.clone(),
                    config.generation.max_tokens,
                    transcripts_rx,
                    tokens_rx,
                    requests_tx,
                    sentences_tx,
                )
                .with_vad_events(observer_rx)
                .run(config.runtime.tick()),
            ),
        ));
        workers.push((
            "generation",
            tokio::spawn(
                GenerationWorker {
                    generator,
                    shared: shared.clone(),
                    requests_rx,
                    tokens_tx,
                    poll,
                }
                .run(),
            ),
        ));
        workers.push((
            "synthesis",
            tokio::spawn(
                SynthesisStage {
                    synthesizer,
                    shared: shared.clone(),
                    sentences_rx,
                    clips_tx,
                    poll,
                }
                .run(),
            ),
        ));
        workers.push((
            "playback",
            tokio::spawn(
                PlaybackStage::new(
                    sink,
                    shared.clone(),
                    clips_rx,
                    poll,
                    config.runtime.playback_poll(),
                )
                .run(),
            ),
        ));

        let frame_samples = config.audio.frame_samples();
        let opened = source
            .open(CaptureSink::new(frame_samples, capture_tx.clone()))
            .and_then(|()| shared.start_listening());
        if let Err(e) = opened {
            warn!("Pipeline startup failed, stopping workers: {}", e);
            shared.request_shutdown();
            source.close();
            return Err(e);
        }

        info!(
            "✅ Voice pipeline started ({}Hz, {}ms frames, {} workers)",
            config.audio.sample_rate,
            config.audio.frame_ms,
            workers.len()
        );
        Ok(PipelineHandle {
            shared,
            source,
            capture_tx,
            frame_samples,
            workers,
            shutdown_timeout: config.runtime.shutdown_timeout(),
        })
    }
}

/// Running pipeline. Dropping it without `shutdown` leaves the workers running
/// until the shared shutdown flag is raised elsewhere.
pub struct PipelineHandle {
    shared: SharedState,
    source: Box<dyn AudioSource>,
    capture_tx: mpsc::Sender<AudioFrame>,
    frame_samples: usize,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl PipelineHandle {
    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    /// Another entry point into the capture channel, for scripted sources.
    pub fn capture_sink(&self) -> CaptureSink {
        CaptureSink::new(self.frame_samples, self.capture_tx.clone())
    }

    /// Names of workers that have not exited yet.
    pub fn running_workers(&self) -> Vec<&'static str> {
        self.workers
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    /// Request shutdown, close the source and wait (bounded) for every worker.
    pub async fn shutdown(self) {
        info!("🛑 Stopping voice pipeline");
        let PipelineHandle {
            shared,
            mut source,
            workers,
            shutdown_timeout,
            ..
        } = self;
        shared.request_shutdown();

        // Closing joins the device thread.
        if let Err(e) = tokio::task::spawn_blocking(move || source.close()).await {
            warn!("Closing the audio source panicked: {}", e);
        }

        let deadline = tokio::time::Instant::now() + shutdown_timeout;
        for (name, mut handle) in workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker {} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Worker {} did not stop in time, aborting", name);
                    handle.abort();
                }
            }
        }
        info!("✅ Voice pipeline stopped");
    }
}
