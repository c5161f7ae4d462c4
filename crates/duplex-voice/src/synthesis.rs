//! **SynthesisPipeline** — sentences to audio to the speaker.
//!
//! Two stages joined by the bounded handoff queue:
//!
//! - synthesis: one sentence at a time through the (non-interruptible)
//!   synthesizer; a clip finished after a cancel is thrown away, and a clip
//!   that does not fit in the handoff queue is dropped
//! - playback: one clip at a time, polled every few milliseconds so a barge-in
//!   stops the speaker mid-clip
//!
//! Each sentence leaves the pipeline exactly once (played, stopped, failed or
//! dropped) and reports it to the speech ledger, which decides when the turn
//! is over.

use crate::backend::{AudioClip, AudioSink, Sentence, Synthesizer};
use crate::state::SharedState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

pub struct SynthesisStage {
    pub synthesizer: Arc<dyn Synthesizer>,
    pub shared: SharedState,
    pub sentences_rx: mpsc::Receiver<Sentence>,
    pub clips_tx: mpsc::Sender<AudioClip>,
    pub poll: Duration,
}

impl SynthesisStage {
    pub async fn run(mut self) {
        let mut dropped = 0u64;
        while !self.shared.is_shutdown() {
            let sentence = match tokio::time::timeout(self.poll, self.sentences_rx.recv()).await {
                Ok(Some(s)) => s,
                Ok(None) => break,
                Err(_) => continue,
            };
            let turn = sentence.turn;
            if !self.shared.synthesis_active(turn) {
                debug!(turn = %turn, index = sentence.index, "cancelled turn, sentence skipped");
                continue;
            }

            let synthesizer = Arc::clone(&self.synthesizer);
            let text = sentence.text.clone();
            let started = Instant::now();
            let result = tokio::task::spawn_blocking(move || synthesizer.synthesize(&text)).await;

            let data = match result {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => {
                    warn!(
                        "⚠️ Synthesis failed for sentence {} of turn {}, skipped: {}",
                        sentence.index, turn, e
                    );
                    self.shared.sentence_done(turn);
                    continue;
                }
                Err(e) => {
                    warn!("Synthesis task for turn {} panicked, sentence skipped: {}", turn, e);
                    self.shared.sentence_done(turn);
                    continue;
                }
            };
            info!(
                "🗣️ Synthesis time: {}ms (turn {}, sentence {})",
                started.elapsed().as_millis(),
                turn,
                sentence.index
            );

            // The call cannot be interrupted; the result can still be discarded.
            if !self.shared.synthesis_active(turn) {
                debug!(
                    turn = %turn,
                    index = sentence.index,
                    "cancelled during synthesis, clip discarded"
                );
                continue;
            }

            let clip = AudioClip {
                turn,
                sentence: sentence.index,
                data,
            };
            match self.clips_tx.try_send(clip) {
                Ok(()) => {}
                Err(TrySendError::Full(clip)) => {
                    dropped += 1;
                    warn!(
                        "Playback queue full, clip {} of turn {} dropped ({} so far)",
                        clip.sentence, turn, dropped
                    );
                    self.shared.sentence_done(turn);
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        debug!("synthesis stage stopped");
    }
}

/// How a clip left the speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClipOutcome {
    Finished,
    Stopped,
    Skipped,
}

pub struct PlaybackStage {
    sink: Arc<dyn AudioSink>,
    shared: SharedState,
    clips_rx: mpsc::Receiver<AudioClip>,
    /// Receive timeout.
    poll: Duration,
    /// Cancel check interval while a clip plays.
    playback_poll: Duration,
    /// A live clip found while draining stale ones.
    next: Option<AudioClip>,
}

impl PlaybackStage {
    pub fn new(
        sink: Arc<dyn AudioSink>,
        shared: SharedState,
        clips_rx: mpsc::Receiver<AudioClip>,
        poll: Duration,
        playback_poll: Duration,
    ) -> Self {
        Self {
            sink,
            shared,
            clips_rx,
            poll,
            playback_poll,
            next: None,
        }
    }

    pub async fn run(mut self) {
        while !self.shared.is_shutdown() {
            let clip = match self.next.take() {
                Some(clip) => clip,
                None => match tokio::time::timeout(self.poll, self.clips_rx.recv()).await {
                    Ok(Some(c)) => c,
                    Ok(None) => break,
                    Err(_) => continue,
                },
            };

            if !self.shared.synthesis_active(clip.turn) {
                debug!(turn = %clip.turn, index = clip.sentence, "cancelled turn, clip discarded");
                self.drain_stale();
                continue;
            }

            if self.play(clip).await == ClipOutcome::Stopped {
                self.drain_stale();
            }
        }
        debug!("playback stage stopped");
    }

    async fn play(&mut self, clip: AudioClip) -> ClipOutcome {
        let turn = clip.turn;
        let index = clip.sentence;

        let sink = Arc::clone(&self.sink);
        let opened = tokio::task::spawn_blocking(move || {
            let handle = sink.play(&clip.data);
            (clip, handle)
        })
        .await;

        let (clip, mut handle) = match opened {
            Ok((clip, Ok(handle))) => (clip, handle),
            Ok((_, Err(e))) => {
                warn!("⚠️ Clip {} of turn {} could not be played, skipped: {}", index, turn, e);
                self.shared.sentence_done(turn);
                return ClipOutcome::Skipped;
            }
            Err(e) => {
                warn!("⚠️ Playback task for turn {} panicked, clip skipped: {}", turn, e);
                self.shared.sentence_done(turn);
                return ClipOutcome::Skipped;
            }
        };

        // Sound is out only now. Refused when a barge-in won the race.
        if !self.shared.begin_speaking(turn) {
            handle.stop();
            return ClipOutcome::Stopped;
        }
        self.shared.mark_playback_start(turn);

        let outcome = loop {
            if !self.shared.synthesis_active(turn) {
                handle.stop();
                info!("⏹️ Playback stopped mid-clip (turn {}, sentence {})", turn, index);
                break ClipOutcome::Stopped;
            }
            if handle.is_finished() {
                break ClipOutcome::Finished;
            }
            tokio::time::sleep(self.playback_poll).await;
        };
        // Removes the clip's temp file, if it has one.
        drop(clip);

        if outcome == ClipOutcome::Finished {
            debug!(turn = %turn, index, "clip finished");
            self.shared.sentence_done(turn);
        }
        outcome
    }

    /// Throw away every queued clip of an inactive turn. The first live clip
    /// (from a newer turn) is kept to play next.
    fn drain_stale(&mut self) {
        let mut discarded = 0usize;
        while let Ok(clip) = self.clips_rx.try_recv() {
            if self.shared.synthesis_active(clip.turn) {
                self.next = Some(clip);
                break;
            }
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "queued clips discarded after cancel");
        }
    }
}
