//! Utterance assembly and recognition.
//!
//! The utterance worker owns the pre-roll ring and the in-progress utterance.
//! It sees every frame (to keep the ring current) and every VAD event. A
//! finished utterance is handed to the recognition worker so that a slow
//! recognizer never stalls frame intake.

use crate::audio::{concat_frames, AudioFrame, PreRollRing};
use crate::backend::{Recognizer, Transcript, Utterance};
use crate::state::SharedState;
use crate::vad::VadEvent;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Pre-roll ring plus the utterance being collected, if any.
#[derive(Debug)]
pub struct UtteranceBuffer {
    ring: PreRollRing,
    sample_rate: u32,
    active: Option<ActiveUtterance>,
}

#[derive(Debug)]
struct ActiveUtterance {
    frames: Vec<AudioFrame>,
    pre_roll_frames: usize,
    started_at: DateTime<Utc>,
}

impl UtteranceBuffer {
    pub fn new(pre_roll_frames: usize, sample_rate: u32) -> Self {
        Self {
            ring: PreRollRing::new(pre_roll_frames),
            sample_rate,
            active: None,
        }
    }

    /// Every frame goes into the ring. While an utterance is open it is also
    /// appended to it.
    pub fn push_frame(&mut self, frame: AudioFrame) {
        if let Some(active) = &mut self.active {
            active.frames.push(frame.clone());
        }
        self.ring.push(frame);
    }

    /// Open a new utterance seeded with the current pre-roll. A second call
    /// while one is open starts over from the ring.
    pub fn voice_started(&mut self) {
        let frames = self.ring.snapshot();
        self.active = Some(ActiveUtterance {
            pre_roll_frames: frames.len(),
            frames,
            started_at: Utc::now(),
        });
    }

    /// Close the open utterance. `None` when nothing was collected (duplicate
    /// or spurious voice_ended). The buffer is empty afterwards either way.
    pub fn voice_ended(&mut self) -> Option<Utterance> {
        let active = self.active.take()?;
        if active.frames.is_empty() {
            return None;
        }
        Some(Utterance {
            samples: concat_frames(&active.frames),
            sample_rate: self.sample_rate,
            started_at: active.started_at,
            pre_roll_frames: active.pre_roll_frames,
            frames: active.frames.len(),
        })
    }

    pub fn handle_event(&mut self, event: &VadEvent) -> Option<Utterance> {
        match event {
            VadEvent::VoiceStarted { .. } => {
                self.voice_started();
                None
            }
            VadEvent::VoiceEnded { .. } => self.voice_ended(),
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.active.is_some()
    }

    /// Frames in the open utterance, pre-roll included.
    pub fn buffered_frames(&self) -> usize {
        self.active.as_ref().map(|a| a.frames.len()).unwrap_or(0)
    }

    pub fn pre_roll(&self) -> &PreRollRing {
        &self.ring
    }
}

/// Feeds the [`UtteranceBuffer`] from the frame and event channels.
pub struct UtteranceWorker {
    pub buffer: UtteranceBuffer,
    pub shared: SharedState,
    pub frames_rx: mpsc::Receiver<AudioFrame>,
    pub events_rx: mpsc::Receiver<VadEvent>,
    pub utterances_tx: mpsc::Sender<Utterance>,
    pub poll: Duration,
}

impl UtteranceWorker {
    pub async fn run(mut self) {
        while !self.shared.is_shutdown() {
            // Events first so voice_started snapshots the ring before later frames land in it.
            tokio::select! {
                biased;
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        if let Some(utterance) = self.buffer.handle_event(&event) {
                            debug!(
                                frames = utterance.frames,
                                pre_roll = utterance.pre_roll_frames,
                                "utterance complete"
                            );
                            if self.utterances_tx.send(utterance).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                },
                frame = self.frames_rx.recv() => match frame {
                    Some(frame) => self.buffer.push_frame(frame),
                    None => break,
                },
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
        debug!("utterance worker stopped");
    }
}

/// Runs the recognizer on each utterance, one at a time.
pub struct RecognitionWorker {
    pub recognizer: Arc<dyn Recognizer>,
    pub shared: SharedState,
    pub utterances_rx: mpsc::Receiver<Utterance>,
    pub transcripts_tx: mpsc::Sender<Transcript>,
    pub poll: Duration,
}

impl RecognitionWorker {
    pub async fn run(mut self) {
        while !self.shared.is_shutdown() {
            let utterance = match tokio::time::timeout(self.poll, self.utterances_rx.recv()).await {
                Ok(Some(u)) => u,
                Ok(None) => break,
                Err(_) => continue,
            };

            let Some(text) = self.recognize(utterance).await else {
                continue;
            };
            self.shared.mark_recognition_final();
            info!("📝 Transcript: {:?}", text);
            let transcript = Transcript { text, at: Utc::now() };
            if self.transcripts_tx.send(transcript).await.is_err() {
                break;
            }
        }
        debug!("recognition worker stopped");
    }

    /// Non-empty trimmed text, or `None` for silence and failures alike.
    async fn recognize(&self, utterance: Utterance) -> Option<String> {
        let recognizer = Arc::clone(&self.recognizer);
        let audio_secs = utterance.duration().as_secs_f32();
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || recognizer.recognize(&utterance)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(text)) => {
                info!("Recognition time: {}ms for {:.2}s of audio", elapsed_ms, audio_secs);
                let text = text.trim();
                if text.is_empty() {
                    debug!("recognizer returned nothing, discarding");
                    None
                } else {
                    Some(text.to_string())
                }
            }
            Ok(Err(e)) => {
                warn!("STT failed, treating as empty: {}", e);
                None
            }
            Err(e) => {
                warn!("STT task panicked, treating as empty: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: f32) -> AudioFrame {
        AudioFrame::new(vec![tag; 320])
    }

    fn started() -> VadEvent {
        VadEvent::VoiceStarted { at: Utc::now() }
    }

    fn ended() -> VadEvent {
        VadEvent::VoiceEnded {
            at: Utc::now(),
            speech: Duration::ZERO,
        }
    }

    #[test]
    fn test_utterance_starts_with_pre_roll_in_order() {
        let mut buffer = UtteranceBuffer::new(3, 16000);
        for i in 0..3 {
            buffer.push_frame(frame(i as f32));
        }
        buffer.handle_event(&started());
        buffer.push_frame(frame(10.0));
        let utterance = buffer.handle_event(&ended()).unwrap();

        assert_eq!(utterance.pre_roll_frames, 3);
        assert_eq!(utterance.frames, 4);
        let firsts: Vec<f32> = utterance.samples.chunks(320).map(|c| c[0]).collect();
        assert_eq!(firsts, vec![0.0, 1.0, 2.0, 10.0]);
    }

    #[test]
    fn frames_before_voice_started_stay_out_of_utterance() {
        let mut buffer = UtteranceBuffer::new(2, 16000);
        for i in 0..5 {
            buffer.push_frame(frame(i as f32));
        }
        assert!(!buffer.is_collecting());
        buffer.voice_started();
        assert_eq!(buffer.buffered_frames(), 2);
    }

    #[test]
    fn test_second_voice_ended_is_a_no_op() {
        let mut buffer = UtteranceBuffer::new(2, 16000);
        buffer.push_frame(frame(0.1));
        buffer.voice_started();
        assert!(buffer.voice_ended().is_some());
        assert!(buffer.voice_ended().is_none());
        assert!(!buffer.is_collecting());
    }

    #[test]
    fn spurious_voice_ended_without_start_yields_nothing() {
        let mut buffer = UtteranceBuffer::new(2, 16000);
        buffer.push_frame(frame(0.1));
        assert!(buffer.handle_event(&ended()).is_none());
    }

    #[test]
    fn sixty_frames_make_one_payload_of_about_1_2s() {
        let mut buffer = UtteranceBuffer::new(10, 16000);
        for _ in 0..10 {
            buffer.push_frame(frame(0.0));
        }
        buffer.voice_started();
        for _ in 0..60 {
            buffer.push_frame(frame(0.2));
        }
        let utterance = buffer.voice_ended().unwrap();
        assert_eq!(utterance.frames, 70);
        let speech = utterance.duration() - Duration::from_millis(200);
        assert_eq!(speech, Duration::from_millis(1200));
    }

    struct Fixed(&'static str);

    impl Recognizer for Fixed {
        fn recognize(&self, _utterance: &Utterance) -> crate::error::VoiceResult<String> {
            Ok(self.0.to_string())
        }
    }

    fn utterance() -> Utterance {
        Utterance {
            samples: vec![0.0; 320],
            sample_rate: 16000,
            started_at: Utc::now(),
            pre_roll_frames: 0,
            frames: 1,
        }
    }

    #[tokio::test]
    async fn test_blank_recognition_is_discarded() {
        let shared = SharedState::new();
        let (utt_tx, utterances_rx) = mpsc::channel(4);
        let (transcripts_tx, mut transcripts_rx) = mpsc::channel(4);
        let worker = RecognitionWorker {
            recognizer: Arc::new(Fixed("   ")),
            shared: shared.clone(),
            utterances_rx,
            transcripts_tx,
            poll: Duration::from_millis(10),
        };
        let handle = tokio::spawn(worker.run());
        utt_tx.send(utterance()).await.unwrap();
        drop(utt_tx);
        handle.await.unwrap();
        assert!(transcripts_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn recognized_text_is_trimmed_and_forwarded() {
        let shared = SharedState::new();
        let (utt_tx, utterances_rx) = mpsc::channel(4);
        let (transcripts_tx, mut transcripts_rx) = mpsc::channel(4);
        let worker = RecognitionWorker {
            recognizer: Arc::new(Fixed(" hello there ")),
            shared,
            utterances_rx,
            transcripts_tx,
            poll: Duration::from_millis(10),
        };
        let handle = tokio::spawn(worker.run());
        utt_tx.send(utterance()).await.unwrap();
        assert_eq!(transcripts_rx.recv().await.unwrap().text, "hello there");
        drop(utt_tx);
        handle.await.unwrap();
    }
}
