//! **TurnOrchestrator** — the control loop that turns transcripts into replies.
//!
//! Every tick runs three passes, none of which waits for input:
//!
//! 1. barge-in: consume the edge flag; cancel the in-flight reply if there is one
//! 2. transcripts: start a turn per transcript (a later one supersedes an earlier one)
//! 3. tokens: segment generated text into sentences and hand them to synthesis
//!
//! The generation worker lives here too: it streams fragments for one request
//! at a time and stops pulling as soon as the turn is no longer active.

use crate::backend::{GenerationRequest, Generator, Sentence, TokenEvent, Transcript};
use crate::state::{SharedState, TurnId};
use crate::vad::VadEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Characters that close a sentence.
pub const SENTENCE_TERMINALS: [char; 3] = ['.', '!', '?'];

/// Accumulates streamed text and cuts it at sentence-terminal punctuation.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    full: String,
    current: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. If it contains terminal punctuation the current
    /// sentence is flushed and returned (trimmed, never empty).
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.full.push_str(fragment);
        self.current.push_str(fragment);
        if fragment.contains(SENTENCE_TERMINALS) {
            return take_trimmed(&mut self.current);
        }
        None
    }

    /// End of stream: flush whatever is left and reset both accumulators.
    pub fn finish(&mut self) -> Option<String> {
        let leftover = take_trimmed(&mut self.current);
        self.full.clear();
        leftover
    }

    pub fn reset(&mut self) {
        self.full.clear();
        self.current.clear();
    }

    /// Everything received since the last reset.
    pub fn full_response(&self) -> &str {
        &self.full
    }

    pub fn pending(&self) -> &str {
        &self.current
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.current.is_empty()
    }
}

fn take_trimmed(buf: &mut String) -> Option<String> {
    let text = buf.trim().to_string();
    buf.clear();
    (!text.is_empty()).then_some(text)
}

/// The turn currently owned by the orchestrator.
#[derive(Debug)]
struct ActiveTurn {
    id: TurnId,
    next_sentence: u32,
}

pub struct TurnOrchestrator {
    shared: SharedState,
    max_tokens: u32,
    segmenter: SentenceSegmenter,
    turn: Option<ActiveTurn>,
    transcripts_rx: mpsc::Receiver<Transcript>,
    tokens_rx: mpsc::Receiver<TokenEvent>,
    vad_events_rx: Option<mpsc::Receiver<VadEvent>>,
    requests_tx: mpsc::Sender<GenerationRequest>,
    sentences_tx: mpsc::Sender<Sentence>,
}

impl TurnOrchestrator {
    pub fn new(
        shared: SharedState,
        max_tokens: u32,
        transcripts_rx: mpsc::Receiver<Transcript>,
        tokens_rx: mpsc::Receiver<TokenEvent>,
        requests_tx: mpsc::Sender<GenerationRequest>,
        sentences_tx: mpsc::Sender<Sentence>,
    ) -> Self {
        Self {
            shared,
            max_tokens,
            segmenter: SentenceSegmenter::new(),
            turn: None,
            transcripts_rx,
            tokens_rx,
            vad_events_rx: None,
            requests_tx,
            sentences_tx,
        }
    }

    /// Also drain the VAD observer channel (logged only).
    pub fn with_vad_events(mut self, rx: mpsc::Receiver<VadEvent>) -> Self {
        self.vad_events_rx = Some(rx);
        self
    }

    /// Run ticks at `period` until shutdown.
    pub async fn run(mut self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("🎭 Turn orchestrator running (tick {:?})", period);
        while !self.shared.is_shutdown() {
            interval.tick().await;
            self.tick();
        }
        debug!("orchestrator stopped");
    }

    /// One iteration: barge-in, transcripts, tokens. Never blocks.
    pub fn tick(&mut self) {
        self.barge_in_pass();
        self.transcript_pass();
        self.token_pass();
        self.observe_vad();
    }

    /// The turn whose tokens are currently being segmented, if any.
    pub fn active_turn(&self) -> Option<TurnId> {
        self.turn.as_ref().map(|t| t.id)
    }

    pub fn segmenter(&self) -> &SentenceSegmenter {
        &self.segmenter
    }

    fn barge_in_pass(&mut self) {
        if self.shared.interrupt() {
            info!("⚡ Barge-in: user speaking, reply cancelled");
            self.abandon_turn();
        }
    }

    fn transcript_pass(&mut self) {
        while let Ok(transcript) = self.transcripts_rx.try_recv() {
            if self.shared.state().is_replying() && self.shared.cancel_reply("superseded") {
                info!("🔄 Newer transcript supersedes the reply in flight");
                self.abandon_turn();
            }

            let turn = match self.shared.begin_turn() {
                Ok(turn) => turn,
                Err(e) => {
                    warn!("Cannot start a turn, transcript dropped: {}", e);
                    continue;
                }
            };
            self.segmenter.reset();
            self.turn = Some(ActiveTurn {
                id: turn,
                next_sentence: 0,
            });

            let request = GenerationRequest {
                turn,
                prompt: transcript.text,
                max_tokens: self.max_tokens,
            };
            if let Err(e) = self.requests_tx.try_send(request) {
                warn!("Generator not accepting requests, turn {} abandoned: {}", turn, e);
                self.turn = None;
                self.shared.finish_reply(turn);
            }
        }
    }

    fn token_pass(&mut self) {
        while let Ok(event) = self.tokens_rx.try_recv() {
            let Some(turn) = self.active_turn() else {
                continue;
            };
            if event.turn() != turn {
                debug!(stale = %event.turn(), current = %turn, "stale token dropped");
                continue;
            }
            match event {
                TokenEvent::Fragment { text, .. } => {
                    if let Some(sentence) = self.segmenter.push(&text) {
                        self.emit_sentence(sentence);
                    }
                }
                TokenEvent::End { .. } => {
                    if let Some(sentence) = self.segmenter.finish() {
                        self.emit_sentence(sentence);
                    }
                    self.segmenter.reset();
                    self.turn = None;
                    self.shared.finish_reply(turn);
                }
            }
        }
    }

    fn emit_sentence(&mut self, text: String) {
        let Some(active) = self.turn.as_mut() else {
            return;
        };
        let sentence = Sentence {
            turn: active.id,
            index: active.next_sentence,
            text,
        };
        active.next_sentence += 1;
        let turn = sentence.turn;

        self.shared.sentence_queued(turn);
        debug!(turn = %turn, index = sentence.index, text = %sentence.text, "sentence ready");
        match self.sentences_tx.try_send(sentence) {
            Ok(()) => {}
            Err(TrySendError::Full(s)) => {
                warn!("Sentence queue full, sentence {} of turn {} dropped", s.index, turn);
                self.shared.sentence_done(turn);
            }
            Err(TrySendError::Closed(_)) => self.shared.sentence_done(turn),
        }
    }

    /// Forget the current turn and everything buffered for it.
    fn abandon_turn(&mut self) {
        self.turn = None;
        self.segmenter.reset();
        let mut discarded = 0usize;
        while self.tokens_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "buffered tokens discarded");
        }
    }

    fn observe_vad(&mut self) {
        if let Some(rx) = self.vad_events_rx.as_mut() {
            while let Ok(event) = rx.try_recv() {
                debug!(
                    at = %event.at(),
                    start = event.is_start(),
                    state = %self.shared.state(),
                    "vad event"
                );
            }
        }
    }
}

enum StreamOutcome {
    Completed,
    Abandoned,
}

/// Streams one generation request at a time into the token channel.
pub struct GenerationWorker {
    pub generator: Arc<dyn Generator>,
    pub shared: SharedState,
    pub requests_rx: mpsc::Receiver<GenerationRequest>,
    pub tokens_tx: mpsc::Sender<TokenEvent>,
    pub poll: Duration,
}

impl GenerationWorker {
    pub async fn run(mut self) {
        while !self.shared.is_shutdown() {
            let request = match tokio::time::timeout(self.poll, self.requests_rx.recv()).await {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(_) => continue,
            };
            if !self.shared.generation_active(request.turn) {
                debug!(turn = %request.turn, "request for inactive turn skipped");
                continue;
            }

            let generator = Arc::clone(&self.generator);
            let shared = self.shared.clone();
            let tokens_tx = self.tokens_tx.clone();
            let joined = tokio::task::spawn_blocking(move || {
                stream_reply(generator.as_ref(), &shared, &tokens_tx, &request)
            })
            .await;
            if let Err(e) = joined {
                warn!("Generation task panicked: {}", e);
            }
        }
        debug!("generation worker stopped");
    }
}

/// Pull fragments until end-of-stream, failure, or the turn goes inactive.
/// Sends `End` unless the stream was abandoned.
fn stream_reply(
    generator: &dyn Generator,
    shared: &SharedState,
    tokens_tx: &mpsc::Sender<TokenEvent>,
    request: &GenerationRequest,
) {
    let turn = request.turn;
    let started = Instant::now();
    let mut fragments = 0usize;

    let outcome = (|| {
        let stream = generator.generate(&request.prompt, request.max_tokens)?;
        for fragment in stream {
            if !shared.generation_active(turn) {
                return Ok(StreamOutcome::Abandoned);
            }
            let text = fragment?;
            if text.is_empty() {
                continue;
            }
            if fragments == 0 {
                info!(
                    "⚡ Time to first token: {}ms (turn {})",
                    started.elapsed().as_millis(),
                    turn
                );
            }
            fragments += 1;
            if tokens_tx.blocking_send(TokenEvent::Fragment { turn, text }).is_err() {
                return Ok(StreamOutcome::Abandoned);
            }
        }
        Ok::<_, crate::error::VoiceError>(StreamOutcome::Completed)
    })();

    match outcome {
        Ok(StreamOutcome::Abandoned) => {
            debug!(turn = %turn, fragments, "generation abandoned");
            return;
        }
        Ok(StreamOutcome::Completed) => {
            debug!(
                turn = %turn,
                fragments,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "generation complete"
            );
        }
        Err(e) => {
            warn!("LLM generation failed for turn {}, ending reply early: {}", turn, e);
        }
    }
    let _ = tokens_tx.blocking_send(TokenEvent::End { turn });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FragmentStream;
    use crate::error::{VoiceError, VoiceResult};
    use crate::state::BotState;
    use chrono::Utc;

    #[test]
    fn hello_there_flushes_exactly_one_sentence() {
        let mut seg = SentenceSegmenter::new();
        assert_eq!(seg.push("Hello"), None);
        assert_eq!(seg.push(" there."), Some("Hello there.".to_string()));
        assert_eq!(seg.finish(), None);
        assert!(seg.is_empty());
    }

    #[test]
    fn leftover_is_flushed_at_end_of_stream() {
        let mut seg = SentenceSegmenter::new();
        assert_eq!(seg.push("Sure! "), Some("Sure!".to_string()));
        seg.push("Let me think");
        assert_eq!(seg.full_response(), "Sure! Let me think");
        assert_eq!(seg.finish(), Some("Let me think".to_string()));
    }

    #[test]
    fn whitespace_only_sentences_are_not_flushed() {
        let mut seg = SentenceSegmenter::new();
        seg.push("   ");
        assert_eq!(seg.push("?"), Some("?".to_string()));
        seg.push("  \n");
        assert_eq!(seg.finish(), None);
    }

    struct Harness {
        shared: SharedState,
        orchestrator: TurnOrchestrator,
        transcripts: mpsc::Sender<Transcript>,
        tokens: mpsc::Sender<TokenEvent>,
        requests: mpsc::Receiver<GenerationRequest>,
        sentences: mpsc::Receiver<Sentence>,
    }

    fn harness() -> Harness {
        let shared = SharedState::new();
        shared.start_listening().unwrap();
        let (transcripts, transcripts_rx) = mpsc::channel(8);
        let (tokens, tokens_rx) = mpsc::channel(64);
        let (requests_tx, requests) = mpsc::channel(8);
        let (sentences_tx, sentences) = mpsc::channel(8);
        let orchestrator = TurnOrchestrator::new(
            shared.clone(),
            160,
            transcripts_rx,
            tokens_rx,
            requests_tx,
            sentences_tx,
        );
        Harness {
            shared,
            orchestrator,
            transcripts,
            tokens,
            requests,
            sentences,
        }
    }

    fn transcript(text: &str) -> Transcript {
        Transcript {
            text: text.to_string(),
            at: Utc::now(),
        }
    }

    fn fragment(turn: TurnId, text: &str) -> TokenEvent {
        TokenEvent::Fragment {
            turn,
            text: text.to_string(),
        }
    }

    #[test]
    fn transcript_starts_turn_and_requests_generation() {
        let mut h = harness();
        h.transcripts.try_send(transcript("hi")).unwrap();
        h.orchestrator.tick();

        assert_eq!(h.shared.state(), BotState::Thinking);
        let request = h.requests.try_recv().unwrap();
        assert_eq!(request.prompt, "hi");
        assert_eq!(request.max_tokens, 160);
        assert_eq!(Some(request.turn), h.orchestrator.active_turn());
    }

    #[test]
    fn tokens_become_ordered_sentences_and_end_finishes_reply() {
        let mut h = harness();
        h.transcripts.try_send(transcript("hi")).unwrap();
        h.orchestrator.tick();
        let turn = h.requests.try_recv().unwrap().turn;

        for text in ["Hello", " there.", " How are", " you?"] {
            h.tokens.try_send(fragment(turn, text)).unwrap();
        }
        h.tokens.try_send(TokenEvent::End { turn }).unwrap();
        h.orchestrator.tick();

        let first = h.sentences.try_recv().unwrap();
        let second = h.sentences.try_recv().unwrap();
        assert_eq!((first.index, first.text.as_str()), (0, "Hello there."));
        assert_eq!((second.index, second.text.as_str()), (1, "How are you?"));
        assert!(h.sentences.try_recv().is_err());

        let snap = h.shared.snapshot();
        assert_eq!(snap.outstanding_sentences, 2);
        assert!(snap.reply_finished);
        assert!(h.orchestrator.segmenter().is_empty());
    }

    #[test]
    fn barge_in_while_thinking_resets_everything() {
        let mut h = harness();
        h.transcripts.try_send(transcript("hi")).unwrap();
        h.orchestrator.tick();
        let turn = h.requests.try_recv().unwrap().turn;

        h.tokens.try_send(fragment(turn, "Half a sent")).unwrap();
        h.orchestrator.tick();
        assert_eq!(h.orchestrator.segmenter().pending(), "Half a sent");

        h.tokens.try_send(fragment(turn, "ence.")).unwrap();
        h.shared.trigger_barge_in();
        h.orchestrator.tick();

        assert_eq!(h.shared.state(), BotState::Listening);
        assert!(h.shared.generation_cancelled());
        assert!(h.shared.synthesis_cancelled());
        assert!(h.orchestrator.segmenter().is_empty());
        assert_eq!(h.orchestrator.active_turn(), None);
        assert!(h.sentences.try_recv().is_err());
    }

    #[test]
    fn barge_in_while_listening_only_clears_the_flag() {
        let mut h = harness();
        h.shared.trigger_barge_in();
        h.orchestrator.tick();
        assert_eq!(h.shared.state(), BotState::Listening);
        assert!(!h.shared.consume_barge_in());
        assert!(!h.shared.generation_cancelled());
    }

    #[test]
    fn test_last_transcript_in_a_pass_wins() {
        let mut h = harness();
        h.transcripts.try_send(transcript("first")).unwrap();
        h.transcripts.try_send(transcript("second")).unwrap();
        h.orchestrator.tick();

        let first = h.requests.try_recv().unwrap();
        let second = h.requests.try_recv().unwrap();
        assert_eq!(second.prompt, "second");
        assert_eq!(h.orchestrator.active_turn(), Some(second.turn));
        assert!(!h.shared.generation_active(first.turn));
        assert!(h.shared.generation_active(second.turn));
        assert_eq!(h.shared.state(), BotState::Thinking);

        // Late tokens from the superseded turn are ignored.
        h.tokens.try_send(fragment(first.turn, "Old news.")).unwrap();
        h.orchestrator.tick();
        assert!(h.sentences.try_recv().is_err());
    }

    #[test]
    fn transcript_while_speaking_supersedes_reply() {
        let mut h = harness();
        h.transcripts.try_send(transcript("hi")).unwrap();
        h.orchestrator.tick();
        let turn = h.requests.try_recv().unwrap().turn;
        h.shared.sentence_queued(turn);
        assert!(h.shared.begin_speaking(turn));

        h.transcripts.try_send(transcript("wait")).unwrap();
        h.orchestrator.tick();
        assert_eq!(h.shared.state(), BotState::Thinking);
        assert!(!h.shared.synthesis_active(turn));
    }

    #[test]
    fn empty_reply_returns_to_listening() {
        let mut h = harness();
        h.transcripts.try_send(transcript("hi")).unwrap();
        h.orchestrator.tick();
        let turn = h.requests.try_recv().unwrap().turn;
        h.tokens.try_send(TokenEvent::End { turn }).unwrap();
        h.orchestrator.tick();
        assert_eq!(h.shared.state(), BotState::Listening);
    }

    struct Scripted(Vec<VoiceResult<String>>);

    impl Generator for Scripted {
        fn generate(&self, _prompt: &str, _max_tokens: u32) -> VoiceResult<FragmentStream<'_>> {
            let items: Vec<VoiceResult<String>> = self
                .0
                .iter()
                .map(|r| match r {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(VoiceError::Generation(e.to_string())),
                })
                .collect();
            Ok(Box::new(items.into_iter()))
        }
    }

    fn request(turn: TurnId) -> GenerationRequest {
        GenerationRequest {
            turn,
            prompt: "hi".into(),
            max_tokens: 16,
        }
    }

    #[tokio::test]
    async fn worker_streams_fragments_then_end() {
        let shared = SharedState::new();
        shared.start_listening().unwrap();
        let turn = shared.begin_turn().unwrap();
        let (requests_tx, requests_rx) = mpsc::channel(4);
        let (tokens_tx, mut tokens_rx) = mpsc::channel(16);
        let worker = GenerationWorker {
            generator: Arc::new(Scripted(vec![
                Ok("Hi".into()),
                Ok(String::new()),
                Ok(" you.".into()),
            ])),
            shared: shared.clone(),
            requests_rx,
            tokens_tx,
            poll: Duration::from_millis(10),
        };
        let handle = tokio::spawn(worker.run());
        requests_tx.send(request(turn)).await.unwrap();

        assert_eq!(tokens_rx.recv().await.unwrap(), fragment(turn, "Hi"));
        assert_eq!(tokens_rx.recv().await.unwrap(), fragment(turn, " you."));
        assert_eq!(tokens_rx.recv().await.unwrap(), TokenEvent::End { turn });

        drop(requests_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_mid_stream_failure_ends_the_reply() {
        let shared = SharedState::new();
        shared.start_listening().unwrap();
        let turn = shared.begin_turn().unwrap();
        let (tokens_tx, mut tokens_rx) = mpsc::channel(16);
        let generator = Scripted(vec![
            Ok("Partial".into()),
            Err(VoiceError::Generation("boom".into())),
            Ok("never".into()),
        ]);

        let tx = tokens_tx.clone();
        let s = shared.clone();
        tokio::task::spawn_blocking(move || stream_reply(&generator, &s, &tx, &request(turn)))
            .await
            .unwrap();

        assert_eq!(tokens_rx.recv().await.unwrap(), fragment(turn, "Partial"));
        assert_eq!(tokens_rx.recv().await.unwrap(), TokenEvent::End { turn });
    }

    #[tokio::test]
    async fn cancelled_turn_is_abandoned_without_end() {
        let shared = SharedState::new();
        shared.start_listening().unwrap();
        let turn = shared.begin_turn().unwrap();
        shared.trigger_barge_in();
        shared.interrupt();

        let (tokens_tx, mut tokens_rx) = mpsc::channel(16);
        let generator = Scripted(vec![Ok("Hello.".into())]);
        let s = shared.clone();
        tokio::task::spawn_blocking(move || {
            stream_reply(&generator, &s, &tokens_tx, &request(turn))
        })
        .await
        .unwrap();
        assert!(tokens_rx.recv().await.is_none());
    }
}
