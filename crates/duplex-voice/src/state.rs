//! **SharedState** — the bot state machine and every cross-worker signal.
//!
//! This is the only memory mutated by more than one worker. All reads and writes
//! go through one mutex, and every public operation is a single critical section,
//! so "check, then act" decisions (e.g. "start speaking unless a barge-in already
//! moved us back to listening") cannot interleave with another worker. Nothing
//! performs I/O while holding the lock; transitions are logged and broadcast
//! after it is released.
//!
//! Signals:
//! - barge-in: edge-triggered, single slot. Set by VAD, consumed (and cleared) by
//!   the orchestrator.
//! - generation-cancel / synthesis-cancel: level-triggered. Raised on barge-in,
//!   cleared only when the next turn begins.
//! - shutdown: level-triggered, one-way.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

const TRANSITION_BROADCAST_CAPACITY: usize = 64;

/// Conversational state of the bot. Exactly one value at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl BotState {
    /// The transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, to: BotState) -> bool {
        use BotState::*;
        matches!(
            (self, to),
            (Idle, Listening)
                | (Listening, Thinking)
                | (Thinking, Speaking)
                | (Speaking, Listening)
                | (Thinking, Listening)
        )
    }

    /// States in which a barge-in cancels the reply.
    pub fn is_replying(self) -> bool {
        matches!(self, BotState::Thinking | BotState::Speaking)
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BotState::Idle => "IDLE",
            BotState::Listening => "LISTENING",
            BotState::Thinking => "THINKING",
            BotState::Speaking => "SPEAKING",
        };
        f.write_str(name)
    }
}

/// Identifies one recognize → generate → synthesize → play cycle.
///
/// Every request, token, sentence and clip carries the id of the turn it belongs
/// to, so work left over from a cancelled or superseded turn is recognisable
/// after the cancel signals have been cleared for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct TurnId(u64);

impl TurnId {
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        TurnId(self.0 + 1)
    }
}

impl From<u64> for TurnId {
    fn from(id: u64) -> Self {
        TurnId(id)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One observed state change. Broadcast to subscribers for observability only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: BotState,
    pub to: BotState,
    pub reason: &'static str,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of the shared flags (debugging and tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: BotState,
    pub turn: TurnId,
    pub barge_in_pending: bool,
    pub generation_cancelled: bool,
    pub synthesis_cancelled: bool,
    pub shutdown: bool,
    pub outstanding_sentences: usize,
    pub reply_finished: bool,
}

/// Tracks how much of the current turn's reply is still on its way to the speaker.
#[derive(Debug, Default)]
struct SpeechLedger {
    outstanding: usize,
    reply_finished: bool,
}

#[derive(Debug, Default)]
struct LatencyMarks {
    last_transcript_at: Option<Instant>,
    first_sound_at: Option<Instant>,
    started_this_turn: bool,
    /// Turn that `last_transcript_at` belongs to, bound when the turn begins.
    bound_turn: Option<TurnId>,
    last_turn_latency: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: BotState,
    barge_in: bool,
    shutdown: bool,
    generation_cancel: bool,
    synthesis_cancel: bool,
    turn: TurnId,
    ledger: SpeechLedger,
    latency: LatencyMarks,
}

impl Inner {
    fn apply(&mut self, to: BotState, reason: &'static str) -> VoiceResult<StateTransition> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(VoiceError::InvalidTransition { from, to });
        }
        self.state = to;
        Ok(StateTransition {
            from,
            to,
            reason,
            at: Utc::now(),
        })
    }

    /// Raise both cancel signals and return to listening, if a reply is in flight.
    fn cancel_reply(&mut self, reason: &'static str) -> Option<StateTransition> {
        if !self.state.is_replying() {
            return None;
        }
        self.generation_cancel = true;
        self.synthesis_cancel = true;
        self.ledger = SpeechLedger::default();
        self.apply(BotState::Listening, reason).ok()
    }

    /// Natural completion: the reply is fully generated and nothing is left to play.
    fn complete_if_drained(&mut self) -> Option<StateTransition> {
        if !self.ledger.reply_finished || self.ledger.outstanding > 0 {
            return None;
        }
        let reason = match self.state {
            BotState::Speaking => "playback finished",
            BotState::Thinking => "nothing to say",
            _ => return None,
        };
        self.apply(BotState::Listening, reason).ok()
    }
}

/// Cloneable handle to the shared state. Pass one to every worker.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<Inner>>,
    transitions: broadcast::Sender<StateTransition>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    /// Create a new shared state in `IDLE`.
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: BotState::Idle,
                barge_in: false,
                shutdown: false,
                generation_cancel: false,
                synthesis_cancel: false,
                turn: TurnId::default(),
                ledger: SpeechLedger::default(),
                latency: LatencyMarks::default(),
            })),
            transitions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner is plain data; a panicking holder cannot leave it half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, transition: Option<StateTransition>) {
        if let Some(t) = transition {
            info!("🔄 State: {} → {} ({})", t.from, t.to, t.reason);
            let _ = self.transitions.send(t);
        }
    }

    /// Receive every subsequent transition.
    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    pub fn state(&self) -> BotState {
        self.lock().state
    }

    pub fn current_turn(&self) -> TurnId {
        self.lock().turn
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let g = self.lock();
        StateSnapshot {
            state: g.state,
            turn: g.turn,
            barge_in_pending: g.barge_in,
            generation_cancelled: g.generation_cancel,
            synthesis_cancelled: g.synthesis_cancel,
            shutdown: g.shutdown,
            outstanding_sentences: g.ledger.outstanding,
            reply_finished: g.ledger.reply_finished,
        }
    }

    /// Validated transition. Returns the previous state.
    pub fn transition(&self, to: BotState, reason: &'static str) -> VoiceResult<BotState> {
        let t = self.lock().apply(to, reason)?;
        let from = t.from;
        self.report(Some(t));
        Ok(from)
    }

    /// IDLE → LISTENING once every worker is running.
    pub fn start_listening(&self) -> VoiceResult<()> {
        self.transition(BotState::Listening, "startup complete").map(|_| ())
    }

    // ---------------------------------------------------------------------
    // Barge-in (edge-triggered, single slot)
    // ---------------------------------------------------------------------

    /// Set the barge-in flag. Idempotent: a second set before consumption is lost.
    pub fn trigger_barge_in(&self) {
        self.lock().barge_in = true;
    }

    /// Read and clear the barge-in flag.
    pub fn consume_barge_in(&self) -> bool {
        std::mem::take(&mut self.lock().barge_in)
    }

    /// Consume the barge-in flag and, if it was set while a reply is in flight,
    /// raise both cancel signals and return to LISTENING. The flag is cleared
    /// even when nothing is cancelled. Returns true when a reply was cancelled.
    pub fn interrupt(&self) -> bool {
        let transition = {
            let mut g = self.lock();
            if !std::mem::take(&mut g.barge_in) {
                return false;
            }
            g.cancel_reply("barge-in")
        };
        let cancelled = transition.is_some();
        self.report(transition);
        cancelled
    }

    /// Cancel the in-flight reply without a barge-in (a newer transcript supersedes it).
    pub fn cancel_reply(&self, reason: &'static str) -> bool {
        let transition = self.lock().cancel_reply(reason);
        let cancelled = transition.is_some();
        self.report(transition);
        cancelled
    }

    // ---------------------------------------------------------------------
    // Turn lifecycle
    // ---------------------------------------------------------------------

    /// LISTENING → THINKING for a freshly dispatched transcript. Clears both
    /// cancel signals, allocates the next turn id and binds the latest
    /// recognition mark to it.
    pub fn begin_turn(&self) -> VoiceResult<TurnId> {
        let (turn, transition) = {
            let mut g = self.lock();
            let t = g.apply(BotState::Thinking, "transcript dispatched")?;
            g.generation_cancel = false;
            g.synthesis_cancel = false;
            g.turn = g.turn.next();
            g.ledger = SpeechLedger::default();
            g.latency.bound_turn = Some(g.turn);
            (g.turn, t)
        };
        self.report(Some(transition));
        Ok(turn)
    }

    /// THINKING → SPEAKING when the first clip of `turn` starts. Returns whether
    /// the clip may play: false when the turn was cancelled or superseded.
    pub fn begin_speaking(&self, turn: TurnId) -> bool {
        let transition = {
            let mut g = self.lock();
            if g.turn != turn || g.synthesis_cancel || g.shutdown {
                return false;
            }
            match g.state {
                BotState::Speaking => None,
                BotState::Thinking => g.apply(BotState::Speaking, "playback started").ok(),
                _ => return false,
            }
        };
        self.report(transition);
        true
    }

    /// A sentence of `turn` was handed to synthesis.
    pub fn sentence_queued(&self, turn: TurnId) {
        let mut g = self.lock();
        if g.turn == turn {
            g.ledger.outstanding += 1;
        }
    }

    /// A sentence of `turn` left the pipeline: played, stopped, or dropped.
    pub fn sentence_done(&self, turn: TurnId) {
        let transition = {
            let mut g = self.lock();
            if g.turn != turn || g.synthesis_cancel {
                return;
            }
            g.ledger.outstanding = g.ledger.outstanding.saturating_sub(1);
            g.complete_if_drained()
        };
        self.report(transition);
    }

    /// The generator finished `turn`'s reply (end-of-stream or failure).
    pub fn finish_reply(&self, turn: TurnId) {
        let transition = {
            let mut g = self.lock();
            if g.turn != turn || g.generation_cancel {
                return;
            }
            g.ledger.reply_finished = true;
            g.complete_if_drained()
        };
        self.report(transition);
    }

    // ---------------------------------------------------------------------
    // Level-triggered signals
    // ---------------------------------------------------------------------

    pub fn generation_cancelled(&self) -> bool {
        self.lock().generation_cancel
    }

    pub fn synthesis_cancelled(&self) -> bool {
        self.lock().synthesis_cancel
    }

    /// Whether the generator should keep streaming for `turn`.
    pub fn generation_active(&self, turn: TurnId) -> bool {
        let g = self.lock();
        !g.shutdown && !g.generation_cancel && g.turn == turn
    }

    /// Whether audio for `turn` should still be synthesized and played.
    pub fn synthesis_active(&self, turn: TurnId) -> bool {
        let g = self.lock();
        !g.shutdown && !g.synthesis_cancel && g.turn == turn
    }

    /// One-way shutdown request observed by every worker loop.
    pub fn request_shutdown(&self) {
        let mut g = self.lock();
        if !g.shutdown {
            g.shutdown = true;
            debug!("shutdown requested");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    // ---------------------------------------------------------------------
    // Latency marks
    // ---------------------------------------------------------------------

    /// Record that a final transcript was produced. Clears the first-sound flag;
    /// the mark is bound to a turn when that turn begins.
    pub fn mark_recognition_final(&self) -> Instant {
        let now = Instant::now();
        let mut g = self.lock();
        g.latency.last_transcript_at = Some(now);
        g.latency.started_this_turn = false;
        g.latency.bound_turn = None;
        now
    }

    /// Record that a clip of `turn` began playing. The first time per turn,
    /// returns (and logs) the time since that turn's recognition mark.
    pub fn mark_playback_start(&self, turn: TurnId) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = {
            let mut g = self.lock();
            g.latency.first_sound_at = Some(now);
            if g.latency.started_this_turn || g.latency.bound_turn != Some(turn) {
                return None;
            }
            g.latency.started_this_turn = true;
            let elapsed = g
                .latency
                .last_transcript_at
                .map(|t| now.saturating_duration_since(t));
            g.latency.last_turn_latency = elapsed;
            elapsed
        };
        if let Some(e) = elapsed {
            info!(
                "⏱️ Latency: recognition final → first sound {}ms (turn {})",
                e.as_millis(),
                turn
            );
        }
        elapsed
    }

    /// Most recent recognition → first-sound measurement.
    pub fn last_turn_latency(&self) -> Option<Duration> {
        self.lock().latency.last_turn_latency
    }
}
