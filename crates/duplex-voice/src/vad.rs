//! Energy-based Voice Activity Detection.
//!
//! Two phases:
//!
//! 1. **Calibration** — listen to background noise for a fixed number of frames
//!    and take the median frame energy as the baseline (robust to a door slam
//!    during calibration). The speech threshold is `baseline × factor`. If no
//!    audio arrives the engine falls back to a fixed baseline instead of waiting
//!    forever.
//! 2. **Detection** — per-frame state machine:
//!
//! ```text
//! Silent ── loud ──► Pending ── loud for ≥ min_speech ──► Speaking  (voice_started, barge-in)
//!   ▲                  │                                      │
//!   └──── quiet ───────┘                                      │ quiet (or no frames) for > silence
//!   └─────────────────────────────────────────────────────────┘  (voice_ended)
//! ```
//!
//! Silence is measured in wall-clock time since the last loud frame, not in
//! frames, because frames may stop arriving entirely.

use crate::audio::AudioFrame;
use crate::config::VadConfig;
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Baseline energy used when calibration saw no audio at all.
pub const FALLBACK_BASELINE_ENERGY: f32 = 1e-7;

/// Per-read wait during calibration.
pub const CALIBRATION_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Speech boundary reported by the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// Continuous speech confirmed.
    VoiceStarted { at: DateTime<Utc> },

    /// Speech followed by enough silence (or the utterance hit its length cap).
    VoiceEnded { at: DateTime<Utc>, speech: Duration },
}

impl VadEvent {
    pub fn is_start(&self) -> bool {
        matches!(self, VadEvent::VoiceStarted { .. })
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            VadEvent::VoiceStarted { at } | VadEvent::VoiceEnded { at, .. } => *at,
        }
    }
}

/// Median of `values` (mean of the two middle values for an even count).
pub fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Outcome of phase 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub baseline: f32,
    pub threshold: f32,
    pub frames: usize,
    /// True when no audio arrived and the fixed baseline was used.
    pub fallback: bool,
}

impl Calibration {
    /// Derive the threshold from the collected per-frame energies.
    pub fn from_energies(mut energies: Vec<f32>, factor: f32) -> Self {
        let frames = energies.len();
        match median(&mut energies) {
            Some(baseline) => Self {
                baseline,
                threshold: baseline * factor,
                frames,
                fallback: false,
            },
            None => Self {
                baseline: FALLBACK_BASELINE_ENERGY,
                threshold: FALLBACK_BASELINE_ENERGY * factor,
                frames: 0,
                fallback: true,
            },
        }
    }
}

/// Phase 1: consume up to `target_frames` frames. Gives up after
/// `max_timeouts` consecutive empty reads and calibrates on what it has.
pub async fn calibrate(
    frames_rx: &mut mpsc::Receiver<AudioFrame>,
    shared: &SharedState,
    target_frames: usize,
    max_timeouts: u32,
    factor: f32,
) -> Calibration {
    info!("🎙️ Calibrating background noise ({} frames)", target_frames);
    let mut energies = Vec::with_capacity(target_frames);
    let mut timeouts = 0;

    while energies.len() < target_frames && !shared.is_shutdown() {
        match tokio::time::timeout(CALIBRATION_READ_TIMEOUT, frames_rx.recv()).await {
            Ok(Some(frame)) => {
                timeouts = 0;
                energies.push(frame.energy());
            }
            Ok(None) => break,
            Err(_) => {
                timeouts += 1;
                if timeouts >= max_timeouts.max(1) {
                    warn!(
                        "⏱️ No audio during calibration, giving up early ({} frames collected)",
                        energies.len()
                    );
                    break;
                }
            }
        }
    }

    let calibration = Calibration::from_energies(energies, factor);
    if calibration.fallback {
        warn!(
            "No audio received during calibration, using fallback threshold {:e}",
            calibration.threshold
        );
    } else {
        info!(
            "🎚️ VAD calibrated: baseline {:e}, threshold {:e} ({} frames)",
            calibration.baseline, calibration.threshold, calibration.frames
        );
    }
    calibration
}

/// Detection phase of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorPhase {
    Silent,
    /// Loud audio seen since `since`, not yet long enough to count as speech.
    Pending { since: Instant },
    Speaking { started: Instant, last_voice: Instant },
}

/// Phase 2 state machine. Pure: callers pass the clock in.
#[derive(Debug)]
pub struct VadDetector {
    threshold: f32,
    min_speech: Duration,
    silence: Duration,
    max_utterance: Duration,
    phase: DetectorPhase,
}

impl VadDetector {
    pub fn new(threshold: f32, config: &VadConfig) -> Self {
        Self {
            threshold,
            min_speech: Duration::from_millis(config.min_speech_ms as u64),
            silence: Duration::from_millis(config.silence_ms as u64),
            max_utterance: Duration::from_millis(config.max_utterance_ms as u64),
            phase: DetectorPhase::Silent,
        }
    }

    /// Feed one frame's energy observed at `now`.
    pub fn process(&mut self, energy: f32, now: Instant) -> Option<VadEvent> {
        let loud = energy > self.threshold;
        match (self.phase, loud) {
            (DetectorPhase::Silent, false) | (DetectorPhase::Pending { .. }, false) => {
                // A burst shorter than min_speech is noise.
                self.phase = DetectorPhase::Silent;
                None
            }
            (DetectorPhase::Silent, true) => self.promote_if_due(now, now),
            (DetectorPhase::Pending { since }, true) => self.promote_if_due(since, now),
            (DetectorPhase::Speaking { started, .. }, true) => {
                self.phase = DetectorPhase::Speaking {
                    started,
                    last_voice: now,
                };
                if now.saturating_duration_since(started) >= self.max_utterance {
                    warn!("⏱️ Max utterance duration reached, closing it");
                    return self.end();
                }
                None
            }
            (DetectorPhase::Speaking { .. }, false) => self.poll_timeout(now),
        }
    }

    /// No frame arrived before the poll timeout; close speech on wall-clock silence.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<VadEvent> {
        match self.phase {
            DetectorPhase::Speaking { last_voice, .. }
                if now.saturating_duration_since(last_voice) > self.silence =>
            {
                self.end()
            }
            _ => None,
        }
    }

    fn promote_if_due(&mut self, since: Instant, now: Instant) -> Option<VadEvent> {
        if now.saturating_duration_since(since) >= self.min_speech {
            self.phase = DetectorPhase::Speaking {
                started: now,
                last_voice: now,
            };
            Some(VadEvent::VoiceStarted { at: Utc::now() })
        } else {
            self.phase = DetectorPhase::Pending { since };
            None
        }
    }

    fn end(&mut self) -> Option<VadEvent> {
        let speech = match self.phase {
            DetectorPhase::Speaking {
                started,
                last_voice,
            } => last_voice.saturating_duration_since(started),
            _ => return None,
        };
        self.phase = DetectorPhase::Silent;
        Some(VadEvent::VoiceEnded {
            at: Utc::now(),
            speech,
        })
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.phase, DetectorPhase::Speaking { .. })
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// VAD worker: calibrates, then turns frames into voice events.
pub struct VadWorker {
    pub config: VadConfig,
    pub calibration_frames: usize,
    pub shared: SharedState,
    pub frames_rx: mpsc::Receiver<AudioFrame>,
    /// Utterance worker. Events are never dropped here.
    pub events_tx: mpsc::Sender<VadEvent>,
    /// Orchestrator copy, observability only (dropped when full).
    pub observer_tx: Option<mpsc::Sender<VadEvent>>,
}

impl VadWorker {
    pub async fn run(mut self) {
        let calibration = calibrate(
            &mut self.frames_rx,
            &self.shared,
            self.calibration_frames,
            self.config.calibration_max_timeouts,
            self.config.threshold_factor,
        )
        .await;

        let mut detector = VadDetector::new(calibration.threshold, &self.config);
        let poll = Duration::from_millis(self.config.poll_timeout_ms as u64);
        info!("✅ VAD listening");

        while !self.shared.is_shutdown() {
            let event = match tokio::time::timeout(poll, self.frames_rx.recv()).await {
                Ok(Some(frame)) => detector.process(frame.energy(), Instant::now()),
                Ok(None) => break,
                Err(_) => detector.poll_timeout(Instant::now()),
            };
            if let Some(event) = event {
                if !self.emit(event).await {
                    break;
                }
            }
        }
        debug!("VAD worker stopped");
    }

    async fn emit(&self, event: VadEvent) -> bool {
        match &event {
            VadEvent::VoiceStarted { .. } => {
                info!("🎤 Speech started");
                // Unconditional: the orchestrator decides whether it matters.
                self.shared.trigger_barge_in();
            }
            VadEvent::VoiceEnded { speech, .. } => {
                info!("✅ Speech ended after {:?}", speech);
            }
        }
        if let Some(observer) = &self.observer_tx {
            let _ = observer.try_send(event.clone());
        }
        self.events_tx.send(event).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VadConfig {
        VadConfig {
            min_speech_ms: 40,
            silence_ms: 100,
            max_utterance_ms: 10_000,
            ..Default::default()
        }
    }

    const LOUD: f32 = 1.0;
    const QUIET: f32 = 0.0;

    #[test]
    fn median_is_robust_to_one_spike() {
        let mut energies = vec![0.01, 0.02, 5.0, 0.015, 0.012];
        assert_eq!(median(&mut energies), Some(0.015));
        let mut even = vec![1.0, 3.0];
        assert_eq!(median(&mut even), Some(2.0));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn calibration_without_audio_uses_fallback() {
        let c = Calibration::from_energies(Vec::new(), 2.0);
        assert!(c.fallback);
        assert_eq!(c.baseline, FALLBACK_BASELINE_ENERGY);
        assert_eq!(c.threshold, FALLBACK_BASELINE_ENERGY * 2.0);
    }

    #[test]
    fn test_short_burst_is_noise() {
        let mut vad = VadDetector::new(0.5, &config());
        let t0 = Instant::now();
        assert_eq!(vad.process(LOUD, t0), None);
        assert_eq!(vad.process(LOUD, t0 + Duration::from_millis(20)), None);
        assert_eq!(vad.process(QUIET, t0 + Duration::from_millis(30)), None);
        assert_eq!(vad.phase(), DetectorPhase::Silent);
        // Timer restarted: another 20ms of loudness is still not enough.
        assert_eq!(vad.process(LOUD, t0 + Duration::from_millis(40)), None);
        assert_eq!(vad.process(LOUD, t0 + Duration::from_millis(60)), None);
    }

    #[test]
    fn sustained_speech_starts_then_ends_after_silence() {
        let mut vad = VadDetector::new(0.5, &config());
        let t0 = Instant::now();
        let ms = |n: u64| t0 + Duration::from_millis(n);

        assert!(vad.process(LOUD, ms(0)).is_none());
        assert!(vad.process(LOUD, ms(20)).is_none());
        assert!(vad.process(LOUD, ms(40)).unwrap().is_start());
        assert!(vad.is_speaking());

        assert!(vad.process(LOUD, ms(200)).is_none());
        assert!(vad.process(QUIET, ms(260)).is_none());
        match vad.process(QUIET, ms(301)) {
            Some(VadEvent::VoiceEnded { speech, .. }) => {
                assert_eq!(speech, Duration::from_millis(160))
            }
            other => panic!("expected voice_ended, got {other:?}"),
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn zero_min_speech_starts_on_first_loud_frame() {
        let mut vad = VadDetector::new(
            0.5,
            &VadConfig {
                min_speech_ms: 0,
                ..config()
            },
        );
        assert!(vad.process(LOUD, Instant::now()).unwrap().is_start());
    }

    #[test]
    fn silence_is_measured_without_frames() {
        let mut vad = VadDetector::new(0.5, &VadConfig { min_speech_ms: 0, ..config() });
        let t0 = Instant::now();
        vad.process(LOUD, t0);
        assert!(vad.poll_timeout(t0 + Duration::from_millis(50)).is_none());
        assert!(vad.poll_timeout(t0 + Duration::from_millis(150)).is_some());
        assert!(vad.poll_timeout(t0 + Duration::from_millis(300)).is_none());
    }

    #[test]
    fn test_endless_speech_is_capped() {
        let mut vad = VadDetector::new(
            0.5,
            &VadConfig {
                min_speech_ms: 0,
                max_utterance_ms: 100,
                ..config()
            },
        );
        let t0 = Instant::now();
        vad.process(LOUD, t0);
        assert!(vad.process(LOUD, t0 + Duration::from_millis(50)).is_none());
        assert!(matches!(
            vad.process(LOUD, t0 + Duration::from_millis(100)),
            Some(VadEvent::VoiceEnded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_gives_up_without_blocking_forever() {
        let shared = SharedState::new();
        let (_tx, mut rx) = mpsc::channel::<AudioFrame>(4);
        let c = calibrate(&mut rx, &shared, 40, 3, 2.0).await;
        assert!(c.fallback);
        assert_eq!(c.threshold, FALLBACK_BASELINE_ENERGY * 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_emits_events_and_sets_barge_in() {
        let shared = SharedState::new();
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (observer_tx, mut observer_rx) = mpsc::channel(8);
        let worker = VadWorker {
            config: VadConfig {
                min_speech_ms: 40,
                silence_ms: 100,
                poll_timeout_ms: 20,
                ..Default::default()
            },
            calibration_frames: 2,
            shared: shared.clone(),
            frames_rx,
            events_tx,
            observer_tx: Some(observer_tx),
        };
        let handle = tokio::spawn(worker.run());

        for _ in 0..2 {
            frames_tx.send(AudioFrame::new(vec![0.001; 320])).await.unwrap();
        }
        for _ in 0..5 {
            frames_tx.send(AudioFrame::new(vec![0.5; 320])).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(events_rx.recv().await.unwrap().is_start());
        assert!(shared.consume_barge_in());

        // Frames stop entirely; voice_ended still arrives.
        let ended = events_rx.recv().await.unwrap();
        assert!(matches!(ended, VadEvent::VoiceEnded { .. }));
        assert!(observer_rx.recv().await.unwrap().is_start());

        shared.request_shutdown();
        handle.await.unwrap();
    }
}
