//! Audio frames and their distribution.
//!
//! Capture pushes raw samples into a [`CaptureSink`], which cuts them into
//! fixed-length [`AudioFrame`]s. The fanout worker copies every frame to each
//! registered consumer channel with a non-blocking send: a full consumer loses
//! that frame, nobody else is affected, and capture never waits.

use crate::state::SharedState;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace};

/// Fixed-length block of mono f32 PCM (-1.0..1.0). Frames carry no sequence
/// number; order is channel FIFO order.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Shared so fanout copies are cheap.
    pub samples: Arc<[f32]>,

    /// When the frame was assembled
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
            captured_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean squared amplitude.
    pub fn energy(&self) -> f32 {
        frame_energy(&self.samples)
    }
}

/// Mean squared amplitude of a block of samples (0.0 for an empty block).
pub fn frame_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32
}

/// Concatenate frames into one contiguous payload, preserving order.
pub fn concat_frames(frames: &[AudioFrame]) -> Vec<f32> {
    let total = frames.iter().map(AudioFrame::len).sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        out.extend_from_slice(&frame.samples);
    }
    out
}

/// Cuts an arbitrary stream of samples into frames of `frame_samples`.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples; call `emit` once per completed frame.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        for &sample in samples {
            self.pending.push(sample);
            if self.pending.len() >= self.frame_samples {
                let next = Vec::with_capacity(self.frame_samples);
                let full = std::mem::replace(&mut self.pending, next);
                emit(AudioFrame::new(full));
            }
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

/// Entry point for an audio source. Lives on the capture thread; every call is
/// non-blocking.
pub struct CaptureSink {
    assembler: FrameAssembler,
    tx: mpsc::Sender<AudioFrame>,
    dropped: u64,
}

impl CaptureSink {
    pub fn new(frame_samples: usize, tx: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            assembler: FrameAssembler::new(frame_samples),
            tx,
            dropped: 0,
        }
    }

    /// Feed raw mono samples at the configured rate.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let tx = &self.tx;
        let dropped = &mut self.dropped;
        self.assembler.push(samples, |frame| {
            if tx.try_send(frame).is_err() {
                *dropped += 1;
            }
        });
    }

    /// Feed an already assembled frame. Returns false when it was dropped.
    pub fn push_frame(&mut self, frame: AudioFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.dropped += 1;
                false
            }
        }
    }

    /// Frames lost because the fanout fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn frame_samples(&self) -> usize {
        self.assembler.frame_samples()
    }
}

struct FanoutConsumer {
    name: &'static str,
    tx: mpsc::Sender<AudioFrame>,
    dropped: u64,
}

/// Distributes frames to N independent bounded consumer channels.
#[derive(Default)]
pub struct AudioFanout {
    consumers: Vec<FanoutConsumer>,
}

impl AudioFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer with its own bounded channel.
    pub fn add_consumer(
        &mut self,
        name: &'static str,
        capacity: usize,
    ) -> mpsc::Receiver<AudioFrame> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.consumers.push(FanoutConsumer { name, tx, dropped: 0 });
        rx
    }

    /// Offer `frame` to every consumer. A full channel drops the frame for that
    /// consumer only. Returns how many consumers received it.
    pub fn publish(&mut self, frame: &AudioFrame) -> usize {
        let mut delivered = 0;
        for consumer in &mut self.consumers {
            match consumer.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    consumer.dropped += 1;
                    trace!(
                        consumer = consumer.name,
                        dropped = consumer.dropped,
                        "fanout: consumer full, frame dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Frames dropped so far for the named consumer.
    pub fn dropped(&self, name: &str) -> u64 {
        self.consumers
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.dropped)
            .unwrap_or(0)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn log_drops(&self) {
        for c in &self.consumers {
            if c.dropped > 0 {
                info!("Fanout: {} frames dropped for slow consumer {}", c.dropped, c.name);
            }
        }
    }
}

/// Fanout worker: capture channel → every consumer.
pub async fn run_fanout(
    mut fanout: AudioFanout,
    mut capture_rx: mpsc::Receiver<AudioFrame>,
    shared: SharedState,
    poll: Duration,
) {
    debug!(consumers = fanout.consumer_count(), "fanout worker started");
    while !shared.is_shutdown() {
        match tokio::time::timeout(poll, capture_rx.recv()).await {
            Ok(Some(frame)) => {
                fanout.publish(&frame);
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    fanout.log_drops();
    debug!("fanout worker stopped");
}

/// Most recent `capacity` frames, updated with every captured frame regardless
/// of detection state.
#[derive(Debug)]
pub struct PreRollRing {
    frames: VecDeque<AudioFrame>,
    capacity: usize,
}

impl PreRollRing {
    /// `capacity` is clamped to at least one frame.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, overwriting the oldest frame once full.
    pub fn push(&mut self, frame: AudioFrame) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<AudioFrame> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
