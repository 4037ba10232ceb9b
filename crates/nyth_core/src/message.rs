//! Message Types for Thread Communication
//!
//! Events flow from the audio and analysis threads to the control thread
//! through an [`EventQueue`]. Producers never block: when the queue is full
//! the oldest event is discarded to make room.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// Evict-and-retry rounds before a push gives up under contention
const PUSH_ATTEMPTS: usize = 4;

/// Events sent from the engine to the control thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    /// Output level of the last processed block (linear, 0.0 - 1.0)
    LevelUpdate { rms: f32, peak: f32 },

    /// Band magnitudes from the analysis worker
    SpectrumUpdate {
        magnitudes: Vec<f32>,
        frequencies: Vec<f32>,
        centroid: f32,
    },

    /// The safety limiter clipped or scrubbed samples, or heard feedback
    SafetyWarning {
        clipped_samples: usize,
        non_finite_samples: usize,
        overload: bool,
        feedback_score: f32,
        feedback_likely: bool,
    },

    /// A component moved to a new lifecycle state
    StateChanged { component: String, state: String },

    /// Error occurred
    Error { message: String },
}

impl Event {
    /// Create an error event from any error type
    pub fn error<E: std::fmt::Display>(err: E) -> Self {
        Event::Error {
            message: err.to_string(),
        }
    }

    pub fn state_changed(component: &str, state: &str) -> Self {
        Event::StateChanged {
            component: component.to_string(),
            state: state.to_string(),
        }
    }
}

/// Bounded multi-producer event queue with drop-oldest backpressure
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `event`, evicting the oldest entry if the queue is full
    ///
    /// Returns false when something had to be dropped. Never blocks; an
    /// evicted event is freed on the calling thread.
    pub fn push(&self, event: Event) -> bool {
        let mut event = event;
        let mut evicted = false;
        for _ in 0..PUSH_ATTEMPTS {
            match self.sender.try_send(event) {
                Ok(()) => return !evicted,
                Err(TrySendError::Full(returned)) => {
                    if self.receiver.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted = true;
                    }
                    event = returned;
                }
                // Both ends live in `self`
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// Everything currently queued, oldest first
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events discarded since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
