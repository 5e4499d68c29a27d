//! Latest-wins frame hand-off between acquisition and publication
//!
//! When the queue is full the oldest frame is dropped, never the newest.
//! The sender side is synchronous and never waits, so the camera loop keeps
//! its cadence no matter how slow the consumer is.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::Frame;

/// Statistics about frame dropping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// Total frames pushed
    pub frames_received: u64,
    /// Frames dropped because the queue was full
    pub frames_dropped: u64,
}

impl QueueStats {
    /// Get the drop rate as a percentage
    pub fn drop_rate(&self) -> f64 {
        if self.frames_received == 0 {
            0.0
        } else {
            (self.frames_dropped as f64 / self.frames_received as f64) * 100.0
        }
    }
}

/// Bounded FIFO that evicts the oldest frame on overflow
#[derive(Debug)]
pub struct LatestQueue {
    buffer: VecDeque<Frame>,
    capacity: usize,
    stats: QueueStats,
}

impl LatestQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            stats: QueueStats::default(),
        }
    }

    /// Push a frame, dropping the oldest if full.
    ///
    /// Returns the dropped frame's sequence, if any.
    pub fn push(&mut self, frame: Frame) -> Option<u64> {
        self.stats.frames_received += 1;

        let dropped = if self.buffer.len() >= self.capacity {
            self.stats.frames_dropped += 1;
            self.buffer.pop_front().map(|f| f.sequence)
        } else {
            None
        };

        self.buffer.push_back(frame);
        dropped
    }

    /// Pop the oldest frame
    pub fn pop(&mut self) -> Option<Frame> {
        self.buffer.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

struct Shared {
    queue: Mutex<LatestQueue>,
    notify: Notify,
    closed: AtomicBool,
}

/// Create a latest-wins channel holding at most `capacity` frames
pub fn latest_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(LatestQueue::new(capacity)),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
    });
    (
        FrameSender {
            shared: shared.clone(),
        },
        FrameReceiver { shared },
    )
}

pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Queue a frame without waiting. Returns false if an older frame was dropped.
    pub fn send(&self, frame: Frame) -> bool {
        let dropped = self.shared.queue.lock().push(frame);
        self.shared.notify.notify_one();
        if let Some(sequence) = dropped {
            debug!("Hand-off queue full, dropped frame {}", sequence);
            return false;
        }
        true
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.queue.lock().stats().clone()
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

pub struct FrameReceiver {
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Wait for the next frame. Returns `None` once the sender is gone and
    /// the queue has drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.shared.queue.lock().pop() {
                return Some(frame);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // Sender may have pushed right before closing
                return self.shared.queue.lock().pop();
            }
            self.shared.notify.notified().await;
        }
    }
}
