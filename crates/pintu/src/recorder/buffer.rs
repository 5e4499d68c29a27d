//! Pre-roll buffer
//!
//! Holds the most recent frames within a time window and a byte budget.
//! Frames from an open event onward are pinned: eviction stops at the first
//! pinned frame and resumes once the event releases them.

use std::collections::VecDeque;

use crate::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pin {
    None,
    /// Pinned from this sequence onward
    From(u64),
    /// Event opened with nothing eligible buffered; pin the next frame in
    Pending,
}

/// Statistics about buffer churn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStats {
    pub frames_inserted: u64,
    pub frames_evicted: u64,
    /// Most frames held at once
    pub peak_frames: usize,
}

#[derive(Debug)]
pub struct PreRollBuffer {
    frames: VecDeque<Frame>,
    window_us: u64,
    max_bytes: usize,
    total_bytes: usize,
    pin: Pin,
    stats: BufferStats,
}

impl PreRollBuffer {
    pub fn new(window_us: u64, max_bytes: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            window_us,
            max_bytes,
            total_bytes: 0,
            pin: Pin::None,
            stats: BufferStats::default(),
        }
    }

    /// Insert a frame and evict whatever the budgets no longer allow.
    ///
    /// Returns the number of frames evicted.
    pub fn insert(&mut self, frame: Frame) -> usize {
        if self.pin == Pin::Pending {
            self.pin = Pin::From(frame.sequence);
        }
        self.total_bytes += frame.size_bytes();
        self.frames.push_back(frame);
        self.stats.frames_inserted += 1;
        self.stats.peak_frames = self.stats.peak_frames.max(self.frames.len());
        self.evict()
    }

    fn is_pinned(&self, frame: &Frame) -> bool {
        match self.pin {
            Pin::From(sequence) => frame.sequence >= sequence,
            Pin::None | Pin::Pending => false,
        }
    }

    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        // The newest frame is always kept
        while self.frames.len() > 1 {
            let (Some(oldest), Some(newest)) = (self.frames.front(), self.frames.back()) else {
                break;
            };
            if self.is_pinned(oldest) {
                break;
            }
            let over_time = newest.captured_at_us.saturating_sub(oldest.captured_at_us) > self.window_us;
            let over_bytes = self.total_bytes > self.max_bytes;
            if !over_time && !over_bytes {
                break;
            }
            if let Some(frame) = self.frames.pop_front() {
                self.total_bytes -= frame.size_bytes();
                evicted += 1;
            }
        }
        self.stats.frames_evicted += evicted as u64;
        evicted
    }

    /// Pin every frame captured at or after `since_us`, plus all frames that
    /// arrive until [`release`](Self::release).
    ///
    /// Returns the first pinned sequence, or `None` if no buffered frame is
    /// recent enough and the next inserted frame will be the first.
    pub fn pin_since(&mut self, since_us: u64) -> Option<u64> {
        match self.frames.iter().find(|f| f.captured_at_us >= since_us) {
            Some(frame) => {
                self.pin = Pin::From(frame.sequence);
                Some(frame.sequence)
            }
            None => {
                self.pin = Pin::Pending;
                None
            }
        }
    }

    /// Unpin and apply the budgets again
    pub fn release(&mut self) -> usize {
        self.pin = Pin::None;
        self.evict()
    }

    /// Copies of all pinned frames, oldest first
    pub fn pinned_frames(&self) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|f| self.is_pinned(f))
            .cloned()
            .collect()
    }

    pub fn pinned_count(&self) -> usize {
        self.frames.iter().filter(|f| self.is_pinned(f)).count()
    }

    /// First pinned sequence, once known
    pub fn pinned_from(&self) -> Option<u64> {
        match self.pin {
            Pin::From(sequence) => Some(sequence),
            Pin::None | Pin::Pending => None,
        }
    }

    /// Time span between oldest and newest buffered frame
    pub fn duration_us(&self) -> u64 {
        match (self.frames.front(), self.frames.back()) {
            (Some(oldest), Some(newest)) => newest.captured_at_us.saturating_sub(oldest.captured_at_us),
            _ => 0,
        }
    }

    /// Time span of the unpinned frames plus the first pinned one
    pub fn unpinned_duration_us(&self) -> u64 {
        let Some(oldest) = self.frames.front() else {
            return 0;
        };
        let newest_unpinned = self
            .frames
            .iter()
            .take_while(|f| !self.is_pinned(f))
            .last()
            .map_or(oldest.captured_at_us, |f| f.captured_at_us);
        newest_unpinned.saturating_sub(oldest.captured_at_us)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}
