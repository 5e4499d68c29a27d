//! Capture module: turns a camera into a sequenced frame stream
//!
//! - [`Camera`] implementations produce one still per read
//! - [`FrameSource`] rate-limits reads, stamps sequence and capture time,
//!   and publishes on the frames topic
//! - [`queue`] sits between acquisition and publication and drops the
//!   oldest frame when full, so a slow path never stalls the camera

pub mod camera;
pub mod queue;
pub mod source;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use camera::{Camera, CommandCamera, StillCommandConfig};
pub use queue::{latest_channel, FrameReceiver, FrameSender, LatestQueue, QueueStats};
pub use source::{CaptureStats, FrameSource};

#[cfg(feature = "test-source")]
pub use camera::{TestCamera, TestCameraConfig};

/// Highest sample rate the source accepts
pub const MAX_SAMPLE_RATE_FPS: f64 = 1_000.0;

/// Lowest sample rate the source accepts (one read every ~17 minutes)
pub const MIN_SAMPLE_RATE_FPS: f64 = 0.001;

/// Frame source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Camera reads per second
    pub sample_rate_fps: f64,
    /// Frames held between acquisition and publication
    pub queue_capacity: usize,
    /// Consecutive read failures before reporting Degraded
    pub failure_threshold: u32,
    /// First retry delay after a failed read
    pub initial_backoff_ms: u64,
    /// Retry delay ceiling
    pub max_backoff_ms: u64,
    /// A read taking longer than this counts as a failed read
    pub read_timeout_ms: u64,
    /// Stop capturing after this long (None = run until shutdown)
    pub max_duration_secs: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate_fps: 5.0,
            queue_capacity: 4,
            failure_threshold: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            read_timeout_ms: 10_000,
            max_duration_secs: None,
        }
    }
}

impl CaptureConfig {
    /// Time between camera reads, with the rate clamped to the accepted range
    pub fn frame_interval(&self) -> Duration {
        let fps = if self.sample_rate_fps.is_nan() {
            MIN_SAMPLE_RATE_FPS
        } else {
            self.sample_rate_fps.clamp(MIN_SAMPLE_RATE_FPS, MAX_SAMPLE_RATE_FPS)
        };
        Duration::from_secs_f64(1.0 / fps)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    /// Retry delay after `failures` consecutive failed reads (exponential, capped)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}
