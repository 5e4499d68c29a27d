//! Detector: sampled object detection over the frame stream
//!
//! Every `stride`-th frame (by sequence number) goes through the inference
//! capability. Objects under the confidence floor are removed before the
//! Detection is published, so downstream consumers never see them. A failed
//! inference publishes nothing for that frame; absence of a Detection and an
//! empty Detection mean different things.

pub mod inference;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use inference::{HttpInference, Inference, RawObject};

use crate::bus::Bus;
use crate::{
    BoundingBox, Clock, Component, DetectedObject, Detection, Frame, HealthTracker, PipelineError,
    Topic,
};

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Run inference on every Kth frame (1 = every frame)
    pub stride: u64,
    /// Objects scoring below this are dropped
    pub confidence_floor: f32,
    /// Per-frame inference deadline
    pub inference_timeout_ms: u64,
    /// Consecutive inference failures before reporting Degraded
    pub failure_threshold: u32,
    /// Suppress same-label boxes overlapping more than this (None = off)
    pub nms_iou_threshold: Option<f32>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            confidence_floor: 0.33,
            inference_timeout_ms: 2_000,
            failure_threshold: 5,
            nms_iou_threshold: Some(0.6),
        }
    }
}

/// Whether a frame is sampled. Depends only on the sequence and the stride.
pub fn should_sample(sequence: u64, stride: u64) -> bool {
    stride <= 1 || sequence % stride == 0
}

/// Intersection over union of two boxes
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter = BoundingBox {
        left: a.left.max(b.left),
        top: a.top.max(b.top),
        right: a.right.min(b.right),
        bottom: a.bottom.min(b.bottom),
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Apply the confidence floor, then optional per-label non-maximum suppression.
///
/// The result is ordered by descending confidence.
pub fn filter_objects(
    mut objects: Vec<DetectedObject>,
    confidence_floor: f32,
    nms_iou_threshold: Option<f32>,
) -> Vec<DetectedObject> {
    objects.retain(|o| o.confidence >= confidence_floor);
    objects.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let Some(threshold) = nms_iou_threshold else {
        return objects;
    };

    let mut kept: Vec<DetectedObject> = Vec::with_capacity(objects.len());
    for candidate in objects {
        let suppressed = kept.iter().any(|k| {
            k.label == candidate.label && iou(&k.bounding_box, &candidate.bounding_box) > threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Counters reported when the detector stops
#[derive(Debug, Clone, Default)]
pub struct DetectorStats {
    pub frames_seen: u64,
    pub frames_sampled: u64,
    pub detections_published: u64,
    pub inference_failures: u64,
    /// Number of discontinuities in the frame sequence
    pub sequence_gaps: u64,
    /// Frames never seen because of gaps
    pub frames_missed: u64,
}

/// Tracks sequence continuity of the incoming frame stream
#[derive(Debug, Default)]
struct GapTracker {
    last: Option<u64>,
}

impl GapTracker {
    /// Returns the number of frames skipped before `sequence`
    fn observe(&mut self, sequence: u64) -> u64 {
        let missed = match self.last {
            Some(last) if sequence > last + 1 => sequence - last - 1,
            Some(last) if sequence <= last => {
                info!("Frame sequence restarted at {} (was {})", sequence, last);
                0
            }
            _ => 0,
        };
        self.last = Some(sequence);
        missed
    }
}

pub struct Detector {
    inference: Arc<dyn Inference>,
    bus: Bus,
    clock: Arc<dyn Clock>,
    config: DetectorConfig,
}

impl Detector {
    pub fn new(inference: Arc<dyn Inference>, bus: Bus, clock: Arc<dyn Clock>, config: DetectorConfig) -> Self {
        Self {
            inference,
            bus,
            clock,
            config,
        }
    }

    fn publish_status(&self, health: &HealthTracker, detail: Option<String>) {
        let status = health.status(Component::Detector, detail, self.clock.now_us());
        if let Err(e) = self.bus.publish_message(Topic::Status, &status) {
            warn!("Failed to publish detector status: {}", e);
        }
    }

    /// Run inference on one frame, bounded by the configured timeout
    async fn infer(&self, frame: &Frame) -> Result<Vec<DetectedObject>, PipelineError> {
        let deadline = Duration::from_millis(self.config.inference_timeout_ms);
        match timeout(deadline, self.inference.detect(frame)).await {
            Ok(Ok(objects)) => Ok(objects),
            Ok(Err(e)) => Err(PipelineError::Inference(format!("{:#}", e))),
            Err(_) => Err(PipelineError::Inference(format!(
                "timed out after {}ms",
                self.config.inference_timeout_ms
            ))),
        }
    }

    /// Run until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<DetectorStats> {
        let mut frames = self.bus.subscribe(Topic::Frames);
        let mut health = HealthTracker::new(self.config.failure_threshold);
        let mut gaps = GapTracker::default();
        let mut stats = DetectorStats::default();

        info!(
            "Detector started: {} (stride {}, floor {:.2})",
            self.inference.name(),
            self.config.stride,
            self.config.confidence_floor
        );
        self.publish_status(&health, None);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv_frame() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            stats.frames_seen += 1;
            let missed = gaps.observe(frame.sequence);
            if missed > 0 {
                stats.sequence_gaps += 1;
                stats.frames_missed += missed;
                debug!("Frame gap: {} frames missing before {}", missed, frame.sequence);
            }

            if !should_sample(frame.sequence, self.config.stride) {
                continue;
            }
            stats.frames_sampled += 1;

            let objects = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.infer(&frame) => result,
            };

            match objects {
                Ok(objects) => {
                    if health.record_success().is_some() {
                        info!("Inference recovered");
                        self.publish_status(&health, None);
                    }

                    let detection = Detection {
                        frame_sequence: frame.sequence,
                        frame_captured_at_us: frame.captured_at_us,
                        detected_at_us: self.clock.now_us(),
                        objects: filter_objects(
                            objects,
                            self.config.confidence_floor,
                            self.config.nms_iou_threshold,
                        ),
                    };
                    if let Some(best) = detection.best() {
                        debug!(
                            "Frame {}: {} objects, best {} ({:.2})",
                            frame.sequence,
                            detection.objects.len(),
                            best.label,
                            best.confidence
                        );
                    }
                    match self.bus.publish_message(Topic::Detections, &detection) {
                        Ok(_) => stats.detections_published += 1,
                        Err(e) => warn!("Failed to publish detection for frame {}: {}", frame.sequence, e),
                    }
                }
                Err(e) => {
                    stats.inference_failures += 1;
                    warn!("Skipping frame {}: {}", frame.sequence, e);
                    if health.record_failure().is_some() {
                        warn!(
                            "Detector degraded after {} consecutive failures",
                            health.consecutive_failures()
                        );
                        self.publish_status(&health, Some(e.to_string()));
                    }
                }
            }
        }

        info!(
            "Detector stopped: {} frames, {} sampled, {} published, {} failures, {} gaps",
            stats.frames_seen,
            stats.frames_sampled,
            stats.detections_published,
            stats.inference_failures,
            stats.sequence_gaps
        );
        Ok(stats)
    }
}
