//! Detection results and the trigger policy that decides which ones matter

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Axis-aligned box in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.right - self.left).max(0.0) * (self.bottom - self.top).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    /// Score in [0, 1]
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// Detector output for one sampled frame.
///
/// An empty `objects` list is a valid result and is still published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub frame_sequence: u64,
    pub frame_captured_at_us: u64,
    /// When inference finished, microseconds since the Unix epoch
    pub detected_at_us: u64,
    pub objects: Vec<DetectedObject>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Highest-confidence object, if any
    pub fn best(&self) -> Option<&DetectedObject> {
        self.objects
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// Labels that open an event, and the confidence they need to do it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerPolicy {
    pub labels: BTreeSet<String>,
    pub confidence_floor: f32,
}

impl TriggerPolicy {
    pub fn new<I, S>(labels: I, confidence_floor: f32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            confidence_floor,
        }
    }

    pub fn matches(&self, object: &DetectedObject) -> bool {
        object.confidence >= self.confidence_floor && self.labels.contains(&object.label)
    }

    /// A detection qualifies when any of its objects matches.
    pub fn qualifies(&self, detection: &Detection) -> bool {
        detection.objects.iter().any(|o| self.matches(o))
    }
}
