//! Event records: what the recorder reports about each event

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

use crate::{Detection, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Open,
    Cooling,
    Closing,
    Persisted,
    Failed,
}

impl EventState {
    /// Persisted and Failed are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventState::Persisted | EventState::Failed)
    }
}

/// Snapshot of one event, published on the events topic at every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub state: EventState,
    pub opened_at_us: u64,
    /// Set while cooling down
    pub cooling_since_us: Option<u64>,
    /// Set once closing starts
    pub closed_at_us: Option<u64>,
    /// The detection that opened the event
    pub trigger: Detection,
    pub last_qualifying_at_us: u64,
    pub qualifying_detections: u32,
    /// Frames retained so far (pre-roll included)
    pub frame_count: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub segment_id: Option<String>,
    pub failure: Option<String>,
}

impl EventRecord {
    /// Open-to-close span, once closed
    pub fn duration_us(&self) -> Option<u64> {
        self.closed_at_us
            .map(|closed| closed.saturating_sub(self.opened_at_us))
    }
}

/// Finalized frames plus metadata, handed to storage when an event closes
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub record: EventRecord,
    pub frames: Vec<Frame>,
}

/// Bounded list of recent events, newest first, one entry per event
#[derive(Debug, Clone)]
pub struct EventHistory {
    records: VecDeque<EventRecord>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Replace the entry for this event, or add it at the front
    pub fn upsert(&mut self, record: EventRecord) {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.event_id == record.event_id)
        {
            *existing = record;
            return;
        }
        self.records.push_front(record);
        self.records.truncate(self.capacity);
    }

    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        self.records.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
