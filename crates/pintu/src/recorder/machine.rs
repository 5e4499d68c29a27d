//! Recorder state machine
//!
//! ```text
//!          qualifying            cooldown elapsed           close window elapsed
//!   Idle ─────────────▶ Open ─────────────────▶ Cooling ─────────────────────▶ Closing
//!    ▲                   ▲                        │                              │
//!    │                   └────── qualifying ──────┘                              │
//!    │                                                                           ▼
//!    └───────────────────────────────── Persisted / Failed ◀──── storage result ─┘
//! ```
//!
//! The machine does no I/O. Each [`Input`] together with the current time
//! yields a list of [`Effect`]s for the caller to carry out. Timer checks run
//! on every input and compare against absolute deadlines, so a late or
//! repeated tick never fires a transition twice or shifts its timing.

use tracing::{debug, warn};

use super::buffer::PreRollBuffer;
use super::event::{EventId, EventRecord, EventState, SegmentRequest};
use super::RecorderConfig;
use crate::{Detection, Frame, TriggerPolicy};

#[derive(Debug, Clone)]
pub struct ActiveEvent {
    pub id: EventId,
    pub opened_at_us: u64,
    pub trigger: Detection,
    pub last_qualifying_us: u64,
    pub qualifying_detections: u32,
    pub cooling_since_us: Option<u64>,
    pub closed_at_us: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub enum RecorderState {
    #[default]
    Idle,
    Open(ActiveEvent),
    Cooling(ActiveEvent),
    /// Waiting for storage to report back
    Closing(ActiveEvent),
}

impl RecorderState {
    pub fn name(&self) -> &'static str {
        match self {
            RecorderState::Idle => "idle",
            RecorderState::Open(_) => "open",
            RecorderState::Cooling(_) => "cooling",
            RecorderState::Closing(_) => "closing",
        }
    }

    pub fn event(&self) -> Option<&ActiveEvent> {
        match self {
            RecorderState::Idle => None,
            RecorderState::Open(e) | RecorderState::Cooling(e) | RecorderState::Closing(e) => Some(e),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, RecorderState::Idle)
    }
}

#[derive(Debug, Clone)]
pub enum Input {
    Frame(Frame),
    Detection(Detection),
    /// Timer check with no other payload
    Tick,
    /// Close now, keeping what was recorded (shutdown)
    ForceClose,
    Persisted { event_id: EventId, segment_id: String },
    PersistFailed { event_id: EventId, reason: String },
}

#[derive(Debug, Clone)]
pub enum Effect {
    /// Publish the record on the events topic
    Publish(EventRecord),
    /// Hand the segment to storage and feed the result back as an input
    Persist(SegmentRequest),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineStats {
    pub events_opened: u64,
    pub events_persisted: u64,
    pub events_failed: u64,
    pub detections_ignored: u64,
}

pub struct RecorderMachine {
    state: RecorderState,
    buffer: PreRollBuffer,
    trigger: TriggerPolicy,
    pre_roll_us: u64,
    cooldown_us: u64,
    close_us: u64,
    max_event_us: u64,
    stats: MachineStats,
}

impl RecorderMachine {
    pub fn new(config: &RecorderConfig) -> Self {
        let us = |ms: u64| ms.saturating_mul(1_000);
        Self {
            state: RecorderState::Idle,
            buffer: PreRollBuffer::new(us(config.pre_roll_ms), config.buffer_max_bytes),
            trigger: TriggerPolicy::new(config.trigger_labels.iter().cloned(), config.trigger_confidence),
            pre_roll_us: us(config.pre_roll_ms),
            cooldown_us: us(config.cooldown_ms),
            close_us: us(config.close_ms),
            max_event_us: us(config.max_event_ms),
            stats: MachineStats::default(),
        }
    }

    pub fn state(&self) -> &RecorderState {
        &self.state
    }

    pub fn buffer(&self) -> &PreRollBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> &MachineStats {
        &self.stats
    }

    /// Apply one input at `now_us` and return the effects to carry out
    pub fn handle(&mut self, input: Input, now_us: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let state = std::mem::take(&mut self.state);
        let state = self.check_timers(state, now_us, &mut effects);
        self.state = self.apply(state, input, now_us, &mut effects);
        effects
    }

    fn record(&self, event: &ActiveEvent, state: EventState) -> EventRecord {
        let pinned = self.buffer.pinned_frames();
        EventRecord {
            event_id: event.id,
            state,
            opened_at_us: event.opened_at_us,
            cooling_since_us: event.cooling_since_us,
            closed_at_us: event.closed_at_us,
            trigger: event.trigger.clone(),
            last_qualifying_at_us: event.last_qualifying_us,
            qualifying_detections: event.qualifying_detections,
            frame_count: pinned.len(),
            first_sequence: pinned.first().map(|f| f.sequence),
            last_sequence: pinned.last().map(|f| f.sequence),
            segment_id: None,
            failure: None,
        }
    }

    fn check_timers(&mut self, mut state: RecorderState, now_us: u64, effects: &mut Vec<Effect>) -> RecorderState {
        loop {
            state = match state {
                RecorderState::Open(mut event) => {
                    let cooling_at = event.last_qualifying_us.saturating_add(self.cooldown_us);
                    let max_at = event.opened_at_us.saturating_add(self.max_event_us);
                    if now_us >= cooling_at && cooling_at <= max_at {
                        event.cooling_since_us = Some(cooling_at);
                        debug!("Event {} cooling since {}", event.id, cooling_at);
                        effects.push(Effect::Publish(self.record(&event, EventState::Cooling)));
                        RecorderState::Cooling(event)
                    } else if now_us >= max_at {
                        return self.fail(event, max_at, "exceeded maximum event duration", effects);
                    } else {
                        return RecorderState::Open(event);
                    }
                }
                RecorderState::Cooling(event) => {
                    let cooling_since = event.cooling_since_us.unwrap_or(event.last_qualifying_us);
                    let close_at = cooling_since.saturating_add(self.close_us);
                    let max_at = event.opened_at_us.saturating_add(self.max_event_us);
                    if now_us >= close_at && close_at <= max_at {
                        return self.begin_close(event, close_at, effects);
                    } else if now_us >= max_at {
                        return self.fail(event, max_at, "exceeded maximum event duration", effects);
                    } else {
                        return RecorderState::Cooling(event);
                    }
                }
                other => return other,
            };
        }
    }

    fn apply(&mut self, state: RecorderState, input: Input, now_us: u64, effects: &mut Vec<Effect>) -> RecorderState {
        match (state, input) {
            (state, Input::Frame(frame)) => {
                self.buffer.insert(frame);
                state
            }
            (state, Input::Detection(detection)) if !self.trigger.qualifies(&detection) => state,
            (RecorderState::Idle, Input::Detection(detection)) => self.open(detection, now_us, effects),
            (RecorderState::Open(mut event), Input::Detection(_)) => {
                event.last_qualifying_us = now_us;
                event.qualifying_detections += 1;
                RecorderState::Open(event)
            }
            (RecorderState::Cooling(mut event), Input::Detection(_)) => {
                event.last_qualifying_us = now_us;
                event.qualifying_detections += 1;
                event.cooling_since_us = None;
                debug!("Event {} reopened", event.id);
                effects.push(Effect::Publish(self.record(&event, EventState::Open)));
                RecorderState::Open(event)
            }
            (RecorderState::Closing(event), Input::Detection(_)) => {
                self.stats.detections_ignored += 1;
                debug!("Qualifying detection while event {} is closing, ignored", event.id);
                RecorderState::Closing(event)
            }
            (state, Input::Tick) => state,
            (RecorderState::Open(event) | RecorderState::Cooling(event), Input::ForceClose) => {
                self.begin_close(event, now_us, effects)
            }
            (state, Input::ForceClose) => state,
            (RecorderState::Closing(event), Input::Persisted { event_id, segment_id }) if event.id == event_id => {
                let mut record = self.record(&event, EventState::Persisted);
                record.segment_id = Some(segment_id);
                self.buffer.release();
                self.stats.events_persisted += 1;
                effects.push(Effect::Publish(record));
                RecorderState::Idle
            }
            (RecorderState::Closing(event), Input::PersistFailed { event_id, reason }) if event.id == event_id => {
                let mut record = self.record(&event, EventState::Failed);
                record.failure = Some(reason);
                self.buffer.release();
                self.stats.events_failed += 1;
                effects.push(Effect::Publish(record));
                RecorderState::Idle
            }
            (state, Input::Persisted { event_id, .. } | Input::PersistFailed { event_id, .. }) => {
                warn!("Ignoring storage result for unknown event {}", event_id);
                state
            }
        }
    }

    fn open(&mut self, trigger: Detection, now_us: u64, effects: &mut Vec<Effect>) -> RecorderState {
        let since = trigger.detected_at_us.saturating_sub(self.pre_roll_us);
        let first = self.buffer.pin_since(since);
        let event = ActiveEvent {
            id: EventId::new(),
            opened_at_us: now_us,
            trigger,
            last_qualifying_us: now_us,
            qualifying_detections: 1,
            cooling_since_us: None,
            closed_at_us: None,
        };
        self.stats.events_opened += 1;
        debug!("Event {} opened, pre-roll from frame {:?}", event.id, first);
        effects.push(Effect::Publish(self.record(&event, EventState::Open)));
        RecorderState::Open(event)
    }

    fn begin_close(&mut self, mut event: ActiveEvent, closed_at_us: u64, effects: &mut Vec<Effect>) -> RecorderState {
        event.closed_at_us = Some(closed_at_us);
        let record = self.record(&event, EventState::Closing);
        let frames = self.buffer.pinned_frames();
        effects.push(Effect::Publish(record.clone()));
        effects.push(Effect::Persist(SegmentRequest { record, frames }));
        RecorderState::Closing(event)
    }

    fn fail(&mut self, mut event: ActiveEvent, at_us: u64, reason: &str, effects: &mut Vec<Effect>) -> RecorderState {
        event.closed_at_us = Some(at_us);
        let mut record = self.record(&event, EventState::Failed);
        record.failure = Some(reason.to_string());
        self.buffer.release();
        self.stats.events_failed += 1;
        warn!("Event {} failed: {}", event.id, reason);
        effects.push(Effect::Publish(record));
        RecorderState::Idle
    }
}
