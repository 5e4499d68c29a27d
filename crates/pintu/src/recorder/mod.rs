//! Recorder: turns detections into persisted event segments
//!
//! A single task owns the [`RecorderMachine`] and with it the pre-roll
//! buffer, so frame ingestion, detections, timer ticks and storage results
//! are applied strictly one after another.

pub mod buffer;
pub mod event;
pub mod machine;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use buffer::{BufferStats, PreRollBuffer};
pub use event::{EventHistory, EventId, EventRecord, EventState, SegmentRequest};
pub use machine::{ActiveEvent, Effect, Input, MachineStats, RecorderMachine, RecorderState};

use crate::bus::Bus;
use crate::storage::SegmentStore;
use crate::{Clock, Component, Detection, HealthTracker, Topic};

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Labels that open an event
    pub trigger_labels: Vec<String>,
    /// Minimum confidence for a trigger label to count
    pub trigger_confidence: f32,
    /// Footage kept from before the triggering detection
    pub pre_roll_ms: u64,
    /// Quiet time before an open event starts cooling
    pub cooldown_ms: u64,
    /// Further quiet time before a cooling event closes
    pub close_ms: u64,
    /// Events open longer than this fail instead of growing forever
    pub max_event_ms: u64,
    /// Byte budget of the pre-roll buffer
    pub buffer_max_bytes: usize,
    /// How often timers are checked
    pub tick_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            trigger_labels: vec!["person".to_string()],
            trigger_confidence: 0.33,
            pre_roll_ms: 5_000,
            cooldown_ms: 5_000,
            close_ms: 10_000,
            max_event_ms: 5 * 60 * 1_000,
            buffer_max_bytes: 64 * 1024 * 1024, // 64 MB
            tick_interval_ms: 250,
        }
    }
}

/// Counters reported when the recorder stops
#[derive(Debug, Clone, Default)]
pub struct RecorderStats {
    pub frames_ingested: u64,
    pub detections_seen: u64,
    pub events: MachineStats,
    pub buffer: BufferStats,
}

pub struct Recorder {
    bus: Bus,
    store: Arc<dyn SegmentStore>,
    clock: Arc<dyn Clock>,
    config: RecorderConfig,
    machine: RecorderMachine,
    health: HealthTracker,
    stats: RecorderStats,
}

impl Recorder {
    pub fn new(bus: Bus, store: Arc<dyn SegmentStore>, clock: Arc<dyn Clock>, config: RecorderConfig) -> Self {
        let machine = RecorderMachine::new(&config);
        Self {
            bus,
            store,
            clock,
            config,
            machine,
            health: HealthTracker::new(1),
            stats: RecorderStats::default(),
        }
    }

    fn publish_status(&self, detail: Option<String>) {
        let status = self.health.status(Component::Recorder, detail, self.clock.now_us());
        if let Err(e) = self.bus.publish_message(Topic::Status, &status) {
            warn!("Failed to publish recorder status: {}", e);
        }
    }

    /// Run until cancelled, then force-close and flush any open event
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RecorderStats> {
        let mut frames = self.bus.subscribe(Topic::Frames);
        let mut detections = self.bus.subscribe(Topic::Detections);
        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Recorder started: triggers {:?}, pre-roll {}ms, cooldown {}ms, close {}ms",
            self.config.trigger_labels, self.config.pre_roll_ms, self.config.cooldown_ms, self.config.close_ms
        );
        self.publish_status(None);

        loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv_frame() => match frame {
                    Some(frame) => {
                        self.stats.frames_ingested += 1;
                        Input::Frame(frame)
                    }
                    None => break,
                },
                detection = detections.recv_message::<Detection>() => match detection {
                    Some(detection) => {
                        self.stats.detections_seen += 1;
                        Input::Detection(detection)
                    }
                    None => break,
                },
                _ = ticker.tick() => Input::Tick,
            };
            self.dispatch(input).await;
        }

        if !self.machine.state().is_idle() {
            info!("Shutting down with event {} in progress, flushing", self.machine.state().name());
        }
        self.dispatch(Input::ForceClose).await;

        self.stats.events = self.machine.stats().clone();
        self.stats.buffer = self.machine.buffer().stats().clone();
        info!(
            "Recorder stopped: {} frames, {} detections, {} events ({} persisted, {} failed)",
            self.stats.frames_ingested,
            self.stats.detections_seen,
            self.stats.events.events_opened,
            self.stats.events.events_persisted,
            self.stats.events.events_failed
        );
        Ok(self.stats)
    }

    /// Feed one input through the machine and carry out its effects.
    ///
    /// Storage results are fed back in before returning, so persistence is
    /// finished before the next frame or detection is looked at.
    async fn dispatch(&mut self, input: Input) {
        let mut pending = VecDeque::from([input]);

        while let Some(input) = pending.pop_front() {
            let effects = self.machine.handle(input, self.clock.now_us());
            for effect in effects {
                match effect {
                    Effect::Publish(record) => self.publish_record(&record),
                    Effect::Persist(request) => {
                        let event_id = request.record.event_id;
                        match self.store.persist(&request.record, &request.frames).await {
                            Ok(segment_id) => {
                                info!(
                                    "Event {} persisted as {} ({} frames)",
                                    event_id,
                                    segment_id,
                                    request.frames.len()
                                );
                                if self.health.record_success().is_some() {
                                    self.publish_status(None);
                                }
                                pending.push_back(Input::Persisted { event_id, segment_id });
                            }
                            Err(e) => {
                                error!("Failed to persist event {}: {:#}", event_id, e);
                                if self.health.record_failure().is_some() {
                                    self.publish_status(Some(format!("{:#}", e)));
                                }
                                pending.push_back(Input::PersistFailed {
                                    event_id,
                                    reason: format!("{:#}", e),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    fn publish_record(&self, record: &EventRecord) {
        debug!(
            "Event {} -> {:?} ({} frames)",
            record.event_id, record.state, record.frame_count
        );
        if let Err(e) = self.bus.publish_message(Topic::Events, record) {
            warn!("Failed to publish event {}: {}", record.event_id, e);
        }
    }
}
