//! Control API: status and event queries, door commands
//!
//! [`ControlApi`] keeps the last status each component published and a
//! bounded history of recent events, both fed from bus subscriptions. It
//! never talks to a component directly, so a component that is not running
//! simply shows up with no status.
//!
//! Commands are validated for shape, stamped with a fresh request id and
//! published once on the commands topic. Nothing here waits for the door to
//! actually move.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusStats};
use crate::recorder::{EventHistory, EventRecord};
use crate::storage::{SegmentInfo, SegmentStore};
use crate::{Clock, Command, CommandKind, Component, ComponentStatus, Health, PipelineError, Topic};

/// Control API configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP listen port
    pub port: u16,
    /// Recent events kept for queries
    pub history_len: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            history_len: 50,
        }
    }
}

/// Storage figures included in the status query
#[derive(Debug, Clone, Serialize)]
pub struct StorageReport {
    pub segments: usize,
    pub usage_bytes: u64,
    pub available_bytes: Option<u64>,
}

/// Answer to the status query
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub camera: String,
    pub uptime_secs: u64,
    /// Last-known status per component; `None` if it never reported
    pub components: BTreeMap<&'static str, Option<ComponentStatus>>,
    pub commands_submitted: u64,
    pub storage: Option<StorageReport>,
}

impl PipelineStatus {
    /// True when every component that has reported is healthy
    pub fn all_healthy(&self) -> bool {
        self.components
            .values()
            .flatten()
            .all(|s| s.health == Health::Healthy)
    }
}

struct ApiInner {
    bus: Bus,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SegmentStore>>,
    statuses: RwLock<HashMap<Component, ComponentStatus>>,
    history: Mutex<EventHistory>,
    commands_submitted: AtomicU64,
    started_at_us: u64,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ControlApi {
    inner: Arc<ApiInner>,
}

impl ControlApi {
    pub fn new(
        bus: Bus,
        clock: Arc<dyn Clock>,
        history_len: usize,
        store: Option<Arc<dyn SegmentStore>>,
    ) -> Self {
        let started_at_us = clock.now_us();
        Self {
            inner: Arc::new(ApiInner {
                bus,
                clock,
                store,
                statuses: RwLock::new(HashMap::new()),
                history: Mutex::new(EventHistory::new(history_len)),
                commands_submitted: AtomicU64::new(0),
                started_at_us,
            }),
        }
    }

    /// Subscribe to status and events, then keep the views current until cancelled.
    ///
    /// Subscriptions are taken before this returns, so nothing published
    /// afterwards is missed.
    pub fn spawn_ingest(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut status_sub = self.inner.bus.subscribe(Topic::Status);
        let mut event_sub = self.inner.bus.subscribe(Topic::Events);
        let api = self.clone();

        let own = ComponentStatus {
            component: Component::Api,
            health: Health::Healthy,
            detail: None,
            consecutive_failures: 0,
            updated_at_us: self.inner.clock.now_us(),
        };
        if let Err(e) = self.inner.bus.publish_message(Topic::Status, &own) {
            warn!("Failed to publish api status: {}", e);
        }

        tokio::spawn(async move {
            info!("Control API ingest started for {}", api.inner.bus.camera());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    status = status_sub.recv_message::<ComponentStatus>() => match status {
                        Some(status) => api.record_status(status),
                        None => break,
                    },
                    record = event_sub.recv_message::<EventRecord>() => match record {
                        Some(record) => api.record_event(record),
                        None => break,
                    },
                }
            }
            debug!("Control API ingest stopped");
        })
    }

    fn record_status(&self, status: ComponentStatus) {
        debug!(component = %status.component, health = ?status.health, "Status update");
        self.inner.statuses.write().insert(status.component, status);
    }

    fn record_event(&self, record: EventRecord) {
        debug!(event_id = %record.event_id, state = ?record.state, "Event update");
        self.inner.history.lock().upsert(record);
    }

    pub fn camera(&self) -> &str {
        self.inner.bus.camera()
    }

    /// Last-known status of one component
    pub fn component_status(&self, component: Component) -> Option<ComponentStatus> {
        self.inner.statuses.read().get(&component).cloned()
    }

    pub async fn status(&self) -> PipelineStatus {
        let components = {
            let statuses = self.inner.statuses.read();
            Component::ALL
                .into_iter()
                .map(|c| (c.as_str(), statuses.get(&c).cloned()))
                .collect()
        };

        let storage = match &self.inner.store {
            Some(store) => Some(storage_report(store.as_ref()).await),
            None => None,
        };

        let now = self.inner.clock.now_us();
        PipelineStatus {
            camera: self.camera().to_string(),
            uptime_secs: now.saturating_sub(self.inner.started_at_us) / 1_000_000,
            components,
            commands_submitted: self.inner.commands_submitted.load(Ordering::Relaxed),
            storage,
        }
    }

    /// Most recent events, newest first
    pub fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        self.inner.history.lock().recent(limit)
    }

    pub fn bus_stats(&self) -> BusStats {
        self.inner.bus.stats()
    }

    /// Stored segments, or `None` when no store is attached
    pub async fn segments(&self) -> Option<anyhow::Result<Vec<SegmentInfo>>> {
        match &self.inner.store {
            Some(store) => Some(store.list().await),
            None => None,
        }
    }

    /// Validate a command and publish it exactly once
    pub fn submit(&self, kind: CommandKind) -> Result<Command, PipelineError> {
        let command = Command::new(kind, self.inner.clock.now_us())?;
        let sequence = self.inner.bus.publish_message(Topic::Commands, &command)?;
        self.inner.commands_submitted.fetch_add(1, Ordering::Relaxed);

        info!(
            request_id = %command.request_id,
            sequence,
            "Command {} published",
            command.kind.name()
        );
        Ok(command)
    }
}

async fn storage_report(store: &dyn SegmentStore) -> StorageReport {
    let segments = match store.list().await {
        Ok(list) => list.len(),
        Err(e) => {
            warn!("Failed to list segments: {:#}", e);
            0
        }
    };
    StorageReport {
        segments,
        usage_bytes: store.usage_bytes().await.unwrap_or(0),
        available_bytes: store.available_bytes().await.ok().flatten(),
    }
}
