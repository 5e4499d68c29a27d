//! Storage for finalized event segments
//!
//! The recorder hands each closed event to a [`SegmentStore`] and gets back
//! a segment id or an error. [`spawn_retention_task`] deletes segments once
//! they age past the retention period.

pub mod local;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::recorder::EventRecord;
use crate::{Clock, Frame};

pub use local::LocalSegmentStore;

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding segment files
    pub root_path: PathBuf,
    /// Retention period in seconds (0 = unlimited)
    pub retention_secs: u64,
    /// Cleanup interval in seconds
    pub cleanup_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("recordings"),
            retention_secs: 7 * 24 * 60 * 60, // 7 days
            cleanup_interval_secs: 3600,      // 1 hour
        }
    }
}

/// Summary of one persisted segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: String,
    /// First frame capture time (event open time if no frames)
    pub start_us: u64,
    /// Event close time
    pub end_us: u64,
    pub frame_count: u32,
    pub size_bytes: u64,
}

/// Storage backend trait
#[async_trait::async_trait]
pub trait SegmentStore: Send + Sync {
    /// Write a finalized event segment, returning its id
    async fn persist(&self, record: &EventRecord, frames: &[Frame]) -> Result<String>;

    /// All stored segments, oldest first
    async fn list(&self) -> Result<Vec<SegmentInfo>>;

    /// Read back a segment's frames in order
    async fn load(&self, segment_id: &str) -> Result<Vec<Frame>>;

    /// Delete segments that ended before the given timestamp, returning bytes freed
    async fn cleanup(&self, before_timestamp_us: u64) -> Result<u64>;

    /// Get storage usage in bytes
    async fn usage_bytes(&self) -> Result<u64>;

    /// Get available capacity in bytes (None if unknown)
    async fn available_bytes(&self) -> Result<Option<u64>>;
}

/// Run one retention pass: delete everything older than `retention_secs`
pub async fn apply_retention(store: &dyn SegmentStore, retention_secs: u64, now_us: u64) -> Result<u64> {
    if retention_secs == 0 {
        return Ok(0);
    }
    let cutoff_us = now_us.saturating_sub(retention_secs.saturating_mul(1_000_000));
    store.cleanup(cutoff_us).await
}

/// Start the periodic cleanup task
pub fn spawn_retention_task(
    store: Arc<dyn SegmentStore>,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.cleanup_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match apply_retention(store.as_ref(), config.retention_secs, clock.now_us()).await {
                        Ok(deleted) if deleted > 0 => {
                            info!("Periodic cleanup: removed {} bytes", deleted);
                        }
                        Ok(_) => {
                            debug!("Periodic cleanup: nothing to clean");
                        }
                        Err(e) => {
                            warn!("Periodic cleanup failed: {:#}", e);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Storage cleanup task shutting down");
                    break;
                }
            }
        }
    })
}
