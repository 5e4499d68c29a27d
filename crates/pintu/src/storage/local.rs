//! Local filesystem segment store
//!
//! One file per event, named `<opened_at_us>-<event_id>.segment`:
//!
//! ```text
//! ┌────────────┬────────────┬─────────────┬──────────────────────────────────┐
//! │  start_us  │   end_us   │ frame_count │  (len u32, encoded frame) × N    │
//! │  (8, LE)   │  (8, LE)   │   (4, LE)   │                                  │
//! └────────────┴────────────┴─────────────┴──────────────────────────────────┘
//! ```
//!
//! The event record is written next to it as `<id>.json`. Files are written
//! under a temporary name and renamed into place, so a crash never leaves a
//! half-written segment behind under its final name.

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{SegmentInfo, SegmentStore, StorageConfig};
use crate::recorder::EventRecord;
use crate::{frame_from_bytes, frame_to_bytes, Frame, MAX_FRAME_PAYLOAD_SIZE, FRAME_HEADER_SIZE};

/// Segment header size: start(8) + end(8) + frame_count(4)
pub const SEGMENT_HEADER_SIZE: usize = 20;

const SEGMENT_EXTENSION: &str = "segment";

#[derive(Debug, Clone)]
struct SegmentEntry {
    info: SegmentInfo,
    path: PathBuf,
}

/// In-memory index for fast lookups
#[derive(Default)]
struct StorageIndex {
    segments: BTreeMap<String, SegmentEntry>,
    total_bytes: u64,
}

/// Local filesystem storage backend
pub struct LocalSegmentStore {
    root_path: PathBuf,
    index: Arc<RwLock<StorageIndex>>,
}

impl LocalSegmentStore {
    /// Open (or create) a store, rebuilding the index from existing files
    pub fn new(config: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_path).with_context(|| {
            format!("Failed to create storage directory: {:?}", config.root_path)
        })?;

        let index = Self::rebuild_index_sync(&config.root_path)?;

        Ok(Self {
            root_path: config.root_path.clone(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    fn rebuild_index_sync(root: &Path) -> Result<StorageIndex> {
        info!("Scanning storage directory: {:?}", root);

        let mut index = StorageIndex::default();
        for entry in fs::read_dir(root)?.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION) {
                continue;
            }
            match read_segment_info(&path) {
                Ok(info) => {
                    index.total_bytes += info.size_bytes;
                    index.segments.insert(info.id.clone(), SegmentEntry { info, path });
                }
                Err(e) => warn!("Skipping unreadable segment {:?}: {:#}", path, e),
            }
        }

        info!(
            "Found {} segments, {} total bytes",
            index.segments.len(),
            index.total_bytes
        );
        Ok(index)
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }
}

/// Segment id for an event: sortable by open time
pub fn segment_id(record: &EventRecord) -> String {
    format!("{:016}-{}", record.opened_at_us, record.event_id)
}

/// Encode a full segment file in memory
fn encode_segment(start_us: u64, end_us: u64, frames: &[Frame]) -> Bytes {
    let body: usize = frames
        .iter()
        .map(|f| 4 + FRAME_HEADER_SIZE + f.payload.len())
        .sum();
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_SIZE + body);

    buf.put_u64_le(start_us);
    buf.put_u64_le(end_us);
    buf.put_u32_le(frames.len() as u32);

    for frame in frames {
        let encoded = frame_to_bytes(frame);
        buf.put_u32_le(encoded.len() as u32);
        buf.put_slice(&encoded);
    }
    buf.freeze()
}

fn parse_header(header: &[u8; SEGMENT_HEADER_SIZE]) -> (u64, u64, u32) {
    let mut start = [0u8; 8];
    let mut end = [0u8; 8];
    let mut count = [0u8; 4];
    start.copy_from_slice(&header[0..8]);
    end.copy_from_slice(&header[8..16]);
    count.copy_from_slice(&header[16..20]);
    (
        u64::from_le_bytes(start),
        u64::from_le_bytes(end),
        u32::from_le_bytes(count),
    )
}

/// Read segment info from file header
fn read_segment_info(path: &Path) -> Result<SegmentInfo> {
    let metadata = fs::metadata(path)?;
    let mut file = File::open(path)?;

    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut header)
        .context("Segment shorter than its header")?;
    let (start_us, end_us, frame_count) = parse_header(&header);

    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Segment file name is not valid UTF-8")?
        .to_string();

    Ok(SegmentInfo {
        id,
        start_us,
        end_us,
        frame_count,
        size_bytes: metadata.len(),
    })
}

/// Read all frames of a segment file
fn read_segment_frames(path: &Path) -> Result<Vec<Frame>> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut file = BufReader::new(file);

    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut header)?;
    let (_, _, frame_count) = parse_header(&header);

    // The header count is untrusted; size the buffer by what the file can hold
    let room = file_len.saturating_sub(SEGMENT_HEADER_SIZE as u64) / (4 + FRAME_HEADER_SIZE) as u64;
    let mut frames = Vec::with_capacity((frame_count as u64).min(room) as usize);
    for i in 0..frame_count {
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .with_context(|| format!("Segment truncated at frame {}", i))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > FRAME_HEADER_SIZE + MAX_FRAME_PAYLOAD_SIZE {
            anyhow::bail!("Frame {} length exceeds maximum: {}", i, len);
        }

        let mut frame_bytes = vec![0u8; len];
        file.read_exact(&mut frame_bytes)
            .with_context(|| format!("Segment truncated inside frame {}", i))?;
        frames.push(frame_from_bytes(Bytes::from(frame_bytes))?);
    }
    Ok(frames)
}

/// Write `data` to `path` via a temporary file and rename
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("partial");
    let mut file = File::create(&tmp).with_context(|| format!("Failed to create {:?}", tmp))?;
    file.write_all(data)?;
    file.sync_data()?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to move {:?} into place", path));
    }
    Ok(())
}

/// Remove a segment file and its event record
fn delete_segment_files(entry: &SegmentEntry) -> std::io::Result<()> {
    fs::remove_file(&entry.path)?;
    let sidecar = entry.path.with_extension("json");
    match fs::remove_file(&sidecar) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!("Failed to delete event record {:?}: {}", sidecar, e);
        }
        _ => {}
    }
    Ok(())
}

#[async_trait::async_trait]
impl SegmentStore for LocalSegmentStore {
    async fn persist(&self, record: &EventRecord, frames: &[Frame]) -> Result<String> {
        let id = segment_id(record);
        let start_us = frames
            .first()
            .map_or(record.opened_at_us, |f| f.captured_at_us);
        let end_us = record.closed_at_us.unwrap_or(record.last_qualifying_at_us);

        let data = encode_segment(start_us, end_us, frames);
        let metadata = serde_json::to_vec_pretty(record).context("Failed to encode event record")?;
        let size_bytes = data.len() as u64;

        let path = self.root_path.join(format!("{}.{}", id, SEGMENT_EXTENSION));
        let meta_path = self.root_path.join(format!("{}.json", id));
        let write_path = path.clone();
        // Segment first: an event record never points at a missing segment
        tokio::task::spawn_blocking(move || {
            write_atomic(&write_path, &data)?;
            if let Err(e) = write_atomic(&meta_path, &metadata) {
                if let Err(remove) = fs::remove_file(&write_path) {
                    warn!("Failed to remove segment {:?} after record write failed: {}", write_path, remove);
                }
                return Err(e);
            }
            Ok(())
        })
        .await
        .context("Segment writer task failed")??;

        let info = SegmentInfo {
            id: id.clone(),
            start_us,
            end_us,
            frame_count: frames.len() as u32,
            size_bytes,
        };

        let mut index = self.index.write().await;
        if let Some(old) = index.segments.insert(id.clone(), SegmentEntry { info, path }) {
            index.total_bytes = index.total_bytes.saturating_sub(old.info.size_bytes);
        }
        index.total_bytes += size_bytes;

        debug!("Wrote segment {} ({} frames, {} bytes)", id, frames.len(), size_bytes);
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<SegmentInfo>> {
        let index = self.index.read().await;
        let mut segments: Vec<SegmentInfo> = index.segments.values().map(|e| e.info.clone()).collect();
        segments.sort_by_key(|s| s.start_us);
        Ok(segments)
    }

    async fn load(&self, segment_id: &str) -> Result<Vec<Frame>> {
        let path = {
            let index = self.index.read().await;
            index
                .segments
                .get(segment_id)
                .map(|e| e.path.clone())
                .with_context(|| format!("Unknown segment: {}", segment_id))?
        };

        tokio::task::spawn_blocking(move || read_segment_frames(&path))
            .await
            .context("Segment reader task failed")?
    }

    async fn cleanup(&self, before_timestamp_us: u64) -> Result<u64> {
        // Detach expired entries, then delete files without holding the lock
        let expired: Vec<SegmentEntry> = {
            let mut index = self.index.write().await;
            let ids: Vec<String> = index
                .segments
                .values()
                .filter(|e| e.info.end_us < before_timestamp_us)
                .map(|e| e.info.id.clone())
                .collect();
            ids.iter().filter_map(|id| index.segments.remove(id)).collect()
        };
        if expired.is_empty() {
            return Ok(0);
        }

        let (deleted, kept): (Vec<SegmentEntry>, Vec<SegmentEntry>) =
            tokio::task::spawn_blocking(move || {
                expired.into_iter().partition(|entry| match delete_segment_files(entry) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Failed to delete segment {:?}: {}", entry.path, e);
                        false
                    }
                })
            })
            .await
            .context("Segment cleanup task failed")?;

        let deleted_bytes: u64 = deleted.iter().map(|e| e.info.size_bytes).sum();
        let mut index = self.index.write().await;
        for entry in kept {
            index.segments.entry(entry.info.id.clone()).or_insert(entry);
        }
        index.total_bytes = index.total_bytes.saturating_sub(deleted_bytes);
        debug!("Cleaned up {} segments, {} bytes", deleted.len(), deleted_bytes);
        Ok(deleted_bytes)
    }

    async fn usage_bytes(&self) -> Result<u64> {
        let index = self.index.read().await;
        Ok(index.total_bytes)
    }

    async fn available_bytes(&self) -> Result<Option<u64>> {
        #[cfg(unix)]
        {
            let path = self.root_path.clone();
            let result = tokio::task::spawn_blocking(move || {
                use std::ffi::CString;
                let c_path = CString::new(path.to_str().unwrap_or("/"))
                    .map_err(|e| anyhow::anyhow!("Invalid path: {}", e))?;
                unsafe {
                    let mut stat: libc::statvfs = std::mem::zeroed();
                    if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                        anyhow::bail!("statvfs failed: {}", std::io::Error::last_os_error());
                    }
                    #[allow(clippy::unnecessary_cast)]
                    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
                    Ok(Some(available))
                }
            })
            .await??;
            Ok(result)
        }
        #[cfg(not(unix))]
        {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{EventId, EventState};
    use crate::storage::apply_retention;
    use crate::{Detection, Encoding};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            root_path: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn record(opened_at_us: u64, closed_at_us: u64) -> EventRecord {
        EventRecord {
            event_id: EventId::new(),
            state: EventState::Closing,
            opened_at_us,
            cooling_since_us: None,
            closed_at_us: Some(closed_at_us),
            trigger: Detection {
                frame_sequence: 1,
                frame_captured_at_us: opened_at_us,
                detected_at_us: opened_at_us,
                objects: vec![],
            },
            last_qualifying_at_us: opened_at_us,
            qualifying_detections: 1,
            frame_count: 0,
            first_sequence: None,
            last_sequence: None,
            segment_id: None,
            failure: None,
        }
    }

    fn frames(start_seq: u64, count: u64, start_us: u64) -> Vec<Frame> {
        (0..count)
            .map(|i| {
                Frame::new(Encoding::Jpeg, 8, 8, Bytes::from(vec![i as u8; 100]))
                    .with_sequence(start_seq + i)
                    .with_timestamp(start_us + i * 200_000)
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();

        let written = frames(40, 10, 8_000_000);
        let id = store.persist(&record(10_000_000, 25_000_000), &written).await.unwrap();

        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded, written);

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].start_us, 8_000_000);
        assert_eq!(list[0].end_us, 25_000_000);
        assert_eq!(list[0].frame_count, 10);
        assert!(dir.path().join(format!("{}.json", id)).exists());
        assert!(store.usage_bytes().await.unwrap() > 1000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_index_rebuilt_from_disk() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = LocalSegmentStore::new(&config(&dir)).unwrap();
            store.persist(&record(1_000_000, 2_000_000), &frames(0, 3, 1_000_000)).await.unwrap()
        };

        let reopened = LocalSegmentStore::new(&config(&dir)).unwrap();
        let list = reopened.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert_eq!(reopened.load(&id).await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_event_is_persisted() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();

        let id = store.persist(&record(5, 9), &[]).await.unwrap();
        let list = store.list().await.unwrap();
        assert_eq!(list[0].start_us, 5);
        assert_eq!(list[0].size_bytes, SEGMENT_HEADER_SIZE as u64);
        assert!(store.load(&id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_truncated_segment_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();
        let id = store.persist(&record(1, 2), &frames(0, 2, 1)).await.unwrap();

        let path = dir.path().join(format!("{}.segment", id));
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 10]).unwrap();

        assert!(store.load(&id).await.is_err());
        assert!(store.load("no-such-segment").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retention_cleanup() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();

        let day_us = 24 * 60 * 60 * 1_000_000u64;
        let old = store.persist(&record(day_us, 2 * day_us), &frames(0, 2, day_us)).await.unwrap();
        let fresh = store
            .persist(&record(9 * day_us, 9 * day_us + 1), &frames(5, 2, 9 * day_us))
            .await
            .unwrap();

        // 7-day retention evaluated at day 10
        let freed = apply_retention(&store, 7 * 24 * 60 * 60, 10 * day_us).await.unwrap();
        assert!(freed > 0);

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![fresh]);
        assert!(!dir.path().join(format!("{}.segment", old)).exists());
        assert!(!dir.path().join(format!("{}.json", old)).exists());

        // Zero retention keeps everything
        assert_eq!(apply_retention(&store, 0, u64::MAX).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_available_bytes() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();
        let available = store.available_bytes().await.unwrap();
        if cfg!(unix) {
            assert!(available.unwrap() > 0);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inflated_frame_count_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();
        let id = store.persist(&record(1, 2), &frames(0, 1, 1)).await.unwrap();

        // Header claims u32::MAX frames while the body holds one
        let path = dir.path().join(format!("{}.segment", id));
        let mut data = fs::read(&path).unwrap();
        data[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &data).unwrap();

        let err = store.load(&id).await.unwrap_err();
        assert!(format!("{:#}", err).contains("truncated at frame 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_write_leaves_no_orphans() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();

        // Segment cannot be renamed into place
        let blocked = record(1_000, 2_000);
        let id = segment_id(&blocked);
        fs::create_dir(dir.path().join(format!("{}.segment", id))).unwrap();
        fs::write(dir.path().join(format!("{}.segment/keep", id)), b"x").unwrap();
        assert!(store.persist(&blocked, &frames(0, 2, 1_000)).await.is_err());
        assert!(!dir.path().join(format!("{}.json", id)).exists());
        assert!(!dir.path().join(format!("{}.partial", id)).exists());

        // Event record cannot be renamed into place
        let blocked = record(3_000, 4_000);
        let id = segment_id(&blocked);
        fs::create_dir(dir.path().join(format!("{}.json", id))).unwrap();
        fs::write(dir.path().join(format!("{}.json/keep", id)), b"x").unwrap();
        assert!(store.persist(&blocked, &frames(0, 2, 3_000)).await.is_err());
        assert!(!dir.path().join(format!("{}.segment", id)).exists());
        assert!(!dir.path().join(format!("{}.partial", id)).exists());

        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.usage_bytes().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cleanup_keeps_undeletable_segments() {
        let dir = TempDir::new().unwrap();
        let store = LocalSegmentStore::new(&config(&dir)).unwrap();

        let stuck = store.persist(&record(1_000, 2_000), &frames(0, 2, 1_000)).await.unwrap();
        let gone = store.persist(&record(3_000, 4_000), &frames(2, 2, 3_000)).await.unwrap();
        let before = store.usage_bytes().await.unwrap();

        // A non-empty directory in place of the segment file cannot be removed
        let stuck_path = dir.path().join(format!("{}.segment", stuck));
        fs::remove_file(&stuck_path).unwrap();
        fs::create_dir(&stuck_path).unwrap();
        fs::write(stuck_path.join("keep"), b"x").unwrap();
        // Missing event record is not an error
        fs::remove_file(dir.path().join(format!("{}.json", gone))).unwrap();

        let freed = store.cleanup(10_000).await.unwrap();
        assert!(freed > 0);

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![stuck]);
        assert_eq!(store.usage_bytes().await.unwrap(), before - freed);
        assert!(!dir.path().join(format!("{}.segment", gone)).exists());
    }
}
