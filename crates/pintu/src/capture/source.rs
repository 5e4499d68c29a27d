//! Frame source: camera acquisition loop
//!
//! Reads the camera at the configured sample rate, stamps each still with a
//! session sequence number and capture time, and hands it to a latest-wins
//! queue drained by a publisher task. Read failures are retried with
//! exponential backoff; the source only ever stops on shutdown or when its
//! optional duration limit runs out.

use anyhow::Result;
use std::sync::Arc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{latest_channel, Camera, CaptureConfig};
use crate::bus::Bus;
use crate::{Clock, Component, HealthTracker, Topic, MAX_FRAME_PAYLOAD_SIZE};

/// Counters reported when the source stops
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_read: u64,
    pub frames_published: u64,
    /// Frames the hand-off queue discarded to stay current
    pub frames_dropped: u64,
    pub frames_oversized: u64,
    pub read_failures: u64,
}

pub struct FrameSource {
    camera: Box<dyn Camera>,
    bus: Bus,
    clock: Arc<dyn Clock>,
    config: CaptureConfig,
}

impl FrameSource {
    pub fn new(camera: Box<dyn Camera>, bus: Bus, clock: Arc<dyn Clock>, config: CaptureConfig) -> Self {
        Self {
            camera,
            bus,
            clock,
            config,
        }
    }

    fn publish_status(&self, health: &HealthTracker, detail: Option<String>) {
        let status = health.status(Component::Capture, detail, self.clock.now_us());
        if let Err(e) = self.bus.publish_message(Topic::Status, &status) {
            warn!("Failed to publish capture status: {}", e);
        }
    }

    /// Run until cancelled (or the duration limit is reached)
    pub async fn run(mut self, cancel: CancellationToken) -> Result<CaptureStats> {
        let (tx, mut rx) = latest_channel(self.config.queue_capacity);

        let publisher_bus = self.bus.clone();
        let publisher = tokio::spawn(async move {
            let mut published = 0u64;
            while let Some(frame) = rx.recv().await {
                publisher_bus.publish_frame(&frame);
                published += 1;
            }
            published
        });

        let mut ticker = interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut health = HealthTracker::new(self.config.failure_threshold);
        let mut stats = CaptureStats::default();
        let mut sequence = 0u64;
        let started = Instant::now();
        let limit = self.config.max_duration_secs.map(std::time::Duration::from_secs);

        info!(
            "Frame source started: {} @ {}fps",
            self.camera.describe(),
            self.config.sample_rate_fps
        );
        self.publish_status(&health, None);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Some(limit) = limit {
                if started.elapsed() >= limit {
                    info!("Capture duration limit of {:?} reached", limit);
                    break;
                }
            }

            // A hung camera counts as a failed read; dropping the read kills it
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = timeout(self.config.read_timeout(), self.camera.read()) => match read {
                    Ok(read) => read,
                    Err(_) => Err(anyhow::anyhow!(
                        "camera read timed out after {}ms",
                        self.config.read_timeout_ms
                    )),
                },
            };

            match read {
                Ok(mut frame) => {
                    if frame.payload.len() > MAX_FRAME_PAYLOAD_SIZE {
                        warn!(
                            "Discarding oversized still: {} > {} bytes",
                            frame.payload.len(),
                            MAX_FRAME_PAYLOAD_SIZE
                        );
                        stats.frames_oversized += 1;
                        continue;
                    }

                    frame.sequence = sequence;
                    frame.captured_at_us = self.clock.now_us();
                    sequence += 1;
                    stats.frames_read += 1;

                    if health.record_success().is_some() {
                        info!("Camera recovered after read failures");
                        self.publish_status(&health, None);
                    }

                    if !tx.send(frame) {
                        stats.frames_dropped += 1;
                    }

                    if stats.frames_read % 300 == 0 {
                        debug!("Frame source: {} frames read", stats.frames_read);
                    }
                }
                Err(e) => {
                    stats.read_failures += 1;
                    let transitioned = health.record_failure().is_some();
                    let failures = health.consecutive_failures();
                    warn!("Camera read failed ({} in a row): {:#}", failures, e);
                    if transitioned {
                        warn!("Capture degraded after {} consecutive failures", failures);
                    }
                    self.publish_status(&health, Some(format!("{:#}", e)));

                    let delay = self.config.backoff(failures);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        drop(tx);
        stats.frames_published = publisher.await.unwrap_or_default();

        info!(
            "Frame source stopped: {} read, {} published, {} dropped, {} read failures",
            stats.frames_read, stats.frames_published, stats.frames_dropped, stats.read_failures
        );
        Ok(stats)
    }
}

#[cfg(all(test, feature = "test-source"))]
mod tests {
    use super::*;
    use crate::capture::{TestCamera, TestCameraConfig};
    use crate::{ComponentStatus, Health, SystemClock};
    use std::time::Duration;

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            sample_rate_fps: 200.0,
            queue_capacity: 8,
            failure_threshold: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            read_timeout_ms: 1_000,
            max_duration_secs: None,
        }
    }

    /// Camera whose reads never complete
    struct StuckCamera;

    #[async_trait::async_trait]
    impl Camera for StuckCamera {
        async fn read(&mut self) -> Result<crate::Frame> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "stuck camera".to_string()
        }
    }

    #[tokio::test]
    async fn test_publishes_increasing_sequences() {
        let bus = Bus::new("doorcam", 64);
        let mut frames = bus.subscribe(Topic::Frames);
        let camera = TestCamera::new(TestCameraConfig {
            frame_size: 32,
            ..Default::default()
        });
        let source = FrameSource::new(Box::new(camera), bus.clone(), Arc::new(SystemClock), fast_config());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(cancel.clone()));

        let mut last: Option<u64> = None;
        for _ in 0..5 {
            let frame = tokio::time::timeout(Duration::from_secs(5), frames.recv_frame())
                .await
                .unwrap()
                .unwrap();
            if let Some(prev) = last {
                assert!(frame.sequence > prev);
            }
            assert!(frame.captured_at_us > 0);
            last = Some(frame.sequence);
        }

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert!(stats.frames_read >= 5);
        assert_eq!(stats.read_failures, 0);
    }

    #[tokio::test]
    async fn test_outage_degrades_then_recovers() {
        let bus = Bus::new("doorcam", 64);
        let mut status = bus.subscribe(Topic::Status);
        let mut frames = bus.subscribe(Topic::Frames);
        let camera = TestCamera::new(TestCameraConfig {
            frame_size: 16,
            failing_reads: 0..3,
            ..Default::default()
        });
        let source = FrameSource::new(Box::new(camera), bus.clone(), Arc::new(SystemClock), fast_config());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(cancel.clone()));

        let mut seen = Vec::new();
        while seen.last() != Some(&Health::Healthy) || seen.len() < 3 {
            let s: ComponentStatus = tokio::time::timeout(Duration::from_secs(5), status.recv_message())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(s.component, Component::Capture);
            seen.push(s.health);
        }
        assert!(seen.contains(&Health::Degraded));

        // Frames resume after the outage, starting from sequence 0
        let first = tokio::time::timeout(Duration::from_secs(5), frames.recv_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.sequence, 0);

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.read_failures, 3);
    }

    #[tokio::test]
    async fn test_duration_limit_stops_source() {
        let bus = Bus::new("doorcam", 64);
        let camera = TestCamera::new(TestCameraConfig::default());
        let config = CaptureConfig {
            max_duration_secs: Some(0),
            ..fast_config()
        };
        let source = FrameSource::new(Box::new(camera), bus, Arc::new(SystemClock), config);

        let stats = tokio::time::timeout(Duration::from_secs(5), source.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.frames_read, 0);
    }

    #[tokio::test]
    async fn test_hung_read_counts_as_failure() {
        let bus = Bus::new("doorcam", 64);
        let mut status = bus.subscribe(Topic::Status);
        let config = CaptureConfig {
            failure_threshold: 1,
            read_timeout_ms: 20,
            ..fast_config()
        };
        let source = FrameSource::new(Box::new(StuckCamera), bus.clone(), Arc::new(SystemClock), config);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(source.run(cancel.clone()));

        let mut degraded = None;
        while degraded.is_none() {
            let s: ComponentStatus = tokio::time::timeout(Duration::from_secs(5), status.recv_message())
                .await
                .unwrap()
                .unwrap();
            if s.health == Health::Degraded {
                degraded = Some(s);
            }
        }
        let degraded = degraded.unwrap();
        assert!(degraded.detail.unwrap().contains("timed out"));
        assert!(degraded.consecutive_failures >= 1);

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(stats.read_failures >= 1);
        assert_eq!(stats.frames_read, 0);
    }
}
