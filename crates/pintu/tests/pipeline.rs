//! End-to-end tests for Pintu
//!
//! Wires real components over an in-process bus (no hardware, no model):
//!
//! - Test camera → Detector (scripted inference) → Recorder → LocalSegmentStore
//! - Control API → axum router → HTTP client
//!
//! Run: `cargo test -p pintu --test pipeline`

#![cfg(all(feature = "web", feature = "test-source"))]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes as BodyBytes;
use axum::http::HeaderMap;
use axum::routing::post;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use pintu::api::ControlApi;
use pintu::bus::Bus;
use pintu::capture::{CaptureConfig, FrameSource, TestCamera, TestCameraConfig};
use pintu::detector::{Detector, DetectorConfig, HttpInference, Inference};
use pintu::recorder::{EventRecord, EventState, Recorder, RecorderConfig};
use pintu::storage::{LocalSegmentStore, SegmentInfo, SegmentStore, StorageConfig};
use pintu::{
    BoundingBox, Clock, Command, Component, DetectedObject, Detection, Encoding, Frame, Health,
    ManualClock, PipelineConfig, SystemClock, Topic,
};

// ── Shared helpers ───────────────────────────────────────────────────

/// Reports a person for frames whose sequence falls in `person`
struct ScriptedInference {
    person: Range<u64>,
}

#[async_trait]
impl Inference for ScriptedInference {
    async fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<DetectedObject>> {
        if self.person.contains(&frame.sequence) {
            Ok(vec![person(0.9)])
        } else {
            Ok(vec![])
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Local store that fails while `failing` is set
struct FlakyStore {
    inner: LocalSegmentStore,
    failing: AtomicBool,
}

#[async_trait]
impl SegmentStore for FlakyStore {
    async fn persist(&self, record: &EventRecord, frames: &[Frame]) -> anyhow::Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.persist(record, frames).await
    }

    async fn list(&self) -> anyhow::Result<Vec<SegmentInfo>> {
        self.inner.list().await
    }

    async fn load(&self, segment_id: &str) -> anyhow::Result<Vec<Frame>> {
        self.inner.load(segment_id).await
    }

    async fn cleanup(&self, before_timestamp_us: u64) -> anyhow::Result<u64> {
        self.inner.cleanup(before_timestamp_us).await
    }

    async fn usage_bytes(&self) -> anyhow::Result<u64> {
        self.inner.usage_bytes().await
    }

    async fn available_bytes(&self) -> anyhow::Result<Option<u64>> {
        self.inner.available_bytes().await
    }
}

fn person(confidence: f32) -> DetectedObject {
    DetectedObject {
        label: "person".to_string(),
        confidence,
        bounding_box: BoundingBox {
            left: 10.0,
            top: 10.0,
            right: 120.0,
            bottom: 300.0,
        },
    }
}

fn store_in(dir: &TempDir) -> LocalSegmentStore {
    LocalSegmentStore::new(&StorageConfig {
        root_path: dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap()
}

fn fast_recorder() -> RecorderConfig {
    RecorderConfig {
        pre_roll_ms: 200,
        cooldown_ms: 100,
        close_ms: 100,
        tick_interval_ms: 10,
        ..Default::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn has_event(api: &ControlApi, state: EventState) -> bool {
    api.recent_events(50).iter().any(|e| e.state == state)
}

// ── Pipeline ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_camera_to_segment() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SegmentStore> = Arc::new(store_in(&dir));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Bus::with_clock("doorcam", 64, clock.clone());
    let cancel = CancellationToken::new();

    let api = ControlApi::new(bus.clone(), clock.clone(), 20, Some(store.clone()));
    let ingest = api.spawn_ingest(cancel.clone());

    let recorder = Recorder::new(bus.clone(), store.clone(), clock.clone(), fast_recorder());
    let recorder_cancel = CancellationToken::new();
    let recorder = tokio::spawn(recorder.run(recorder_cancel.clone()));

    let detector = Detector::new(
        Arc::new(ScriptedInference { person: 5..15 }),
        bus.clone(),
        clock.clone(),
        DetectorConfig::default(),
    );
    let detector = tokio::spawn(detector.run(cancel.clone()));

    let camera = TestCamera::new(TestCameraConfig {
        frame_size: 512,
        ..Default::default()
    });
    let source = FrameSource::new(
        Box::new(camera),
        bus.clone(),
        clock.clone(),
        CaptureConfig {
            sample_rate_fps: 50.0,
            ..Default::default()
        },
    );
    let source = tokio::spawn(source.run(cancel.clone()));

    eventually("event persisted", || has_event(&api, EventState::Persisted)).await;

    cancel.cancel();
    recorder_cancel.cancel();
    let capture_stats = source.await.unwrap().unwrap();
    let detector_stats = detector.await.unwrap().unwrap();
    let recorder_stats = recorder.await.unwrap().unwrap();
    ingest.await.unwrap();

    assert!(capture_stats.frames_published > 15);
    assert_eq!(detector_stats.inference_failures, 0);
    assert_eq!(recorder_stats.events.events_opened, 1);
    assert_eq!(recorder_stats.events.events_persisted, 1);

    let event = api
        .recent_events(50)
        .into_iter()
        .find(|e| e.state == EventState::Persisted)
        .unwrap();
    let segment_id = event.segment_id.clone().unwrap();

    let segments = store.list().await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].id, segment_id);

    let frames = store.load(&segment_id).await.unwrap();
    assert_eq!(frames.len(), event.frame_count);
    // Pre-roll reaches back before the first person frame
    assert!(frames[0].sequence < 5);
    assert!(frames.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
    assert!(frames.iter().all(|f| f.encoding == Encoding::Jpeg));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequence_gap_is_not_filled() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SegmentStore> = Arc::new(store_in(&dir));
    let clock = Arc::new(ManualClock::new(12_000_000));
    let bus = Bus::with_clock("doorcam", 64, clock.clone());
    let cancel = CancellationToken::new();

    let api = ControlApi::new(bus.clone(), clock.clone(), 20, None);
    let ingest = api.spawn_ingest(cancel.clone());

    let recorder_cancel = CancellationToken::new();
    let recorder = Recorder::new(bus.clone(), store.clone(), clock.clone(), RecorderConfig::default());
    let recorder = tokio::spawn(recorder.run(recorder_cancel.clone()));

    let detector = Detector::new(
        Arc::new(ScriptedInference { person: 0..1000 }),
        bus.clone(),
        clock.clone(),
        DetectorConfig::default(),
    );
    let detector = tokio::spawn(detector.run(cancel.clone()));

    // Let both subscribe before anything is published
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sequences: Vec<u64> = (95..100).chain(105..111).collect();
    for seq in &sequences {
        let frame = Frame::new(Encoding::Jpeg, 4, 4, Bytes::from_static(b"jpeg"))
            .with_sequence(*seq)
            .with_timestamp(seq * 100_000);
        bus.publish_frame(&frame);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    eventually("all detections published", || {
        bus.stats().topic(Topic::Detections).unwrap().published == sequences.len() as u64
    })
    .await;
    eventually("event open", || has_event(&api, EventState::Open)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Shutdown force-closes and flushes the open event
    cancel.cancel();
    let detector_stats = detector.await.unwrap().unwrap();
    recorder_cancel.cancel();
    recorder.await.unwrap().unwrap();
    ingest.await.unwrap();

    assert_eq!(detector_stats.sequence_gaps, 1);
    assert_eq!(detector_stats.frames_missed, 5);

    let segments = store.list().await.unwrap();
    assert_eq!(segments.len(), 1);
    let frames = store.load(&segments[0].id).await.unwrap();
    let stored: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
    assert_eq!(stored, sequences);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_storage_failure_then_recovery() {
    let dir = TempDir::new().unwrap();
    let flaky = Arc::new(FlakyStore {
        inner: store_in(&dir),
        failing: AtomicBool::new(true),
    });
    let store: Arc<dyn SegmentStore> = flaky.clone();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let bus = Bus::with_clock("doorcam", 64, clock.clone());
    let cancel = CancellationToken::new();

    let api = ControlApi::new(bus.clone(), clock.clone(), 20, Some(store.clone()));
    let ingest = api.spawn_ingest(cancel.clone());

    let recorder = Recorder::new(bus.clone(), store.clone(), clock.clone(), fast_recorder());
    let recorder = tokio::spawn(recorder.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let detect = |seq: u64, at: u64| Detection {
        frame_sequence: seq,
        frame_captured_at_us: at,
        detected_at_us: at,
        objects: vec![person(0.8)],
    };

    // First event: storage refuses the segment
    bus.publish_message(Topic::Detections, &detect(1, clock.now_us())).unwrap();
    eventually("first event open", || has_event(&api, EventState::Open)).await;
    clock.advance(Duration::from_millis(250));
    eventually("first event failed", || has_event(&api, EventState::Failed)).await;
    eventually("recorder degraded", || {
        api.component_status(Component::Recorder)
            .is_some_and(|s| s.health == Health::Degraded)
    })
    .await;

    let failed = api.recent_events(50).into_iter().find(|e| e.state == EventState::Failed).unwrap();
    assert!(failed.failure.as_deref().unwrap_or_default().contains("disk full"));
    assert!(failed.segment_id.is_none());

    // Second event: storage is back
    flaky.failing.store(false, Ordering::SeqCst);
    bus.publish_message(Topic::Detections, &detect(2, clock.now_us())).unwrap();
    eventually("second event open", || {
        api.recent_events(50).iter().filter(|e| e.state != EventState::Failed).count() == 1
    })
    .await;
    clock.advance(Duration::from_millis(250));
    eventually("second event persisted", || has_event(&api, EventState::Persisted)).await;
    eventually("recorder healthy", || {
        api.component_status(Component::Recorder)
            .is_some_and(|s| s.health == Health::Healthy)
    })
    .await;

    cancel.cancel();
    let stats = recorder.await.unwrap().unwrap();
    ingest.await.unwrap();

    assert_eq!(stats.events.events_opened, 2);
    assert_eq!(stats.events.events_failed, 1);
    assert_eq!(stats.events.events_persisted, 1);
    assert_eq!(store.list().await.unwrap().len(), 1);

    let ids: HashSet<_> = api.recent_events(50).iter().map(|e| e.event_id).collect();
    assert_eq!(ids.len(), 2);
}

/// Recorder held open by long windows, fed one person detection and a few frames
async fn open_event_then_shut_down(
    store: Arc<dyn SegmentStore>,
) -> (ControlApi, pintu::recorder::RecorderStats, CancellationToken, tokio::task::JoinHandle<()>) {
    let clock = Arc::new(ManualClock::new(5_000_000));
    let bus = Bus::with_clock("doorcam", 64, clock.clone());
    let cancel = CancellationToken::new();

    let api = ControlApi::new(bus.clone(), clock.clone(), 20, Some(store.clone()));
    let ingest = api.spawn_ingest(cancel.clone());

    let config = RecorderConfig {
        cooldown_ms: 60_000,
        close_ms: 60_000,
        ..fast_recorder()
    };
    let recorder_cancel = CancellationToken::new();
    let recorder = Recorder::new(bus.clone(), store, clock.clone(), config);
    let recorder = tokio::spawn(recorder.run(recorder_cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let now = clock.now_us();
    bus.publish_message(
        Topic::Detections,
        &Detection {
            frame_sequence: 0,
            frame_captured_at_us: now,
            detected_at_us: now,
            objects: vec![person(0.9)],
        },
    )
    .unwrap();
    eventually("event open", || has_event(&api, EventState::Open)).await;

    for seq in 0..3u64 {
        let frame = Frame::new(Encoding::Jpeg, 4, 4, Bytes::from_static(b"jpeg"))
            .with_sequence(seq)
            .with_timestamp(now + seq * 10_000);
        bus.publish_frame(&frame);
    }
    eventually("frames ingested", || {
        bus.stats().topic(Topic::Frames).unwrap().published == 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Still open: nothing has advanced the clock past the cooldown
    assert!(has_event(&api, EventState::Open));
    assert!(!has_event(&api, EventState::Persisted));

    recorder_cancel.cancel();
    let stats = timeout(Duration::from_secs(5), recorder).await.unwrap().unwrap().unwrap();
    (api, stats, cancel, ingest)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_flushes_open_event() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn SegmentStore> = Arc::new(store_in(&dir));

    let (api, stats, cancel, ingest) = open_event_then_shut_down(store.clone()).await;

    assert_eq!(stats.events.events_opened, 1);
    assert_eq!(stats.events.events_persisted, 1);
    assert_eq!(stats.events.events_failed, 0);

    let segments = store.list().await.unwrap();
    assert_eq!(segments.len(), 1);
    let frames = store.load(&segments[0].id).await.unwrap();
    assert_eq!(frames.iter().map(|f| f.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);

    eventually("persisted record observed", || has_event(&api, EventState::Persisted)).await;
    cancel.cancel();
    ingest.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_flush_with_failing_store() {
    let dir = TempDir::new().unwrap();
    let flaky = Arc::new(FlakyStore {
        inner: store_in(&dir),
        failing: AtomicBool::new(true),
    });
    let store: Arc<dyn SegmentStore> = flaky.clone();

    let (api, stats, cancel, ingest) = open_event_then_shut_down(store.clone()).await;

    assert_eq!(stats.events.events_opened, 1);
    assert_eq!(stats.events.events_persisted, 0);
    assert_eq!(stats.events.events_failed, 1);
    assert!(flaky.inner.list().await.unwrap().is_empty());

    eventually("failed record observed", || has_event(&api, EventState::Failed)).await;
    let failed = api.recent_events(50).into_iter().find(|e| e.state == EventState::Failed).unwrap();
    assert!(failed.failure.as_deref().unwrap_or_default().contains("disk full"));

    cancel.cancel();
    ingest.await.unwrap();
}

// ── Web layer ────────────────────────────────────────────────────────

struct WebFixture {
    base: String,
    bus: Bus,
    api: ControlApi,
    cancel: CancellationToken,
    client: reqwest::Client,
}

async fn web_fixture() -> WebFixture {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Bus::with_clock("doorcam", 16, clock.clone());
    let cancel = CancellationToken::new();
    let api = ControlApi::new(bus.clone(), clock, 20, None);
    api.spawn_ingest(cancel.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(pintu::web::serve(
        listener,
        api.clone(),
        PipelineConfig::default(),
        cancel.clone(),
    ));

    WebFixture {
        base: format!("http://{}", addr),
        bus,
        api,
        cancel,
        client: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn test_http_command_published_once() {
    let web = web_fixture().await;
    let mut commands = web.bus.subscribe(Topic::Commands);

    let resp = web
        .client
        .post(format!("{}/api/commands", web.base))
        .json(&serde_json::json!({"kind": "unlock", "hold_ms": 1500}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let accepted: Command = resp.json().await.unwrap();
    assert_eq!(accepted.unlock_hold(), Some(Duration::from_millis(1500)));

    let published: Command = commands.recv_message().await.unwrap();
    assert_eq!(published.request_id, accepted.request_id);
    assert!(commands.try_recv().is_none());

    let resp = web
        .client
        .post(format!("{}/api/door/lock", web.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let lock: Command = commands.recv_message().await.unwrap();
    assert_ne!(lock.request_id, accepted.request_id);

    web.cancel.cancel();
}

#[tokio::test]
async fn test_http_rejects_malformed_commands() {
    let web = web_fixture().await;

    let unknown = web
        .client
        .post(format!("{}/api/commands", web.base))
        .json(&serde_json::json!({"kind": "explode"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);

    let broken = web
        .client
        .post(format!("{}/api/commands", web.base))
        .header("content-type", "application/json")
        .body("{\"kind\": \"unlock\"")
        .send()
        .await
        .unwrap();
    assert_eq!(broken.status(), reqwest::StatusCode::BAD_REQUEST);

    let too_long = web
        .client
        .post(format!("{}/api/door/unlock?hold_ms=3600000", web.base))
        .send()
        .await
        .unwrap();
    assert_eq!(too_long.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = too_long.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    assert_eq!(web.bus.stats().topic(Topic::Commands).unwrap().published, 0);
    web.cancel.cancel();
}

#[tokio::test]
async fn test_http_queries() {
    let web = web_fixture().await;
    eventually("api status", || web.api.component_status(Component::Api).is_some()).await;

    let status: serde_json::Value = web
        .client
        .get(format!("{}/api/status", web.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["camera"], "doorcam");
    assert_eq!(status["components"]["api"]["health"], "healthy");
    assert!(status["components"]["capture"].is_null());

    let events: Vec<serde_json::Value> = web
        .client
        .get(format!("{}/api/events?limit=5", web.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(events.is_empty());

    let config: serde_json::Value = web
        .client
        .get(format!("{}/api/config", web.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["camera_name"], "doorcam");

    let bus: serde_json::Value = web
        .client
        .get(format!("{}/api/bus", web.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bus["topics"].as_array().unwrap().len(), 5);

    let segments = web
        .client
        .get(format!("{}/api/segments", web.base))
        .send()
        .await
        .unwrap();
    assert_eq!(segments.status(), reqwest::StatusCode::NOT_FOUND);

    web.cancel.cancel();
}

#[tokio::test]
async fn test_http_inference_against_stub_server() {
    let app = axum::Router::new().route(
        "/detect",
        post(|headers: HeaderMap, body: BodyBytes| async move {
            let content_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let confidence = if content_type == "image/jpeg" && body.starts_with(b"\xff\xd8") {
                0.9
            } else {
                0.1
            };
            axum::Json(serde_json::json!([
                {"class": "person", "confidence": confidence, "left": 0, "top": 0, "right": 50, "bottom": 90}
            ]))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    let inference = HttpInference::new(format!("http://{}/detect", addr), Duration::from_secs(2)).unwrap();
    let frame = Frame::new(Encoding::Jpeg, 4, 4, Bytes::from_static(b"\xff\xd8data")).with_sequence(7);
    let objects = inference.detect(&frame).await.unwrap();

    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].label, "person");
    assert!((objects[0].confidence - 0.9).abs() < 1e-6);

    let missing = HttpInference::new(format!("http://{}/nope", addr), Duration::from_secs(2)).unwrap();
    assert!(missing.detect(&frame).await.is_err());
}
