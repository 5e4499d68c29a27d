//! Pintu — door camera appliance
//!
//! Runs the capture, detector, recorder and control API components on one
//! in-process bus. Each component is its own task; any subset can be run.
//!
//! ## Usage
//!
//! ```bash
//! # Everything, synthetic camera, inference server on localhost
//! PINTU_INFERENCE_URL=http://127.0.0.1:9000/detect pintu
//!
//! # Real camera via a still-capture command
//! PINTU_CAMERA_COMMAND="rpicam-still -n -t 1 -e jpg -o -" pintu
//!
//! # Only some components
//! pintu --only capture,recorder,api
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use pintu::api::ControlApi;
use pintu::bus::Bus;
use pintu::capture::{Camera, CommandCamera, FrameSource, StillCommandConfig};
use pintu::detector::{Detector, HttpInference, Inference};
use pintu::recorder::Recorder;
use pintu::storage::{spawn_retention_task, LocalSegmentStore, SegmentStore};
use pintu::{Clock, Component, PipelineConfig, SystemClock};

const SHUTDOWN_STAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse `--only a,b,c`; all components when absent
fn parse_components(args: &[String]) -> Result<HashSet<Component>> {
    let Some(pos) = args.iter().position(|a| a == "--only") else {
        return Ok(Component::ALL.into_iter().collect());
    };
    let list = args
        .get(pos + 1)
        .context("--only needs a comma-separated component list")?;
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<Component>().map_err(anyhow::Error::msg))
        .collect()
}

fn build_camera(config: &PipelineConfig, force_test_source: bool) -> Result<Box<dyn Camera>> {
    if let (Some(line), false) = (&config.camera_command, force_test_source) {
        let still = StillCommandConfig::from_command_line(line, config.frame_width, config.frame_height)
            .context("PINTU_CAMERA_COMMAND is empty")?;
        info!("  Camera: command {:?}", line);
        return Ok(Box::new(CommandCamera::new(still)));
    }

    #[cfg(feature = "test-source")]
    {
        use pintu::capture::{TestCamera, TestCameraConfig};
        info!("  Camera: synthetic test source");
        Ok(Box::new(TestCamera::new(TestCameraConfig {
            width: config.frame_width,
            height: config.frame_height,
            ..Default::default()
        })))
    }

    #[cfg(not(feature = "test-source"))]
    {
        let _ = force_test_source;
        info!("  Camera: rpicam-still");
        Ok(Box::new(CommandCamera::new(StillCommandConfig::rpicam_still(
            config.frame_width,
            config.frame_height,
        ))))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let components = parse_components(&args)?;
    let force_test_source = args.iter().any(|a| a == "--test-source");

    let config = PipelineConfig::from_env()?;
    config.validate()?;

    info!("Pintu starting");
    info!("  Camera name: {}", config.camera_name);
    info!(
        "  Components: {}",
        Component::ALL
            .into_iter()
            .filter(|c| components.contains(c))
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = Bus::with_clock(config.camera_name.clone(), config.bus_capacity, clock.clone());

    // Stages shut down in order: sources first, then the recorder so it can
    // flush, then the API.
    let source_cancel = CancellationToken::new();
    let recorder_cancel = CancellationToken::new();
    let api_cancel = CancellationToken::new();
    let source_tracker = TaskTracker::new();
    let recorder_tracker = TaskTracker::new();
    let api_tracker = TaskTracker::new();

    let store: Option<Arc<dyn SegmentStore>> =
        if components.contains(&Component::Recorder) || components.contains(&Component::Api) {
            info!("  Storage path: {:?}", config.storage.root_path);
            info!("  Retention: {} days", config.storage.retention_secs / (24 * 60 * 60));
            let store = LocalSegmentStore::new(&config.storage)?;
            Some(Arc::new(store))
        } else {
            None
        };

    if components.contains(&Component::Capture) {
        let camera = build_camera(&config, force_test_source)?;
        let source = FrameSource::new(camera, bus.clone(), clock.clone(), config.capture.clone());
        let cancel = source_cancel.clone();
        source_tracker.spawn(async move {
            match source.run(cancel).await {
                Ok(stats) => info!(
                    "Capture finished: {} read, {} published, {} dropped, {} failures",
                    stats.frames_read, stats.frames_published, stats.frames_dropped, stats.read_failures
                ),
                Err(e) => error!("Capture error: {:#}", e),
            }
        });
    }

    if components.contains(&Component::Detector) {
        let url = config
            .inference_url
            .as_deref()
            .context("PINTU_INFERENCE_URL is required to run the detector")?;
        info!("  Inference: {}", url);
        let inference: Arc<dyn Inference> = Arc::new(HttpInference::new(
            url,
            Duration::from_millis(config.detector.inference_timeout_ms),
        )?);
        let detector = Detector::new(inference, bus.clone(), clock.clone(), config.detector.clone());
        let cancel = source_cancel.clone();
        source_tracker.spawn(async move {
            match detector.run(cancel).await {
                Ok(stats) => info!(
                    "Detector finished: {} sampled, {} published, {} failures, {} gaps",
                    stats.frames_sampled, stats.detections_published, stats.inference_failures, stats.sequence_gaps
                ),
                Err(e) => error!("Detector error: {:#}", e),
            }
        });
    }

    if let Some(store) = store.clone() {
        recorder_tracker.spawn(spawn_retention_task(
            store.clone(),
            config.storage.clone(),
            clock.clone(),
            recorder_cancel.clone(),
        ));

        if components.contains(&Component::Recorder) {
            let recorder = Recorder::new(bus.clone(), store, clock.clone(), config.recorder.clone());
            let cancel = recorder_cancel.clone();
            recorder_tracker.spawn(async move {
                if let Err(e) = recorder.run(cancel).await {
                    error!("Recorder error: {:#}", e);
                }
            });
        }
    }

    if components.contains(&Component::Api) {
        let api = ControlApi::new(bus.clone(), clock.clone(), config.api.history_len, store.clone());
        api_tracker.spawn(api.spawn_ingest(api_cancel.clone()));

        let bind = SocketAddr::from(([0, 0, 0, 0], config.api.port));
        let web_config = config.clone();
        let cancel = api_cancel.clone();
        api_tracker.spawn(async move {
            if let Err(e) = pintu::web::start(api, web_config, bind, cancel).await {
                error!("Web server error: {:#}", e);
            }
        });
    }

    source_tracker.close();
    recorder_tracker.close();
    api_tracker.close();

    run_headless(&bus, &source_tracker).await;

    info!("Shutting down");
    source_cancel.cancel();
    wait_stage("sources", &source_tracker).await;
    recorder_cancel.cancel();
    wait_stage("recorder", &recorder_tracker).await;
    api_cancel.cancel();
    wait_stage("api", &api_tracker).await;

    info!("Pintu stopped");
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pintu=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_stage(name: &str, tracker: &TaskTracker) {
    if tokio::time::timeout(SHUTDOWN_STAGE_TIMEOUT, tracker.wait()).await.is_err() {
        warn!("Shutdown of {} timed out after {:?}", name, SHUTDOWN_STAGE_TIMEOUT);
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Headless mode: log stats periodically until a shutdown signal arrives,
/// or until the capture stage ends by itself (duration limit).
async fn run_headless(bus: &Bus, sources: &TaskTracker) {
    let mut stats_interval = interval(Duration::from_secs(30));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let sources_done = sources.wait();
    tokio::pin!(sources_done);
    let has_sources = !sources.is_empty();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal");
                break;
            }
            _ = &mut sources_done, if has_sources => {
                info!("Capture stage finished");
                break;
            }
            _ = stats_interval.tick() => {
                let stats = bus.stats();
                let summary: Vec<String> = stats
                    .topics
                    .iter()
                    .map(|t| format!("{} {}/{}", t.topic, t.published, t.dropped))
                    .collect();
                info!("Stats (published/dropped): {}", summary.join(", "));
            }
        }
    }
}
