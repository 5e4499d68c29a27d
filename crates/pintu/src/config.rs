//! Pipeline configuration from `PINTU_*` environment variables
//!
//! Every variable is optional; unset variables keep the defaults below.
//!
//! | Variable | Default |
//! |---|---|
//! | `PINTU_CAMERA_NAME` | `doorcam` |
//! | `PINTU_BUS_CAPACITY` | 64 |
//! | `PINTU_CAMERA_COMMAND` | unset (test camera) |
//! | `PINTU_FRAME_WIDTH` / `PINTU_FRAME_HEIGHT` | 640 / 480 |
//! | `PINTU_SAMPLE_RATE_FPS` | 5 |
//! | `PINTU_CAPTURE_DURATION_SECS` | unset (run forever) |
//! | `PINTU_CAPTURE_READ_TIMEOUT_MS` | 10000 |
//! | `PINTU_DETECT_STRIDE` | 1 |
//! | `PINTU_CONFIDENCE_FLOOR` | 0.33 |
//! | `PINTU_NMS_IOU` | 0.6 (`off` disables) |
//! | `PINTU_INFERENCE_URL` | unset |
//! | `PINTU_INFERENCE_TIMEOUT_MS` | 2000 |
//! | `PINTU_TRIGGER_LABELS` | `person` (comma separated) |
//! | `PINTU_TRIGGER_CONFIDENCE` | 0.33 |
//! | `PINTU_PRE_ROLL_MS` / `PINTU_COOLDOWN_MS` / `PINTU_CLOSE_MS` | 5000 / 5000 / 10000 |
//! | `PINTU_MAX_EVENT_MS` | 300000 |
//! | `PINTU_BUFFER_MAX_BYTES` | 64 MiB |
//! | `PINTU_STORAGE_PATH` | `./recordings` |
//! | `PINTU_RETENTION_DAYS` | 7 |
//! | `PINTU_API_PORT` | 8080 |
//! | `PINTU_EVENT_HISTORY` | 50 |

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use crate::api::ApiConfig;
use crate::capture::{CaptureConfig, MAX_SAMPLE_RATE_FPS, MIN_SAMPLE_RATE_FPS};
use crate::detector::DetectorConfig;
use crate::recorder::RecorderConfig;
use crate::storage::StorageConfig;
use crate::{PipelineError, DEFAULT_BUS_CAPACITY};

const ENV_PREFIX: &str = "PINTU_";

/// Longest accepted window or timeout (24 h)
pub const MAX_WINDOW_MS: u64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub camera_name: String,
    pub bus_capacity: usize,
    /// Still-capture command line; the synthetic camera is used when unset
    pub camera_command: Option<String>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub capture: CaptureConfig,
    pub inference_url: Option<String>,
    pub detector: DetectorConfig,
    pub recorder: RecorderConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera_name: "doorcam".to_string(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            camera_command: None,
            frame_width: 640,
            frame_height: 480,
            capture: CaptureConfig::default(),
            inference_url: None,
            detector: DetectorConfig::default(),
            recorder: RecorderConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, PipelineError>
where
    T: FromStr,
    T::Err: Display,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| PipelineError::Configuration(format!("{}={:?}: {}", key, raw, e))),
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl PipelineConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup, starting from the defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let mut config = Self::default();
        let l = &lookup;

        set(&mut config.camera_name, parse_var(l, "CAMERA_NAME")?);
        set(&mut config.bus_capacity, parse_var(l, "BUS_CAPACITY")?);
        config.camera_command = parse_var(l, "CAMERA_COMMAND")?;
        set(&mut config.frame_width, parse_var(l, "FRAME_WIDTH")?);
        set(&mut config.frame_height, parse_var(l, "FRAME_HEIGHT")?);

        set(&mut config.capture.sample_rate_fps, parse_var(l, "SAMPLE_RATE_FPS")?);
        set(&mut config.capture.queue_capacity, parse_var(l, "CAPTURE_QUEUE")?);
        set(&mut config.capture.failure_threshold, parse_var(l, "CAPTURE_FAILURE_THRESHOLD")?);
        set(&mut config.capture.read_timeout_ms, parse_var(l, "CAPTURE_READ_TIMEOUT_MS")?);
        if let Some(secs) = parse_var(l, "CAPTURE_DURATION_SECS")? {
            config.capture.max_duration_secs = Some(secs);
        }

        config.inference_url = parse_var(l, "INFERENCE_URL")?;
        set(&mut config.detector.stride, parse_var(l, "DETECT_STRIDE")?);
        set(&mut config.detector.confidence_floor, parse_var(l, "CONFIDENCE_FLOOR")?);
        set(&mut config.detector.inference_timeout_ms, parse_var(l, "INFERENCE_TIMEOUT_MS")?);
        set(&mut config.detector.failure_threshold, parse_var(l, "DETECTOR_FAILURE_THRESHOLD")?);
        if let Some(raw) = parse_var::<String>(l, "NMS_IOU")? {
            config.detector.nms_iou_threshold = match raw.to_lowercase().as_str() {
                "off" | "none" | "0" => None,
                value => Some(value.parse().map_err(|e| {
                    PipelineError::Configuration(format!("{}NMS_IOU={:?}: {}", ENV_PREFIX, raw, e))
                })?),
            };
        }

        if let Some(labels) = parse_var::<String>(l, "TRIGGER_LABELS")? {
            config.recorder.trigger_labels = labels
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        set(&mut config.recorder.trigger_confidence, parse_var(l, "TRIGGER_CONFIDENCE")?);
        set(&mut config.recorder.pre_roll_ms, parse_var(l, "PRE_ROLL_MS")?);
        set(&mut config.recorder.cooldown_ms, parse_var(l, "COOLDOWN_MS")?);
        set(&mut config.recorder.close_ms, parse_var(l, "CLOSE_MS")?);
        set(&mut config.recorder.max_event_ms, parse_var(l, "MAX_EVENT_MS")?);
        set(&mut config.recorder.buffer_max_bytes, parse_var(l, "BUFFER_MAX_BYTES")?);

        if let Some(path) = parse_var::<String>(l, "STORAGE_PATH")? {
            config.storage.root_path = PathBuf::from(path);
        }
        if let Some(days) = parse_var::<u64>(l, "RETENTION_DAYS")? {
            config.storage.retention_secs = days.checked_mul(24 * 60 * 60).ok_or_else(|| {
                PipelineError::Configuration(format!("{}RETENTION_DAYS={} is too large", ENV_PREFIX, days))
            })?;
        }

        set(&mut config.api.port, parse_var(l, "API_PORT")?);
        set(&mut config.api.history_len, parse_var(l, "EVENT_HISTORY")?);

        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::Configuration(msg));

        if self.camera_name.is_empty() || self.camera_name.contains('/') {
            return fail(format!("invalid camera name {:?}", self.camera_name));
        }
        if self.bus_capacity == 0 {
            return fail("bus capacity must be at least 1".into());
        }
        let fps = self.capture.sample_rate_fps;
        if !(MIN_SAMPLE_RATE_FPS..=MAX_SAMPLE_RATE_FPS).contains(&fps) {
            return fail(format!(
                "sample rate must be within [{}, {}] fps, got {}",
                MIN_SAMPLE_RATE_FPS, MAX_SAMPLE_RATE_FPS, fps
            ));
        }
        if self.capture.queue_capacity == 0 {
            return fail("capture queue capacity must be at least 1".into());
        }
        if self.detector.stride == 0 {
            return fail("detection stride must be at least 1".into());
        }
        for (name, value) in [
            ("confidence floor", self.detector.confidence_floor),
            ("trigger confidence", self.recorder.trigger_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if let Some(threshold) = self.detector.nms_iou_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return fail(format!("NMS IoU threshold must be within (0, 1], got {}", threshold));
            }
        }
        if self.recorder.trigger_labels.iter().all(|l| l.trim().is_empty()) {
            return fail("trigger label set is empty".into());
        }
        for (name, value) in [
            ("cooldown window", self.recorder.cooldown_ms),
            ("close window", self.recorder.close_ms),
            ("max event duration", self.recorder.max_event_ms),
            ("tick interval", self.recorder.tick_interval_ms),
            ("camera read timeout", self.capture.read_timeout_ms),
            ("inference timeout", self.detector.inference_timeout_ms),
        ] {
            if value == 0 {
                return fail(format!("{} must be non-zero", name));
            }
            if value > MAX_WINDOW_MS {
                return fail(format!("{} of {}ms exceeds {}ms", name, value, MAX_WINDOW_MS));
            }
        }
        if self.recorder.pre_roll_ms > MAX_WINDOW_MS {
            return fail(format!(
                "pre-roll of {}ms exceeds {}ms",
                self.recorder.pre_roll_ms, MAX_WINDOW_MS
            ));
        }
        if self.recorder.buffer_max_bytes == 0 {
            return fail("pre-roll buffer budget must be non-zero".into());
        }
        Ok(())
    }
}
