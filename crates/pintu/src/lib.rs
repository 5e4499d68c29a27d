//! Pintu - Door camera event pipeline
//!
//! This is the unified library crate for Pintu. Components communicate only
//! through the [`bus::Bus`], never through shared memory or direct calls:
//!
//! - **Core types** (always available): Frame, Detection, Command, status, protocol constants
//! - **`bus`**: In-process publish/subscribe transport with per-topic sequencing
//! - **`capture`**: Camera acquisition, sample-rate limiting, latest-wins hand-off
//! - **`detector`**: Sampled object detection over the frame stream
//! - **`recorder`**: Pre-roll buffer and the event state machine
//! - **`storage`**: Segment persistence and retention
//! - **`api`**: Control surface (status, recent events, door commands)
//! - **`web`**: axum HTTP front for the control API
//! - **`test-source`**: Synthetic camera without hardware

// Core modules (always compiled)
mod clock;
mod codec;
mod command;
mod config;
mod detection;
mod error;
mod frame;
mod protocol;
mod status;

pub use clock::{unix_micros, Clock, ManualClock, SystemClock};
pub use codec::*;
pub use command::*;
pub use config::PipelineConfig;
pub use detection::{BoundingBox, DetectedObject, Detection, TriggerPolicy};
pub use error::PipelineError;
pub use frame::{Encoding, Frame};
pub use protocol::*;
pub use status::{Component, ComponentStatus, Health, HealthTracker};

pub mod api;
pub mod bus;
pub mod capture;
pub mod detector;
pub mod recorder;
pub mod storage;

// Web: axum HTTP server for the control API
#[cfg(feature = "web")]
pub mod web;
