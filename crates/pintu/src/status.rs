//! Component health reporting
//!
//! Components publish a [`ComponentStatus`] on the status topic whenever
//! their health changes. Failures never stop a component; they only move it
//! between `Healthy` and `Degraded`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Capture,
    Detector,
    Recorder,
    Api,
}

impl Component {
    pub const ALL: [Component; 4] = [
        Component::Capture,
        Component::Detector,
        Component::Recorder,
        Component::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Capture => "capture",
            Component::Detector => "detector",
            Component::Recorder => "recorder",
            Component::Api => "api",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| format!("unknown component: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub component: Component,
    pub health: Health,
    /// Last error or other context, if any
    pub detail: Option<String>,
    pub consecutive_failures: u32,
    pub updated_at_us: u64,
}

/// Counts consecutive failures and reports health transitions.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    threshold: u32,
    consecutive_failures: u32,
    health: Health,
}

impl HealthTracker {
    /// `threshold` consecutive failures flip the component to `Degraded`.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            health: Health::Healthy,
        }
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns `Some(Degraded)` on the failure that crosses the threshold.
    pub fn record_failure(&mut self) -> Option<Health> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.health == Health::Healthy && self.consecutive_failures >= self.threshold {
            self.health = Health::Degraded;
            return Some(Health::Degraded);
        }
        None
    }

    /// Returns `Some(Healthy)` when recovering from `Degraded`.
    pub fn record_success(&mut self) -> Option<Health> {
        self.consecutive_failures = 0;
        if self.health == Health::Degraded {
            self.health = Health::Healthy;
            return Some(Health::Healthy);
        }
        None
    }

    pub fn status(&self, component: Component, detail: Option<String>, now_us: u64) -> ComponentStatus {
        ComponentStatus {
            component,
            health: self.health,
            detail,
            consecutive_failures: self.consecutive_failures,
            updated_at_us: now_us,
        }
    }
}
