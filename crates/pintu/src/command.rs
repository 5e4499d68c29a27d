//! Command protocol types for door control
//!
//! Commands are published by the control API on the commands topic and
//! consumed by whatever drives the door hardware. Each one carries a fresh
//! request id so consumers can de-duplicate. Serialization on the bus uses
//! MessagePack via rmp-serde; the HTTP surface accepts the same shape as JSON,
//! e.g. `{"kind": "unlock", "hold_ms": 3000}`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::PipelineError;

/// Unlock hold used when the request does not name one
pub const DEFAULT_UNLOCK_HOLD_MS: u64 = 3_000;

/// Longest unlock hold the API accepts
pub const MAX_UNLOCK_HOLD_MS: u64 = 60_000;

/// All supported commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// Release the door latch, re-locking after the hold
    Unlock {
        #[serde(default)]
        hold_ms: Option<u64>,
    },
    /// Lock the door now
    Lock,
    /// Intent only: nothing in the pipeline gates recording on it
    Arm,
    Disarm,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Unlock { .. } => "unlock",
            CommandKind::Lock => "lock",
            CommandKind::Arm => "arm",
            CommandKind::Disarm => "disarm",
        }
    }

    /// Reject malformed parameters before anything is published
    pub fn validate(&self) -> Result<(), PipelineError> {
        if let CommandKind::Unlock { hold_ms: Some(hold) } = self {
            if *hold == 0 {
                return Err(PipelineError::InvalidCommand(
                    "unlock hold must be greater than zero".into(),
                ));
            }
            if *hold > MAX_UNLOCK_HOLD_MS {
                return Err(PipelineError::InvalidCommand(format!(
                    "unlock hold {}ms exceeds maximum {}ms",
                    hold, MAX_UNLOCK_HOLD_MS
                )));
            }
        }
        Ok(())
    }
}

/// A validated command as it appears on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub request_id: Uuid,
    pub issued_at_us: u64,
    pub kind: CommandKind,
}

impl Command {
    /// Validate `kind` and stamp it with a fresh request id
    pub fn new(kind: CommandKind, issued_at_us: u64) -> Result<Self, PipelineError> {
        kind.validate()?;
        Ok(Self {
            request_id: Uuid::new_v4(),
            issued_at_us,
            kind,
        })
    }

    /// Effective unlock hold, `None` for non-unlock commands
    pub fn unlock_hold(&self) -> Option<Duration> {
        match self.kind {
            CommandKind::Unlock { hold_ms } => Some(Duration::from_millis(
                hold_ms.unwrap_or(DEFAULT_UNLOCK_HOLD_MS),
            )),
            _ => None,
        }
    }
}
