//! Bus protocol: topic naming, message envelope and wire constants
//!
//! Every message on the bus travels inside an [`Envelope`] addressed to one
//! [`Topic`] of one camera. Topic names are plain strings of the form
//! `pintu/<camera>/<kind>` so a networked broker can carry them unchanged.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Root of every topic name
pub const TOPIC_PREFIX: &str = "pintu";

/// Frame header size: sequence(8) + captured_at(8) + encoding(1) + width(4) + height(4)
pub const FRAME_HEADER_SIZE: usize = 25;

/// Maximum frame payload size (16 MB)
pub const MAX_FRAME_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of a MessagePack-encoded message (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default per-topic broadcast capacity
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// The message streams a camera exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Captured frames (binary frame codec)
    Frames,
    /// Detector output, one message per sampled frame
    Detections,
    /// Event lifecycle records from the recorder
    Events,
    /// Door and arming commands from the control API
    Commands,
    /// Component health transitions
    Status,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Frames,
        Topic::Detections,
        Topic::Events,
        Topic::Commands,
        Topic::Status,
    ];

    /// Last path segment of the topic name
    pub fn suffix(&self) -> &'static str {
        match self {
            Topic::Frames => "frames",
            Topic::Detections => "detections",
            Topic::Events => "events",
            Topic::Commands => "commands",
            Topic::Status => "status",
        }
    }

    /// Full topic name for a camera, e.g. `pintu/doorcam/frames`
    pub fn name(&self, camera: &str) -> String {
        format!("{}/{}/{}", TOPIC_PREFIX, camera, self.suffix())
    }

    /// Parse a full topic name back into (camera, topic)
    pub fn parse(name: &str) -> Option<(&str, Topic)> {
        let rest = name.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
        let (camera, suffix) = rest.rsplit_once('/')?;
        if camera.is_empty() {
            return None;
        }
        let topic = Topic::ALL.into_iter().find(|t| t.suffix() == suffix)?;
        Some((camera, topic))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A message as carried by the bus.
///
/// `sequence` is assigned by the bus per topic and increases by one for
/// every publish, so subscribers can spot what they missed.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Topic,
    pub sequence: u64,
    /// Publish time in microseconds since the Unix epoch
    pub timestamp_us: u64,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::Frames.name("doorcam"), "pintu/doorcam/frames");
        assert_eq!(Topic::Commands.name("porch"), "pintu/porch/commands");
    }

    #[test]
    fn test_topic_parse() {
        assert_eq!(
            Topic::parse("pintu/doorcam/detections"),
            Some(("doorcam", Topic::Detections))
        );
        assert_eq!(Topic::parse("pintu/doorcam/unknown"), None);
        assert_eq!(Topic::parse("other/doorcam/frames"), None);
        assert_eq!(Topic::parse("pintu//frames"), None);
    }

    #[test]
    fn test_header_size_matches_layout() {
        assert_eq!(FRAME_HEADER_SIZE, 8 + 8 + 1 + 4 + 4);
    }
}
