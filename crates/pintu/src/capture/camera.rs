//! Camera implementations
//!
//! A camera produces one encoded still per `read`. Sequence numbers and
//! capture times are stamped by the frame source, not the camera.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tracing::debug;

use crate::{Encoding, Frame};

#[async_trait]
pub trait Camera: Send {
    /// Read a single still. Errors are treated as transient by the caller.
    async fn read(&mut self) -> Result<Frame>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// External still-capture command configuration
#[derive(Debug, Clone)]
pub struct StillCommandConfig {
    /// Executable to run
    pub program: String,
    /// Arguments; the command must write one encoded image to stdout
    pub args: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub encoding: Encoding,
}

impl StillCommandConfig {
    /// rpicam-still writing a JPEG to stdout
    pub fn rpicam_still(width: u32, height: u32) -> Self {
        Self {
            program: "rpicam-still".to_string(),
            args: vec![
                "-n".to_string(), // No preview window
                "-t".to_string(),
                "1".to_string(),
                "--width".to_string(),
                width.to_string(),
                "--height".to_string(),
                height.to_string(),
                "-e".to_string(),
                "jpg".to_string(),
                "-o".to_string(),
                "-".to_string(), // Output to stdout
            ],
            width,
            height,
            encoding: Encoding::Jpeg,
        }
    }

    /// Parse a whitespace-separated command line, e.g. `fswebcam -q -`
    pub fn from_command_line(line: &str, width: u32, height: u32) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            width,
            height,
            encoding: Encoding::Jpeg,
        })
    }
}

/// Camera that runs an external command per still
pub struct CommandCamera {
    config: StillCommandConfig,
}

impl CommandCamera {
    pub fn new(config: StillCommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Camera for CommandCamera {
    async fn read(&mut self) -> Result<Frame> {
        let output = Command::new(&self.config.program)
            .args(&self.config.args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.config.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {}: {}",
                self.config.program,
                output.status,
                stderr.trim()
            );
        }
        if output.stdout.is_empty() {
            anyhow::bail!("{} produced no image data", self.config.program);
        }

        debug!("Captured {} bytes from {}", output.stdout.len(), self.config.program);

        Ok(Frame::new(
            self.config.encoding,
            self.config.width,
            self.config.height,
            Bytes::from(output.stdout),
        ))
    }

    fn describe(&self) -> String {
        format!("command `{}`", self.config.program)
    }
}

/// Configuration for the synthetic camera
#[cfg(feature = "test-source")]
#[derive(Debug, Clone)]
pub struct TestCameraConfig {
    pub width: u32,
    pub height: u32,
    /// Simulated still size in bytes
    pub frame_size: usize,
    /// Reads (0-based) in this range fail, to simulate an outage
    pub failing_reads: std::ops::Range<u64>,
}

#[cfg(feature = "test-source")]
impl Default for TestCameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_size: 4096,
            failing_reads: 0..0,
        }
    }
}

/// Synthetic camera producing JPEG-like stills without hardware
#[cfg(feature = "test-source")]
pub struct TestCamera {
    config: TestCameraConfig,
    reads: u64,
}

#[cfg(feature = "test-source")]
impl TestCamera {
    pub fn new(config: TestCameraConfig) -> Self {
        Self { config, reads: 0 }
    }
}

#[cfg(feature = "test-source")]
#[async_trait]
impl Camera for TestCamera {
    async fn read(&mut self) -> Result<Frame> {
        let read = self.reads;
        self.reads += 1;

        if self.config.failing_reads.contains(&read) {
            anyhow::bail!("simulated camera failure on read {}", read);
        }

        // SOI marker, read counter, then a fill pattern
        let mut data = Vec::with_capacity(self.config.frame_size.max(10));
        data.extend_from_slice(&[0xff, 0xd8]);
        data.extend_from_slice(&read.to_be_bytes());
        while data.len() < self.config.frame_size {
            data.push((read & 0xff) as u8);
        }

        Ok(Frame::new(
            Encoding::Jpeg,
            self.config.width,
            self.config.height,
            Bytes::from(data),
        ))
    }

    fn describe(&self) -> String {
        format!("test camera {}x{}", self.config.width, self.config.height)
    }
}
