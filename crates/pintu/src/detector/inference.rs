//! Inference capability
//!
//! The model itself lives outside this crate. [`HttpInference`] ships each
//! sampled still to an inference server and parses its answer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::time::Duration;

use crate::{BoundingBox, DetectedObject, Frame};

#[async_trait]
pub trait Inference: Send + Sync {
    /// Run the model over one frame
    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedObject>>;

    fn name(&self) -> &str;
}

/// One object as reported by the inference server
#[derive(Debug, Clone, Deserialize)]
pub struct RawObject {
    pub class: String,
    pub confidence: f32,
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl From<RawObject> for DetectedObject {
    fn from(raw: RawObject) -> Self {
        Self {
            label: raw.class,
            confidence: raw.confidence,
            bounding_box: BoundingBox {
                left: raw.left,
                top: raw.top,
                right: raw.right,
                bottom: raw.bottom,
            },
        }
    }
}

/// Inference over HTTP.
///
/// `POST <url>` with the encoded image as the body and its MIME type as
/// `Content-Type`. The server answers with a JSON array of
/// `{class, confidence, left, top, right, bottom}` objects.
pub struct HttpInference {
    client: reqwest::Client,
    url: String,
}

impl HttpInference {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build inference HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Inference for HttpInference {
    async fn detect(&self, frame: &Frame) -> Result<Vec<DetectedObject>> {
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, frame.encoding.mime_type())
            .header("X-Frame-Sequence", frame.sequence.to_string())
            .body(frame.payload.clone())
            .send()
            .await
            .with_context(|| format!("Inference request to {} failed", self.url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Inference server returned {}: {}", status, body.trim());
        }

        let objects: Vec<RawObject> = resp
            .json()
            .await
            .context("Failed to parse inference response")?;
        Ok(objects.into_iter().map(DetectedObject::from).collect())
    }

    fn name(&self) -> &str {
        &self.url
    }
}
