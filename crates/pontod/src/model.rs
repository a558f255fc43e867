//! Model runtime seam — the face classifier as an opaque capability.
//!
//! The daemon never sees model internals; it sends a frame and gets
//! back zero or more detections. Production talks to a local inference
//! sidecar over HTTP; tests script the outcomes.

use std::future::Future;
use std::time::Duration;

use ponto_core::types::Detection;
use ponto_hw::Frame;
use reqwest::multipart::{Form, Part};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    /// The runtime could not be brought up at all.
    #[error("model load failure: {0}")]
    LoadFailure(String),
    /// A single inference call failed; the scan loop treats this like a
    /// tick with no usable detection.
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Face classifier capability: frame in, detections out.
pub trait ModelRuntime: Send {
    /// Bring the runtime up. Called once, before the camera is touched.
    fn load(&mut self) -> impl Future<Output = Result<(), ModelError>> + Send;

    /// Detect faces in one frame. Latency is variable; the scan loop
    /// never issues a second call before the previous one returns.
    fn detect_faces(
        &mut self,
        frame: &Frame,
    ) -> impl Future<Output = Result<Vec<Detection>, ModelError>> + Send;
}

/// HTTP client for the local face-inference sidecar.
pub struct SidecarRuntime {
    client: reqwest::Client,
    base_url: String,
}

#[derive(serde::Deserialize)]
struct DetectResponse {
    detections: Vec<Detection>,
}

impl SidecarRuntime {
    pub fn new(base_url: &str) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ModelError::LoadFailure(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ModelRuntime for SidecarRuntime {
    async fn load(&mut self) -> Result<(), ModelError> {
        let url = format!("{}/v1/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ModelError::LoadFailure(format!("sidecar unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(ModelError::LoadFailure(format!(
                "sidecar unhealthy: {}",
                resp.status()
            )));
        }
        tracing::info!(url = %self.base_url, "model runtime ready");
        Ok(())
    }

    async fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<Detection>, ModelError> {
        let png = frame
            .to_png()
            .map_err(|e| ModelError::InferenceFailed(e.to_string()))?;

        let form = Form::new().part(
            "frame",
            Part::bytes(png)
                .file_name("frame.png")
                .mime_str("image/png")
                .map_err(|e| ModelError::InferenceFailed(e.to_string()))?,
        );

        let url = format!("{}/v1/detect", self.base_url);
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ModelError::InferenceFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ModelError::InferenceFailed(format!(
                "sidecar returned {}",
                resp.status()
            )));
        }

        let body: DetectResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::InferenceFailed(e.to_string()))?;
        Ok(body.detections)
    }
}
