//! Client for the vision microservice

use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("vision service unreachable: {0}")]
    Unreachable(String),

    #[error("vision service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("frame capture timed out after {0:?}")]
    Timeout(Duration),
}

pub struct VisionClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl VisionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Grab the current camera frame as JPEG bytes.
    pub async fn capture_frame(&self) -> Result<Bytes, VisionError> {
        let response = self
            .client
            .get(self.url("capture_frame"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Frame capture failed with {}: {}", status, message);
            return Err(VisionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let frame = response.bytes().await.map_err(|e| self.classify(e))?;
        debug!("Captured frame: {} bytes", frame.len());
        Ok(frame)
    }

    /// Whether `GET /health` answers with a success status.
    pub async fn health(&self) -> bool {
        match self
            .client
            .get(self.url("health"))
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(e) => {
                debug!("Vision health check failed: {}", e);
                false
            }
        }
    }

    fn classify(&self, err: reqwest::Error) -> VisionError {
        if err.is_timeout() {
            VisionError::Timeout(self.timeout)
        } else {
            VisionError::Unreachable(err.to_string())
        }
    }
}
