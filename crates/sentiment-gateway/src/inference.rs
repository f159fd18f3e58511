//! Client for the external sentiment model endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::configuration::InferenceConfig;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("inference endpoint answered with status {0}")]
    Status(u16),
}

/// Runs the model on an uploaded video.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Analyze the video stored under `key` and return the model output.
    async fn analyze(&self, key: &str) -> Result<Value, InferenceError>;
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    video_path: &'a str,
}

/// Posts `{ "video_path": "s3://<bucket>/<key>" }` to an HTTP endpoint.
pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            bucket: config.bucket.clone(),
        })
    }

    pub fn video_path(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn analyze(&self, key: &str) -> Result<Value, InferenceError> {
        let video_path = self.video_path(key);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&InvokeBody {
                video_path: &video_path,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::error!("Inference endpoint returned {status} for {video_path}");
            return Err(InferenceError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}
