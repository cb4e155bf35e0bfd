// src/services/inference_client.rs
use crate::errors::InferenceError;
use crate::models::{AnalysisResult, DiseaseInformation, InferenceResponse, InvalidConfidence};
use crate::services::file_intake::ImageAsset;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};

/// One outbound classification call. Implementations hold no per-call state
/// and never retry; the caller decides what to do with a failure.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn analyze(&self, asset: &ImageAsset) -> Result<AnalysisResult, InferenceError>;
}

pub struct HttpInferenceClient {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpInferenceClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: format!("{}/predict/leaf-disease", base_url.trim_end_matches('/')),
            api_key,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn analyze(&self, asset: &ImageAsset) -> Result<AnalysisResult, InferenceError> {
        let start = Instant::now();

        let part = Part::bytes(asset.data().to_vec())
            .file_name(asset.filename().unwrap_or("leaf").to_string())
            .mime_str(asset.content_type())
            .map_err(|e| InferenceError::Transport(format!("Invalid image part: {}", e)))?;
        let form = Form::new().part("image", part);

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Inference service returned {}: {}", status, error_text);
            return Err(InferenceError::ServerRejected {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body: InferenceResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                malformed(status, format!("Failed to parse inference response: {}", e))
            } else {
                transport_error(e)
            }
        })?;

        let result =
            AnalysisResult::try_from(body).map_err(|e| malformed(status, e.to_string()))?;

        debug!(
            "Inference for {} byte image finished in {} ms",
            asset.size(),
            start.elapsed().as_millis()
        );
        Ok(result)
    }
}

fn transport_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Transport(e.to_string())
    }
}

fn malformed(status: StatusCode, message: String) -> InferenceError {
    InferenceError::ServerRejected {
        status: status.as_u16(),
        message,
    }
}

/// Stand-in used when no inference service is configured. Answers every
/// image with the same black rot diagnosis after a fixed latency.
pub struct MockInferenceClient {
    latency: Duration,
}

impl MockInferenceClient {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    pub fn sample_result() -> Result<AnalysisResult, InvalidConfidence> {
        let treatment = "Prune out cankers and dead wood. Apply fungicides during the growing season. Remove fallen fruits and leaves to reduce infection sources.";
        AnalysisResult::new(
            "Apple_Black_rot",
            0.92,
            DiseaseInformation {
                description: "Apple black rot is a fungal disease that affects apples, caused by the fungus Botryosphaeria obtusa.".to_string(),
                symptoms: "Circular lesions on leaves, rotting fruit with concentric rings, and cankers on branches.".to_string(),
                treatment: treatment.to_string(),
            },
            treatment,
        )
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn analyze(&self, _asset: &ImageAsset) -> Result<AnalysisResult, InferenceError> {
        tokio::time::sleep(self.latency).await;
        Self::sample_result().map_err(|e| InferenceError::Transport(e.to_string()))
    }
}

/// Puts an upper bound on any client's call. An elapsed deadline is
/// reported as `InferenceError::Timeout`.
pub struct Deadline<C> {
    inner: C,
    limit: Duration,
}

impl<C> Deadline<C> {
    pub fn new(inner: C, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl<C: InferenceClient> InferenceClient for Deadline<C> {
    async fn analyze(&self, asset: &ImageAsset) -> Result<AnalysisResult, InferenceError> {
        tokio::time::timeout(self.limit, self.inner.analyze(asset))
            .await
            .unwrap_or(Err(InferenceError::Timeout))
    }
}
