// src/errors.rs
use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use thiserror::Error;
use uuid::Uuid;

/// Why an uploaded file was refused before it became an `ImageAsset`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported image type '{0}': please select a JPEG or PNG image")]
    UnsupportedType(String),

    #[error("Image is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::UnsupportedType(_) => "unsupported_type",
            ValidationError::TooLarge { .. } => "too_large",
        }
    }
}

/// Failure of the outbound call to the classification service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Inference service timed out")]
    Timeout,

    #[error("Inference request failed: {0}")]
    Transport(String),

    #[error("Inference service rejected the request ({status}): {message}")]
    ServerRejected { status: u16, message: String },
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Timeout => "timeout",
            InferenceError::Transport(_) => "transport",
            InferenceError::ServerRejected { .. } => "server_rejected",
        }
    }
}

/// A workflow event that is not valid in the current state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("An analysis is already in progress")]
    Busy,

    #[error("No image has been selected")]
    NothingToAnalyze,

    #[error("Analysis already completed, reset before starting over")]
    AlreadyCompleted,

    #[error("No analysis result is available")]
    NoResult,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    #[error("Report rendering failed: {0}")]
    Render(String),
}

#[derive(Error, Debug)]
pub enum FarmsightError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Analysis session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Analysis record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Missing or invalid bearer token")]
    Unauthorized,
}

impl FarmsightError {
    fn category(&self) -> &'static str {
        match self {
            FarmsightError::Redis(_) => "Database error",
            FarmsightError::Serialization(_) => "Data processing error",
            FarmsightError::Validation(_) => "Validation error",
            FarmsightError::BadRequest(_) => "Invalid request",
            FarmsightError::Upload(_) => "Upload error",
            FarmsightError::Workflow(_) => "Workflow conflict",
            FarmsightError::Export(_) => "Report error",
            FarmsightError::SessionNotFound(_) | FarmsightError::RecordNotFound(_) => "Not found",
            FarmsightError::Unauthorized => "Unauthorized",
        }
    }
}

impl ResponseError for FarmsightError {
    fn status_code(&self) -> StatusCode {
        match self {
            FarmsightError::Redis(_)
            | FarmsightError::Serialization(_)
            | FarmsightError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FarmsightError::Validation(_)
            | FarmsightError::BadRequest(_)
            | FarmsightError::Upload(_) => StatusCode::BAD_REQUEST,
            FarmsightError::Workflow(_) => StatusCode::CONFLICT,
            FarmsightError::SessionNotFound(_) | FarmsightError::RecordNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            FarmsightError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = serde_json::json!({
            "error": self.category(),
            "message": self.to_string()
        });
        if let FarmsightError::Validation(e) = self {
            body["kind"] = serde_json::Value::from(e.kind());
        }
        HttpResponse::build(self.status_code()).json(body)
    }
}
