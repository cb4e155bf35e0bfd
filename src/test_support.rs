// src/test_support.rs
// Fixtures and scripted inference clients shared by the unit tests.
use crate::errors::InferenceError;
use crate::models::AnalysisResult;
use crate::services::file_intake::{FileIntake, ImageAsset};
use crate::services::inference_client::{InferenceClient, MockInferenceClient};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

pub fn jpeg_asset(size: usize) -> ImageAsset {
    FileIntake::new()
        .validate(vec![0xFFu8; size], "image/jpeg", size)
        .unwrap()
}

pub fn sample_result() -> AnalysisResult {
    MockInferenceClient::sample_result().unwrap()
}

/// Counts calls, holds each one until a permit is released, then replays
/// scripted outcomes in order (sample result once the script runs out).
pub struct ScriptedClient {
    calls: AtomicUsize,
    gate: Semaphore,
    outcomes: Mutex<VecDeque<Result<AnalysisResult, InferenceError>>>,
}

impl ScriptedClient {
    pub fn open(outcomes: Vec<Result<AnalysisResult, InferenceError>>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            outcomes: Mutex::new(outcomes.into()),
        }
    }

    pub fn gated() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(0),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for ScriptedClient {
    async fn analyze(&self, _asset: &ImageAsset) -> Result<AnalysisResult, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.unwrap();
        permit.forget();
        let next = self.outcomes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(sample_result()))
    }
}
