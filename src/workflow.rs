// src/workflow.rs
//! Leaf-analysis state machine.
//!
//! `Idle -> Previewing -> Analyzing -> Result | Failed -> (reset) Idle`.
//! The machine is cyclic; every state can be reset back to `Idle`. Each
//! trip into `Analyzing` gets a fresh request id, and a completion is only
//! applied when it carries the id of the currently active request.

use crate::errors::{FarmsightError, InferenceError, WorkflowError};
use crate::models::{AnalysisResult, ErrorView, ImageSummary, ResultView, WorkflowPhase, WorkflowSnapshot};
use crate::services::file_intake::ImageAsset;
use crate::services::report_exporter::{Report, ReportExporter};
use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

pub type RequestId = Uuid;

#[derive(Debug, Clone)]
pub enum WorkflowState {
    Idle,
    Previewing(Arc<ImageAsset>),
    Analyzing {
        asset: Arc<ImageAsset>,
        request: RequestId,
    },
    Result {
        result: Arc<AnalysisResult>,
        asset: Arc<ImageAsset>,
    },
    // The asset stays so a retry does not need a fresh upload.
    Failed {
        error: InferenceError,
        asset: Arc<ImageAsset>,
    },
}

impl WorkflowState {
    pub fn phase(&self) -> WorkflowPhase {
        match self {
            WorkflowState::Idle => WorkflowPhase::Idle,
            WorkflowState::Previewing(_) => WorkflowPhase::Previewing,
            WorkflowState::Analyzing { .. } => WorkflowPhase::Analyzing,
            WorkflowState::Result { .. } => WorkflowPhase::Result,
            WorkflowState::Failed { .. } => WorkflowPhase::Failed,
        }
    }

    fn asset(&self) -> Option<&Arc<ImageAsset>> {
        match self {
            WorkflowState::Idle => None,
            WorkflowState::Previewing(asset)
            | WorkflowState::Analyzing { asset, .. }
            | WorkflowState::Result { asset, .. }
            | WorkflowState::Failed { asset, .. } => Some(asset),
        }
    }
}

/// What the caller must run after a successful `begin_analysis`.
#[derive(Debug, Clone)]
pub struct AnalysisTicket {
    pub request: RequestId,
    pub asset: Arc<ImageAsset>,
}

#[derive(Debug)]
pub struct LeafWorkflow {
    state: WorkflowState,
}

impl LeafWorkflow {
    pub fn new() -> Self {
        Self {
            state: WorkflowState::Idle,
        }
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.state.phase()
    }

    pub fn active_request(&self) -> Option<RequestId> {
        match &self.state {
            WorkflowState::Analyzing { request, .. } => Some(*request),
            _ => None,
        }
    }

    /// A validated file was chosen. Replaces any previous preview or failure.
    pub fn select_file(&mut self, asset: ImageAsset) -> Result<(), WorkflowError> {
        match self.state {
            WorkflowState::Analyzing { .. } => Err(WorkflowError::Busy),
            WorkflowState::Result { .. } => Err(WorkflowError::AlreadyCompleted),
            WorkflowState::Idle | WorkflowState::Previewing(_) | WorkflowState::Failed { .. } => {
                self.state = WorkflowState::Previewing(Arc::new(asset));
                Ok(())
            }
        }
    }

    /// Moves to `Analyzing` and hands out the ticket for the one outbound
    /// call. Returns `Ok(None)` when a request is already in flight.
    pub fn begin_analysis(&mut self) -> Result<Option<AnalysisTicket>, WorkflowError> {
        let asset = match &self.state {
            WorkflowState::Analyzing { .. } => return Ok(None),
            WorkflowState::Idle => return Err(WorkflowError::NothingToAnalyze),
            WorkflowState::Result { .. } => return Err(WorkflowError::AlreadyCompleted),
            WorkflowState::Previewing(asset) | WorkflowState::Failed { asset, .. } => {
                Arc::clone(asset)
            }
        };

        let request = Uuid::new_v4();
        info!("Analysis {} started ({} bytes)", request, asset.size());
        self.state = WorkflowState::Analyzing {
            asset: Arc::clone(&asset),
            request,
        };
        Ok(Some(AnalysisTicket { request, asset }))
    }

    /// Applies the outcome of request `request`. Completions for any other
    /// request (reset, superseded) are dropped and `false` is returned.
    pub fn complete(
        &mut self,
        request: RequestId,
        outcome: Result<AnalysisResult, InferenceError>,
    ) -> bool {
        let asset = match &self.state {
            WorkflowState::Analyzing {
                asset,
                request: active,
            } if *active == request => Arc::clone(asset),
            _ => {
                debug!("Discarding stale completion for request {}", request);
                return false;
            }
        };

        self.state = match outcome {
            Ok(result) => {
                info!(
                    "Analysis {} finished: {} ({}%)",
                    request,
                    result.display_label(),
                    result.confidence_percent()
                );
                WorkflowState::Result {
                    result: Arc::new(result),
                    asset,
                }
            }
            Err(error) => {
                warn!("Analysis {} failed: {}", request, error);
                WorkflowState::Failed { error, asset }
            }
        };
        true
    }

    /// Back to `Idle`, releasing asset and result. Returns the id of the
    /// request that was abandoned, if one was in flight.
    pub fn reset(&mut self) -> Option<RequestId> {
        let abandoned = self.active_request();
        if !matches!(self.state, WorkflowState::Idle) {
            debug!("Workflow reset from {:?}", self.phase());
        }
        self.state = WorkflowState::Idle;
        abandoned
    }

    pub fn export(&self, exporter: &dyn ReportExporter) -> Result<Report, FarmsightError> {
        match &self.state {
            WorkflowState::Result { result, asset } => Ok(exporter.export(result, asset)?),
            _ => Err(WorkflowError::NoResult.into()),
        }
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let (result, error) = match &self.state {
            WorkflowState::Result { result, .. } => (Some(ResultView::from(result.as_ref())), None),
            WorkflowState::Failed { error, .. } => (
                None,
                Some(ErrorView {
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                    retryable: true,
                }),
            ),
            _ => (None, None),
        };

        WorkflowSnapshot {
            state: self.phase(),
            image: self.state.asset().map(|a| ImageSummary::from(a.as_ref())),
            request_id: self.active_request(),
            result,
            error,
        }
    }
}

impl Default for LeafWorkflow {
    fn default() -> Self {
        Self::new()
    }
}
