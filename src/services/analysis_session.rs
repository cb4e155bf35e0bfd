// src/services/analysis_session.rs
use crate::errors::{FarmsightError, InferenceError};
use crate::models::{AnalysisResult, WorkflowSnapshot};
use crate::services::file_intake::{FileIntake, IntakeSource};
use crate::services::inference_client::InferenceClient;
use crate::services::report_exporter::{Report, ReportExporter};
use crate::workflow::{LeafWorkflow, RequestId};
use bytes::Bytes;
use futures_util::FutureExt;
use log::{info, warn};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Started(RequestId),
    AlreadyInFlight,
}

struct Inner {
    workflow: LeafWorkflow,
    abort: Option<AbortHandle>,
    last_seen: Instant,
}

/// One user's leaf-analysis workflow plus the inference task it spawned.
///
/// Every transition goes through `inner`, which is never held across an
/// await, so transitions on a session are applied one at a time.
pub struct AnalysisSession {
    id: Uuid,
    inner: Mutex<Inner>,
    // Bumped whenever an analysis settles or is abandoned.
    settled: watch::Sender<u64>,
    intake: Arc<FileIntake>,
    client: Arc<dyn InferenceClient>,
    exporter: Arc<dyn ReportExporter>,
}

impl AnalysisSession {
    pub fn new(
        intake: Arc<FileIntake>,
        client: Arc<dyn InferenceClient>,
        exporter: Arc<dyn ReportExporter>,
    ) -> Arc<Self> {
        let (settled, _) = watch::channel(0);
        Arc::new(Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(Inner {
                workflow: LeafWorkflow::new(),
                abort: None,
                last_seen: Instant::now(),
            }),
            settled,
            intake,
            client,
            exporter,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.lock().last_seen = Instant::now();
    }

    fn idle_since(&self) -> Instant {
        self.lock().last_seen
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.lock().workflow.snapshot()
    }

    /// Validates the upload and, when valid, moves to `Previewing`. An
    /// invalid file leaves the workflow untouched.
    pub fn select_file(
        &self,
        source: IntakeSource,
        filename: Option<String>,
        data: Bytes,
        declared_type: &str,
        size: usize,
    ) -> Result<WorkflowSnapshot, FarmsightError> {
        let asset = self
            .intake
            .accept(source, filename, data, declared_type, size)?;

        let mut inner = self.lock();
        inner.workflow.select_file(asset)?;
        Ok(inner.workflow.snapshot())
    }

    /// Starts the inference call unless one is already running.
    pub fn request_analysis(self: &Arc<Self>) -> Result<Dispatch, FarmsightError> {
        let mut inner = self.lock();
        let Some(ticket) = inner.workflow.begin_analysis()? else {
            return Ok(Dispatch::AlreadyInFlight);
        };

        let session: Weak<Self> = Arc::downgrade(self);
        let client = Arc::clone(&self.client);
        let request = ticket.request;
        let handle: JoinHandle<()> = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(client.analyze(&ticket.asset))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!("Inference call for request {} panicked", request);
                    Err(InferenceError::Transport("inference call panicked".to_string()))
                });
            if let Some(session) = session.upgrade() {
                session.finish(request, outcome);
            }
        });

        inner.abort = Some(handle.abort_handle());
        Ok(Dispatch::Started(request))
    }

    fn finish(&self, request: RequestId, outcome: Result<AnalysisResult, InferenceError>) {
        let mut inner = self.lock();
        if inner.workflow.complete(request, outcome) {
            inner.abort = None;
            drop(inner);
            self.settled.send_modify(|n| *n += 1);
        }
    }

    /// Waits until no inference call is in flight. Any number of callers
    /// may wait at once; all of them see the settled state.
    pub async fn settle(&self) -> WorkflowSnapshot {
        let mut settled = self.settled.subscribe();
        loop {
            {
                let inner = self.lock();
                if inner.workflow.active_request().is_none() {
                    return inner.workflow.snapshot();
                }
            }
            // The sender lives as long as `self`.
            if settled.changed().await.is_err() {
                return self.snapshot();
            }
        }
    }

    /// Returns to `Idle`, cancelling any in-flight call. Idempotent.
    pub fn reset(&self) -> WorkflowSnapshot {
        let mut inner = self.lock();
        if let Some(abort) = inner.abort.take() {
            abort.abort();
        }
        let abandoned = inner.workflow.reset();
        let snapshot = inner.workflow.snapshot();
        drop(inner);

        if let Some(request) = abandoned {
            info!("Session {} reset, abandoned request {}", self.id, request);
            self.settled.send_modify(|n| *n += 1);
        }
        snapshot
    }

    pub fn export(&self) -> Result<Report, FarmsightError> {
        self.lock().workflow.export(self.exporter.as_ref())
    }
}

/// Live sessions by id. Sessions share nothing but this map.
///
/// A session untouched for `idle_ttl` is dropped by the reaper, the same
/// as an explicit close.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<AnalysisSession>>>,
    intake: Arc<FileIntake>,
    client: Arc<dyn InferenceClient>,
    exporter: Arc<dyn ReportExporter>,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        exporter: Arc<dyn ReportExporter>,
        idle_ttl: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            intake: Arc::new(FileIntake::new()),
            client,
            exporter,
            idle_ttl,
        }
    }

    pub fn create(&self) -> Arc<AnalysisSession> {
        let session = AnalysisSession::new(
            Arc::clone(&self.intake),
            Arc::clone(&self.client),
            Arc::clone(&self.exporter),
        );
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session.id(), Arc::clone(&session));
        info!("Created analysis session {}", session.id());
        session
    }

    /// Looks up a session and marks it as used.
    pub fn get(&self, id: &Uuid) -> Result<Arc<AnalysisSession>, FarmsightError> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or(FarmsightError::SessionNotFound(*id))?;
        session.touch();
        Ok(session)
    }

    /// Drops the session after cancelling whatever it was doing.
    pub fn remove(&self, id: &Uuid) -> Result<(), FarmsightError> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
            .ok_or(FarmsightError::SessionNotFound(*id))?;
        session.reset();
        info!("Closed analysis session {}", id);
        Ok(())
    }

    /// Removes every session last used more than `idle_ttl` before `now`.
    /// Returns how many were dropped.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let expired: Vec<Arc<AnalysisSession>> = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.idle_since()) > self.idle_ttl)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            session.reset();
            info!("Expired idle analysis session {}", session.id());
        }
        expired.len()
    }

    /// Runs `reap_idle` every `every` until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let dropped = registry.reap_idle(Instant::now());
                if dropped > 0 {
                    info!("Reaped {} idle sessions, {} live", dropped, registry.len());
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ValidationError, WorkflowError};
    use crate::models::WorkflowPhase;
    use crate::services::file_intake::MAX_IMAGE_BYTES;
    use crate::services::inference_client::{Deadline, MockInferenceClient};
    use crate::services::report_exporter::TextReportExporter;
    use crate::test_support::ScriptedClient;
    use std::time::Duration;

    fn session_with(client: Arc<dyn InferenceClient>) -> Arc<AnalysisSession> {
        AnalysisSession::new(
            Arc::new(FileIntake::new()),
            client,
            Arc::new(TextReportExporter::new()),
        )
    }

    fn upload(session: &AnalysisSession, size: usize, content_type: &str) -> Result<WorkflowSnapshot, FarmsightError> {
        session.select_file(
            IntakeSource::Browse,
            Some("leaf.jpg".into()),
            Bytes::from(vec![0xFFu8; size]),
            content_type,
            size,
        )
    }

    #[tokio::test]
    async fn happy_path_two_megabyte_jpeg() {
        let session = session_with(Arc::new(ScriptedClient::open(vec![])));

        let snapshot = upload(&session, 2 * 1000 * 1000, "image/jpeg").unwrap();
        assert_eq!(snapshot.state, WorkflowPhase::Previewing);

        assert!(matches!(session.request_analysis().unwrap(), Dispatch::Started(_)));
        assert_eq!(session.snapshot().state, WorkflowPhase::Analyzing);

        let snapshot = session.settle().await;
        assert_eq!(snapshot.state, WorkflowPhase::Result);
        let view = snapshot.result.unwrap();
        assert_eq!(view.disease, "Apple_Black_rot");
        assert_eq!(view.display_label, "Apple Black rot");
        assert_eq!(view.confidence_display, "92%");
    }

    #[tokio::test]
    async fn oversized_png_leaves_session_idle() {
        let session = session_with(Arc::new(ScriptedClient::open(vec![])));
        let err = upload(&session, 6 * 1000 * 1000, "image/png").unwrap_err();
        assert!(matches!(
            err,
            FarmsightError::Validation(ValidationError::TooLarge { limit: MAX_IMAGE_BYTES, .. })
        ));
        assert_eq!(session.snapshot().state, WorkflowPhase::Idle);
    }

    #[tokio::test]
    async fn unsupported_type_leaves_preview_in_place() {
        let session = session_with(Arc::new(ScriptedClient::open(vec![])));
        upload(&session, 10, "image/png").unwrap();

        let err = upload(&session, 10, "image/gif").unwrap_err();
        assert!(matches!(err, FarmsightError::Validation(ValidationError::UnsupportedType(_))));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, WorkflowPhase::Previewing);
        assert_eq!(snapshot.image.unwrap().content_type, "image/png");
    }

    #[tokio::test]
    async fn double_request_makes_one_outbound_call() {
        let client = Arc::new(ScriptedClient::gated());
        let session = session_with(client.clone());
        upload(&session, 100, "image/jpeg").unwrap();

        let first = session.request_analysis().unwrap();
        let second = session.request_analysis().unwrap();
        assert!(matches!(first, Dispatch::Started(_)));
        assert_eq!(second, Dispatch::AlreadyInFlight);

        client.release(1);
        let snapshot = session.settle().await;
        assert_eq!(snapshot.state, WorkflowPhase::Result);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn timeout_fails_then_reset_returns_to_idle() {
        let client = Deadline::new(
            MockInferenceClient::new(Duration::from_secs(10)),
            Duration::from_millis(20),
        );
        let session = session_with(Arc::new(client));
        upload(&session, 100, "image/jpeg").unwrap();
        session.request_analysis().unwrap();

        let snapshot = session.settle().await;
        assert_eq!(snapshot.state, WorkflowPhase::Failed);
        let error = snapshot.error.unwrap();
        assert_eq!(error.kind, "timeout");
        assert!(error.retryable);

        assert_eq!(session.reset().state, WorkflowPhase::Idle);
    }

    #[tokio::test]
    async fn reset_during_analysis_discards_late_completion() {
        let client = Arc::new(ScriptedClient::gated());
        let session = session_with(client.clone());
        upload(&session, 100, "image/jpeg").unwrap();
        session.request_analysis().unwrap();
        tokio::task::yield_now().await;

        assert_eq!(session.reset().state, WorkflowPhase::Idle);
        client.release(1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = session.settle().await;
        assert_eq!(snapshot.state, WorkflowPhase::Idle);
        assert!(snapshot.result.is_none());
        assert!(snapshot.image.is_none());
    }

    #[tokio::test]
    async fn retry_after_failure_uses_retained_image() {
        let client = Arc::new(ScriptedClient::open(vec![Err(InferenceError::Transport(
            "connection reset".into(),
        ))]));
        let session = session_with(client.clone());
        upload(&session, 321, "image/png").unwrap();

        session.request_analysis().unwrap();
        assert_eq!(session.settle().await.state, WorkflowPhase::Failed);

        session.request_analysis().unwrap();
        let snapshot = session.settle().await;
        assert_eq!(snapshot.state, WorkflowPhase::Result);
        assert_eq!(snapshot.image.unwrap().size, 321);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn export_requires_result() {
        let session = session_with(Arc::new(ScriptedClient::open(vec![])));
        assert!(matches!(
            session.export(),
            Err(FarmsightError::Workflow(WorkflowError::NoResult))
        ));

        upload(&session, 100, "image/jpeg").unwrap();
        session.request_analysis().unwrap();
        session.settle().await;

        let report = session.export().unwrap();
        assert_eq!(report.filename, "leaf-report-apple-black-rot.txt");
        assert_eq!(session.snapshot().state, WorkflowPhase::Result);
    }

    #[tokio::test]
    async fn registry_isolates_sessions() {
        let registry = SessionRegistry::new(
            Arc::new(ScriptedClient::open(vec![])),
            Arc::new(TextReportExporter::new()),
            Duration::from_secs(60),
        );
        let a = registry.create();
        let b = registry.create();
        assert_eq!(registry.len(), 2);

        upload(&a, 10, "image/jpeg").unwrap();
        assert_eq!(b.snapshot().state, WorkflowPhase::Idle);

        let fetched = registry.get(&a.id()).unwrap();
        assert_eq!(fetched.snapshot().state, WorkflowPhase::Previewing);

        registry.remove(&a.id()).unwrap();
        assert!(matches!(
            registry.get(&a.id()),
            Err(FarmsightError::SessionNotFound(_))
        ));
        assert!(registry.remove(&a.id()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_waiters_all_see_the_settled_state() {
        let client = Arc::new(ScriptedClient::gated());
        let session = session_with(client.clone());
        upload(&session, 100, "image/jpeg").unwrap();
        session.request_analysis().unwrap();

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.settle().await.state }
        });
        let second = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.settle().await.state }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        client.release(1);
        assert_eq!(first.await.unwrap(), WorkflowPhase::Result);
        assert_eq!(second.await.unwrap(), WorkflowPhase::Result);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn reset_wakes_waiters() {
        let client = Arc::new(ScriptedClient::gated());
        let session = session_with(client);
        upload(&session, 100, "image/jpeg").unwrap();
        session.request_analysis().unwrap();

        let waiter = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.settle().await.state }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.reset();

        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, WorkflowPhase::Idle);
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped_and_recently_used_ones_kept() {
        let registry = SessionRegistry::new(
            Arc::new(ScriptedClient::open(vec![])),
            Arc::new(TextReportExporter::new()),
            Duration::from_secs(60),
        );
        let stale = registry.create();
        upload(&stale, 10, "image/jpeg").unwrap();
        let fresh = registry.create();

        assert_eq!(registry.reap_idle(Instant::now()), 0);

        let later = Instant::now() + Duration::from_secs(90);
        // A request that lands right before the sweep.
        registry.get(&fresh.id()).unwrap().lock().last_seen = later;
        assert_eq!(registry.reap_idle(later), 1);

        assert!(matches!(
            registry.get(&stale.id()),
            Err(FarmsightError::SessionNotFound(_))
        ));
        assert!(registry.get(&fresh.id()).is_ok());
        assert_eq!(stale.snapshot().state, WorkflowPhase::Idle);
    }
}
