// src/services/records.rs
use crate::errors::FarmsightError;
use crate::models::{AnalysisRecord, PendingTask, TaskFlag};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Per-user farm analysis records, oldest first.
#[async_trait]
pub trait AnalysisRecords: Send + Sync {
    async fn list(&self, user: &str) -> Result<Vec<AnalysisRecord>, FarmsightError>;

    async fn create(&self, user: &str, record: AnalysisRecord) -> Result<(), FarmsightError>;

    async fn update_flags(
        &self,
        user: &str,
        id: Uuid,
        flags: &[(TaskFlag, bool)],
    ) -> Result<AnalysisRecord, FarmsightError>;
}

/// Storage key for a caller. Bearer tokens are secrets, so records are
/// keyed by the hex SHA-256 of the token instead of the token itself.
pub fn user_key(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let bytes = hasher.finalize();
    bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()
}

/// Builds a record from a client-supplied JSON object. Flag fields must be
/// booleans; `_id` and `created_at` are always assigned here.
pub fn new_record(body: &Value) -> Result<AnalysisRecord, FarmsightError> {
    let mut fields = body
        .as_object()
        .cloned()
        .ok_or_else(|| FarmsightError::BadRequest("Expected a JSON object".to_string()))?;
    fields.remove("_id");
    fields.remove("created_at");

    let mut record = AnalysisRecord {
        id: Uuid::new_v4(),
        irrigation_needed: false,
        fertilization_needed: false,
        created_at: Utc::now(),
        details: Map::new(),
    };
    for flag in TaskFlag::ALL {
        if let Some(value) = fields.remove(flag.as_str()) {
            let value = value.as_bool().ok_or_else(|| {
                FarmsightError::BadRequest(format!("'{}' must be a boolean", flag.as_str()))
            })?;
            record.set_flag(flag, value);
        }
    }
    record.details = fields;
    Ok(record)
}

/// Parses a `{ "<flag>": bool, ... }` update body.
pub fn parse_flag_update(body: &Value) -> Result<Vec<(TaskFlag, bool)>, FarmsightError> {
    let fields = body
        .as_object()
        .ok_or_else(|| FarmsightError::BadRequest("Expected a JSON object".to_string()))?;
    if fields.is_empty() {
        return Err(FarmsightError::BadRequest("No flags to update".to_string()));
    }

    fields
        .iter()
        .map(|(name, value)| -> Result<(TaskFlag, bool), FarmsightError> {
            let flag = TaskFlag::parse(name)
                .ok_or_else(|| FarmsightError::BadRequest(format!("Unknown flag '{}'", name)))?;
            let value = value.as_bool().ok_or_else(|| {
                FarmsightError::BadRequest(format!("'{}' must be a boolean", name))
            })?;
            Ok((flag, value))
        })
        .collect()
}

/// Pending tasks come from the most recent record only.
pub fn derive_pending_tasks(records: &[AnalysisRecord]) -> Vec<PendingTask> {
    let Some(latest) = records.last() else {
        return Vec::new();
    };
    TaskFlag::ALL
        .into_iter()
        .filter(|flag| latest.flag(*flag))
        .map(|flag| PendingTask::pending(flag, latest.id))
        .collect()
}

/// Process-local store used when no Redis URL is configured.
#[derive(Default)]
pub struct MemoryRecords {
    by_user: Mutex<HashMap<String, Vec<AnalysisRecord>>>,
}

impl MemoryRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalysisRecords for MemoryRecords {
    async fn list(&self, user: &str) -> Result<Vec<AnalysisRecord>, FarmsightError> {
        let by_user = self.by_user.lock().unwrap_or_else(|p| p.into_inner());
        Ok(by_user.get(user).cloned().unwrap_or_default())
    }

    async fn create(&self, user: &str, record: AnalysisRecord) -> Result<(), FarmsightError> {
        let mut by_user = self.by_user.lock().unwrap_or_else(|p| p.into_inner());
        by_user.entry(user.to_string()).or_default().push(record);
        Ok(())
    }

    async fn update_flags(
        &self,
        user: &str,
        id: Uuid,
        flags: &[(TaskFlag, bool)],
    ) -> Result<AnalysisRecord, FarmsightError> {
        let mut by_user = self.by_user.lock().unwrap_or_else(|p| p.into_inner());
        let record = by_user
            .get_mut(user)
            .and_then(|records| records.iter_mut().find(|r| r.id == id))
            .ok_or(FarmsightError::RecordNotFound(id))?;
        for (flag, value) in flags {
            record.set_flag(*flag, *value);
        }
        Ok(record.clone())
    }
}
