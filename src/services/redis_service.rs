// src/services/redis_service.rs
use crate::errors::FarmsightError;
use crate::models::{AnalysisRecord, TaskFlag};
use crate::services::records::AnalysisRecords;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use uuid::Uuid;

/// Analysis records in Redis.
///
/// Each record is a hash under `analysis:{user}:{id}`: the JSON document in
/// the `record` field and each task flag in a field of its own, so that
/// flag updates are single HSETs and never overwrite each other. The list
/// `user:{user}:analyses` holds the ids in insertion order. `user` is the
/// caller's token digest.
pub struct RedisService {
    manager: ConnectionManager,
}

const RECORD_FIELD: &str = "record";

impl RedisService {
    pub async fn new(redis_url: &str) -> Result<Self, FarmsightError> {
        let client = Client::open(redis_url).map_err(|e| FarmsightError::Redis(e.to_string()))?;

        let mut manager = ConnectionManager::new(client)
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;

        // Test connection
        redis::cmd("PING")
            .query_async::<_, String>(&mut manager)
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;

        Ok(Self { manager })
    }

    async fn load(
        &self,
        conn: &mut ConnectionManager,
        user: &str,
        id: &Uuid,
    ) -> Result<Option<AnalysisRecord>, FarmsightError> {
        let fields: HashMap<String, String> = conn
            .hgetall(record_key(user, id))
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;

        record_from_fields(&fields)
    }
}

fn record_key(user: &str, id: &Uuid) -> String {
    format!("analysis:{}:{}", user, id)
}

fn index_key(user: &str) -> String {
    format!("user:{}:analyses", user)
}

fn flag_value(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn record_fields(record: &AnalysisRecord) -> Result<Vec<(&'static str, String)>, FarmsightError> {
    let json =
        serde_json::to_string(record).map_err(|e| FarmsightError::Serialization(e.to_string()))?;

    let mut fields = vec![(RECORD_FIELD, json)];
    for flag in TaskFlag::ALL {
        fields.push((flag.as_str(), flag_value(record.flag(flag)).to_string()));
    }
    Ok(fields)
}

// Flag fields win over the copy embedded in the JSON document.
fn record_from_fields(
    fields: &HashMap<String, String>,
) -> Result<Option<AnalysisRecord>, FarmsightError> {
    let Some(json) = fields.get(RECORD_FIELD) else {
        return Ok(None);
    };
    let mut record: AnalysisRecord =
        serde_json::from_str(json).map_err(|e| FarmsightError::Serialization(e.to_string()))?;

    for flag in TaskFlag::ALL {
        if let Some(value) = fields.get(flag.as_str()) {
            record.set_flag(flag, value == "true");
        }
    }
    Ok(Some(record))
}

#[async_trait]
impl AnalysisRecords for RedisService {
    async fn list(&self, user: &str) -> Result<Vec<AnalysisRecord>, FarmsightError> {
        let mut conn = self.manager.clone();

        let ids: Vec<String> = conn
            .lrange(index_key(user), 0, -1)
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(record) = self.load(&mut conn, user, &id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn create(&self, user: &str, record: AnalysisRecord) -> Result<(), FarmsightError> {
        let mut conn = self.manager.clone();
        let fields = record_fields(&record)?;

        conn.hset_multiple::<_, _, _, ()>(record_key(user, &record.id), fields.as_slice())
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;

        // Add to user index
        conn.rpush::<_, _, ()>(index_key(user), record.id.to_string())
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;

        Ok(())
    }

    async fn update_flags(
        &self,
        user: &str,
        id: Uuid,
        flags: &[(TaskFlag, bool)],
    ) -> Result<AnalysisRecord, FarmsightError> {
        let mut conn = self.manager.clone();
        let key = record_key(user, &id);

        let exists: bool = conn
            .hexists(&key, RECORD_FIELD)
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;
        if !exists {
            return Err(FarmsightError::RecordNotFound(id));
        }

        let updates: Vec<(&str, &str)> = flags
            .iter()
            .map(|(flag, value)| (flag.as_str(), flag_value(*value)))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(&key, updates.as_slice())
            .await
            .map_err(|e| FarmsightError::Redis(e.to_string()))?;

        self.load(&mut conn, user, &id)
            .await?
            .ok_or(FarmsightError::RecordNotFound(id))
    }
}
