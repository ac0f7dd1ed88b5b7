use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use postgrest::Postgrest;
use thiserror::Error;

use crate::frame::ContextRecord;
use crate::supabase::execute_json;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context request failed: {0}")]
    Request(String),
    #[error("context source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies the caller's most recent records, newest first.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn recent_records(&self, owner: &str, limit: usize) -> Result<Vec<ContextRecord>, ContextError>;
}

/// Reads recent rows of the `tasks` table.
pub struct PostgrestContextSource {
    client: Postgrest,
}

impl PostgrestContextSource {
    pub fn new(client: Postgrest) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContextSource for PostgrestContextSource {
    async fn recent_records(&self, owner: &str, limit: usize) -> Result<Vec<ContextRecord>, ContextError> {
        let query = self
            .client
            .from("tasks")
            .select("id,title,priority,stage,created_at")
            .eq("user_id", owner)
            .order("created_at.desc")
            .limit(limit);

        let records: Vec<ContextRecord> = execute_json(query).await.map_err(ContextError::Request)?;
        debug!("Fetched {} context records for {owner}", records.len());
        Ok(records)
    }
}

/// Per-owner records held in memory.
#[derive(Default)]
pub struct MemoryContextSource {
    records: DashMap<String, Vec<ContextRecord>>,
}

impl MemoryContextSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, owner: &str, record: ContextRecord) {
        self.records.entry(owner.to_string()).or_default().push(record);
    }
}

#[async_trait]
impl ContextSource for MemoryContextSource {
    async fn recent_records(&self, owner: &str, limit: usize) -> Result<Vec<ContextRecord>, ContextError> {
        let mut records = self
            .records
            .get(owner)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}
