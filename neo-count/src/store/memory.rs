use super::{CountStore, StoreError, stored_count};
use crate::model::DateCount;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Process-local store with the same upsert semantics and value range as
/// the Postgres table. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCountStore {
    rows: RwLock<BTreeMap<NaiveDate, u64>>,
}

impl MemoryCountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows ordered by date
    pub async fn rows(&self) -> Vec<DateCount> {
        self.rows
            .read()
            .await
            .iter()
            .map(|(date, count)| DateCount {
                date: *date,
                count: *count,
            })
            .collect()
    }
}

#[async_trait]
impl CountStore for MemoryCountStore {
    async fn upsert(&self, row: &DateCount) -> Result<(), StoreError> {
        stored_count(row.count)?;
        self.rows.write().await.insert(row.date, row.count);
        Ok(())
    }
}
