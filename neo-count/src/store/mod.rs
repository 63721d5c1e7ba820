//! Persistence port for per-date counts.
//!
//! Every write is an upsert keyed on the date: a new date is inserted, a
//! known date has its count overwritten.

mod memory;
mod postgres;

pub use memory::MemoryCountStore;
pub use postgres::PostgresCountStore;

use crate::metrics_defs::UPSERT_ROWS;
use crate::model::DateCount;
use async_trait::async_trait;
use chrono::NaiveDate;
use shared::counter;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Count {0} does not fit the stored integer column")]
    CountOutOfRange(u64),
}

/// A batch stopped at `index`; rows before it stay committed.
#[derive(Error, Debug)]
#[error("upsert of row {index} ({date}) failed: {source}")]
pub struct PersistError {
    pub index: usize,
    pub date: NaiveDate,
    pub source: StoreError,
}

#[async_trait]
pub trait CountStore: Send + Sync {
    /// Inserts `row`, or overwrites the stored count when its date is already present.
    async fn upsert(&self, row: &DateCount) -> Result<(), StoreError>;
}

/// Upserts `rows` one at a time, in order.
///
/// Each row is its own atomic write. Processing stops at the first failing
/// row and that failure is returned; the batch is then partially applied.
/// Returns the number of rows written.
pub async fn upsert_all(store: &dyn CountStore, rows: &[DateCount]) -> Result<usize, PersistError> {
    for (index, row) in rows.iter().enumerate() {
        if let Err(source) = store.upsert(row).await {
            counter!(UPSERT_ROWS, "outcome" => "failure").increment(1);
            tracing::error!(
                index,
                date = %row.date,
                error = %source,
                "Upsert failed, aborting batch"
            );
            return Err(PersistError {
                index,
                date: row.date,
                source,
            });
        }
        counter!(UPSERT_ROWS, "outcome" => "success").increment(1);
    }

    tracing::debug!(rows = rows.len(), "Batch upserted");
    Ok(rows.len())
}

/// Counts are stored in a signed 64-bit column.
pub(crate) fn stored_count(count: u64) -> Result<i64, StoreError> {
    i64::try_from(count).map_err(|_| StoreError::CountOutOfRange(count))
}
