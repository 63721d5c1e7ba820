use super::{CountStore, StoreError, stored_count};
use crate::config::PostgresConfig;
use crate::model::DateCount;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

/// Count table in PostgreSQL:
///
/// ```sql
/// CREATE TABLE neo_count (
///     date DATE PRIMARY KEY,
///     count BIGINT NOT NULL CHECK (count >= 0)
/// );
/// ```
///
/// The pool is shared by all requests; writers are not serialized against
/// each other.
#[derive(Clone, Debug)]
pub struct PostgresCountStore {
    pool: PgPool,
    table: String,
    upsert_sql: String,
}

impl PostgresCountStore {
    /// Opens the pool eagerly so a wrong host or credentials fail at startup.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        tracing::info!(
            host = %config.host,
            database = %config.database,
            table = %config.table,
            "Connected to count store"
        );

        Ok(Self::with_pool(pool, &config.table))
    }

    /// `table` must already be validated as a plain identifier.
    pub fn with_pool(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
            upsert_sql: upsert_statement(table),
        }
    }

    /// Creates the count table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&schema_statement(&self.table))
            .execute(&self.pool)
            .await?;
        tracing::info!(table = %self.table, "Count table is present");
        Ok(())
    }
}

#[async_trait]
impl CountStore for PostgresCountStore {
    async fn upsert(&self, row: &DateCount) -> Result<(), StoreError> {
        sqlx::query(&self.upsert_sql)
            .bind(row.date)
            .bind(stored_count(row.count)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn upsert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (date, count) VALUES ($1, $2) \
         ON CONFLICT (date) DO UPDATE SET count = EXCLUDED.count"
    )
}

fn schema_statement(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         date DATE PRIMARY KEY, \
         count BIGINT NOT NULL CHECK (count >= 0))"
    )
}
