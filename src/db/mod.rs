use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::prediction::PredictionRecord;

pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Insert-only store for prediction documents.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    async fn insert(&self, record: &PredictionRecord) -> Result<(), DocumentStoreError>;

    async fn health_check(&self) -> Result<(), DocumentStoreError>;
}

/// PostgreSQL-backed prediction store.
pub struct PgPredictionStore {
    pool: PgPool,
}

impl PgPredictionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PredictionStore for PgPredictionStore {
    async fn insert(&self, record: &PredictionRecord) -> Result<(), DocumentStoreError> {
        queries::insert_prediction(&self.pool, record).await
    }

    async fn health_check(&self) -> Result<(), DocumentStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    #[error("no writable primary: {0}")]
    NotWritablePrimary(String),

    #[error("server selection timed out: {0}")]
    SelectionTimeout(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DocumentStoreError {
    /// Topology failures that a later attempt against the same cluster may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotWritablePrimary(_) | Self::SelectionTimeout(_) | Self::ConnectionLost(_)
        )
    }
}

impl From<sqlx::Error> for DocumentStoreError {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
            _ => None,
        };

        if matches!(err, sqlx::Error::PoolTimedOut) {
            return Self::SelectionTimeout(err.to_string());
        }
        if matches!(err, sqlx::Error::Io(_)) {
            return Self::ConnectionLost(err.to_string());
        }

        match code.as_deref() {
            // read_only_sql_transaction: connected to a hot standby
            Some("25006") => Self::NotWritablePrimary(err.to_string()),
            Some("57P01" | "57P02" | "57P03") => Self::ConnectionLost(err.to_string()),
            Some(class) if class.starts_with("08") => Self::ConnectionLost(err.to_string()),
            _ => Self::Database(err),
        }
    }
}
