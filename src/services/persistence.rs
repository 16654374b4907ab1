use std::sync::Arc;
use tracing::{error, info};

use crate::db::{DocumentStoreError, PredictionStore};
use crate::error::PipelineError;
use crate::models::prediction::PredictionRecord;
use crate::services::retry::{RetryError, RetryPolicy};

/// Writes prediction documents, retrying topology failures under a [`RetryPolicy`].
pub struct PersistenceWriter {
    store: Arc<dyn PredictionStore>,
    policy: RetryPolicy,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn PredictionStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Insert `record`, returning the number of attempts it took.
    ///
    /// A failure here means the record is lost for this attempt; callers log
    /// it and carry on.
    pub async fn write(&self, record: &PredictionRecord) -> Result<u32, PipelineError> {
        let result = self
            .policy
            .run(
                "insert_prediction",
                |_| self.store.insert(record),
                DocumentStoreError::is_transient,
            )
            .await;

        match result {
            Ok(((), attempts)) => {
                metrics::histogram!("detect_persist_attempts").record(attempts as f64);
                info!(
                    prediction_id = %record.id,
                    labels = record.labels.len(),
                    attempts,
                    "Saved prediction"
                );
                Ok(attempts)
            }
            Err(err) => {
                let attempts = err.attempts();
                metrics::histogram!("detect_persist_attempts").record(attempts as f64);
                match &err {
                    RetryError::Exhausted { error, .. } => error!(
                        prediction_id = %record.id,
                        attempts,
                        error = %error,
                        "Exhausted retries saving prediction, record lost"
                    ),
                    RetryError::Permanent { error, .. } => error!(
                        prediction_id = %record.id,
                        attempts,
                        error = %error,
                        "Non-retryable failure saving prediction, record lost"
                    ),
                }
                Err(PipelineError::Persistence {
                    attempts,
                    source: err.into_inner(),
                })
            }
        }
    }
}
