//! Per-message job pipeline.
//!
//! Stages run strictly in order:
//! decode → fetch → infer → encode → upload → persist → notify → acknowledge.
//! Only a validation failure or a fully completed run deletes the message;
//! fetch and inference failures leave it leased so the queue redelivers it.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::{Disposition, PipelineError, Stage};
use crate::models::job::Job;
use crate::models::prediction::{predicted_image_key, Label, PredictionId, PredictionRecord};
use crate::services::detector::DetectionArtifacts;
use crate::services::encoding;
use crate::services::persistence::PersistenceWriter;
use crate::services::queue::{AckToken, QueueMessage};
use crate::services::retry::RetryPolicy;

/// Sub-directory of the attempt's scratch dir that receives detector output.
const PREDICTED_DIR: &str = "predicted";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub scratch_dir: PathBuf,
    pub persist_policy: RetryPolicy,
    pub upload_policy: RetryPolicy,
}

/// Result of a non-blocking stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed(String),
    Skipped,
}

impl StageStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Everything observable about a run that reached the acknowledge stage.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub prediction_id: PredictionId,
    pub chat_id: String,
    pub predicted_image_key: String,
    pub labels: Vec<Label>,
    pub skipped_lines: usize,
    pub upload: StageStatus,
    pub persistence: StageStatus,
    pub persist_attempts: u32,
    pub notification: StageStatus,
}

/// Final disposition of one message.
#[derive(Debug)]
pub enum JobOutcome {
    /// Undecodable payload, acknowledged without side effects.
    Rejected { reason: String },
    /// Transient failure; not acknowledged, the queue will redeliver.
    Abandoned {
        prediction_id: PredictionId,
        stage: Stage,
        error: String,
    },
    /// Ran to the commit point and was acknowledged.
    Completed(JobReport),
}

impl JobOutcome {
    pub fn acknowledged(&self) -> bool {
        !matches!(self, Self::Abandoned { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            Self::Abandoned { .. } => "abandoned",
            Self::Completed(_) => "completed",
        }
    }
}

pub struct JobPipeline {
    state: AppState,
    writer: PersistenceWriter,
    settings: PipelineSettings,
}

impl JobPipeline {
    pub fn new(state: AppState, settings: PipelineSettings) -> Self {
        let writer = PersistenceWriter::new(Arc::clone(&state.documents), settings.persist_policy);
        Self {
            state,
            writer,
            settings,
        }
    }

    /// Process one message to its disposition.
    ///
    /// `Err` means something outside the error taxonomy's recoverable kinds
    /// went wrong (e.g. the acknowledge itself failed); the message stays
    /// leased and the consumer loop decides what to do.
    pub async fn handle(&self, message: QueueMessage) -> Result<JobOutcome, PipelineError> {
        let started = Instant::now();
        let QueueMessage { body, ack_token } = message;

        let job = match Job::decode(&body) {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "Dropping malformed job message");
                self.acknowledge(ack_token).await?;
                let outcome = JobOutcome::Rejected {
                    reason: err.to_string(),
                };
                record_outcome(&outcome, started);
                return Ok(outcome);
            }
        };

        let prediction_id = PredictionId::new();
        let scratch = ScratchDir(self.settings.scratch_dir.join(prediction_id.to_string()));

        info!(
            prediction_id = %prediction_id,
            image_name = %job.image_name,
            chat_id = %job.chat_id,
            "Processing detection job"
        );

        let result = self.run_stages(&job, prediction_id, &scratch.0).await;
        drop(scratch);

        let outcome = match result {
            Ok(report) => {
                self.acknowledge(ack_token).await?;
                info!(
                    prediction_id = %prediction_id,
                    labels = report.labels.len(),
                    persisted = report.persistence.succeeded(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed and acknowledged"
                );
                JobOutcome::Completed(report)
            }
            Err(err) => match err.disposition() {
                Disposition::Redeliver => {
                    warn!(
                        prediction_id = %prediction_id,
                        error = %err,
                        "Abandoning job, message will be redelivered"
                    );
                    JobOutcome::Abandoned {
                        prediction_id,
                        stage: err.stage().unwrap_or(Stage::Fetch),
                        error: err.to_string(),
                    }
                }
                _ => return Err(err),
            },
        };

        record_outcome(&outcome, started);
        Ok(outcome)
    }

    async fn run_stages(
        &self,
        job: &Job,
        prediction_id: PredictionId,
        scratch: &Path,
    ) -> Result<JobReport, PipelineError> {
        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|e| PipelineError::catastrophic(Stage::Fetch, e))?;

        // Fetch
        let input_path = scratch.join(job.file_name());
        let bytes = self
            .state
            .storage
            .download(&job.image_name)
            .await
            .map_err(|e| PipelineError::transient(Stage::Fetch, e))?;
        tokio::fs::write(&input_path, &bytes)
            .await
            .map_err(|e| PipelineError::catastrophic(Stage::Fetch, e))?;
        debug!(prediction_id = %prediction_id, bytes = bytes.len(), "Downloaded input image");

        // Infer
        let artifacts = self.infer(&input_path, &scratch.join(PREDICTED_DIR)).await?;
        debug!(prediction_id = %prediction_id, detections = artifacts.detections, "Inference complete");

        // Encode
        let encoded = encoding::read_labels(&artifacts.labels_path, &self.state.class_names)
            .await
            .map_err(|e| PipelineError::catastrophic(Stage::Encode, e))?;
        for err in &encoded.skipped {
            warn!(prediction_id = %prediction_id, error = %err, "Skipping corrupt detection line");
        }
        if !encoded.skipped.is_empty() {
            metrics::counter!("detect_labels_skipped_total").increment(encoded.skipped.len() as u64);
        }

        // Upload
        let predicted_key = predicted_image_key(&prediction_id, &job.image_name);
        let upload = match self.upload(&artifacts.rendered_path, &predicted_key).await {
            Ok(()) => StageStatus::Succeeded,
            Err(err) => {
                warn!(
                    prediction_id = %prediction_id,
                    key = %predicted_key,
                    error = %err,
                    "Predicted image upload failed, continuing"
                );
                StageStatus::Failed(err.to_string())
            }
        };

        // Persist
        let record = PredictionRecord {
            id: prediction_id,
            chat_id: job.chat_id.clone(),
            original_image_key: job.image_name.clone(),
            predicted_image_key: predicted_key.clone(),
            labels: encoded.labels,
            created_at: Utc::now(),
        };
        let (persistence, persist_attempts) = match self.writer.write(&record).await {
            Ok(attempts) => (StageStatus::Succeeded, attempts),
            Err(err) => {
                let attempts = match &err {
                    PipelineError::Persistence { attempts, .. } => *attempts,
                    _ => 0,
                };
                (StageStatus::Failed(err.to_string()), attempts)
            }
        };

        // Notify
        let notification = self.notify(&prediction_id).await;

        Ok(JobReport {
            prediction_id,
            chat_id: record.chat_id,
            predicted_image_key: predicted_key,
            labels: record.labels,
            skipped_lines: encoded.skipped.len(),
            upload,
            persistence,
            persist_attempts,
            notification,
        })
    }

    /// Run the detector on the blocking pool. Errors and panics are transient.
    async fn infer(
        &self,
        input_path: &Path,
        output_dir: &Path,
    ) -> Result<DetectionArtifacts, PipelineError> {
        let detector = Arc::clone(&self.state.detector);
        let input_path = input_path.to_path_buf();
        let output_dir = output_dir.to_path_buf();

        match tokio::task::spawn_blocking(move || detector.detect(&input_path, &output_dir)).await {
            Ok(Ok(artifacts)) => Ok(artifacts),
            Ok(Err(e)) => Err(PipelineError::transient(Stage::Infer, e)),
            Err(join) => Err(PipelineError::transient(
                Stage::Infer,
                format!("detector panicked: {join}"),
            )),
        }
    }

    async fn upload(&self, rendered_path: &Path, key: &str) -> Result<(), PipelineError> {
        let data = tokio::fs::read(rendered_path)
            .await
            .map_err(|e| PipelineError::DegradedUpload(e.into()))?;
        let content_type = image::ImageFormat::from_path(rendered_path)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");

        self.settings
            .upload_policy
            .run(
                "upload_predicted_image",
                |_| self.state.storage.upload(key, &data, content_type),
                |_| true,
            )
            .await
            .map(|((), _)| ())
            .map_err(|err| PipelineError::DegradedUpload(err.into_inner()))
    }

    async fn notify(&self, prediction_id: &PredictionId) -> StageStatus {
        let Some(notifier) = &self.state.notifier else {
            debug!(prediction_id = %prediction_id, "No notification target configured");
            return StageStatus::Skipped;
        };

        match notifier.notify(prediction_id).await {
            Ok(()) => StageStatus::Succeeded,
            Err(e) => {
                let err = PipelineError::Notification(e);
                warn!(prediction_id = %prediction_id, error = %err, "Notification failed");
                StageStatus::Failed(err.to_string())
            }
        }
    }

    async fn acknowledge(&self, token: AckToken) -> Result<(), PipelineError> {
        self.state
            .queue
            .delete(token)
            .await
            .map_err(|e| PipelineError::catastrophic(Stage::Acknowledge, e))
    }
}

/// Per-attempt working directory, removed when the guard goes out of scope.
///
/// Removal happens in `Drop` so a panicking stage still cleans up while the
/// task unwinds.
struct ScratchDir(PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.0.display(), error = %e, "Failed to remove scratch directory"),
        }
    }
}

fn record_outcome(outcome: &JobOutcome, started: Instant) {
    metrics::counter!("detect_jobs_total", "outcome" => outcome.as_str()).increment(1);
    metrics::histogram!("detect_job_seconds").record(started.elapsed().as_secs_f64());
}
