use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::consumer::LoopSettings;
use crate::pipeline::PipelineSettings;
use crate::services::retry::RetryPolicy;
use crate::services::yolo::DetectorOptions;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Ops server bind address for /health and /metrics.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Redis key of the pending job list
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Lease duration before an unacknowledged message is redelivered
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Bucket holding input and predicted images
    pub s3_bucket: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    /// Custom S3-compatible endpoint (MinIO, R2). Unset for AWS.
    pub s3_endpoint: Option<String>,

    pub s3_access_key: Option<String>,

    pub s3_secret_key: Option<String>,

    /// Callback URL for finished predictions. Unset disables notification.
    pub notify_url: Option<String>,

    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,

    /// YOLO model exported to ONNX
    pub model_path: PathBuf,

    /// Class index to name table (JSON or one name per line)
    pub class_names_path: PathBuf,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    #[serde(default = "default_input_size")]
    pub input_size: u32,

    #[serde(default = "default_inference_threads")]
    pub inference_threads: usize,

    /// Parent of the per-attempt working directories
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,

    #[serde(default = "default_idle_sleep_secs")]
    pub idle_sleep_secs: u64,

    #[serde(default = "default_error_pause_secs")]
    pub error_pause_secs: u64,

    #[serde(default = "default_persist_max_attempts")]
    pub persist_max_attempts: u32,

    #[serde(default = "default_persist_base_delay_ms")]
    pub persist_base_delay_ms: u64,

    /// Ceiling on a single persistence backoff delay
    #[serde(default = "default_persist_max_delay_ms")]
    pub persist_max_delay_ms: u64,

    #[serde(default = "default_upload_max_attempts")]
    pub upload_max_attempts: u32,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_queue_name() -> String {
    "detect:jobs".to_string()
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_s3_region() -> String {
    "eu-north-1".to_string()
}

fn default_notify_timeout_secs() -> u64 {
    10
}

fn default_confidence_threshold() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_input_size() -> u32 {
    640
}

fn default_inference_threads() -> usize {
    4
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp/detect-worker")
}

fn default_poll_wait_secs() -> u64 {
    5
}

fn default_idle_sleep_secs() -> u64 {
    10
}

fn default_error_pause_secs() -> u64 {
    2
}

fn default_persist_max_attempts() -> u32 {
    5
}

fn default_persist_base_delay_ms() -> u64 {
    500
}

fn default_persist_max_delay_ms() -> u64 {
    30_000
}

fn default_upload_max_attempts() -> u32 {
    1
}

fn default_worker_concurrency() -> usize {
    1
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which persistence backoff would stop growing.
    pub fn validate(&self) -> Result<(), envy::Error> {
        if !self.persist_policy().delays_strictly_increase() {
            return Err(envy::Error::Custom(format!(
                "PERSIST_MAX_ATTEMPTS={} with PERSIST_BASE_DELAY_MS={} reaches \
                 PERSIST_MAX_DELAY_MS={} before the last retry",
                self.persist_max_attempts, self.persist_base_delay_ms, self.persist_max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            input_size: self.input_size,
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            intra_threads: self.inference_threads,
        }
    }

    fn persist_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.persist_max_attempts,
            Duration::from_millis(self.persist_base_delay_ms),
        )
        .with_max_delay(Duration::from_millis(self.persist_max_delay_ms))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            scratch_dir: self.scratch_dir.clone(),
            persist_policy: self.persist_policy(),
            upload_policy: RetryPolicy::new(
                self.upload_max_attempts,
                Duration::from_millis(self.persist_base_delay_ms),
            ),
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            poll_wait: Duration::from_secs(self.poll_wait_secs),
            idle_sleep: Duration::from_secs(self.idle_sleep_secs),
            error_pause: Duration::from_secs(self.error_pause_secs),
            concurrency: self.worker_concurrency.max(1),
        }
    }
}
