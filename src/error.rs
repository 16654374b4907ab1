use strum::{Display, IntoStaticStr};

use crate::db::DocumentStoreError;
use crate::services::{notifier::NotifyError, storage::StorageError};

/// Position in the per-message state machine where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Receive,
    Decode,
    Fetch,
    Infer,
    Encode,
    Upload,
    Persist,
    Notify,
    Acknowledge,
    Dispatch,
}

/// Closed error taxonomy of the job pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    TransientIo,
    DataCorruption,
    DegradedUpload,
    Persistence,
    Notification,
    Catastrophic,
}

/// What happens to the queue message after an error of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the message now; it can never succeed.
    Acknowledge,
    /// Leave the message leased; the queue redelivers it after the visibility timeout.
    Redeliver,
    /// Log and carry on with the next stage.
    Continue,
    /// Propagate to the consumer loop.
    Escalate,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("transient failure during {stage}: {message}")]
    TransientIo { stage: Stage, message: String },

    #[error("corrupt detection line {line}: {reason}")]
    DataCorruption { line: usize, reason: String },

    #[error("predicted image upload failed: {0}")]
    DegradedUpload(#[source] StorageError),

    #[error("prediction not persisted after {attempts} attempt(s): {source}")]
    Persistence {
        attempts: u32,
        source: DocumentStoreError,
    },

    #[error("notification failed: {0}")]
    Notification(#[source] NotifyError),

    #[error("unexpected failure during {stage}: {message}")]
    Catastrophic { stage: Stage, message: String },
}

impl PipelineError {
    pub fn transient(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self::TransientIo {
            stage,
            message: err.to_string(),
        }
    }

    pub fn catastrophic(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self::Catastrophic {
            stage,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::TransientIo { .. } => ErrorKind::TransientIo,
            Self::DataCorruption { .. } => ErrorKind::DataCorruption,
            Self::DegradedUpload(_) => ErrorKind::DegradedUpload,
            Self::Persistence { .. } => ErrorKind::Persistence,
            Self::Notification(_) => ErrorKind::Notification,
            Self::Catastrophic { .. } => ErrorKind::Catastrophic,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self.kind() {
            ErrorKind::Validation => Disposition::Acknowledge,
            ErrorKind::TransientIo => Disposition::Redeliver,
            ErrorKind::DataCorruption
            | ErrorKind::DegradedUpload
            | ErrorKind::Persistence
            | ErrorKind::Notification => Disposition::Continue,
            ErrorKind::Catastrophic => Disposition::Escalate,
        }
    }

    /// Stage the error is attributed to, where the variant records one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Validation(_) => Some(Stage::Decode),
            Self::TransientIo { stage, .. } | Self::Catastrophic { stage, .. } => Some(*stage),
            Self::DataCorruption { .. } => Some(Stage::Encode),
            Self::DegradedUpload(_) => Some(Stage::Upload),
            Self::Persistence { .. } => Some(Stage::Persist),
            Self::Notification(_) => Some(Stage::Notify),
        }
    }
}
