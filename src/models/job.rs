use garde::Validate;
use serde::Deserialize;

use crate::error::PipelineError;

/// Wire shape of a detection request as producers push it onto the queue.
#[derive(Debug, Deserialize)]
struct JobPayload {
    img_name: Option<String>,
    chat_id: Option<String>,
}

/// A detection request decoded from a queue message body.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct Job {
    /// Object key of the input image in the bucket.
    #[garde(length(min = 1))]
    pub image_name: String,

    /// Caller correlation id, carried through to the stored prediction.
    #[garde(length(min = 1))]
    pub chat_id: String,
}

impl Job {
    /// Decode and validate a raw message body.
    ///
    /// Any failure is a [`PipelineError::Validation`]: the message can never
    /// succeed on redelivery.
    pub fn decode(body: &str) -> Result<Self, PipelineError> {
        let payload: JobPayload = serde_json::from_str(body)
            .map_err(|e| PipelineError::Validation(format!("malformed job payload: {e}")))?;

        let job = Self {
            image_name: payload.img_name.unwrap_or_default(),
            chat_id: payload.chat_id.unwrap_or_default(),
        };

        job.validate()
            .map_err(|report| PipelineError::Validation(report.to_string()))?;

        Ok(job)
    }

    /// Last path segment of the image key, used for scratch copies.
    pub fn file_name(&self) -> &str {
        self.image_name
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .unwrap_or("image")
    }
}
