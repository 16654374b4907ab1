use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::models::prediction::PredictionId;

/// Downstream callback announcing a finished prediction.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, prediction_id: &PredictionId) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationBody<'a> {
    prediction_id: &'a PredictionId,
}

/// Posts `{"predictionId": ...}` to a fixed URL. Never retried.
pub struct HttpNotifier {
    http: Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Http)?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, prediction_id: &PredictionId) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.url)
            .json(&NotificationBody { prediction_id })
            .send()
            .await
            .map_err(NotifyError::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Callback responded with status {0}")]
    Status(u16),
}
