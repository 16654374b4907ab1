use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier minted once per pipeline attempt.
///
/// Two deliveries of the same message get two different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictionId(Uuid);

impl PredictionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PredictionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PredictionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PredictionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One normalized bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    #[serde(rename = "class")]
    pub class_name: String,
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
    /// Detector score, when the label file carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Stored result of one successful detection run. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    #[serde(rename = "_id")]
    pub id: PredictionId,
    pub chat_id: String,
    #[serde(rename = "original_img_path")]
    pub original_image_key: String,
    #[serde(rename = "predicted_img_path")]
    pub predicted_image_key: String,
    pub labels: Vec<Label>,
    #[serde(rename = "time", with = "epoch_seconds")]
    pub created_at: DateTime<Utc>,
}

/// Bucket key of the rendered image for an attempt.
pub fn predicted_image_key(id: &PredictionId, image_name: &str) -> String {
    format!("predictions/{id}/{image_name}")
}

/// Timestamps travel as fractional seconds since the Unix epoch.
pub mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn to_f64(time: &DateTime<Utc>) -> f64 {
        time.timestamp_micros() as f64 / 1_000_000.0
    }

    pub fn from_f64(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
    }

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(to_f64(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        from_f64(secs).ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}")))
    }
}
