use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::DocumentStoreError;
use crate::models::prediction::{epoch_seconds, Label, PredictionId, PredictionRecord};

/// Insert a prediction document. Plain insert: a duplicate id is an error.
pub async fn insert_prediction(
    pool: &PgPool,
    record: &PredictionRecord,
) -> Result<(), DocumentStoreError> {
    sqlx::query(
        r#"
        INSERT INTO predictions (id, chat_id, original_img_path, predicted_img_path, labels, time)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(&record.chat_id)
    .bind(&record.original_image_key)
    .bind(&record.predicted_image_key)
    .bind(Json(&record.labels))
    .bind(epoch_seconds::to_f64(&record.created_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a prediction by ID
pub async fn get_prediction(
    pool: &PgPool,
    id: PredictionId,
) -> Result<Option<PredictionRecord>, DocumentStoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, chat_id, original_img_path, predicted_img_path, labels, time
        FROM predictions
        WHERE id = $1
        "#,
    )
    .bind(id.as_uuid())
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let id: Uuid = r.try_get("id")?;
    let Json(labels): Json<Vec<Label>> = r.try_get("labels")?;
    let time: f64 = r.try_get("time")?;
    let created_at = epoch_seconds::from_f64(time).ok_or_else(|| {
        DocumentStoreError::Database(sqlx::Error::Decode(
            format!("timestamp out of range: {time}").into(),
        ))
    })?;

    Ok(Some(PredictionRecord {
        id: PredictionId::from(id),
        chat_id: r.try_get("chat_id")?,
        original_image_key: r.try_get("original_img_path")?,
        predicted_image_key: r.try_get("predicted_img_path")?,
        labels,
        created_at,
    }))
}

/// Predictions stored for a chat, oldest first.
pub async fn list_for_chat(
    pool: &PgPool,
    chat_id: &str,
) -> Result<Vec<PredictionId>, DocumentStoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id
        FROM predictions
        WHERE chat_id = $1
        ORDER BY time ASC
        "#,
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| Ok(PredictionId::from(r.try_get::<Uuid, _>("id")?)))
        .collect()
}
