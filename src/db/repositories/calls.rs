use chrono::Utc;
use sqlx::{Error as SqlxError, SqlitePool};
use tracing::{error, info};

use crate::db::models::{CallRow, CallStatus, NewCall};

pub struct CallsRepository;

impl CallsRepository {
    pub async fn create(pool: &SqlitePool, call: &NewCall) -> Result<(), SqlxError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO calls (call_id, file_path, original_filename, file_size_bytes, duration, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&call.call_id)
        .bind(&call.file_path)
        .bind(&call.original_filename)
        .bind(call.file_size_bytes)
        .bind(call.duration)
        .bind(CallStatus::Uploaded.as_str())
        .bind(now)
        .execute(pool)
        .await;

        if let Err(e) = &result {
            error!("Failed to create call record {}: {}", call.call_id, e);
        } else {
            info!("Call record created: {}", call.call_id);
        }
        result.map(|_| ())
    }

    pub async fn get(pool: &SqlitePool, call_id: &str) -> Result<Option<CallRow>, SqlxError> {
        sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<CallRow>, SqlxError> {
        sqlx::query_as::<_, CallRow>("SELECT * FROM calls ORDER BY created_at DESC, id DESC")
            .fetch_all(pool)
            .await
    }

    /// Status transition; `updated_at` moves with every change.
    pub async fn update_status(
        pool: &SqlitePool,
        call_id: &str,
        status: CallStatus,
        error_message: Option<&str>,
    ) -> Result<(), SqlxError> {
        info!("Updating call status: {} -> {}", call_id, status);
        sqlx::query("UPDATE calls SET status = ?, error = ?, updated_at = ? WHERE call_id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(Utc::now())
            .bind(call_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Write back the audio-analysis summary measured during processing.
    pub async fn update_audio_summary(
        pool: &SqlitePool,
        call_id: &str,
        duration: Option<f64>,
        format: Option<&str>,
        sample_rate: Option<i64>,
        channels: Option<i64>,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            "UPDATE calls SET duration = COALESCE(?, duration), audio_format = ?, sample_rate = ?, channels = ?, updated_at = ?
             WHERE call_id = ?",
        )
        .bind(duration)
        .bind(format)
        .bind(sample_rate)
        .bind(channels)
        .bind(Utc::now())
        .bind(call_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_row(pool: &SqlitePool, call_id: &str) -> Result<u64, SqlxError> {
        let done = sqlx::query("DELETE FROM calls WHERE call_id = ?")
            .bind(call_id)
            .execute(pool)
            .await?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_database;

    fn new_call(call_id: &str) -> NewCall {
        NewCall {
            call_id: call_id.to_string(),
            file_path: format!("/tmp/{call_id}.wav"),
            original_filename: "clip.wav".to_string(),
            file_size_bytes: 1000,
            duration: Some(5.0),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_round_trip() {
        let (_dir, db) = temp_database().await;
        CallsRepository::create(db.pool(), &new_call("c1")).await.unwrap();

        let row = CallsRepository::get(db.pool(), "c1").await.unwrap().unwrap();
        assert_eq!(row.status, "uploaded");
        assert_eq!(row.duration, Some(5.0));
        assert!(row.updated_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_call_id_is_rejected() {
        let (_dir, db) = temp_database().await;
        CallsRepository::create(db.pool(), &new_call("dup")).await.unwrap();
        assert!(CallsRepository::create(db.pool(), &new_call("dup"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn status_updates_touch_updated_at() {
        let (_dir, db) = temp_database().await;
        CallsRepository::create(db.pool(), &new_call("c2")).await.unwrap();
        CallsRepository::update_status(db.pool(), "c2", CallStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let row = CallsRepository::get(db.pool(), "c2").await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error.as_deref(), Some("boom"));
        assert!(row.updated_at.is_some());
    }
}
