use chrono::Utc;
use sqlx::{Error as SqlxError, SqlitePool};
use tracing::info;

use crate::db::models::TranscriptRow;

pub struct TranscriptsRepository;

impl TranscriptsRepository {
    /// Store a transcript for a call. At most one row per call; an explicit
    /// re-run replaces the previous text.
    pub async fn store(
        pool: &SqlitePool,
        call_id: &str,
        text: &str,
        language: Option<&str>,
        confidence: i64,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            "INSERT INTO transcripts (call_id, text, language, confidence, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(call_id) DO UPDATE SET
                text = excluded.text,
                language = excluded.language,
                confidence = excluded.confidence",
        )
        .bind(call_id)
        .bind(text)
        .bind(language)
        .bind(confidence)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        info!(
            "Transcript stored for call {} ({} chars)",
            call_id,
            text.len()
        );
        Ok(())
    }

    pub async fn get_by_call(
        pool: &SqlitePool,
        call_id: &str,
    ) -> Result<Option<TranscriptRow>, SqlxError> {
        sqlx::query_as::<_, TranscriptRow>("SELECT * FROM transcripts WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn delete_by_call(pool: &SqlitePool, call_id: &str) -> Result<(), SqlxError> {
        sqlx::query("DELETE FROM transcripts WHERE call_id = ?")
            .bind(call_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete_all(pool: &SqlitePool) -> Result<(), SqlxError> {
        sqlx::query("DELETE FROM transcripts").execute(pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_database;
    use crate::db::models::NewCall;
    use crate::db::repositories::CallsRepository;

    async fn seed_call(pool: &SqlitePool, call_id: &str) {
        CallsRepository::create(
            pool,
            &NewCall {
                call_id: call_id.to_string(),
                file_path: "/tmp/a.wav".into(),
                original_filename: "a.wav".into(),
                file_size_bytes: 10,
                duration: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn one_transcript_per_call_even_after_rerun() {
        let (_dir, db) = temp_database().await;
        seed_call(db.pool(), "c1").await;

        TranscriptsRepository::store(db.pool(), "c1", "first", Some("en"), 80)
            .await
            .unwrap();
        TranscriptsRepository::store(db.pool(), "c1", "second", Some("en"), 90)
            .await
            .unwrap();

        let row = TranscriptsRepository::get_by_call(db.pool(), "c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.text, "second");
        assert_eq!(row.confidence, 90);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transcripts")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
