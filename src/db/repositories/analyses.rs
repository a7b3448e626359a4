use chrono::Utc;
use sqlx::{Error as SqlxError, SqlitePool};
use tracing::info;

use crate::db::models::{AnalysisRow, NewAnalysis};

pub struct AnalysesRepository;

impl AnalysesRepository {
    /// Append an analysis row; re-analysis keeps history.
    pub async fn insert(
        pool: &SqlitePool,
        call_id: &str,
        analysis: &NewAnalysis,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            "INSERT INTO analyses (call_id, intent, intent_confidence, sentiment, sentiment_score,
                                   escalation_risk, risk_score, urgency_level, compliance_risk,
                                   keywords, topics, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(call_id)
        .bind(&analysis.intent)
        .bind(analysis.intent_confidence)
        .bind(&analysis.sentiment)
        .bind(analysis.sentiment_score)
        .bind(&analysis.escalation_risk)
        .bind(analysis.risk_score)
        .bind(&analysis.urgency_level)
        .bind(&analysis.compliance_risk)
        .bind(serde_json::to_string(&analysis.keywords).unwrap_or_else(|_| "[]".into()))
        .bind(serde_json::to_string(&analysis.topics).unwrap_or_else(|_| "[]".into()))
        .bind(Utc::now())
        .execute(pool)
        .await?;

        info!(
            "Analysis stored for call {}: intent={} sentiment={} risk={}",
            call_id, analysis.intent, analysis.sentiment, analysis.escalation_risk
        );
        Ok(())
    }

    /// Most recent analysis for a call, if any.
    pub async fn latest_for_call(
        pool: &SqlitePool,
        call_id: &str,
    ) -> Result<Option<AnalysisRow>, SqlxError> {
        sqlx::query_as::<_, AnalysisRow>(
            "SELECT * FROM analyses WHERE call_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(call_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn delete_by_call(pool: &SqlitePool, call_id: &str) -> Result<(), SqlxError> {
        sqlx::query("DELETE FROM analyses WHERE call_id = ?")
            .bind(call_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn delete_all(pool: &SqlitePool) -> Result<(), SqlxError> {
        sqlx::query("DELETE FROM analyses").execute(pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_database;

    fn analysis(intent: &str) -> NewAnalysis {
        NewAnalysis {
            intent: intent.to_string(),
            intent_confidence: 40,
            sentiment: "neutral".into(),
            sentiment_score: 0,
            escalation_risk: "low".into(),
            risk_score: 0,
            urgency_level: "low".into(),
            compliance_risk: "none".into(),
            keywords: vec!["billing".into()],
            topics: Vec::new(),
        }
    }

    #[tokio::test]
    async fn reanalysis_appends_and_latest_wins() {
        let (_dir, db) = temp_database().await;
        AnalysesRepository::insert(db.pool(), "c1", &analysis("billing question"))
            .await
            .unwrap();
        AnalysesRepository::insert(db.pool(), "c1", &analysis("sales inquiry"))
            .await
            .unwrap();

        let latest = AnalysesRepository::latest_for_call(db.pool(), "c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.intent.as_deref(), Some("sales inquiry"));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analyses WHERE call_id = 'c1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);

        let keywords: Vec<String> = serde_json::from_str(&latest.keywords).unwrap();
        assert_eq!(keywords, vec!["billing".to_string()]);
    }
}
