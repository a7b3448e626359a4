// Results query layer: paginated, filtered browsing over persisted calls
// joined with their transcript and latest analysis.
//
// Ordering is load-bearing: `(created_at <dir> NULLS LAST, id <dir>)` makes
// pagination stable even when timestamps collide.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Error as SqlxError, FromRow, QueryBuilder, Sqlite, SqlitePool};
use tracing::{info, warn};

use super::{AnalysesRepository, CallsRepository, TranscriptsRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("asc") => SortDirection::Asc,
            _ => SortDirection::Desc,
        }
    }

    fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsQuery {
    pub status: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Only `created_at` is supported; anything else falls back silently.
    pub sort: Option<String>,
    pub direction: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ResultRow {
    pub id: i64,
    pub call_id: String,
    pub file_path: Option<String>,
    pub original_filename: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub duration: Option<f64>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    // Transcript join (null when missing, never row-excluding)
    pub transcript_text: Option<String>,
    pub language: Option<String>,
    pub confidence: Option<i64>,
    // Latest analysis join
    pub intent: Option<String>,
    pub intent_confidence: Option<i64>,
    pub sentiment: Option<String>,
    pub sentiment_score: Option<i64>,
    pub escalation_risk: Option<String>,
    pub risk_score: Option<i64>,
    pub urgency_level: Option<String>,
    pub compliance_risk: Option<String>,
    pub keywords: Option<String>,
    pub topics: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResultsPage {
    pub results: Vec<ResultRow>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

const SELECT_COLUMNS: &str = "c.id, c.call_id, c.file_path, c.original_filename, c.file_size_bytes, \
     c.duration, c.status, c.created_at, c.updated_at, \
     t.text AS transcript_text, t.language, t.confidence, \
     a.intent, a.intent_confidence, a.sentiment, a.sentiment_score, \
     a.escalation_risk, a.risk_score, a.urgency_level, a.compliance_risk, \
     a.keywords, a.topics";

const JOINS: &str = " FROM calls c \
     LEFT JOIN transcripts t ON t.call_id = c.call_id \
     LEFT JOIN analyses a ON a.id = \
        (SELECT MAX(a2.id) FROM analyses a2 WHERE a2.call_id = c.call_id)";

pub struct ResultsRepository;

impl ResultsRepository {
    pub async fn list(pool: &SqlitePool, query: &ResultsQuery) -> Result<ResultsPage, SqlxError> {
        let direction = SortDirection::parse(query.direction.as_deref());
        if let Some(sort) = query.sort.as_deref() {
            if sort != "created_at" {
                warn!("unsupported sort field '{sort}', falling back to created_at");
            }
        }

        let limit = query.limit.unwrap_or(50).clamp(1, 500);
        let offset = query.offset.unwrap_or(0).max(0);

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {SELECT_COLUMNS}{JOINS} WHERE 1=1"));
        push_filters(&mut builder, query);
        let dir = direction.as_sql();
        builder.push(format!(
            " ORDER BY c.created_at {dir} NULLS LAST, c.id {dir}"
        ));
        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let results = builder
            .build_query_as::<ResultRow>()
            .fetch_all(pool)
            .await?;

        let mut count_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM calls c WHERE 1=1");
        push_filters(&mut count_builder, query);
        let total: i64 = count_builder.build_query_scalar().fetch_one(pool).await?;

        Ok(ResultsPage {
            results,
            total,
            page: offset / limit,
            page_size: limit,
        })
    }

    pub async fn detail(pool: &SqlitePool, call_id: &str) -> Result<Option<ResultRow>, SqlxError> {
        let sql = format!("SELECT {SELECT_COLUMNS}{JOINS} WHERE c.call_id = ?");
        sqlx::query_as::<_, ResultRow>(&sql)
            .bind(call_id)
            .fetch_optional(pool)
            .await
    }

    /// Cascading delete: files first (errors logged, never aborting), then
    /// child rows, then the call row.
    pub async fn delete(
        pool: &SqlitePool,
        call_id: &str,
        processed_dir: &Path,
    ) -> Result<bool, SqlxError> {
        let Some(call) = CallsRepository::get(pool, call_id).await? else {
            return Ok(false);
        };

        if let Some(file_path) = call.file_path.as_deref() {
            remove_file_logged(Path::new(file_path));
            // Processed derivative, if the pipeline produced one.
            if let Some(stem) = Path::new(file_path).file_stem() {
                let converted = processed_dir.join(format!("{}_converted.wav", stem.to_string_lossy()));
                if converted.exists() {
                    remove_file_logged(&converted);
                }
            }
        }

        TranscriptsRepository::delete_by_call(pool, call_id).await?;
        AnalysesRepository::delete_by_call(pool, call_id).await?;
        CallsRepository::delete_row(pool, call_id).await?;
        info!("Deleted call {} and dependent rows", call_id);
        Ok(true)
    }

    /// Remove everything under the upload root (files first, then emptied
    /// directories), then truncate child tables before `calls`.
    pub async fn clear_all(pool: &SqlitePool, upload_root: &Path) -> Result<(), SqlxError> {
        if upload_root.exists() {
            if let Err(e) = remove_dir_contents(upload_root) {
                warn!("failed clearing upload dir {}: {e}", upload_root.display());
            }
        }

        TranscriptsRepository::delete_all(pool).await?;
        AnalysesRepository::delete_all(pool).await?;
        sqlx::query("DELETE FROM calls").execute(pool).await?;
        info!("Cleared all results and uploaded files");
        Ok(())
    }
}

fn push_filters(builder: &mut QueryBuilder<Sqlite>, query: &ResultsQuery) {
    if let Some(status) = &query.status {
        builder.push(" AND c.status = ");
        builder.push_bind(status.clone());
    }
    if let Some(from) = query.date_from {
        builder.push(" AND c.created_at >= ");
        builder.push_bind(from);
    }
    if let Some(to) = query.date_to {
        builder.push(" AND c.created_at <= ");
        builder.push_bind(to);
    }
}

fn remove_file_logged(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!("Deleted file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to delete {}: {e}", path.display()),
    }
}

/// Depth-first removal: files before their directories.
fn remove_dir_contents(root: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_dir_contents(&path)?;
            std::fs::remove_dir(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_database;
    use crate::db::models::{CallStatus, NewAnalysis, NewCall};

    async fn seed_call(pool: &SqlitePool, call_id: &str, created_offset_sec: i64) {
        CallsRepository::create(
            pool,
            &NewCall {
                call_id: call_id.to_string(),
                file_path: format!("/tmp/{call_id}.wav"),
                original_filename: format!("{call_id}.wav"),
                file_size_bytes: 100,
                duration: None,
            },
        )
        .await
        .unwrap();
        // Deterministic timestamps for ordering assertions.
        let created = Utc::now() - chrono::Duration::seconds(created_offset_sec);
        sqlx::query("UPDATE calls SET created_at = ? WHERE call_id = ?")
            .bind(created)
            .bind(call_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pagination_yields_strict_prefixes_without_gaps() {
        let (_dir, db) = temp_database().await;
        for i in 0..5 {
            seed_call(db.pool(), &format!("c{i}"), i).await;
        }

        let full = ResultsRepository::list(
            db.pool(),
            &ResultsQuery {
                limit: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(full.total, 5);
        // Newest first.
        assert_eq!(full.results[0].call_id, "c0");

        let mut paged: Vec<String> = Vec::new();
        for page in 0..3 {
            let chunk = ResultsRepository::list(
                db.pool(),
                &ResultsQuery {
                    limit: Some(2),
                    offset: Some(page * 2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            paged.extend(chunk.results.iter().map(|r| r.call_id.clone()));
        }

        let full_ids: Vec<String> = full.results.iter().map(|r| r.call_id.clone()).collect();
        assert_eq!(paged, full_ids);
    }

    #[tokio::test]
    async fn id_breaks_created_at_ties() {
        let (_dir, db) = temp_database().await;
        seed_call(db.pool(), "a", 0).await;
        seed_call(db.pool(), "b", 0).await;
        let pinned = Utc::now();
        sqlx::query("UPDATE calls SET created_at = ?")
            .bind(pinned)
            .execute(db.pool())
            .await
            .unwrap();

        let page = ResultsRepository::list(db.pool(), &ResultsQuery::default())
            .await
            .unwrap();
        // Same timestamp: descending id order wins.
        assert_eq!(page.results[0].call_id, "b");
        assert_eq!(page.results[1].call_id, "a");
    }

    #[tokio::test]
    async fn status_filter_and_unsupported_sort_fall_back() {
        let (_dir, db) = temp_database().await;
        seed_call(db.pool(), "done", 0).await;
        seed_call(db.pool(), "pending", 1).await;
        CallsRepository::update_status(db.pool(), "done", CallStatus::Completed, None)
            .await
            .unwrap();

        let page = ResultsRepository::list(
            db.pool(),
            &ResultsQuery {
                status: Some("completed".into()),
                sort: Some("file_size_bytes".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.results[0].call_id, "done");
    }

    #[tokio::test]
    async fn detail_joins_transcript_and_latest_analysis() {
        let (_dir, db) = temp_database().await;
        seed_call(db.pool(), "c1", 0).await;
        TranscriptsRepository::store(db.pool(), "c1", "hello world", Some("en"), 85)
            .await
            .unwrap();
        for intent in ["billing question", "sales inquiry"] {
            AnalysesRepository::insert(
                db.pool(),
                "c1",
                &NewAnalysis {
                    intent: intent.into(),
                    intent_confidence: 30,
                    sentiment: "neutral".into(),
                    sentiment_score: 0,
                    escalation_risk: "low".into(),
                    risk_score: 0,
                    urgency_level: "low".into(),
                    compliance_risk: "none".into(),
                    keywords: Vec::new(),
                    topics: Vec::new(),
                },
            )
            .await
            .unwrap();
        }

        let row = ResultsRepository::detail(db.pool(), "c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.transcript_text.as_deref(), Some("hello world"));
        assert_eq!(row.intent.as_deref(), Some("sales inquiry"));

        let missing = ResultsRepository::detail(db.pool(), "nope").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn missing_children_yield_null_fields_not_exclusion() {
        let (_dir, db) = temp_database().await;
        seed_call(db.pool(), "bare", 0).await;
        let page = ResultsRepository::list(db.pool(), &ResultsQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert!(page.results[0].transcript_text.is_none());
        assert!(page.results[0].intent.is_none());
    }

    #[tokio::test]
    async fn delete_cascades_rows_and_files() {
        let (_dir, db) = temp_database().await;
        let files = tempfile::tempdir().unwrap();
        let audio = files.path().join("c1.wav");
        std::fs::write(&audio, b"riff").unwrap();

        CallsRepository::create(
            db.pool(),
            &NewCall {
                call_id: "c1".into(),
                file_path: audio.display().to_string(),
                original_filename: "c1.wav".into(),
                file_size_bytes: 4,
                duration: None,
            },
        )
        .await
        .unwrap();
        TranscriptsRepository::store(db.pool(), "c1", "text", None, 0)
            .await
            .unwrap();

        let deleted = ResultsRepository::delete(db.pool(), "c1", files.path())
            .await
            .unwrap();
        assert!(deleted);
        assert!(!audio.exists());
        assert!(CallsRepository::get(db.pool(), "c1").await.unwrap().is_none());
        assert!(TranscriptsRepository::get_by_call(db.pool(), "c1")
            .await
            .unwrap()
            .is_none());

        let again = ResultsRepository::delete(db.pool(), "c1", files.path())
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn clear_all_empties_tables_and_upload_root() {
        let (_dir, db) = temp_database().await;
        let uploads = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(uploads.path().join("2026/08/01")).unwrap();
        std::fs::write(uploads.path().join("2026/08/01/x.wav"), b"riff").unwrap();

        seed_call(db.pool(), "c1", 0).await;
        ResultsRepository::clear_all(db.pool(), uploads.path())
            .await
            .unwrap();

        assert!(std::fs::read_dir(uploads.path()).unwrap().next().is_none());
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM calls")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
