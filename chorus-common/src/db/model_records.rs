//! Model record operations
//!
//! The model record is the only coordination point between workers: its
//! creation is an atomic create-if-absent (the coordinator's claim), and
//! every status change is a compare-and-set whose legal source states come
//! from the [`ModelStatus`] transition table. An update that would express
//! an illegal transition matches zero rows and reports `false` instead of
//! writing.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::models::{ModelRecord, ModelStatus};
use crate::time::{from_db, to_db};
use crate::Result;

/// Create the record if no record with its ID exists yet.
///
/// Returns true when this call created the record. The insert is atomic, so
/// two workers racing to claim the same epoch end with exactly one pending
/// record; the loser simply observes `false`.
pub async fn create_if_absent(pool: &SqlitePool, record: &ModelRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO model_records (
            id, project, recorder,
            source_start, source_end, inference_valid_start, inference_valid_end,
            filename, uri, status, attempts, error, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.project)
    .bind(&record.recorder)
    .bind(to_db(record.source_start))
    .bind(to_db(record.source_end))
    .bind(to_db(record.inference_valid_start))
    .bind(to_db(record.inference_valid_end))
    .bind(&record.filename)
    .bind(&record.uri)
    .bind(record.status.as_str())
    .bind(record.attempts)
    .bind(&record.error)
    .bind(to_db(record.created_at))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Load one model record
pub async fn get(pool: &SqlitePool, record_id: &str) -> Result<Option<ModelRecord>> {
    let row = sqlx::query("SELECT * FROM model_records WHERE id = ?")
        .bind(record_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| parse_record(&r)).transpose()
}

/// Queue (or requeue) a record for training: publish-side bookkeeping done
/// by the dispatcher. Clears stale processing/completion stamps and counts
/// the attempt.
pub async fn mark_queued(pool: &SqlitePool, record_id: &str) -> Result<bool> {
    let result = sqlx::query(&format!(
        "UPDATE model_records SET \
             status = 'queued', queued_at = ?, processing_at = NULL, \
             completed_at = NULL, attempts = attempts + 1 \
         WHERE id = ? AND status IN ({})",
        sources_clause(ModelStatus::Queued)
    ))
    .bind(to_db(crate::time::now()))
    .bind(record_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// The training runner's claim: advance to processing iff the record is
/// still waiting. Returns false when another run already advanced it — the
/// duplicate-delivery guard.
pub async fn claim_processing(pool: &SqlitePool, record_id: &str) -> Result<bool> {
    let result = sqlx::query(&format!(
        "UPDATE model_records SET status = 'processing', processing_at = ? \
         WHERE id = ? AND status IN ({})",
        sources_clause(ModelStatus::Processing)
    ))
    .bind(to_db(crate::time::now()))
    .bind(record_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Terminal success: record the artifact location
pub async fn mark_complete(pool: &SqlitePool, record_id: &str, uri: &str) -> Result<bool> {
    let result = sqlx::query(&format!(
        "UPDATE model_records SET \
             status = 'complete', completed_at = ?, uri = ?, error = NULL \
         WHERE id = ? AND status IN ({})",
        sources_clause(ModelStatus::Complete)
    ))
    .bind(to_db(crate::time::now()))
    .bind(uri)
    .bind(record_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Terminal failure: record the causing error for operator visibility
pub async fn mark_failed(pool: &SqlitePool, record_id: &str, error: &str) -> Result<bool> {
    let result = sqlx::query(&format!(
        "UPDATE model_records SET status = 'failed', failed_at = ?, error = ? \
         WHERE id = ? AND status IN ({})",
        sources_clause(ModelStatus::Failed)
    ))
    .bind(to_db(crate::time::now()))
    .bind(error)
    .bind(record_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Pending records created before `cutoff`, oldest first — the dispatcher's
/// backfill-delay query
pub async fn pending_older_than(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ModelRecord>> {
    records_by_status_before(pool, ModelStatus::Pending, "created_at", cutoff).await
}

/// Processing records whose claim is older than `cutoff` — presumed lost
/// workers, candidates for requeue
pub async fn processing_stalled_since(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ModelRecord>> {
    records_by_status_before(pool, ModelStatus::Processing, "processing_at", cutoff).await
}

async fn records_by_status_before(
    pool: &SqlitePool,
    status: ModelStatus,
    timestamp_column: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ModelRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT * FROM model_records \
         WHERE status = ? AND {timestamp_column} < ? \
         ORDER BY {timestamp_column} ASC"
    ))
    .bind(status.as_str())
    .bind(to_db(cutoff))
    .fetch_all(pool)
    .await?;

    rows.iter().map(parse_record).collect()
}

/// `'a','b'` list of the statuses from which `to` is legally reachable.
/// Status names are compile-time constants, so inlining them is safe.
fn sources_clause(to: ModelStatus) -> String {
    ModelStatus::legal_sources(to)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_record(row: &sqlx::sqlite::SqliteRow) -> Result<ModelRecord> {
    let status: String = row.try_get("status")?;

    let optional_time = |column: &str| -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = row.try_get(column)?;
        value.as_deref().map(from_db).transpose()
    };

    Ok(ModelRecord {
        id: row.try_get("id")?,
        project: row.try_get("project")?,
        recorder: row.try_get("recorder")?,
        source_start: from_db(&row.try_get::<String, _>("source_start")?)?,
        source_end: from_db(&row.try_get::<String, _>("source_end")?)?,
        inference_valid_start: from_db(&row.try_get::<String, _>("inference_valid_start")?)?,
        inference_valid_end: from_db(&row.try_get::<String, _>("inference_valid_end")?)?,
        filename: row.try_get("filename")?,
        uri: row.try_get("uri")?,
        status: ModelStatus::parse(&status)?,
        attempts: row.try_get("attempts")?,
        error: row.try_get("error")?,
        created_at: from_db(&row.try_get::<String, _>("created_at")?)?,
        queued_at: optional_time("queued_at")?,
        processing_at: optional_time("processing_at")?,
        completed_at: optional_time("completed_at")?,
        failed_at: optional_time("failed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_db;
    use crate::epoch::{resolve_epoch, EpochResolution};
    use chrono::{Duration, TimeZone, Utc};

    fn test_record() -> ModelRecord {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let uploaded = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        match resolve_epoch("proj", "rec-1", created, uploaded, 5) {
            EpochResolution::Epoch(descriptor) => ModelRecord::pending_from_epoch(&descriptor),
            EpochResolution::NotEnoughHistory => panic!("expected an epoch"),
        }
    }

    #[tokio::test]
    async fn test_create_if_absent_is_idempotent() {
        let pool = setup_test_db().await;
        let record = test_record();

        assert!(create_if_absent(&pool, &record).await.unwrap());
        // second claim for the same epoch observes the existing record
        assert!(!create_if_absent(&pool, &record).await.unwrap());

        let loaded = get(&pool, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ModelStatus::Pending);
        assert_eq!(loaded.source_start, record.source_start);
        assert_eq!(loaded.attempts, 0);
    }

    #[tokio::test]
    async fn test_claim_processing_single_winner() {
        let pool = setup_test_db().await;
        let record = test_record();
        create_if_absent(&pool, &record).await.unwrap();
        mark_queued(&pool, &record.id).await.unwrap();

        assert!(claim_processing(&pool, &record.id).await.unwrap());
        // a duplicate delivery loses the claim
        assert!(!claim_processing(&pool, &record.id).await.unwrap());

        let loaded = get(&pool, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ModelStatus::Processing);
        assert!(loaded.processing_at.is_some());
        assert_eq!(loaded.attempts, 1);
    }

    #[tokio::test]
    async fn test_terminal_states_resist_redelivery() {
        let pool = setup_test_db().await;
        let record = test_record();
        create_if_absent(&pool, &record).await.unwrap();
        claim_processing(&pool, &record.id).await.unwrap();
        mark_complete(&pool, &record.id, &record.uri).await.unwrap();

        // a redelivered job can neither requeue nor reclaim the record
        assert!(!mark_queued(&pool, &record.id).await.unwrap());
        assert!(!claim_processing(&pool, &record.id).await.unwrap());
        assert!(!mark_failed(&pool, &record.id, "late failure").await.unwrap());

        let loaded = get(&pool, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ModelStatus::Complete);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_failed_records_error() {
        let pool = setup_test_db().await;
        let record = test_record();
        create_if_absent(&pool, &record).await.unwrap();
        claim_processing(&pool, &record.id).await.unwrap();

        assert!(mark_failed(&pool, &record.id, "no feature frames").await.unwrap());

        let loaded = get(&pool, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ModelStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("no feature frames"));
        assert!(loaded.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_requeue_clears_stale_claim() {
        let pool = setup_test_db().await;
        let record = test_record();
        create_if_absent(&pool, &record).await.unwrap();
        claim_processing(&pool, &record.id).await.unwrap();

        // stalled worker: dispatcher requeues
        assert!(mark_queued(&pool, &record.id).await.unwrap());

        let loaded = get(&pool, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ModelStatus::Queued);
        assert!(loaded.processing_at.is_none());
        assert_eq!(loaded.attempts, 1);
    }

    #[tokio::test]
    async fn test_dispatcher_queries() {
        let pool = setup_test_db().await;
        let record = test_record();
        create_if_absent(&pool, &record).await.unwrap();

        let future = crate::time::now() + Duration::hours(1);
        let past = crate::time::now() - Duration::hours(1);

        assert_eq!(pending_older_than(&pool, future).await.unwrap().len(), 1);
        assert!(pending_older_than(&pool, past).await.unwrap().is_empty());

        claim_processing(&pool, &record.id).await.unwrap();
        assert_eq!(
            processing_stalled_since(&pool, future).await.unwrap().len(),
            1
        );
        assert!(processing_stalled_since(&pool, past).await.unwrap().is_empty());
    }
}
