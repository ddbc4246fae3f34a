//! Item record operations and the detection merge engine
//!
//! The merge runs inside a single-row transaction so that two analyses
//! finishing concurrently on the same item cannot overwrite each other's
//! detections. Contention is retried here and never surfaced to callers.

use sqlx::SqlitePool;

use super::models::{AudioItem, Detection};
use super::retry::retry_on_lock;
use crate::time::{from_db, to_db};
use crate::{Error, Result};

/// Retry deadline for the merge transaction
const MERGE_MAX_WAIT_MS: u64 = 5_000;

/// Save (or replace) an item record
pub async fn save_item(pool: &SqlitePool, item: &AudioItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO items (
            id, project, recorder, uploaded_at, uri,
            analyses_performed, detections, has_detections, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            project = excluded.project,
            recorder = excluded.recorder,
            uploaded_at = excluded.uploaded_at,
            uri = excluded.uri,
            analyses_performed = excluded.analyses_performed,
            detections = excluded.detections,
            has_detections = excluded.has_detections
        "#,
    )
    .bind(&item.id)
    .bind(&item.project)
    .bind(&item.recorder)
    .bind(to_db(item.uploaded_at))
    .bind(&item.uri)
    .bind(serde_json::to_string(&item.analyses_performed)?)
    .bind(serde_json::to_string(&item.detections)?)
    .bind(item.has_detections as i64)
    .bind(to_db(crate::time::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one item record
pub async fn get_item(pool: &SqlitePool, item_id: &str) -> Result<Option<AudioItem>> {
    let row: Option<ItemRow> = sqlx::query_as(
        "SELECT id, project, recorder, uploaded_at, uri, \
                analyses_performed, detections, has_detections \
         FROM items WHERE id = ?",
    )
    .bind(item_id)
    .fetch_optional(pool)
    .await?;

    row.map(parse_item).transpose()
}

/// All items for one recorder whose upload time falls inside [from, to],
/// ordered by upload time ascending
pub async fn items_in_window(
    pool: &SqlitePool,
    project: &str,
    recorder: &str,
    from: chrono::DateTime<chrono::Utc>,
    to: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<AudioItem>> {
    let rows: Vec<ItemRow> = sqlx::query_as(
        "SELECT id, project, recorder, uploaded_at, uri, \
                analyses_performed, detections, has_detections \
         FROM items \
         WHERE project = ? AND recorder = ? AND uploaded_at >= ? AND uploaded_at <= ? \
         ORDER BY uploaded_at ASC",
    )
    .bind(project)
    .bind(recorder)
    .bind(to_db(from))
    .bind(to_db(to))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(parse_item).collect()
}

/// Merge newly computed detections into an item record.
///
/// Runs as a single-row transaction: read the current snapshot, merge in
/// memory, write back the detection list, the analysis set, and the derived
/// `has_detections` flag. Existing detections whose ID matches an incoming
/// one are replaced field-wise (newer values win); unmatched existing
/// detections are kept; incoming detections with new IDs are appended.
/// Applying the same detection set twice yields the same record.
pub async fn merge_detections(
    pool: &SqlitePool,
    item_id: &str,
    analysis_id: &str,
    new_detections: &[Detection],
) -> Result<()> {
    retry_on_lock("merge detections", MERGE_MAX_WAIT_MS, || async {
        let mut tx = pool.begin().await?;

        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT analyses_performed, detections FROM items WHERE id = ?",
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (performed_json, detections_json) =
            row.ok_or_else(|| Error::NotFound(format!("item {item_id}")))?;

        let mut performed: Vec<String> = serde_json::from_str(&performed_json)?;
        if performed.iter().any(|a| a == analysis_id) {
            tracing::warn!(
                item_id,
                analysis_id,
                "analysis already recorded for item, refreshing results"
            );
        } else {
            performed.push(analysis_id.to_string());
        }

        let existing: Vec<Detection> = serde_json::from_str(&detections_json)?;
        let merged = merge_detection_lists(&existing, new_detections);
        let has_detections = !merged.is_empty();

        sqlx::query(
            "UPDATE items SET analyses_performed = ?, detections = ?, has_detections = ? \
             WHERE id = ?",
        )
        .bind(serde_json::to_string(&performed)?)
        .bind(serde_json::to_string(&merged)?)
        .bind(has_detections as i64)
        .bind(item_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            item_id,
            analysis_id,
            merged = merged.len(),
            incoming = new_detections.len(),
            "detections merged"
        );

        Ok(())
    })
    .await
}

/// Merge two detection lists by stable ID
pub fn merge_detection_lists(existing: &[Detection], incoming: &[Detection]) -> Vec<Detection> {
    let mut merged: Vec<Detection> = Vec::with_capacity(existing.len() + incoming.len());

    for detection in existing {
        match incoming.iter().find(|n| n.id == detection.id) {
            Some(newer) => merged.push(detection.overlay(newer)),
            None => merged.push(detection.clone()),
        }
    }

    for newer in incoming {
        if !merged.iter().any(|m| m.id == newer.id) {
            merged.push(newer.clone());
        }
    }

    merged
}

type ItemRow = (String, String, String, String, String, String, String, i64);

fn parse_item(row: ItemRow) -> Result<AudioItem> {
    let (id, project, recorder, uploaded_at, uri, performed_json, detections_json, has_detections) =
        row;

    Ok(AudioItem {
        id,
        project,
        recorder,
        uploaded_at: from_db(&uploaded_at)?,
        uri,
        analyses_performed: serde_json::from_str(&performed_json)?,
        detections: serde_json::from_str(&detections_json)?,
        has_detections: has_detections != 0,
    })
}
