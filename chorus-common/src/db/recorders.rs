//! Recorder record operations

use sqlx::SqlitePool;

use super::models::Recorder;
use crate::time::{from_db, to_db};
use crate::Result;

/// Save (or replace) a recorder record
pub async fn save_recorder(pool: &SqlitePool, recorder: &Recorder) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO recorders (project, id, name, created_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(project, id) DO UPDATE SET
            name = excluded.name,
            created_at = excluded.created_at
        "#,
    )
    .bind(&recorder.project)
    .bind(&recorder.id)
    .bind(&recorder.name)
    .bind(to_db(recorder.created_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one recorder record
pub async fn get_recorder(
    pool: &SqlitePool,
    project: &str,
    recorder_id: &str,
) -> Result<Option<Recorder>> {
    let row: Option<(String, String, Option<String>, String)> = sqlx::query_as(
        "SELECT project, id, name, created_at FROM recorders WHERE project = ? AND id = ?",
    )
    .bind(project)
    .bind(recorder_id)
    .fetch_optional(pool)
    .await?;

    match row {
        None => Ok(None),
        Some((project, id, name, created_at)) => Ok(Some(Recorder {
            project,
            id,
            name,
            created_at: from_db(&created_at)?,
        })),
    }
}
