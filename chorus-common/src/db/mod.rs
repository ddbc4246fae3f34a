//! Document-store layer
//!
//! SQLite is the document store: one row per item / recorder / model
//! record, JSON columns for nested lists, and single-row transactions for
//! the detection merge. All cross-worker coordination happens through this
//! layer as compare-and-create or transactional read-modify-write — there
//! is no lock manager.

pub mod items;
pub mod model_records;
pub mod models;
pub mod recorders;
pub mod retry;

use std::path::Path;

use sqlx::SqlitePool;

use crate::Result;

/// Initialize the database connection pool, creating the file and tables
/// if they do not exist yet
pub async fn init_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Create the Chorus tables if they do not exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recorders (
            project TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (project, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            recorder TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            uri TEXT NOT NULL,
            analyses_performed TEXT NOT NULL DEFAULT '[]',
            detections TEXT NOT NULL DEFAULT '[]',
            has_detections INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_items_recorder_uploaded \
         ON items (project, recorder, uploaded_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS model_records (
            id TEXT PRIMARY KEY,
            project TEXT NOT NULL,
            recorder TEXT NOT NULL,
            source_start TEXT NOT NULL,
            source_end TEXT NOT NULL,
            inference_valid_start TEXT NOT NULL,
            inference_valid_end TEXT NOT NULL,
            filename TEXT NOT NULL,
            uri TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            queued_at TEXT,
            processing_at TEXT,
            completed_at TEXT,
            failed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_model_records_status \
         ON model_records (status, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    /// In-memory pool pinned to a single connection so every query sees the
    /// same database
    pub async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        super::init_tables(&pool).await.unwrap();
        pool
    }
}
