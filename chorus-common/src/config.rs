//! Configuration loading
//!
//! One TOML document covers both workers. Resolution order: explicit path
//! (CLI), `CHORUS_CONFIG` environment variable, compiled defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    /// SQLite database file backing the document store
    pub database_path: PathBuf,
    /// Root directory of the filesystem blob store
    pub blob_root: PathBuf,
    /// Local scratch directory for downloaded artifacts
    pub scratch_dir: PathBuf,

    /// Length of a model epoch in days
    pub validity_days: i64,
    /// Analysis kind that produces feature frames (prerequisite for both
    /// training and inference)
    pub feature_analysis: String,
    /// Analysis kind recorded against detections produced here
    pub analysis_id: String,
    /// Seconds of audio covered by one feature frame
    pub frame_seconds: f64,
    /// Percentile of in-sample scores used as the detection threshold
    pub anomaly_percentile: f64,
    /// Items in a training window that lack feature frames are skipped with
    /// a warning when true, and fail the training job when false
    pub skip_missing_features: bool,

    /// Seconds between dispatcher sweeps
    pub dispatch_interval_secs: u64,
    /// A pending model record must be at least this old before its training
    /// job is queued, leaving room for backfilled uploads
    pub dispatch_backfill_delay_secs: u64,
    /// A processing record older than this is presumed lost and requeued
    pub processing_stale_secs: u64,
    /// Requeue cap: after this many attempts a stalled record is failed
    pub max_training_attempts: i64,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("chorus.db"),
            blob_root: PathBuf::from("blobs"),
            scratch_dir: std::env::temp_dir().join("chorus"),
            validity_days: crate::epoch::DEFAULT_VALIDITY_DAYS,
            feature_analysis: "embedding".to_string(),
            analysis_id: "anomaly-detection".to_string(),
            frame_seconds: 0.96,
            anomaly_percentile: 99.99,
            skip_missing_features: true,
            dispatch_interval_secs: 3600,
            dispatch_backfill_delay_secs: 2 * 3600,
            processing_stale_secs: 8 * 3600,
            max_training_attempts: 5,
        }
    }
}

impl ChorusConfig {
    /// Load configuration.
    ///
    /// Priority order:
    /// 1. Explicit path (command-line argument)
    /// 2. `CHORUS_CONFIG` environment variable
    /// 3. Compiled defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(env_path) = std::env::var("CHORUS_CONFIG") {
            return Self::from_file(Path::new(&env_path));
        }

        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))
    }
}
