//! Epoch resolution
//!
//! Maps an item's upload time to the training epoch whose model must score
//! it. Epochs are fixed-length, non-overlapping windows of upload history
//! starting at recorder creation: a model trained on one window is valid for
//! inference over the *next* window of the same length. Every item uploaded
//! inside one inference-valid window resolves to the identical epoch ID and
//! therefore the identical model record — the invariant the coordinator's
//! create-if-absent claim depends on.
//!
//! Resolution is a pure function of its inputs: recomputing for the same
//! (recorder creation, upload time, validity length) always yields the same
//! descriptor.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::time::{end_of_utc_day, start_of_utc_day};

/// Default length of an epoch in days
pub const DEFAULT_VALIDITY_DAYS: i64 = 5;

/// A resolved epoch: the training window, the window of uploads its model
/// may score, and the deterministic identity of the model record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochDescriptor {
    pub project: String,
    pub recorder: String,
    /// Uploads in this window are the model's training data
    pub source_start: DateTime<Utc>,
    pub source_end: DateTime<Utc>,
    /// Uploads in this window are scored by the model
    pub inference_valid_start: DateTime<Utc>,
    pub inference_valid_end: DateTime<Utc>,
    /// Artifact filename, derived from the source window
    pub filename: String,
    /// Blob locator of the model artifact
    pub uri: String,
    /// Deterministic model record key
    pub model_id: String,
}

/// Outcome of epoch resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochResolution {
    Epoch(EpochDescriptor),
    /// The recorder is younger than one full epoch; no model can exist yet.
    /// Policy outcome, not an error — callers should not retry the item.
    NotEnoughHistory,
}

/// Resolve the epoch for an upload.
///
/// The epoch boundary is the most recent whole multiple of `validity_days`
/// days after recorder creation, minus one day; the source window is the
/// `validity_days`-day block ending on that boundary and the inference-valid
/// window is the following block. Both windows are normalized to whole UTC
/// days (00:00:00 through 23:59:59).
pub fn resolve_epoch(
    project: &str,
    recorder: &str,
    recorder_created_at: DateTime<Utc>,
    uploaded_at: DateTime<Utc>,
    validity_days: i64,
) -> EpochResolution {
    let delta_days = (uploaded_at - recorder_created_at).num_days();
    if delta_days < validity_days {
        return EpochResolution::NotEnoughHistory;
    }

    let source_end_day =
        recorder_created_at + Duration::days(delta_days - (delta_days % validity_days) - 1);
    let source_start_day = source_end_day - Duration::days(validity_days - 1);

    let source_start = start_of_utc_day(source_start_day);
    let source_end = end_of_utc_day(source_end_day);
    let inference_valid_start = start_of_utc_day(source_end_day + Duration::days(1));
    let inference_valid_end = end_of_utc_day(source_end_day + Duration::days(validity_days));

    let filename = format!(
        "{}_{}_{}_anomaly_model.json",
        recorder,
        source_start.format("%y-%m-%d"),
        source_end.format("%y-%m-%d"),
    );
    let uri = format!("artifacts/anomaly/{project}/{recorder}/{filename}");
    let model_id = model_id(project, &filename);

    EpochResolution::Epoch(EpochDescriptor {
        project: project.to_string(),
        recorder: recorder.to_string(),
        source_start,
        source_end,
        inference_valid_start,
        inference_valid_end,
        filename,
        uri,
        model_id,
    })
}

/// Deterministic model record key: truncated SHA-256 of project + filename
fn model_id(project: &str, filename: &str) -> String {
    let digest = Sha256::digest(format!("{project}_{filename}").as_bytes());
    format!("{digest:x}")[..32].to_string()
}
