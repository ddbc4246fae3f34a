//! Document-store record types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::epoch::EpochDescriptor;
use crate::{Error, Result};

/// One timestamped finding produced by an analysis over an item.
///
/// Detection IDs are derived from the analysis kind and time span, so a
/// re-run of the same analysis produces the same IDs and merges instead of
/// duplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    /// Offset in seconds where the detection starts
    pub start: f64,
    /// Offset in seconds where the detection ends
    pub end: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// The analysis that produced this detection
    pub analysis_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Link to a clipped audio file, when one has been cut
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_uri: Option<String>,
}

impl Detection {
    /// Deterministic detection ID for a (span, analysis) pair
    pub fn stable_id(analysis_id: &str, start: f64, end: f64) -> String {
        let digest = Sha256::digest(format!("{start}-{end}-{analysis_id}").as_bytes());
        format!("{digest:x}")[..12].to_string()
    }

    /// Field-wise overlay of a newer detection with the same ID: the newer
    /// values win, and optional fields the newer run did not produce keep
    /// their previous values.
    pub fn overlay(&self, newer: &Detection) -> Detection {
        Detection {
            id: newer.id.clone(),
            start: newer.start,
            end: newer.end,
            tags: if newer.tags.is_empty() {
                self.tags.clone()
            } else {
                newer.tags.clone()
            },
            analysis_id: newer.analysis_id.clone(),
            confidence: newer.confidence.or(self.confidence),
            threshold: newer.threshold.or(self.threshold),
            clip_uri: newer.clip_uri.clone().or_else(|| self.clip_uri.clone()),
        }
    }
}

/// One audio upload tracked by the system
#[derive(Debug, Clone)]
pub struct AudioItem {
    pub id: String,
    pub project: String,
    pub recorder: String,
    pub uploaded_at: DateTime<Utc>,
    /// Blob locator of the raw audio
    pub uri: String,
    /// Analysis kinds that have already run against this item
    pub analyses_performed: Vec<String>,
    pub detections: Vec<Detection>,
    /// Derived: true when `detections` is non-empty
    pub has_detections: bool,
}

impl AudioItem {
    pub fn new(
        project: impl Into<String>,
        recorder: impl Into<String>,
        uploaded_at: DateTime<Utc>,
        uri: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project: project.into(),
            recorder: recorder.into(),
            uploaded_at,
            uri: uri.into(),
            analyses_performed: Vec::new(),
            detections: Vec::new(),
            has_detections: false,
        }
    }

    pub fn has_analysis(&self, analysis_id: &str) -> bool {
        self.analyses_performed.iter().any(|a| a == analysis_id)
    }
}

/// One recorder deployed in the field
#[derive(Debug, Clone)]
pub struct Recorder {
    pub project: String,
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Training status of a model record.
///
/// Legal transitions:
///
/// ```text
/// pending ──> queued ──> processing ──> complete
///    │                    ^       │
///    └────────────────────┘       └──> failed
///         (direct claim)   <── queued (stale requeue)
/// ```
///
/// `complete` and `failed` are terminal; leaving them requires operator
/// intervention and is not expressible through this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Pending,
    Queued,
    Processing,
    Complete,
    Failed,
}

impl ModelStatus {
    pub const ALL: [ModelStatus; 5] = [
        ModelStatus::Pending,
        ModelStatus::Queued,
        ModelStatus::Processing,
        ModelStatus::Complete,
        ModelStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Pending => "pending",
            ModelStatus::Queued => "queued",
            ModelStatus::Processing => "processing",
            ModelStatus::Complete => "complete",
            ModelStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ModelStatus::Pending),
            "queued" => Ok(ModelStatus::Queued),
            "processing" => Ok(ModelStatus::Processing),
            "complete" => Ok(ModelStatus::Complete),
            "failed" => Ok(ModelStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown model status {other:?}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelStatus::Complete | ModelStatus::Failed)
    }

    /// The transition table. Write paths derive their guards from this, so
    /// an illegal transition cannot be expressed as a successful write.
    pub fn can_transition_to(&self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Processing)
                | (Queued, Processing)
                | (Processing, Queued)
                | (Processing, Complete)
                | (Processing, Failed)
        )
    }

    /// All statuses from which `to` is reachable
    pub fn legal_sources(to: ModelStatus) -> Vec<ModelStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The coordination document for one (recorder, epoch) model
#[derive(Debug, Clone)]
pub struct ModelRecord {
    /// Deterministic key: hash of (project, epoch filename)
    pub id: String,
    pub project: String,
    pub recorder: String,
    pub source_start: DateTime<Utc>,
    pub source_end: DateTime<Utc>,
    pub inference_valid_start: DateTime<Utc>,
    pub inference_valid_end: DateTime<Utc>,
    pub filename: String,
    /// Blob locator of the trained artifact
    pub uri: String,
    pub status: ModelStatus,
    /// Times this record has been queued for training
    pub attempts: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub processing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl ModelRecord {
    /// The record the coordinator creates when it first sees an epoch
    pub fn pending_from_epoch(descriptor: &EpochDescriptor) -> Self {
        Self {
            id: descriptor.model_id.clone(),
            project: descriptor.project.clone(),
            recorder: descriptor.recorder.clone(),
            source_start: descriptor.source_start,
            source_end: descriptor.source_end,
            inference_valid_start: descriptor.inference_valid_start,
            inference_valid_end: descriptor.inference_valid_end,
            filename: descriptor.filename.clone(),
            uri: descriptor.uri.clone(),
            status: ModelStatus::Pending,
            attempts: 0,
            error: None,
            created_at: crate::time::now(),
            queued_at: None,
            processing_at: None,
            completed_at: None,
            failed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(id: &str, confidence: Option<f64>) -> Detection {
        Detection {
            id: id.to_string(),
            start: 1.0,
            end: 2.0,
            tags: Vec::new(),
            analysis_id: "anomaly-detection".to_string(),
            confidence,
            threshold: Some(10.0),
            clip_uri: None,
        }
    }

    #[test]
    fn test_stable_id_is_deterministic() {
        let a = Detection::stable_id("anomaly-detection", 1.92, 4.8);
        let b = Detection::stable_id("anomaly-detection", 1.92, 4.8);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);

        let other_span = Detection::stable_id("anomaly-detection", 1.92, 5.76);
        assert_ne!(a, other_span);
        let other_analysis = Detection::stable_id("birdsong", 1.92, 4.8);
        assert_ne!(a, other_analysis);
    }

    #[test]
    fn test_overlay_new_values_win() {
        let old = Detection {
            tags: vec!["verified".to_string()],
            clip_uri: Some("clips/a1.mp3".to_string()),
            ..detection("a1", Some(0.5))
        };
        let new = detection("a1", Some(0.9));

        let merged = old.overlay(&new);
        assert_eq!(merged.confidence, Some(0.9));
        // fields the newer run did not produce are preserved
        assert_eq!(merged.tags, vec!["verified".to_string()]);
        assert_eq!(merged.clip_uri, Some("clips/a1.mp3".to_string()));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in ModelStatus::ALL {
            if !status.is_terminal() {
                continue;
            }
            for next in ModelStatus::ALL {
                assert!(!status.can_transition_to(next));
            }
        }
        assert!(ModelStatus::Complete.is_terminal());
        assert!(ModelStatus::Failed.is_terminal());
        assert!(!ModelStatus::Processing.is_terminal());
    }

    #[test]
    fn test_legal_sources_match_table() {
        assert_eq!(
            ModelStatus::legal_sources(ModelStatus::Processing),
            vec![ModelStatus::Pending, ModelStatus::Queued]
        );
        assert_eq!(
            ModelStatus::legal_sources(ModelStatus::Complete),
            vec![ModelStatus::Processing]
        );
        assert_eq!(
            ModelStatus::legal_sources(ModelStatus::Queued),
            vec![ModelStatus::Pending, ModelStatus::Processing]
        );
    }

    #[test]
    fn test_status_round_trip() {
        for status in ModelStatus::ALL {
            assert_eq!(ModelStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ModelStatus::parse("limbo").is_err());
    }
}
