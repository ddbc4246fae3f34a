//! Model coordination
//!
//! Decides, for an incoming item, whether the model for its epoch exists and
//! is ready. When no record exists for the epoch the coordinator creates a
//! pending one — the act that triggers training — and defers the item. The
//! create is an atomic create-if-absent on the record's deterministic key,
//! so concurrent workers racing on the same epoch end with exactly one
//! pending record and no lock service.

use sqlx::SqlitePool;

use chorus_common::db::models::{AudioItem, ModelRecord, ModelStatus};
use chorus_common::db::{model_records, recorders};
use chorus_common::epoch::{resolve_epoch, EpochResolution};
use chorus_common::{Error, Result};

/// Outcome of a coordination check
#[derive(Debug)]
pub enum ModelDecision {
    /// The model is trained; proceed with inference
    Ready(ModelRecord),
    /// Do not run inference now
    Deferred(DeferReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// The recorder is younger than one epoch; permanent for this item
    NotEnoughHistory,
    /// This call created the pending record; training will be dispatched
    AwaitingCreation,
    /// A record exists but training has not completed
    NotReady,
    /// Training failed; waits for an operator, never auto-retried here
    TrainingFailed,
}

pub struct ModelCoordinator {
    db: SqlitePool,
    validity_days: i64,
}

impl ModelCoordinator {
    pub fn new(db: SqlitePool, validity_days: i64) -> Self {
        Self { db, validity_days }
    }

    /// Resolve the item's epoch and check or create its model record.
    ///
    /// Only the creation path writes; a defer against an existing record has
    /// no side effect.
    pub async fn ensure_model(&self, item: &AudioItem) -> Result<ModelDecision> {
        let recorder = recorders::get_recorder(&self.db, &item.project, &item.recorder)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("recorder {}/{}", item.project, item.recorder))
            })?;

        let descriptor = match resolve_epoch(
            &item.project,
            &item.recorder,
            recorder.created_at,
            item.uploaded_at,
            self.validity_days,
        ) {
            EpochResolution::Epoch(descriptor) => descriptor,
            EpochResolution::NotEnoughHistory => {
                tracing::debug!(
                    item_id = %item.id,
                    recorder = %item.recorder,
                    "recorder younger than one epoch, item excluded from analysis"
                );
                return Ok(ModelDecision::Deferred(DeferReason::NotEnoughHistory));
            }
        };

        match model_records::get(&self.db, &descriptor.model_id).await? {
            None => {
                let record = ModelRecord::pending_from_epoch(&descriptor);
                let created = model_records::create_if_absent(&self.db, &record).await?;
                if created {
                    tracing::info!(
                        model_id = %descriptor.model_id,
                        recorder = %item.recorder,
                        source_start = %descriptor.source_start,
                        source_end = %descriptor.source_end,
                        "model needs to be created, deferring item"
                    );
                } else {
                    // lost the creation race; same record either way
                    tracing::debug!(
                        model_id = %descriptor.model_id,
                        "model record created concurrently, deferring item"
                    );
                }
                Ok(ModelDecision::Deferred(DeferReason::AwaitingCreation))
            }
            Some(record) if record.status == ModelStatus::Complete => {
                Ok(ModelDecision::Ready(record))
            }
            Some(record) if record.status == ModelStatus::Failed => {
                tracing::warn!(
                    model_id = %record.id,
                    error = record.error.as_deref().unwrap_or("unknown"),
                    "model training failed, deferring item until operator retry"
                );
                Ok(ModelDecision::Deferred(DeferReason::TrainingFailed))
            }
            Some(record) => {
                tracing::debug!(
                    model_id = %record.id,
                    status = %record.status,
                    "model not ready yet, deferring item"
                );
                Ok(ModelDecision::Deferred(DeferReason::NotReady))
            }
        }
    }
}
