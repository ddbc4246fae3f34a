//! Inference worker loop
//!
//! One delivery at a time: load the item, check the feature prerequisite,
//! coordinate the model, score, merge. Acknowledgement policy follows the
//! error model:
//!
//! - analyzed or deferred items are acked — deferred items come back through
//!   the training fan-out, not bus redelivery;
//! - items whose prerequisite feature extraction has not run yet are left
//!   unacked so redelivery retries them once extraction catches up;
//! - transport faults (missing item, failed download, malformed message)
//!   leave the delivery unacked and rely on redelivery;
//! - malformed stored data is logged and acked so a poison item cannot wedge
//!   the worker.

use std::sync::Arc;

use sqlx::SqlitePool;

use chorus_common::blob::{features_path, BlobStore};
use chorus_common::bus::{topics, Delivery, InProcessBus};
use chorus_common::config::ChorusConfig;
use chorus_common::db::items;
use chorus_common::model::AnomalyModel;
use chorus_common::{Error, Result};

use crate::coordinator::{DeferReason, ModelCoordinator, ModelDecision};
use crate::detections::detections_from_scores;

/// What processing one item amounted to
#[derive(Debug)]
pub enum ItemOutcome {
    /// Inference ran and results were merged
    Analyzed { detections: usize },
    /// The model is not ready (or never will be); item dropped
    Deferred(DeferReason),
    /// Feature extraction has not run for this item yet
    MissingPrerequisite,
}

pub struct InferenceWorker {
    db: SqlitePool,
    bus: InProcessBus,
    blob: Arc<dyn BlobStore>,
    coordinator: ModelCoordinator,
    config: ChorusConfig,
}

impl InferenceWorker {
    pub fn new(
        db: SqlitePool,
        bus: InProcessBus,
        blob: Arc<dyn BlobStore>,
        config: ChorusConfig,
    ) -> Self {
        let coordinator = ModelCoordinator::new(db.clone(), config.validity_days);
        Self {
            db,
            bus,
            blob,
            coordinator,
            config,
        }
    }

    /// Pull and process messages until the bus closes
    pub async fn run(&self) -> Result<()> {
        tracing::info!(topic = topics::ANOMALY_INFERENCE, "inference worker listening");
        loop {
            let delivery = self.bus.pull(topics::ANOMALY_INFERENCE).await?;
            self.handle_delivery(delivery).await;
        }
    }

    /// Process one delivery and decide its acknowledgement
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let item_id = match delivery.text() {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "malformed inference message, leaving unacked");
                return; // dropped without ack
            }
        };

        match self.process_item(&item_id).await {
            Ok(ItemOutcome::Analyzed { detections }) => {
                tracing::info!(item_id, detections, "processing complete");
                delivery.ack();
            }
            Ok(ItemOutcome::Deferred(reason)) => {
                tracing::debug!(item_id, ?reason, "item deferred");
                delivery.ack();
            }
            Ok(ItemOutcome::MissingPrerequisite) => {
                tracing::warn!(
                    item_id,
                    feature_analysis = %self.config.feature_analysis,
                    redeliveries = delivery.redeliveries(),
                    "item has no feature frames yet, awaiting redelivery"
                );
                // dropped without ack
            }
            Err(Error::InvalidInput(message)) => {
                tracing::error!(item_id, %message, "malformed stored data, skipping item");
                delivery.ack();
            }
            Err(e) => {
                tracing::warn!(
                    item_id,
                    error = %e,
                    redeliveries = delivery.redeliveries(),
                    "item processing failed, awaiting redelivery"
                );
                // dropped without ack
            }
        }
    }

    /// Run the full inference path for one item ID
    pub async fn process_item(&self, item_id: &str) -> Result<ItemOutcome> {
        let item = items::get_item(&self.db, item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("item {item_id}")))?;

        if !item.has_analysis(&self.config.feature_analysis) {
            return Ok(ItemOutcome::MissingPrerequisite);
        }

        let record = match self.coordinator.ensure_model(&item).await? {
            ModelDecision::Ready(record) => record,
            ModelDecision::Deferred(reason) => return Ok(ItemOutcome::Deferred(reason)),
        };

        // Models are shared across every item in the epoch; cache them in
        // scratch instead of re-downloading per item.
        let model_dest = self.config.scratch_dir.join("models").join(&record.filename);
        let model_path = self.blob.download(&record.uri, &model_dest).await?;
        let model = AnomalyModel::load(&model_path)?;

        let features_blob = features_path(&self.config.feature_analysis, &item.project, &item.id);
        let features_dest = self
            .config
            .scratch_dir
            .join("features")
            .join(format!("{}.json", item.id));
        let features_local = self.blob.download(&features_blob, &features_dest).await?;

        let frames: Vec<Vec<f64>> = serde_json::from_slice(&std::fs::read(&features_local)?)?;
        let scores = model.score_all(&frames);
        let detections = detections_from_scores(
            &scores,
            model.threshold,
            self.config.frame_seconds,
            &self.config.analysis_id,
        );

        items::merge_detections(&self.db, &item.id, &self.config.analysis_id, &detections).await?;

        // feature files are per-item, no reason to keep them around
        if let Err(e) = tokio::fs::remove_file(&features_local).await {
            tracing::debug!(error = %e, "could not remove scratch feature file");
        }

        Ok(ItemOutcome::Analyzed {
            detections: detections.len(),
        })
    }
}
