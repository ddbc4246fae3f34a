//! Training runner
//!
//! Drives one model record from queued to a terminal state:
//!
//! 1. Guard — re-read the record; if it is no longer waiting the job is a
//!    duplicate delivery and is discarded without side effects.
//! 2. Claim — compare-and-set to processing. The claim is optimistic, not a
//!    lease: a lost worker is recovered by the dispatcher's staleness sweep.
//! 3. Train — stack the window's feature frames, fit, calibrate the score
//!    threshold against the fitted model's own training data, upload.
//! 4. Terminal write — complete with the artifact URI, or failed with the
//!    causing error *before* the error propagates, so the coordinator never
//!    sees a processing record whose worker has already given up.
//! 5. Fan-out — re-enqueue the items held back while the model was pending.
//!
//! Jobs are acknowledged on receipt: training outlives any reasonable ack
//! deadline, and the dispatcher requeues jobs whose worker died.

use std::sync::Arc;

use sqlx::SqlitePool;

use chorus_common::blob::{features_path, BlobStore};
use chorus_common::bus::{topics, InProcessBus, Publisher, TrainingJob};
use chorus_common::config::ChorusConfig;
use chorus_common::db::models::{ModelRecord, ModelStatus};
use chorus_common::db::{items, model_records};
use chorus_common::model::AnomalyModel;
use chorus_common::time::from_db;
use chorus_common::{Error, Result};

use crate::fanout;

/// Outcome of one training job
#[derive(Debug)]
pub enum TrainingOutcome {
    /// The model completed and held-back items were re-enqueued
    Completed { resubmitted: usize },
    /// The record already advanced past waiting — duplicate delivery
    StaleGuard { status: ModelStatus },
    /// The record no longer exists
    MissingRecord,
}

pub struct TrainingRunner {
    db: SqlitePool,
    bus: InProcessBus,
    publisher: Arc<dyn Publisher>,
    blob: Arc<dyn BlobStore>,
    config: ChorusConfig,
}

impl TrainingRunner {
    pub fn new(
        db: SqlitePool,
        bus: InProcessBus,
        publisher: Arc<dyn Publisher>,
        blob: Arc<dyn BlobStore>,
        config: ChorusConfig,
    ) -> Self {
        Self {
            db,
            bus,
            publisher,
            blob,
            config,
        }
    }

    /// Pull and process training jobs until the bus closes
    pub async fn run(&self) -> Result<()> {
        tracing::info!(topic = topics::ANOMALY_TRAIN, "training runner listening");
        loop {
            let delivery = self.bus.pull(topics::ANOMALY_TRAIN).await?;
            let payload = delivery.payload().to_vec();
            delivery.ack();

            let job: TrainingJob = match serde_json::from_slice(&payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed training job, discarding");
                    continue;
                }
            };

            tracing::info!(
                request = %job.request,
                project = %job.project,
                recorder = %job.recorder,
                from = %job.from_iso_date,
                to = %job.to_iso_date,
                "received training job"
            );

            match self.handle_job(&job).await {
                Ok(TrainingOutcome::Completed { resubmitted }) => {
                    tracing::info!(request = %job.request, resubmitted, "training job complete");
                }
                Ok(TrainingOutcome::StaleGuard { status }) => {
                    tracing::info!(request = %job.request, %status, "duplicate training job discarded");
                }
                Ok(TrainingOutcome::MissingRecord) => {}
                Err(e) => {
                    tracing::error!(request = %job.request, error = %e, "training job failed");
                }
            }
        }
    }

    /// Run one training job through the record's state machine
    pub async fn handle_job(&self, job: &TrainingJob) -> Result<TrainingOutcome> {
        let Some(record) = model_records::get(&self.db, &job.request).await? else {
            tracing::warn!(request = %job.request, "training request no longer present, not processing");
            return Ok(TrainingOutcome::MissingRecord);
        };

        if !matches!(record.status, ModelStatus::Pending | ModelStatus::Queued) {
            return Ok(TrainingOutcome::StaleGuard {
                status: record.status,
            });
        }

        if !model_records::claim_processing(&self.db, &record.id).await? {
            // advanced by a concurrent run between the read and the claim
            let status = model_records::get(&self.db, &record.id)
                .await?
                .map(|r| r.status)
                .unwrap_or(record.status);
            return Ok(TrainingOutcome::StaleGuard { status });
        }

        match self.train(&record, job).await {
            Ok(artifact_uri) => {
                if !model_records::mark_complete(&self.db, &record.id, &artifact_uri).await? {
                    // the record left processing under us; operator intervention required
                    tracing::error!(
                        request = %record.id,
                        "completion write did not apply, record state needs operator attention"
                    );
                }
            }
            Err(e) => {
                // write-then-raise: the failure must reach the record before
                // the error reaches the caller
                match model_records::mark_failed(&self.db, &record.id, &e.to_string()).await {
                    Ok(true) => {}
                    Ok(false) => tracing::error!(
                        request = %record.id,
                        "failure write did not apply, record state needs operator attention"
                    ),
                    Err(write_err) => tracing::error!(
                        request = %record.id,
                        error = %write_err,
                        "could not record training failure"
                    ),
                }
                return Err(e);
            }
        }

        let resubmitted =
            fanout::resubmit_window(&self.db, self.publisher.as_ref(), &record).await?;
        Ok(TrainingOutcome::Completed { resubmitted })
    }

    /// Fit and upload the model; returns the artifact URI
    async fn train(&self, record: &ModelRecord, job: &TrainingJob) -> Result<String> {
        let from = from_db(&job.from_iso_date)?;
        let to = from_db(&job.to_iso_date)?;

        tracing::info!(
            project = %record.project,
            recorder = %record.recorder,
            %from,
            %to,
            "training model"
        );

        let window = items::items_in_window(&self.db, &record.project, &record.recorder, from, to)
            .await?;

        let scratch = self.config.scratch_dir.join("training").join(&record.id);
        let mut frames: Vec<Vec<f64>> = Vec::new();
        let mut included = 0usize;
        let mut skipped = 0usize;

        for item in &window {
            if !item.has_analysis(&self.config.feature_analysis) {
                if self.config.skip_missing_features {
                    tracing::warn!(
                        item_id = %item.id,
                        "item has not gone through feature extraction, excluded from training"
                    );
                    skipped += 1;
                    continue;
                }
                return Err(Error::Training(format!(
                    "item {} has no {} features",
                    item.id, self.config.feature_analysis
                )));
            }

            let blob_path =
                features_path(&self.config.feature_analysis, &record.project, &item.id);
            let dest = scratch.join(format!("{}.json", item.id));
            let local = self.blob.download(&blob_path, &dest).await?;
            let mut item_frames: Vec<Vec<f64>> =
                serde_json::from_slice(&std::fs::read(&local)?)?;
            frames.append(&mut item_frames);
            included += 1;
        }

        tracing::info!(included, skipped, frames = frames.len(), "feature frames stacked");

        if frames.is_empty() {
            return Err(Error::Training(
                "no feature frames in source window".to_string(),
            ));
        }

        let mut model =
            AnomalyModel::fit(&frames).map_err(|e| Error::Training(e.to_string()))?;
        model.calibrate_threshold(&frames, self.config.anomaly_percentile);

        let local_artifact = scratch.join(&record.filename);
        model.save(&local_artifact)?;
        self.blob.upload(&local_artifact, &record.uri).await?;
        tracing::info!(uri = %record.uri, threshold = model.threshold, "model artifact uploaded");

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::debug!(error = %e, "could not remove training scratch directory");
        }

        Ok(record.uri.clone())
    }
}
