//! Training-request dispatcher
//!
//! The coordinator only creates pending records; something must turn them
//! into training jobs. The dispatcher sweeps periodically and:
//!
//! - queues pending records once they are old enough that backfilled
//!   uploads for the window have had time to arrive;
//! - requeues processing records whose claim has gone stale (a worker died
//!   mid-job), up to an attempt cap;
//! - fails records past the cap so they surface to an operator instead of
//!   cycling forever.
//!
//! The job message is published before the record is marked queued, so a
//! crash between the two at worst duplicates a job — which the runner's
//! guard discards.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use sqlx::SqlitePool;

use chorus_common::bus::{topics, Publisher, TrainingJob};
use chorus_common::config::ChorusConfig;
use chorus_common::db::model_records;
use chorus_common::db::models::ModelRecord;
use chorus_common::time::to_db;
use chorus_common::Result;

/// What one sweep did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Pending records queued for their first training run
    pub queued: usize,
    /// Stalled processing records sent back to the queue
    pub requeued: usize,
    /// Stalled records past the attempt cap, marked failed
    pub failed: usize,
}

pub struct Dispatcher {
    db: SqlitePool,
    publisher: Arc<dyn Publisher>,
    config: ChorusConfig,
}

impl Dispatcher {
    pub fn new(db: SqlitePool, publisher: Arc<dyn Publisher>, config: ChorusConfig) -> Self {
        Self {
            db,
            publisher,
            config,
        }
    }

    /// Sweep forever at the configured interval
    pub async fn run(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.dispatch_interval_secs));
        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(stats) => {
                    if stats != SweepStats::default() {
                        tracing::info!(
                            queued = stats.queued,
                            requeued = stats.requeued,
                            failed = stats.failed,
                            "dispatch sweep finished"
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "dispatch sweep failed"),
            }
        }
    }

    /// One pass over waiting and stalled records
    pub async fn sweep(&self) -> Result<SweepStats> {
        let now = chorus_common::time::now();
        let mut stats = SweepStats::default();

        let backfill_cutoff =
            now - ChronoDuration::seconds(self.config.dispatch_backfill_delay_secs as i64);
        for record in model_records::pending_older_than(&self.db, backfill_cutoff).await? {
            match self.queue_training_job(&record).await {
                Ok(true) => stats.queued += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(request = %record.id, error = %e, "failed to queue training job");
                }
            }
        }

        let stale_cutoff =
            now - ChronoDuration::seconds(self.config.processing_stale_secs as i64);
        for record in model_records::processing_stalled_since(&self.db, stale_cutoff).await? {
            if record.attempts < self.config.max_training_attempts {
                match self.queue_training_job(&record).await {
                    Ok(true) => {
                        tracing::warn!(
                            request = %record.id,
                            attempts = record.attempts,
                            "stalled training run requeued"
                        );
                        stats.requeued += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(request = %record.id, error = %e, "failed to requeue stalled record");
                    }
                }
            } else if model_records::mark_failed(&self.db, &record.id, "training timed out").await? {
                tracing::warn!(
                    request = %record.id,
                    attempts = record.attempts,
                    "stalled training run out of attempts, marked failed"
                );
                stats.failed += 1;
            }
        }

        Ok(stats)
    }

    /// Publish the job, then mark the record queued
    async fn queue_training_job(&self, record: &ModelRecord) -> Result<bool> {
        tracing::info!(
            request = %record.id,
            filename = %record.filename,
            "starting job to fit model"
        );

        let job = TrainingJob {
            project: record.project.clone(),
            recorder: record.recorder.clone(),
            request: record.id.clone(),
            from_iso_date: to_db(record.source_start),
            to_iso_date: to_db(record.source_end),
        };
        self.publisher
            .publish(topics::ANOMALY_TRAIN, serde_json::to_vec(&job)?)
            .await?;

        let queued = model_records::mark_queued(&self.db, &record.id).await?;
        if !queued {
            // the record advanced between query and update; the runner's
            // guard makes the extra job message harmless
            tracing::warn!(request = %record.id, "record advanced before queueing");
        }
        Ok(queued)
    }
}
