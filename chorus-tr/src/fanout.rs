//! Resubmission fan-out
//!
//! While a model is pending, items in its inference-valid window are
//! deferred. Once training completes, every one of those items is
//! re-published to the inference topic — once per item found. The merge
//! engine's idempotency makes any bus-level duplication of these messages
//! safe.

use sqlx::SqlitePool;

use chorus_common::bus::{topics, Publisher};
use chorus_common::db::items;
use chorus_common::db::models::ModelRecord;
use chorus_common::Result;

/// Re-enqueue all items covered by a completed model.
///
/// A failed publish is logged and does not block the remaining items; all
/// publish acknowledgements are awaited before returning. Returns the
/// number of items successfully re-published.
pub async fn resubmit_window(
    pool: &SqlitePool,
    publisher: &dyn Publisher,
    record: &ModelRecord,
) -> Result<usize> {
    let window = items::items_in_window(
        pool,
        &record.project,
        &record.recorder,
        record.inference_valid_start,
        record.inference_valid_end,
    )
    .await?;

    tracing::info!(
        model_id = %record.id,
        items = window.len(),
        "resubmitting items for inference"
    );

    let publishes = window.iter().map(|item| async move {
        tracing::debug!(item_id = %item.id, uploaded_at = %item.uploaded_at, "resubmitting item");
        match publisher
            .publish(topics::ANOMALY_INFERENCE, item.id.clone().into_bytes())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "failed to resubmit item");
                false
            }
        }
    });

    let published = futures::future::join_all(publishes)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

    tracing::info!(model_id = %record.id, published, "finished resubmitting items");
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_common::bus::InProcessBus;
    use chorus_common::db::models::{AudioItem, ModelRecord};
    use chorus_common::epoch::{resolve_epoch, EpochResolution};
    use chrono::{TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .unwrap();
        chorus_common::db::init_tables(&pool).await.unwrap();
        pool
    }

    fn record_for_first_epoch() -> ModelRecord {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let uploaded = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        match resolve_epoch("proj", "rec-1", created, uploaded, 5) {
            EpochResolution::Epoch(d) => ModelRecord::pending_from_epoch(&d),
            EpochResolution::NotEnoughHistory => panic!("expected an epoch"),
        }
    }

    #[tokio::test]
    async fn test_resubmits_each_window_item_once() {
        let pool = setup_pool().await;
        let record = record_for_first_epoch();

        // three items in the window (Jan 6-10), one outside
        let mut expected = HashSet::new();
        for day in [6, 8, 10] {
            let item = AudioItem::new(
                "proj",
                "rec-1",
                Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
                format!("audio/proj/{day}.mp3"),
            );
            items::save_item(&pool, &item).await.unwrap();
            expected.insert(item.id);
        }
        let outside = AudioItem::new(
            "proj",
            "rec-1",
            Utc.with_ymd_and_hms(2024, 1, 12, 0, 0, 0).unwrap(),
            "audio/proj/12.mp3",
        );
        items::save_item(&pool, &outside).await.unwrap();

        let bus = InProcessBus::new();
        let published = resubmit_window(&pool, &bus, &record).await.unwrap();
        assert_eq!(published, 3);

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let delivery = bus.pull(topics::ANOMALY_INFERENCE).await.unwrap();
            seen.insert(delivery.text().unwrap().to_string());
            delivery.ack();
        }
        assert_eq!(seen, expected);

        // exactly once per item found
        let extra = timeout(Duration::from_millis(50), bus.pull(topics::ANOMALY_INFERENCE)).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_empty_window_publishes_nothing() {
        let pool = setup_pool().await;
        let record = record_for_first_epoch();
        let bus = InProcessBus::new();

        let published = resubmit_window(&pool, &bus, &record).await.unwrap();
        assert_eq!(published, 0);
    }
}
