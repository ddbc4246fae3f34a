//! Message bus adapter
//!
//! The workers consume from and publish to named topics with at-least-once
//! delivery: a message must be explicitly acknowledged, and a delivery
//! dropped without acknowledgement is requeued. Consumers therefore treat
//! every message as possibly duplicate.
//!
//! [`InProcessBus`] is the in-process substrate used by tests and
//! single-host deployments; a real bus client plugs in behind the
//! [`Publisher`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::{Error, Result};

/// Topic names shared by the workers
pub mod topics {
    /// Item IDs awaiting anomaly inference
    pub const ANOMALY_INFERENCE: &str = "analyses.anomaly-detection";
    /// Training job descriptors
    pub const ANOMALY_TRAIN: &str = "analyses.anomaly-train";
}

/// Training job descriptor carried on the training topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub project: String,
    pub recorder: String,
    /// Model record ID this job belongs to
    pub request: String,
    /// Source window start, RFC3339
    pub from_iso_date: String,
    /// Source window end, RFC3339
    pub to_iso_date: String,
}

/// Publish side of the bus
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

struct QueuedMessage {
    payload: Vec<u8>,
    redeliveries: u32,
}

struct TopicChannel {
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
}

impl TopicChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

/// In-process topic bus with explicit acknowledgement
#[derive(Clone, Default)]
pub struct InProcessBus {
    channels: Arc<Mutex<HashMap<String, Arc<TopicChannel>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel(&self, topic: &str) -> Arc<TopicChannel> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicChannel::new()))
            .clone()
    }

    /// Wait for the next message on a topic.
    ///
    /// The receiver lock is held for the duration of the wait, so each topic
    /// has at most one in-flight pull — the one-outstanding-message flow
    /// control the workers rely on.
    pub async fn pull(&self, topic: &str) -> Result<Delivery> {
        let channel = self.channel(topic).await;
        let mut rx = channel.rx.lock().await;
        let message = rx
            .recv()
            .await
            .ok_or_else(|| Error::Bus(format!("topic {topic} closed")))?;

        Ok(Delivery {
            payload: message.payload,
            redeliveries: message.redeliveries,
            topic: topic.to_string(),
            tx: channel.tx.clone(),
            acked: false,
        })
    }
}

#[async_trait]
impl Publisher for InProcessBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let channel = self.channel(topic).await;
        channel
            .tx
            .send(QueuedMessage {
                payload,
                redeliveries: 0,
            })
            .map_err(|_| Error::Bus(format!("topic {topic} closed")))
    }
}

/// One pulled message. Call [`ack`](Self::ack) once processing is finished;
/// dropping an unacknowledged delivery requeues it.
pub struct Delivery {
    payload: Vec<u8>,
    redeliveries: u32,
    topic: String,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    acked: bool,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// How many times this message was requeued before this delivery
    pub fn redeliveries(&self) -> u32 {
        self.redeliveries
    }

    /// Payload as UTF-8 text
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| Error::InvalidInput(format!("non-UTF-8 payload: {e}")))
    }

    /// Acknowledge the message; it will not be redelivered
    pub fn ack(mut self) {
        self.acked = true;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.acked {
            let requeued = QueuedMessage {
                payload: std::mem::take(&mut self.payload),
                redeliveries: self.redeliveries + 1,
            };
            if self.tx.send(requeued).is_ok() {
                tracing::debug!(topic = %self.topic, "unacked delivery requeued");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_then_pull() {
        let bus = InProcessBus::new();
        bus.publish("t", b"item-1".to_vec()).await.unwrap();

        let delivery = bus.pull("t").await.unwrap();
        assert_eq!(delivery.text().unwrap(), "item-1");
        assert_eq!(delivery.redeliveries(), 0);
        delivery.ack();
    }

    #[tokio::test]
    async fn test_acked_message_is_not_redelivered() {
        let bus = InProcessBus::new();
        bus.publish("t", b"once".to_vec()).await.unwrap();
        bus.pull("t").await.unwrap().ack();

        let next = timeout(Duration::from_millis(50), bus.pull("t")).await;
        assert!(next.is_err(), "acked message must not come back");
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_requeued() {
        let bus = InProcessBus::new();
        bus.publish("t", b"retry-me".to_vec()).await.unwrap();

        {
            let delivery = bus.pull("t").await.unwrap();
            assert_eq!(delivery.redeliveries(), 0);
            // dropped without ack
        }

        let redelivered = bus.pull("t").await.unwrap();
        assert_eq!(redelivered.text().unwrap(), "retry-me");
        assert_eq!(redelivered.redeliveries(), 1);
        redelivered.ack();
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let bus = InProcessBus::new();
        bus.publish("a", b"for-a".to_vec()).await.unwrap();
        bus.publish("b", b"for-b".to_vec()).await.unwrap();

        let from_b = bus.pull("b").await.unwrap();
        assert_eq!(from_b.text().unwrap(), "for-b");
        from_b.ack();

        let from_a = bus.pull("a").await.unwrap();
        assert_eq!(from_a.text().unwrap(), "for-a");
        from_a.ack();
    }

    #[tokio::test]
    async fn test_training_job_wire_format() {
        let job = TrainingJob {
            project: "proj".to_string(),
            recorder: "rec".to_string(),
            request: "abc123".to_string(),
            from_iso_date: "2024-01-01T00:00:00.000000Z".to_string(),
            to_iso_date: "2024-01-05T23:59:59.000000Z".to_string(),
        };

        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"from_iso_date\""));
        assert!(json.contains("\"request\":\"abc123\""));

        let parsed: TrainingJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.recorder, "rec");
    }
}
