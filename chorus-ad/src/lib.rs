//! chorus-ad - Anomaly Detection Inference Worker
//!
//! Consumes item IDs from the inference topic, resolves the model epoch for
//! each item, coordinates model creation when an epoch has no model yet, and
//! merges anomaly detections back into the item record. Items whose model is
//! not ready are deferred; the training worker's fan-out re-enqueues them
//! once the model completes.

pub mod coordinator;
pub mod detections;
pub mod worker;
