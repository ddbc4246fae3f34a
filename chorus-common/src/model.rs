//! Anomaly model artifact
//!
//! A per-dimension Gaussian over feature frames with a score threshold
//! calibrated on the training data. The score is the negative log-likelihood
//! of a frame under the model, so higher means more anomalous. The artifact
//! is a small JSON document uploaded to the blob store by the training
//! worker and downloaded by inference workers.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Floor applied to per-dimension variance to keep scores finite on
/// constant training dimensions.
const VARIANCE_FLOOR: f64 = 1e-6;

const LN_TWO_PI: f64 = 1.837_877_066_409_345_5;

/// Diagonal-Gaussian anomaly model with a calibrated detection threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    /// Per-dimension mean of the training frames
    pub means: Vec<f64>,
    /// Per-dimension variance of the training frames
    pub variances: Vec<f64>,
    /// Scores above this are anomalous; set by [`calibrate_threshold`](Self::calibrate_threshold)
    pub threshold: f64,
}

impl AnomalyModel {
    /// Fit the model to a set of feature frames.
    ///
    /// All frames must share one width. Returns `InvalidInput` for an empty
    /// or ragged training set.
    pub fn fit(frames: &[Vec<f64>]) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| Error::InvalidInput("cannot fit model to zero frames".to_string()))?;
        let dims = first.len();
        if dims == 0 {
            return Err(Error::InvalidInput("feature frames have zero width".to_string()));
        }
        if let Some(bad) = frames.iter().find(|f| f.len() != dims) {
            return Err(Error::InvalidInput(format!(
                "ragged feature frames: expected width {dims}, found {}",
                bad.len()
            )));
        }

        let count = frames.len() as f64;
        let mut means = vec![0.0; dims];
        for frame in frames {
            for (mean, value) in means.iter_mut().zip(frame) {
                *mean += value;
            }
        }
        for mean in &mut means {
            *mean /= count;
        }

        let mut variances = vec![0.0; dims];
        for frame in frames {
            for ((variance, mean), value) in variances.iter_mut().zip(&means).zip(frame) {
                let diff = value - mean;
                *variance += diff * diff;
            }
        }
        for variance in &mut variances {
            *variance = (*variance / count).max(VARIANCE_FLOOR);
        }

        Ok(Self {
            means,
            variances,
            threshold: f64::INFINITY,
        })
    }

    /// Anomaly score of one frame: negative log-likelihood under the model
    pub fn score(&self, frame: &[f64]) -> f64 {
        debug_assert_eq!(frame.len(), self.means.len());
        let mut nll = 0.0;
        for ((value, mean), variance) in frame.iter().zip(&self.means).zip(&self.variances) {
            let diff = value - mean;
            nll += 0.5 * (diff * diff / variance + (variance).ln() + LN_TWO_PI);
        }
        nll
    }

    /// Score every frame in order
    pub fn score_all(&self, frames: &[Vec<f64>]) -> Vec<f64> {
        frames.iter().map(|f| self.score(f)).collect()
    }

    /// Set the detection threshold to the given percentile of in-sample
    /// scores, so only the most unusual training-like frames exceed it.
    pub fn calibrate_threshold(&mut self, frames: &[Vec<f64>], percentile: f64) {
        let mut scores = self.score_all(frames);
        if scores.is_empty() {
            return;
        }
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((percentile / 100.0) * scores.len() as f64).ceil() as usize;
        let index = rank.clamp(1, scores.len()) - 1;
        self.threshold = scores[index];
    }

    /// Write the artifact as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read an artifact previously written by [`save`](Self::save)
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training_frames() -> Vec<Vec<f64>> {
        // Tight cluster around (1.0, -2.0)
        (0..100)
            .map(|i| {
                let jitter = (i % 10) as f64 * 0.01;
                vec![1.0 + jitter, -2.0 - jitter]
            })
            .collect()
    }

    #[test]
    fn test_fit_rejects_empty_and_ragged_input() {
        assert!(AnomalyModel::fit(&[]).is_err());
        assert!(AnomalyModel::fit(&[vec![1.0, 2.0], vec![1.0]]).is_err());
    }

    #[test]
    fn test_outlier_scores_above_inliers() {
        let frames = training_frames();
        let model = AnomalyModel::fit(&frames).unwrap();

        let inlier = model.score(&[1.0, -2.0]);
        let outlier = model.score(&[9.0, 4.0]);
        assert!(outlier > inlier);
    }

    #[test]
    fn test_calibrated_threshold_flags_only_outliers() {
        let frames = training_frames();
        let mut model = AnomalyModel::fit(&frames).unwrap();
        model.calibrate_threshold(&frames, 99.99);

        // Nearly all training frames sit at or below the threshold
        let above = model
            .score_all(&frames)
            .into_iter()
            .filter(|s| *s > model.threshold)
            .count();
        assert_eq!(above, 0);

        // A frame far outside the training cluster exceeds it
        assert!(model.score(&[50.0, 50.0]) > model.threshold);
    }

    #[test]
    fn test_save_load_round_trip() {
        let frames = training_frames();
        let mut model = AnomalyModel::fit(&frames).unwrap();
        model.calibrate_threshold(&frames, 99.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model.save(&path).unwrap();

        let loaded = AnomalyModel::load(&path).unwrap();
        assert_eq!(loaded.means, model.means);
        assert_eq!(loaded.variances, model.variances);
        assert_eq!(loaded.threshold, model.threshold);
    }
}
