//! Frame scores to detections
//!
//! The model scores each fixed-length frame of audio independently. Frames
//! whose score exceeds the calibrated threshold are glued into contiguous
//! spans: three adjacent anomalous frames become a single detection running
//! from the start of the first to the end of the third.

use chorus_common::db::models::Detection;

/// Build detections from per-frame anomaly scores.
///
/// `scores[i]` covers audio `[i * frame_seconds, (i + 1) * frame_seconds)`.
/// A detection's confidence is the score of its first frame; the threshold
/// used is recorded on each detection for later inspection.
pub fn detections_from_scores(
    scores: &[f64],
    threshold: f64,
    frame_seconds: f64,
    analysis_id: &str,
) -> Vec<Detection> {
    let mut detections = Vec::new();
    let mut span: Option<(f64, f64, f64)> = None; // (start, end, confidence)

    for (index, score) in scores.iter().enumerate() {
        if *score <= threshold {
            if let Some((start, end, confidence)) = span.take() {
                detections.push(build_detection(start, end, confidence, threshold, analysis_id));
            }
            continue;
        }

        let frame_start = round2(index as f64 * frame_seconds);
        let frame_end = round2((index + 1) as f64 * frame_seconds);
        match &mut span {
            None => span = Some((frame_start, frame_end, *score)),
            Some((_, end, _)) => *end = frame_end,
        }
    }

    if let Some((start, end, confidence)) = span {
        detections.push(build_detection(start, end, confidence, threshold, analysis_id));
    }

    detections
}

fn build_detection(
    start: f64,
    end: f64,
    confidence: f64,
    threshold: f64,
    analysis_id: &str,
) -> Detection {
    Detection {
        id: Detection::stable_id(analysis_id, start, end),
        start,
        end,
        tags: Vec::new(),
        analysis_id: analysis_id.to_string(),
        confidence: Some(confidence),
        threshold: Some(threshold),
        clip_uri: None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
