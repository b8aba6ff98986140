use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};

use crate::detect::backend::{DetectionCapability, DetectorInput, ObjectDetector, PoseEstimator};
use crate::detect::result::{Detection, Keypoints, COCO_PERSON};

/// Replays scripted detections keyed by frame sequence number.
///
/// Frames without a script yield nothing. Sequences marked with
/// [`ScriptedDetector::fail_at`] return an error, which lets tests drive the
/// graceful and strict failure paths.
#[derive(Default)]
pub struct ScriptedDetector {
    frames: BTreeMap<u64, Vec<Detection>>,
    failures: BTreeSet<u64>,
    fail_objects_only: bool,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add detections for one frame, appending to any already scripted.
    pub fn with_frame(mut self, sequence: u64, detections: Vec<Detection>) -> Self {
        self.push_frame(sequence, detections);
        self
    }

    pub fn push_frame(&mut self, sequence: u64, detections: Vec<Detection>) {
        self.frames.entry(sequence).or_default().extend(detections);
    }

    pub fn fail_at(mut self, sequence: u64) -> Self {
        self.failures.insert(sequence);
        self
    }

    /// Restrict scripted failures to object (non-person) queries.
    pub fn failing_objects_only(mut self) -> Self {
        self.fail_objects_only = true;
        self
    }
}

impl ObjectDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(
            capability,
            DetectionCapability::PersonDetection | DetectionCapability::ObjectDetection
        )
    }

    fn detect(
        &mut self,
        input: &DetectorInput<'_>,
        class_filter: &[u32],
        min_confidence: f32,
    ) -> Result<Vec<Detection>> {
        let person_query = matches!(class_filter, [COCO_PERSON]);
        if self.failures.contains(&input.sequence) && !(self.fail_objects_only && person_query) {
            return Err(anyhow!(
                "scripted detector failure at frame {}",
                input.sequence
            ));
        }
        Ok(self
            .frames
            .get(&input.sequence)
            .map(|detections| {
                detections
                    .iter()
                    .filter(|d| class_filter.contains(&d.class_id))
                    .filter(|d| d.confidence >= min_confidence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Pose estimator returning the same answer for every crop, optionally
/// after a number of failed calls.
pub struct FixedPoseEstimator {
    keypoints: Option<Keypoints>,
    fail: bool,
    failures_left: u32,
}

impl FixedPoseEstimator {
    pub fn new(keypoints: Option<Keypoints>) -> Self {
        Self {
            keypoints,
            fail: false,
            failures_left: 0,
        }
    }

    pub fn failing() -> Self {
        Self {
            keypoints: None,
            fail: true,
            failures_left: 0,
        }
    }

    /// Fail the first `calls` estimates, then answer normally.
    pub fn failing_first(mut self, calls: u32) -> Self {
        self.failures_left = calls;
        self
    }
}

impl PoseEstimator for FixedPoseEstimator {
    fn name(&self) -> &'static str {
        "fixed-pose"
    }

    fn estimate(&mut self, _crop: &DetectorInput<'_>) -> Result<Option<Keypoints>> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(anyhow!("pose estimator warming up"));
        }
        if self.fail {
            return Err(anyhow!("pose estimator unavailable"));
        }
        Ok(self.keypoints)
    }
}
