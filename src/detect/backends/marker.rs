//! Colour-marker backends for synthetic scenes.
//!
//! The synthetic frame source paints shoppers, merchandise and body
//! keypoints as solid marker colours. These backends read them back, which
//! lets the daemon and demo run the full pipeline without a model.

use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectionCapability, DetectorInput, ObjectDetector, PoseEstimator};
use crate::detect::result::{Detection, Keypoints, COCO_PERSON};
use crate::geometry::{BoundingBox, Point};

pub const PERSON_MARKER: [u8; 3] = [220, 40, 40];
pub const BOTTLE_MARKER: [u8; 3] = [40, 60, 220];
pub const WRIST_MARKER: [u8; 3] = [240, 220, 30];
pub const HIP_MARKER: [u8; 3] = [30, 200, 80];

/// COCO class id for bottles.
const COCO_BOTTLE: u32 = 39;
/// Blobs smaller than this are treated as noise.
const MIN_MARKER_PIXELS: usize = 4;
const MARKER_CONFIDENCE: f32 = 0.9;

/// Extent and centroid of all pixels exactly matching `color`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Blob {
    bbox: BoundingBox,
    centroid: Point,
    pixels: usize,
}

fn find_blob(input: &DetectorInput<'_>, color: [u8; 3]) -> Result<Option<Blob>> {
    let (width, height) = (input.width as usize, input.height as usize);
    let pixels = input.pixels();
    if pixels.len() != width * height * 3 {
        return Err(anyhow!(
            "pixel buffer is {} bytes, expected {}x{} RGB24",
            pixels.len(),
            width,
            height
        ));
    }

    let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
    let (mut sum_x, mut sum_y, mut count) = (0.0f64, 0.0f64, 0usize);
    for (i, px) in pixels.chunks_exact(3).enumerate() {
        if px != color {
            continue;
        }
        let (x, y) = (i % width, i / width);
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
        sum_x += x as f64;
        sum_y += y as f64;
        count += 1;
    }

    if count < MIN_MARKER_PIXELS {
        return Ok(None);
    }
    Ok(Some(Blob {
        bbox: BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x - min_x + 1) as f32,
            (max_y - min_y + 1) as f32,
        ),
        centroid: Point::new(
            (sum_x / count as f64) as f32 + 0.5,
            (sum_y / count as f64) as f32 + 0.5,
        ),
        pixels: count,
    }))
}

/// Finds one blob per marker colour and reports it as a detection.
pub struct MarkerDetector {
    markers: Vec<([u8; 3], u32)>,
}

impl MarkerDetector {
    pub fn new() -> Self {
        Self {
            markers: vec![(PERSON_MARKER, COCO_PERSON), (BOTTLE_MARKER, COCO_BOTTLE)],
        }
    }

    /// Map an additional marker colour to a class id.
    pub fn with_marker(mut self, color: [u8; 3], class_id: u32) -> Self {
        self.markers.push((color, class_id));
        self
    }
}

impl Default for MarkerDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDetector for MarkerDetector {
    fn name(&self) -> &'static str {
        "marker"
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
        if MARKER_CONFIDENCE < min_confidence {
            return Ok(Vec::new());
        }
        let mut detections = Vec::new();
        for (color, class_id) in &self.markers {
            if !class_filter.contains(class_id) {
                continue;
            }
            if let Some(blob) = find_blob(input, *color)? {
                detections.push(Detection::new(blob.bbox, MARKER_CONFIDENCE, *class_id));
            }
        }
        Ok(detections)
    }
}

/// Reads wrist and hip markers from a person crop.
///
/// Only the left side is painted by the synthetic scene, so right-side
/// keypoints are always absent.
#[derive(Default)]
pub struct MarkerPoseEstimator;

impl MarkerPoseEstimator {
    pub fn new() -> Self {
        Self
    }
}

impl PoseEstimator for MarkerPoseEstimator {
    fn name(&self) -> &'static str {
        "marker-pose"
    }

    fn estimate(&mut self, crop: &DetectorInput<'_>) -> Result<Option<Keypoints>> {
        let wrist = find_blob(crop, WRIST_MARKER)?;
        let hip = find_blob(crop, HIP_MARKER)?;
        let keypoints = Keypoints {
            left_wrist: wrist.map(|b| b.centroid),
            left_hip: hip.map(|b| b.centroid),
            ..Keypoints::default()
        };
        Ok((!keypoints.is_empty()).then_some(keypoints))
    }
}
