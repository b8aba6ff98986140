use serde::{Deserialize, Serialize};

use crate::geometry::{BoundingBox, Point};

/// COCO class id for persons.
pub const COCO_PERSON: u32 = 0;

/// COCO ids treated as shelf merchandise: bottle, wine glass, cup, cell phone.
pub const RETAIL_OBJECT_CLASSES: [u32; 4] = [39, 40, 41, 67];

/// One detector output: `{boundingBox, confidence, classId}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_id: u32) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
        }
    }

    pub fn person(bbox: BoundingBox, confidence: f32) -> Self {
        Self::new(bbox, confidence, COCO_PERSON)
    }
}

/// Sparse body keypoints in crop-local pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Keypoints {
    pub left_wrist: Option<Point>,
    pub right_wrist: Option<Point>,
    pub left_hip: Option<Point>,
    pub right_hip: Option<Point>,
}

impl Keypoints {
    pub fn is_empty(&self) -> bool {
        self.left_wrist.is_none()
            && self.right_wrist.is_none()
            && self.left_hip.is_none()
            && self.right_hip.is_none()
    }
}

/// Where a set of keypoints came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointSource {
    Estimator,
    Heuristic,
}
