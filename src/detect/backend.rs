use anyhow::Result;

use crate::detect::result::{Detection, Keypoints};

/// Detection capabilities a backend may advertise.
///
/// Capabilities are limited to what the behavior pipeline consumes.
/// Identity-linked outputs (face embeddings, re-ID vectors) are forbidden.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    PersonDetection,
    ObjectDetection,
    PoseEstimation,
}

/// Pixels handed to a backend for the duration of one call.
///
/// Built only by `InferenceView`; the slice cannot outlive the frame borrow.
pub struct DetectorInput<'a> {
    pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Per-camera frame sequence number.
    pub sequence: u64,
}

impl<'a> DetectorInput<'a> {
    pub(crate) fn new(pixels: &'a [u8], width: u32, height: u32, sequence: u64) -> Self {
        Self {
            pixels,
            width,
            height,
            sequence,
        }
    }

    /// Packed RGB24, row-major, `width * height * 3` bytes.
    pub fn pixels(&self) -> &'a [u8] {
        self.pixels
    }
}

/// Object detector backend.
///
/// # Audit Boundary
///
/// Implementations MUST be audited to ensure they:
/// - Do not store pixels beyond the `detect` call
/// - Do not write frames to disk or the network
/// - Do not compute identity-linked outputs
///
/// "Nothing found" is `Ok(vec![])`; errors are reserved for real failures.
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Detect objects whose class is in `class_filter` with confidence of at
    /// least `min_confidence`.
    fn detect(
        &mut self,
        input: &DetectorInput<'_>,
        class_filter: &[u32],
        min_confidence: f32,
    ) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pose estimator backend. Same audit boundary as [`ObjectDetector`].
pub trait PoseEstimator: Send {
    fn name(&self) -> &'static str;

    /// Estimate keypoints for a cropped person region. Coordinates are
    /// crop-local. `Ok(None)` means no pose was found.
    fn estimate(&mut self, crop: &DetectorInput<'_>) -> Result<Option<Keypoints>>;
}
