//! Raw media isolation layer.
//!
//! - `RawFrame`: opaque container for RGB24 pixel data. Bytes are private and
//!   zeroized on drop.
//! - `InferenceView`: restricted view handed to pipeline stages. It can run
//!   detectors and pose estimation, it cannot export bytes.
//!
//! The ONLY path for pixels to leave a frame is `RawFrame::redacted_copy`,
//! used by the event formatter after the face region has been blurred and
//! veiled.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::{imageops, RgbImage};
use zeroize::{Zeroize, Zeroizing};

use crate::detect::{BackendRegistry, Detection, DetectionCapability, DetectorInput, Keypoints};
use crate::geometry::BoundingBox;

fn luma([r, g, b]: [u8; 3]) -> u32 {
    (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000
}

/// Blend a patch halfway toward black, or toward white when it is dark.
/// Blur leaves a flat region untouched; after the veil every pixel of a flat
/// region differs from its original.
fn veil(patch: &mut RgbImage) {
    let count = (patch.width() as u64 * patch.height() as u64).max(1);
    let mean: u64 = patch.pixels().map(|p| luma(p.0) as u64).sum::<u64>() / count;
    let target: u16 = if mean >= 128 { 0 } else { 255 };
    for pixel in patch.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = ((*channel as u16 + target) / 2) as u8;
        }
    }
}

// ----------------------------------------------------------------------------
// RawFrame: Opaque raw media container
// ----------------------------------------------------------------------------

/// Opaque raw frame. There is no `.as_bytes()`, no `Clone`, no `AsRef<[u8]>`.
pub struct RawFrame {
    /// Private pixel data, packed RGB24. MUST NOT be exposed via any public API.
    data: Vec<u8>,

    pub camera_id: String,
    /// Per-camera, monotonically increasing.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

impl RawFrame {
    /// Wrap decoded RGB24 pixels. Fails when the buffer does not match the
    /// stated dimensions.
    pub fn new(
        camera_id: impl Into<String>,
        sequence: u64,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            let actual = data.len();
            let mut data = data;
            data.zeroize();
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB24",
                actual,
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            camera_id: camera_id.into(),
            sequence,
            captured_at,
            width,
            height,
        })
    }

    /// Uniform mid-grey frame, for sources and tests that only need geometry.
    pub fn blank(
        camera_id: impl Into<String>,
        sequence: u64,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let data = vec![128u8; width as usize * height as usize * 3];
        Self::new(camera_id, sequence, captured_at, width, height, data)
    }

    /// Take ownership of a decoded image.
    pub fn from_image(
        camera_id: impl Into<String>,
        sequence: u64,
        captured_at: DateTime<Utc>,
        image: RgbImage,
    ) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::new(camera_id, sequence, captured_at, width, height, image.into_raw())
    }

    /// Stages get a restricted view. Cannot extract bytes.
    pub fn inference_view(&self) -> InferenceView<'_> {
        InferenceView { frame: self }
    }

    fn detector_input(&self) -> DetectorInput<'_> {
        DetectorInput::new(&self.data, self.width, self.height, self.sequence)
    }

    /// Copy of the pixels inside `region`, wiped when dropped.
    fn crop_pixels(&self, region: &BoundingBox) -> Zeroizing<Vec<u8>> {
        let (x0, y0) = (region.x as usize, region.y as usize);
        let (w, h) = (region.w as usize, region.h as usize);
        let stride = self.width as usize * 3;
        let mut out = Zeroizing::new(Vec::with_capacity(w * h * 3));
        for row in y0..y0 + h {
            let start = row * stride + x0 * 3;
            out.extend_from_slice(&self.data[start..start + w * 3]);
        }
        out
    }

    /// Copy of the frame with every region in `blur` Gaussian-blurred and
    /// veiled.
    ///
    /// Regions are clipped to the frame; a region entirely outside it is an
    /// error, since the caller asked for a redaction that cannot happen.
    pub(crate) fn redacted_copy(&self, blur: &[BoundingBox], sigma: f32) -> Result<RgbImage> {
        let mut image = RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        for region in blur {
            let clipped = region
                .clamp_to(self.width, self.height)
                .ok_or_else(|| anyhow!("redaction region {:?} lies outside the frame", region))?;
            let patch = imageops::crop_imm(
                &image,
                clipped.x as u32,
                clipped.y as u32,
                clipped.w as u32,
                clipped.h as u32,
            )
            .to_image();
            let mut blurred = imageops::blur(&patch, sigma);
            veil(&mut blurred);
            imageops::replace(&mut image, &blurred, clipped.x as i64, clipped.y as i64);
        }
        Ok(image)
    }

    #[cfg(test)]
    pub(crate) fn pixel_at(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        // Zeroize raw pixel data on drop to limit exposure window.
        self.data.zeroize();
    }
}

// ----------------------------------------------------------------------------
// InferenceView: Restricted interface for pipeline stages
// ----------------------------------------------------------------------------

/// Restricted view of a frame.
///
/// `InferenceView` provides dimensions, capture metadata, and the ability to
/// run registered detectors. It does NOT provide raw byte access,
/// serialization, or cloning of the underlying data.
pub struct InferenceView<'a> {
    frame: &'a RawFrame,
}

impl<'a> InferenceView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.frame.captured_at
    }

    /// Run the backend registered for `capability` over the whole frame.
    pub fn detect(
        &self,
        registry: &BackendRegistry,
        capability: DetectionCapability,
        class_filter: &[u32],
        min_confidence: f32,
    ) -> Result<Vec<Detection>> {
        registry.detect_with_capability(
            capability,
            &self.frame.detector_input(),
            class_filter,
            min_confidence,
        )
    }

    /// Run the pose estimator on the crop under `region`.
    ///
    /// Keypoints are crop-local. A region outside the frame yields `Ok(None)`.
    pub fn estimate_pose(
        &self,
        registry: &BackendRegistry,
        region: &BoundingBox,
    ) -> Result<Option<Keypoints>> {
        let Some(clipped) = region.clamp_to(self.frame.width, self.frame.height) else {
            return Ok(None);
        };
        let crop = self.frame.crop_pixels(&clipped);
        registry.estimate_pose(&DetectorInput::new(
            &crop,
            clipped.w as u32,
            clipped.h as u32,
            self.frame.sequence,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{MarkerPoseEstimator, ScriptedDetector};
    use crate::detect::backends::marker::{HIP_MARKER, WRIST_MARKER};
    use crate::geometry::Point;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn frame_rejects_wrong_buffer_length() {
        assert!(RawFrame::new("cam", 0, t0(), 4, 4, vec![0; 47]).is_err());
        assert!(RawFrame::new("cam", 0, t0(), 4, 4, vec![0; 48]).is_ok());
    }

    #[test]
    fn inference_view_runs_detectors() -> Result<()> {
        let frame = RawFrame::blank("cam", 7, t0(), 16, 16)?;
        let mut registry = BackendRegistry::new();
        registry.register(ScriptedDetector::new().with_frame(
            7,
            vec![Detection::person(BoundingBox::new(1.0, 1.0, 4.0, 8.0), 0.9)],
        ));
        let view = frame.inference_view();
        let persons = view.detect(&registry, DetectionCapability::PersonDetection, &[0], 0.5)?;
        assert_eq!(persons.len(), 1);
        assert_eq!(view.sequence(), 7);
        Ok(())
    }

    #[test]
    fn pose_crop_uses_local_coordinates() -> Result<()> {
        let mut img = RgbImage::from_pixel(32, 32, image::Rgb([90, 90, 90]));
        for (x, y) in [(12, 20), (13, 20), (12, 21), (13, 21)] {
            img.put_pixel(x, y, image::Rgb(WRIST_MARKER));
        }
        for (x, y) in [(16, 24), (17, 24), (16, 25), (17, 25)] {
            img.put_pixel(x, y, image::Rgb(HIP_MARKER));
        }
        let frame = RawFrame::from_image("cam", 0, t0(), img)?;
        let mut registry = BackendRegistry::new();
        registry.register_pose_estimator(MarkerPoseEstimator::new());

        let keypoints = frame
            .inference_view()
            .estimate_pose(&registry, &BoundingBox::new(10.0, 10.0, 12.0, 20.0))?
            .unwrap();
        assert_eq!(keypoints.left_wrist, Some(Point::new(3.0, 11.0)));
        assert_eq!(keypoints.left_hip, Some(Point::new(7.0, 15.0)));
        Ok(())
    }

    #[test]
    fn redacted_copy_blurs_only_the_region() -> Result<()> {
        let img = RgbImage::from_fn(40, 40, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        });
        let frame = RawFrame::from_image("cam", 0, t0(), img)?;
        let out = frame.redacted_copy(&[BoundingBox::new(0.0, 0.0, 20.0, 20.0)], 4.0)?;

        assert_ne!(out.get_pixel(10, 10).0, frame.pixel_at(10, 10));
        assert_eq!(out.get_pixel(30, 30).0, frame.pixel_at(30, 30));
        assert!(frame
            .redacted_copy(&[BoundingBox::new(50.0, 50.0, 5.0, 5.0)], 4.0)
            .is_err());
        Ok(())
    }

    #[test]
    fn flat_regions_are_still_redacted() -> Result<()> {
        for shade in [0u8, 128, 254, 255] {
            let img = RgbImage::from_pixel(40, 40, image::Rgb([shade; 3]));
            let frame = RawFrame::from_image("cam", 0, t0(), img)?;
            let out = frame.redacted_copy(&[BoundingBox::new(0.0, 0.0, 20.0, 20.0)], 4.0)?;
            for (x, y) in [(0, 0), (10, 10), (19, 19)] {
                assert_ne!(out.get_pixel(x, y).0, [shade; 3], "shade {} at ({}, {})", shade, x, y);
            }
            assert_eq!(out.get_pixel(30, 30).0, [shade; 3]);
        }
        Ok(())
    }
}
