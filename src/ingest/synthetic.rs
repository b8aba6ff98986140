//! Synthetic shop scene (`stub://`).
//!
//! A scripted 30 second loop painted with the colour markers understood by
//! `detect::backends::marker`:
//!
//! | time (s) | scene |
//! |---|---|
//! | 0-3 | shopper walks in towards the shelf |
//! | 3-7 | shopper at the shelf, bottle in hand |
//! | 7-9 | bottle gone, wrist next to hip |
//! | 9-14 | shopper walks to the exit, bypassing checkout |
//! | 14-17 | shopper stands in the exit zone |
//! | 17-30 | empty scene |
//!
//! Timestamps come from a simulated clock advancing `1/fps` per frame, so
//! the scene plays identically whether or not it is paced in real time.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use image::{Rgb, RgbImage};
use rand::Rng;
use std::time::{Duration as StdDuration, Instant};

use super::{FrameSource, SourceConfig, SourceFrame, SourceStats};
use crate::detect::backends::marker::{BOTTLE_MARKER, HIP_MARKER, PERSON_MARKER, WRIST_MARKER};
use crate::frame::RawFrame;
use crate::geometry::{Zone, ZoneSet};

pub const SCENE_LOOP_MS: i64 = 30_000;

/// Shop layout in frame fractions: shelf on the left, checkout along the
/// top, exit on the right.
pub fn default_zones(width: u32, height: u32) -> ZoneSet {
    let (w, h) = (width as f32, height as f32);
    ZoneSet::new(vec![
        Zone::rect("shelf-1", 0.15 * w, 0.0, 0.30 * w, h),
        Zone::rect("checkout", 0.50 * w, 0.0, 0.20 * w, 0.20 * h),
        Zone::rect("exit", 0.75 * w, 0.0, 0.25 * w, h),
    ])
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct SceneState {
    /// Shopper centre x as a fraction of frame width.
    shopper_x: Option<f32>,
    holding_bottle: bool,
    concealing: bool,
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t.clamp(0.0, 1.0)
}

fn scene_at(ms: i64) -> SceneState {
    let t = ms.rem_euclid(SCENE_LOOP_MS) as f32 / 1000.0;
    let (shopper_x, holding_bottle, concealing) = match t {
        t if t < 3.0 => (Some(lerp(0.09, 0.30, t / 3.0)), false, false),
        t if t < 7.0 => (Some(0.30), true, false),
        t if t < 9.0 => (Some(0.30), false, true),
        t if t < 14.0 => (Some(lerp(0.30, 0.875, (t - 9.0) / 5.0)), false, false),
        t if t < 17.0 => (Some(0.875), false, false),
        _ => (None, false, false),
    };
    SceneState {
        shopper_x,
        holding_bottle,
        concealing,
    }
}

fn fill(img: &mut RgbImage, x: f32, y: f32, w: f32, h: f32, color: [u8; 3]) {
    let (width, height) = img.dimensions();
    let x0 = x.round().max(0.0) as u32;
    let y0 = y.round().max(0.0) as u32;
    let x1 = ((x + w).round().max(0.0) as u32).min(width);
    let y1 = ((y + h).round().max(0.0) as u32).min(height);
    for py in y0..y1 {
        for px in x0..x1 {
            img.put_pixel(px, py, Rgb(color));
        }
    }
}

fn render(state: &SceneState, width: u32, height: u32, rng: &mut impl Rng) -> RgbImage {
    // Grey noise only: r == g == b never collides with a marker colour.
    let mut img = RgbImage::from_fn(width, height, |_, _| {
        let v = rng.gen_range(110u8..=146);
        Rgb([v, v, v])
    });
    let Some(cx) = state.shopper_x else {
        return img;
    };
    let (fw, fh) = (width as f32, height as f32);
    let (pw, ph) = (0.125 * fw, 0.42 * fh);
    let (px, py) = (cx * fw - pw / 2.0, 0.42 * fh);
    fill(&mut img, px, py, pw, ph, PERSON_MARKER);

    if state.holding_bottle {
        let (bw, bh) = (0.016 * fw, 0.042 * fh);
        let (hx, hy) = (px + pw / 2.0, py + 0.7 * ph);
        fill(&mut img, hx - bw / 2.0, hy - bh / 2.0, bw, bh, BOTTLE_MARKER);
    }
    if state.concealing {
        // 2x2 markers, a quarter of the proximity threshold apart.
        let gap = (pw.min(ph) * 0.15 * 0.25).round().max(2.0);
        let (hip_x, hip_y) = ((px + 0.3 * pw).round(), (py + 0.85 * ph).round());
        fill(&mut img, hip_x, hip_y, 2.0, 2.0, HIP_MARKER);
        fill(&mut img, hip_x + gap, hip_y, 2.0, 2.0, WRIST_MARKER);
    }
    img
}

pub struct SyntheticSource {
    config: SourceConfig,
    started: DateTime<Utc>,
    wall_start: Option<Instant>,
    frame_count: u64,
    emit_zones: bool,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            started: Utc::now(),
            wall_start: None,
            frame_count: 0,
            emit_zones: false,
        }
    }

    /// Start the simulated clock at `at` instead of now.
    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.started = at;
        self
    }

    /// Deliver [`default_zones`] with the first frame.
    pub fn with_default_zones(mut self) -> Self {
        self.emit_zones = true;
        self
    }

    fn frame_offset_ms(&self, index: u64) -> i64 {
        (index as i64 * 1000) / self.config.fps.max(1) as i64
    }

    fn pace(&mut self, index: u64) {
        if !self.config.realtime {
            return;
        }
        let wall_start = *self.wall_start.get_or_insert_with(Instant::now);
        let due = wall_start + StdDuration::from_millis(self.frame_offset_ms(index).max(0) as u64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn connect(&mut self) -> Result<()> {
        log::info!(
            "camera {}: connected to {} (synthetic, {} fps)",
            self.config.camera_id,
            self.config.url,
            self.config.fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        if self
            .config
            .max_frames
            .is_some_and(|max| self.frame_count >= max)
        {
            return Ok(None);
        }
        let index = self.frame_count;
        self.pace(index);
        self.frame_count += 1;

        let offset = self.frame_offset_ms(index);
        let state = scene_at(offset);
        let img = render(
            &state,
            self.config.width,
            self.config.height,
            &mut rand::thread_rng(),
        );
        let frame = RawFrame::from_image(
            self.config.camera_id.clone(),
            index + 1,
            self.started + Duration::milliseconds(offset),
            img,
        )?;
        let mut out = SourceFrame::new(frame);
        if self.emit_zones && index == 0 {
            out = out.with_zones(default_zones(self.config.width, self.config.height));
        }
        Ok(Some(out))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BackendRegistry, DetectionCapability, MarkerDetector, COCO_PERSON};

    fn config(max_frames: u64) -> SourceConfig {
        SourceConfig {
            max_frames: Some(max_frames),
            ..SourceConfig::default()
        }
    }

    #[test]
    fn timeline_phases() {
        assert_eq!(scene_at(0).shopper_x, Some(0.09));
        assert!(scene_at(4_000).holding_bottle);
        assert!(scene_at(8_000).concealing);
        assert_eq!(scene_at(15_000).shopper_x, Some(0.875));
        assert_eq!(scene_at(20_000).shopper_x, None);
        assert_eq!(scene_at(34_000), scene_at(4_000));
    }

    #[test]
    fn frames_follow_simulated_clock() -> Result<()> {
        let mut source = SyntheticSource::new(config(3)).with_default_zones();
        let first = source.next_frame()?.unwrap();
        let second = source.next_frame()?.unwrap();
        assert!(first.zones.is_some());
        assert!(second.zones.is_none());
        assert_eq!(first.frame.sequence, 1);
        assert_eq!(
            second.frame.captured_at - first.frame.captured_at,
            Duration::milliseconds(100)
        );
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn shopper_is_visible_to_marker_detector() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(MarkerDetector::new());
        let img = render(&scene_at(4_000), 640, 480, &mut rand::thread_rng());
        let frame = RawFrame::from_image("cam-1", 1, Utc::now(), img)?;
        let view = frame.inference_view();

        let persons = view.detect(&registry, DetectionCapability::PersonDetection, &[COCO_PERSON], 0.5)?;
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].bbox.w, 80.0);
        let zones = default_zones(640, 480);
        assert!(zones
            .containing(&persons[0].bbox.center())
            .contains("shelf-1"));

        let objects = view.detect(&registry, DetectionCapability::ObjectDetection, &[39], 0.5)?;
        assert_eq!(objects.len(), 1);
        Ok(())
    }
}
