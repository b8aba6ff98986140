//! Planar geometry shared by every pipeline stage.
//!
//! All coordinates are frame pixels with the origin at the top-left corner and
//! `y` growing downwards. Malformed input (empty or non-finite boxes, polygons
//! with fewer than three vertices) never raises: it simply never matches.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned box, serialized as `[x, y, w, h]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.w, b.h]
    }
}

/// Whole-pixel identity of a box, used to key per-object state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxKey([i32; 4]);

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// True for zero/negative extents and for any non-finite coordinate.
    pub fn is_empty(&self) -> bool {
        let finite = self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite();
        !finite || self.w <= 0.0 || self.h <= 0.0
    }

    pub fn area(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.w * self.h
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        if self.is_empty() || other.is_empty() {
            return 0.0;
        }
        let iw = self.right().min(other.right()) - self.x.max(other.x);
        let ih = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if iw <= 0.0 || ih <= 0.0 {
            0.0
        } else {
            iw * ih
        }
    }

    /// Intersection over union. Zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Intersection over the smaller of the two areas (overlap coefficient).
    ///
    /// A small object fully inside a larger region scores 1.0 here, where its
    /// IoU would be tiny.
    pub fn overlap_ratio(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let smaller = self.area().min(other.area());
        if smaller <= 0.0 {
            0.0
        } else {
            inter / smaller
        }
    }

    /// Sub-rectangle expressed in fractions of this box.
    pub fn sub_region(&self, fx: f32, fy: f32, fw: f32, fh: f32) -> BoundingBox {
        BoundingBox::new(
            self.x + self.w * fx,
            self.y + self.h * fy,
            self.w * fw,
            self.h * fh,
        )
    }

    /// Clip to a `width` x `height` frame, snapped outwards to whole pixels.
    /// Returns `None` when nothing of the box is visible.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.is_empty() {
            return None;
        }
        let x0 = self.x.floor().max(0.0);
        let y0 = self.y.floor().max(0.0);
        let x1 = self.right().ceil().min(width as f32);
        let y1 = self.bottom().ceil().min(height as f32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(BoundingBox::new(x0, y0, x1 - x0, y1 - y0))
    }

    pub fn key(&self) -> BoxKey {
        BoxKey([
            self.x.round() as i32,
            self.y.round() as i32,
            self.w.round() as i32,
            self.h.round() as i32,
        ])
    }
}

/// Even-odd ray casting. Degenerate polygons and non-finite points never match.
pub fn point_in_polygon(point: &Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 || !point.is_finite() || polygon.iter().any(|p| !p.is_finite()) {
        return false;
    }
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > point.y) != (pj.y > point.y) {
            let x_cross = (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x;
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// ----------------------------------------------------------------------------
// Zones
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Zone {
    pub name: String,
    pub polygon: Vec<Point>,
}

impl Zone {
    pub fn new(name: impl Into<String>, polygon: Vec<Point>) -> Self {
        Self {
            name: name.into(),
            polygon,
        }
    }

    /// Axis-aligned rectangle zone, handy for configuration and tests.
    pub fn rect(name: impl Into<String>, x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new(
            name,
            vec![
                Point::new(x, y),
                Point::new(x + w, y),
                Point::new(x + w, y + h),
                Point::new(x, y + h),
            ],
        )
    }

    pub fn contains(&self, point: &Point) -> bool {
        point_in_polygon(point, &self.polygon)
    }

    pub fn is_degenerate(&self) -> bool {
        self.polygon.len() < 3
    }
}

/// Per-camera zone definitions, `{name: [[x, y], ...]}` on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<[f32; 2]>>", into = "BTreeMap<String, Vec<[f32; 2]>>")]
pub struct ZoneSet {
    zones: Vec<Zone>,
}

impl From<BTreeMap<String, Vec<[f32; 2]>>> for ZoneSet {
    fn from(map: BTreeMap<String, Vec<[f32; 2]>>) -> Self {
        let zones = map
            .into_iter()
            .map(|(name, vertices)| {
                Zone::new(
                    name,
                    vertices.into_iter().map(|[x, y]| Point::new(x, y)).collect(),
                )
            })
            .collect();
        Self { zones }
    }
}

impl From<ZoneSet> for BTreeMap<String, Vec<[f32; 2]>> {
    fn from(set: ZoneSet) -> Self {
        set.zones
            .into_iter()
            .map(|zone| (zone.name, zone.polygon.iter().map(|p| [p.x, p.y]).collect()))
            .collect()
    }
}

impl ZoneSet {
    /// Later zones with a duplicate name replace earlier ones.
    pub fn new(zones: Vec<Zone>) -> Self {
        let mut set = Self::default();
        for zone in zones {
            set.insert(zone);
        }
        set
    }

    pub fn insert(&mut self, zone: Zone) {
        if let Some(existing) = self.zones.iter_mut().find(|z| z.name == zone.name) {
            *existing = zone;
        } else {
            self.zones.push(zone);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Names of every zone containing `point`.
    pub fn containing(&self, point: &Point) -> BTreeSet<String> {
        self.zones
            .iter()
            .filter(|zone| zone.contains(point))
            .map(|zone| zone.name.clone())
            .collect()
    }

    /// First shelf zone containing `point`.
    pub fn shelf_zone_at(&self, point: &Point) -> Option<&Zone> {
        self.zones
            .iter()
            .find(|zone| is_shelf_zone(&zone.name) && zone.contains(point))
    }
}

fn contains_ci(name: &str, needle: &str) -> bool {
    name.to_lowercase().contains(needle)
}

pub fn is_shelf_zone(name: &str) -> bool {
    contains_ci(name, "shelf")
}

pub fn is_checkout_zone(name: &str) -> bool {
    contains_ci(name, "checkout")
}

pub fn is_exit_zone(name: &str) -> bool {
    contains_ci(name, "exit")
}
