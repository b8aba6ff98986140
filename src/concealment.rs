//! Concealment Heuristic.
//!
//! Evaluated only for tracks holding a confirmed interaction. A wrist close
//! to the hip on the same side reads as possible concealment.
//!
//! This stage MUST NOT read or store facial data. It sees nothing but the
//! crop dimensions and four optional keypoints.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::detect::{KeypointSource, Keypoints};
use crate::geometry::Point;
use crate::interaction::Interaction;
use crate::tracking::Track;
use crate::TrackId;

pub const DEFAULT_CONCEALMENT_CONFIDENCE: f32 = 0.7;

/// Proximity threshold as a fraction of the crop's shorter side.
const PROXIMITY_FRACTION: f32 = 0.15;
const MAX_CONCEALMENT_CONFIDENCE: f32 = 0.95;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcealmentTarget {
    Pocket,
    Waist,
}

impl ConcealmentTarget {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "pocket" => Some(ConcealmentTarget::Pocket),
            "waist" => Some(ConcealmentTarget::Waist),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hand {
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConcealmentEvent {
    pub track_id: TrackId,
    pub confidence: f32,
    pub target: ConcealmentTarget,
    pub hand: Hand,
    pub keypoint_source: KeypointSource,
    pub timestamp: DateTime<Utc>,
}

/// Fallback keypoints as fixed fractions of the crop.
pub fn heuristic_keypoints(width: f32, height: f32) -> Keypoints {
    Keypoints {
        left_wrist: Some(Point::new(width * 0.3, height * 0.7)),
        right_wrist: Some(Point::new(width * 0.7, height * 0.7)),
        left_hip: Some(Point::new(width * 0.35, height * 0.85)),
        right_hip: Some(Point::new(width * 0.65, height * 0.85)),
    }
}

/// Closest wrist/hip pairing below the proximity threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HandProximity {
    pub hand: Hand,
    pub confidence: f32,
    pub wrist: Point,
    pub hip: Point,
}

/// Best same-side wrist/hip proximity, scored `1 - distance / threshold`
/// with `threshold = min(width, height) * 0.15`. `None` when no pair is
/// close enough.
pub fn hand_proximity(keypoints: &Keypoints, width: f32, height: f32) -> Option<HandProximity> {
    let threshold = width.min(height) * PROXIMITY_FRACTION;
    if !threshold.is_finite() || threshold <= 0.0 {
        return None;
    }
    let pairs = [
        (Hand::Left, keypoints.left_wrist, keypoints.left_hip),
        (Hand::Right, keypoints.right_wrist, keypoints.right_hip),
    ];
    pairs
        .into_iter()
        .filter_map(|(hand, wrist, hip)| {
            let (wrist, hip) = (wrist?, hip?);
            let distance = wrist.distance(&hip);
            (distance < threshold).then(|| HandProximity {
                hand,
                confidence: 1.0 - distance / threshold,
                wrist,
                hip,
            })
        })
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConcealmentConfig {
    pub min_confidence: f32,
    pub targets: BTreeSet<ConcealmentTarget>,
}

impl Default for ConcealmentConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_CONCEALMENT_CONFIDENCE,
            targets: [ConcealmentTarget::Pocket, ConcealmentTarget::Waist].into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConcealmentDetector {
    config: ConcealmentConfig,
}

impl ConcealmentDetector {
    pub fn new(config: ConcealmentConfig) -> Self {
        Self { config }
    }

    /// Check every track that owns one of `confirmed`.
    ///
    /// `estimate` supplies pose keypoints for a track's crop; `Ok(None)`
    /// falls back to the fixed heuristic. Estimator errors propagate so the
    /// caller can apply its failure policy.
    pub fn detect(
        &self,
        tracks: &[Track],
        confirmed: &[Interaction],
        now: DateTime<Utc>,
        mut estimate: impl FnMut(&Track) -> Result<Option<Keypoints>>,
    ) -> Result<Vec<ConcealmentEvent>> {
        let owners: BTreeSet<TrackId> = confirmed.iter().map(|i| i.track_id).collect();
        let mut events = Vec::new();

        for track in tracks.iter().filter(|t| owners.contains(&t.track_id)) {
            let (width, height) = (track.bbox.w, track.bbox.h);
            let (keypoints, source) = match estimate(track)? {
                Some(keypoints) => (keypoints, KeypointSource::Estimator),
                None => (heuristic_keypoints(width, height), KeypointSource::Heuristic),
            };
            let Some(proximity) = hand_proximity(&keypoints, width, height) else {
                continue;
            };
            if proximity.confidence < self.config.min_confidence {
                continue;
            }
            // Image y grows downwards: at or below the hip line reads as pocket.
            let target = if proximity.wrist.y >= proximity.hip.y {
                ConcealmentTarget::Pocket
            } else {
                ConcealmentTarget::Waist
            };
            if !self.config.targets.contains(&target) {
                log::debug!(
                    "track {} concealment at {:?} ignored: target not enabled",
                    track.track_id,
                    target
                );
                continue;
            }
            let confidence = proximity.confidence.min(MAX_CONCEALMENT_CONFIDENCE);
            log::info!(
                "track {} concealment motion ({:?}, confidence {:.2})",
                track.track_id,
                target,
                confidence
            );
            events.push(ConcealmentEvent {
                track_id: track.track_id,
                confidence,
                target,
                hand: proximity.hand,
                keypoint_source: source,
                timestamp: now,
            });
        }
        Ok(events)
    }
}
