//! Interaction Detector: shelf pickups with temporal debounce.
//!
//! A candidate interaction starts when the estimated hand region of a track
//! inside a shelf zone overlaps a merchandise detection whose center lies in
//! a shelf zone. It confirms once the overlap has been sustained for the
//! interaction time, and is reported exactly once, on the confirming frame.
//!
//! Candidates are keyed by `(track, whole-pixel object box)`. A jittery
//! detector therefore splits one physical object across several keys and
//! under-confirms; no object re-identification is attempted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::detect::Detection;
use crate::geometry::{is_shelf_zone, BoundingBox, BoxKey, ZoneSet};
use crate::tracking::Track;
use crate::{secs_between, TrackId};

pub const DEFAULT_INTERACTION_TIME_SECS: f64 = 2.0;
pub const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.3;

const CONFIDENCE_BOOST: f32 = 0.2;
const MAX_INTERACTION_CONFIDENCE: f32 = 0.95;

/// Observable behaviors that feed the risk scorer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ObjectPick,
    Concealment,
    ExitWithoutCheckout,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ObjectPick => "object_pick",
            Action::Concealment => "concealment",
            Action::ExitWithoutCheckout => "exit_without_checkout",
        }
    }

    /// Human-readable phrase used in alert descriptions.
    pub fn description(&self) -> &'static str {
        match self {
            Action::ObjectPick => "Item picked from shelf",
            Action::Concealment => "Concealment motion detected",
            Action::ExitWithoutCheckout => "Exited without checkout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Interaction {
    pub track_id: TrackId,
    pub action: Action,
    pub object_bbox: BoundingBox,
    pub shelf_zone: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub duration_secs: f64,
    pub confidence: f32,
    pub confirmed: bool,
}

/// Hand position heuristic: horizontally centred 40% of the box width,
/// 60%..80% of its height.
pub fn estimate_hand_region(person: &BoundingBox) -> BoundingBox {
    person.sub_region(0.3, 0.6, 0.4, 0.2)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InteractionConfig {
    pub interaction_time_secs: f64,
    pub overlap_threshold: f32,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            interaction_time_secs: DEFAULT_INTERACTION_TIME_SECS,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
        }
    }
}

#[derive(Debug, Default)]
pub struct InteractionDetector {
    config: InteractionConfig,
    pending: HashMap<TrackId, HashMap<BoxKey, Interaction>>,
}

impl InteractionDetector {
    pub fn new(config: InteractionConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Returns interactions confirmed by this call only.
    ///
    /// Hand/object overlap is [`BoundingBox::overlap_ratio`] (intersection
    /// over the smaller area), not plain IoU: a bottle fully inside the hand
    /// region scores 1.0, where IoU would be diluted by the larger hand box
    /// and a small object would rarely cross the threshold.
    pub fn detect(
        &mut self,
        tracks: &[Track],
        objects: &[Detection],
        zones: &ZoneSet,
        now: DateTime<Utc>,
    ) -> Vec<Interaction> {
        let mut confirmed = Vec::new();

        for track in tracks {
            if !track.in_zone_matching(is_shelf_zone) {
                if let Some(dropped) = self.pending.remove(&track.track_id) {
                    let unconfirmed = dropped.values().filter(|i| !i.confirmed).count();
                    if unconfirmed > 0 {
                        log::debug!(
                            "track {} left shelf zones, discarding {} pending interaction(s)",
                            track.track_id,
                            unconfirmed
                        );
                    }
                }
                continue;
            }

            let hand = estimate_hand_region(&track.bbox);
            for object in objects {
                if object.bbox.is_empty() {
                    continue;
                }
                let Some(shelf) = zones.shelf_zone_at(&object.bbox.center()) else {
                    continue;
                };
                if hand.overlap_ratio(&object.bbox) <= self.config.overlap_threshold {
                    continue;
                }

                let entry = self
                    .pending
                    .entry(track.track_id)
                    .or_default()
                    .entry(object.bbox.key())
                    .or_insert_with(|| Interaction {
                        track_id: track.track_id,
                        action: Action::ObjectPick,
                        object_bbox: object.bbox,
                        shelf_zone: shelf.name.clone(),
                        first_seen: now,
                        last_seen: now,
                        duration_secs: 0.0,
                        confidence: (object.confidence + CONFIDENCE_BOOST)
                            .min(MAX_INTERACTION_CONFIDENCE),
                        confirmed: false,
                    });
                entry.last_seen = now;
                entry.duration_secs = secs_between(now, entry.first_seen);
                if !entry.confirmed && entry.duration_secs >= self.config.interaction_time_secs {
                    entry.confirmed = true;
                    log::info!(
                        "track {} confirmed pickup in {} after {:.1}s",
                        entry.track_id,
                        entry.shelf_zone,
                        entry.duration_secs
                    );
                    confirmed.push(entry.clone());
                }
            }
        }

        self.cleanup(now);
        confirmed
    }

    /// Drop candidates not refreshed within twice the interaction time.
    fn cleanup(&mut self, now: DateTime<Utc>) {
        let max_idle = self.config.interaction_time_secs * 2.0;
        self.pending.retain(|_, per_track| {
            per_track.retain(|_, interaction| secs_between(now, interaction.last_seen) <= max_idle);
            !per_track.is_empty()
        });
    }

    pub fn forget_track(&mut self, track_id: TrackId) {
        self.pending.remove(&track_id);
    }

    /// Number of tracked `(track, object)` pairs, confirmed or not.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Zone;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn zones() -> ZoneSet {
        ZoneSet::new(vec![Zone::rect("shelf-1", 0.0, 0.0, 200.0, 300.0)])
    }

    fn track(in_shelf: bool) -> Track {
        let bbox = BoundingBox::new(50.0, 50.0, 50.0, 200.0);
        let zones: BTreeSet<String> = if in_shelf {
            ["shelf-1".to_string()].into()
        } else {
            BTreeSet::new()
        };
        Track {
            track_id: 1,
            bbox,
            center: bbox.center(),
            confidence: 0.9,
            zones,
            first_seen: t(0),
            last_seen: t(0),
        }
    }

    fn bottle() -> Detection {
        // Inside the hand region (65..85, 170..210).
        Detection::new(BoundingBox::new(70.0, 180.0, 8.0, 16.0), 0.6, 39)
    }

    #[test]
    fn hand_region_heuristic() {
        let hand = estimate_hand_region(&BoundingBox::new(50.0, 50.0, 50.0, 200.0));
        assert_eq!(hand, BoundingBox::new(65.0, 170.0, 20.0, 40.0));
    }

    #[test]
    fn confirms_once_at_threshold() {
        let mut detector = InteractionDetector::new(InteractionConfig::default());
        let zones = zones();
        let mut emitted = Vec::new();
        for step in 0..=30 {
            let out = detector.detect(&[track(true)], &[bottle()], &zones, t(step * 100));
            if !out.is_empty() {
                emitted.push((step, out));
            }
        }
        assert_eq!(emitted.len(), 1);
        let (step, out) = &emitted[0];
        assert_eq!(*step, 20);
        assert_eq!(out[0].duration_secs, 2.0);
        assert!(out[0].confirmed);
        assert_eq!(out[0].shelf_zone, "shelf-1");
        assert!((out[0].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn leaving_shelf_discards_pending() {
        let mut detector = InteractionDetector::new(InteractionConfig::default());
        let zones = zones();
        for step in 0..=18 {
            assert!(detector
                .detect(&[track(true)], &[bottle()], &zones, t(step * 100))
                .is_empty());
        }
        assert!(detector
            .detect(&[track(false)], &[bottle()], &zones, t(1900))
            .is_empty());
        assert_eq!(detector.pending_len(), 0);

        // Re-entry starts from zero: 2.0s after t=2000, not before.
        for step in 20..40 {
            assert!(detector
                .detect(&[track(true)], &[bottle()], &zones, t(step * 100))
                .is_empty());
        }
        assert_eq!(
            detector
                .detect(&[track(true)], &[bottle()], &zones, t(4000))
                .len(),
            1
        );
    }

    #[test]
    fn objects_outside_shelf_zones_are_ignored() {
        let mut detector = InteractionDetector::new(InteractionConfig::default());
        let zones = ZoneSet::new(vec![Zone::rect("shelf-1", 0.0, 0.0, 60.0, 100.0)]);
        for step in 0..=30 {
            assert!(detector
                .detect(&[track(true)], &[bottle()], &zones, t(step * 100))
                .is_empty());
        }
    }

    #[test]
    fn idle_candidates_expire() {
        let mut detector = InteractionDetector::new(InteractionConfig::default());
        let zones = zones();
        detector.detect(&[track(true)], &[bottle()], &zones, t(0));
        assert_eq!(detector.pending_len(), 1);
        detector.detect(&[track(true)], &[], &zones, t(4000));
        assert_eq!(detector.pending_len(), 1);
        detector.detect(&[track(true)], &[], &zones, t(4100));
        assert_eq!(detector.pending_len(), 0);
    }

    #[test]
    fn low_overlap_does_not_start_candidate() {
        let mut detector = InteractionDetector::new(InteractionConfig::default());
        let far = Detection::new(BoundingBox::new(150.0, 20.0, 8.0, 16.0), 0.9, 39);
        detector.detect(&[track(true)], &[far], &zones(), t(0));
        assert_eq!(detector.pending_len(), 0);
    }

    #[test]
    fn small_object_in_hand_counts_despite_low_iou() {
        let hand = estimate_hand_region(&track(true).bbox);
        let object = bottle().bbox;
        assert!(hand.iou(&object) < DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(hand.overlap_ratio(&object), 1.0);

        let mut detector = InteractionDetector::new(InteractionConfig::default());
        detector.detect(&[track(true)], &[bottle()], &zones(), t(0));
        assert_eq!(detector.pending_len(), 1);
    }
}
