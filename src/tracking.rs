//! Track Registry: camera-scoped person identities.
//!
//! A track exists in the registry if and only if it was matched to a
//! detection within the expiry window. Ids are process-local, monotonically
//! increasing per camera, and never reused. Nothing here is persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::detect::Detection;
use crate::geometry::{BoundingBox, Point, ZoneSet};
use crate::{secs_between, TrackId};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_TRACK_EXPIRY_SECS: f64 = 300.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Track {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    pub center: Point,
    pub confidence: f32,
    /// Zones the center point currently falls within.
    pub zones: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Track {
    /// Seconds between first and last match.
    pub fn age_secs(&self) -> f64 {
        secs_between(self.last_seen, self.first_seen)
    }

    pub fn in_zone_matching(&self, predicate: impl Fn(&str) -> bool) -> bool {
        self.zones.iter().any(|zone| predicate(zone.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    pub expiry_secs: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            expiry_secs: DEFAULT_TRACK_EXPIRY_SECS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackSummary {
    pub track_id: TrackId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub duration_secs: f64,
    pub current_zones: BTreeSet<String>,
    pub zones_visited: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct TrackRegistry {
    config: TrackerConfig,
    tracks: BTreeMap<TrackId, Track>,
    zones_visited: BTreeMap<TrackId, BTreeSet<String>>,
    last_id: TrackId,
    last_matched: Vec<Track>,
    expired: Vec<TrackId>,
}

impl TrackRegistry {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Fold one frame of person detections into the registry.
    ///
    /// Returns the tracks matched or created by this frame. Unmatched
    /// existing tracks stay in the registry until the expiry sweep.
    pub fn update(
        &mut self,
        detections: &[Detection],
        zones: &ZoneSet,
        now: DateTime<Utc>,
    ) -> Vec<Track> {
        self.sweep_expired(now);

        // Greedy one-to-one matching, highest IoU first.
        let mut candidates: Vec<(f32, usize, TrackId)> = Vec::new();
        for (det_idx, detection) in detections.iter().enumerate() {
            if detection.bbox.is_empty() {
                continue;
            }
            for (track_id, track) in &self.tracks {
                let iou = track.bbox.iou(&detection.bbox);
                if iou >= self.config.iou_threshold && iou > 0.0 {
                    candidates.push((iou, det_idx, *track_id));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut assigned: BTreeMap<usize, TrackId> = BTreeMap::new();
        let mut taken: BTreeSet<TrackId> = BTreeSet::new();
        for (_, det_idx, track_id) in candidates {
            if assigned.contains_key(&det_idx) || taken.contains(&track_id) {
                continue;
            }
            assigned.insert(det_idx, track_id);
            taken.insert(track_id);
        }

        let mut matched_ids = Vec::new();
        for (det_idx, detection) in detections.iter().enumerate() {
            if detection.bbox.is_empty() {
                continue;
            }
            let track_id = match assigned.get(&det_idx) {
                Some(track_id) => {
                    if let Some(track) = self.tracks.get_mut(track_id) {
                        track.bbox = detection.bbox;
                        track.center = detection.bbox.center();
                        track.confidence = detection.confidence;
                        track.last_seen = now;
                    }
                    *track_id
                }
                None => self.create_track(detection, now),
            };
            matched_ids.push(track_id);
        }

        // Zone sets may change between frames, so membership is recomputed
        // for every live track, matched or not.
        for track in self.tracks.values_mut() {
            track.zones = zones.containing(&track.center);
            self.zones_visited
                .entry(track.track_id)
                .or_default()
                .extend(track.zones.iter().cloned());
        }

        self.last_matched = matched_ids
            .iter()
            .filter_map(|id| self.tracks.get(id).cloned())
            .collect();
        self.last_matched.clone()
    }

    fn create_track(&mut self, detection: &Detection, now: DateTime<Utc>) -> TrackId {
        self.last_id += 1;
        let track_id = self.last_id;
        log::debug!("new track {} at {:?}", track_id, detection.bbox);
        self.tracks.insert(
            track_id,
            Track {
                track_id,
                bbox: detection.bbox,
                center: detection.bbox.center(),
                confidence: detection.confidence,
                zones: BTreeSet::new(),
                first_seen: now,
                last_seen: now,
            },
        );
        track_id
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) {
        let expiry = self.config.expiry_secs;
        let stale: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|track| secs_between(now, track.last_seen) > expiry)
            .map(|track| track.track_id)
            .collect();
        for track_id in stale {
            log::debug!("track {} expired", track_id);
            self.tracks.remove(&track_id);
            self.zones_visited.remove(&track_id);
            self.last_matched.retain(|t| t.track_id != track_id);
            self.expired.push(track_id);
        }
    }

    /// Tracks matched by the most recent successful `update`.
    pub fn last_matched(&self) -> &[Track] {
        &self.last_matched
    }

    /// Ids removed by expiry since the last call. Downstream stages drop
    /// their per-track state for these.
    pub fn drain_expired(&mut self) -> Vec<TrackId> {
        std::mem::take(&mut self.expired)
    }

    pub fn get(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn summary(&self, track_id: TrackId) -> Option<TrackSummary> {
        let track = self.tracks.get(&track_id)?;
        Some(TrackSummary {
            track_id,
            first_seen: track.first_seen,
            last_seen: track.last_seen,
            duration_secs: track.age_secs(),
            current_zones: track.zones.clone(),
            zones_visited: self.zones_visited.get(&track_id).cloned().unwrap_or_default(),
        })
    }
}
