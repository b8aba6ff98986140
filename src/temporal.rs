//! Temporal Filter: continuity and minimum-duration checks.
//!
//! An interaction survives only if:
//! - its track's history window has no gap above `max_track_gap`, and no such
//!   gap ended within the last `min_tracking_duration` seconds;
//! - the track has been tracked for at least `min_tracking_duration`;
//! - the interaction itself lasted at least half of `min_tracking_duration`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::geometry::{BoundingBox, Point};
use crate::interaction::Interaction;
use crate::tracking::Track;
use crate::{secs_between, TrackId};

/// History retained per track, in seconds.
pub const HISTORY_WINDOW_SECS: f64 = 30.0;
pub const DEFAULT_MAX_TRACK_GAP_SECS: f64 = 1.0;
pub const DEFAULT_MIN_TRACKING_DURATION_SECS: f64 = 3.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemporalConfig {
    pub max_track_gap_secs: f64,
    pub min_tracking_duration_secs: f64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            max_track_gap_secs: DEFAULT_MAX_TRACK_GAP_SECS,
            min_tracking_duration_secs: DEFAULT_MIN_TRACKING_DURATION_SECS,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistorySample {
    pub at: DateTime<Utc>,
    pub bbox: BoundingBox,
    pub center: Point,
    pub zones: BTreeSet<String>,
}

/// Sliding buffer of recent samples for one track. Never persisted.
#[derive(Clone, Debug, Default)]
pub struct TrackHistoryWindow {
    samples: VecDeque<HistorySample>,
    /// End time of the most recent gap above the configured maximum.
    last_gap_at: Option<DateTime<Utc>>,
}

impl TrackHistoryWindow {
    fn push(&mut self, sample: HistorySample, max_gap: f64) {
        if let Some(prev) = self.samples.back() {
            if sample.at <= prev.at {
                return;
            }
            if secs_between(sample.at, prev.at) > max_gap {
                self.last_gap_at = Some(sample.at);
            }
        }
        self.samples.push_back(sample);
    }

    fn trim(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.samples.front() {
            if secs_between(now, front.at) > HISTORY_WINDOW_SECS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_continuous(&self, now: DateTime<Utc>, config: &TemporalConfig) -> bool {
        let gaps_ok = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .all(|(a, b)| secs_between(b.at, a.at) <= config.max_track_gap_secs);
        let recent_break = self
            .last_gap_at
            .is_some_and(|at| secs_between(now, at) < config.min_tracking_duration_secs);
        gaps_ok && !recent_break
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &HistorySample> {
        self.samples.iter()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContinuitySummary {
    pub track_id: TrackId,
    pub sample_count: usize,
    pub span_secs: f64,
    pub zones: BTreeSet<String>,
    pub continuous: bool,
    pub last_gap_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct TemporalFilter {
    config: TemporalConfig,
    windows: HashMap<TrackId, TrackHistoryWindow>,
}

impl TemporalFilter {
    pub fn new(config: TemporalConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Record this frame's tracks, then return the interactions that pass
    /// all three rules. Call once per frame, even with no interactions, so
    /// the history windows stay current.
    pub fn filter(
        &mut self,
        tracks: &[Track],
        interactions: &[Interaction],
        now: DateTime<Utc>,
    ) -> Vec<Interaction> {
        self.observe(tracks, now);

        interactions
            .iter()
            .filter(|interaction| self.accepts(tracks, interaction, now))
            .cloned()
            .collect()
    }

    fn observe(&mut self, tracks: &[Track], now: DateTime<Utc>) {
        // Samples are stamped with the track's own last match, so a reused
        // stale track does not paper over a detection gap.
        for track in tracks {
            self.windows.entry(track.track_id).or_default().push(
                HistorySample {
                    at: track.last_seen,
                    bbox: track.bbox,
                    center: track.center,
                    zones: track.zones.clone(),
                },
                self.config.max_track_gap_secs,
            );
        }
        self.windows.retain(|_, window| {
            window.trim(now);
            !window.is_empty()
        });
    }

    fn accepts(&self, tracks: &[Track], interaction: &Interaction, now: DateTime<Utc>) -> bool {
        let Some(track) = tracks.iter().find(|t| t.track_id == interaction.track_id) else {
            log::debug!(
                "dropping interaction for vanished track {}",
                interaction.track_id
            );
            return false;
        };
        let min_duration = self.config.min_tracking_duration_secs;

        let continuous = self
            .windows
            .get(&track.track_id)
            .is_some_and(|window| window.is_continuous(now, &self.config));
        if !continuous {
            log::debug!("track {} rejected: tracking gap", track.track_id);
            return false;
        }
        if track.age_secs() < min_duration {
            log::debug!(
                "track {} rejected: tracked {:.1}s < {:.1}s",
                track.track_id,
                track.age_secs(),
                min_duration
            );
            return false;
        }
        if interaction.duration_secs < min_duration * 0.5 {
            log::debug!(
                "track {} interaction rejected: {:.1}s too short",
                track.track_id,
                interaction.duration_secs
            );
            return false;
        }
        true
    }

    /// Continuity judgement for a single track, as used by the filter.
    pub fn is_continuous(&self, track_id: TrackId, now: DateTime<Utc>) -> bool {
        self.windows
            .get(&track_id)
            .is_some_and(|window| window.is_continuous(now, &self.config))
    }

    pub fn window(&self, track_id: TrackId) -> Option<&TrackHistoryWindow> {
        self.windows.get(&track_id)
    }

    pub fn summary(&self, track_id: TrackId, now: DateTime<Utc>) -> Option<ContinuitySummary> {
        let window = self.windows.get(&track_id)?;
        let first = window.samples.front()?;
        let last = window.samples.back()?;
        Some(ContinuitySummary {
            track_id,
            sample_count: window.len(),
            span_secs: secs_between(last.at, first.at),
            zones: window
                .samples
                .iter()
                .flat_map(|s| s.zones.iter().cloned())
                .collect(),
            continuous: window.is_continuous(now, &self.config),
            last_gap_at: window.last_gap_at,
        })
    }

    pub fn forget_track(&mut self, track_id: TrackId) {
        self.windows.remove(&track_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::Action;
    use chrono::{Duration, TimeZone};

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn track(first_ms: i64, last_ms: i64) -> Track {
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        Track {
            track_id: 1,
            bbox,
            center: bbox.center(),
            confidence: 0.9,
            zones: BTreeSet::new(),
            first_seen: t(first_ms),
            last_seen: t(last_ms),
        }
    }

    fn interaction(duration_secs: f64) -> Interaction {
        Interaction {
            track_id: 1,
            action: Action::ObjectPick,
            object_bbox: BoundingBox::new(0.0, 0.0, 2.0, 2.0),
            shelf_zone: "shelf-1".into(),
            first_seen: t(0),
            last_seen: t(0),
            duration_secs,
            confidence: 0.8,
            confirmed: true,
        }
    }

    /// Feed frames every 100ms over `[from, to]`, skipping `gaps`.
    fn feed(filter: &mut TemporalFilter, from: i64, to: i64, skip: impl Fn(i64) -> bool) {
        let mut ms = from;
        while ms <= to {
            if !skip(ms) {
                filter.filter(&[track(0, ms)], &[], t(ms));
            }
            ms += 100;
        }
    }

    #[test]
    fn continuous_old_track_passes() {
        let mut filter = TemporalFilter::new(TemporalConfig::default());
        feed(&mut filter, 0, 4900, |_| false);
        let kept = filter.filter(&[track(0, 5000)], &[interaction(2.0)], t(5000));
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn recent_gap_rejects_track() {
        let mut filter = TemporalFilter::new(TemporalConfig::default());
        // 1.5s hole ending at t=3600.
        feed(&mut filter, 0, 4900, |ms| (2100..3600).contains(&ms));
        let kept = filter.filter(&[track(0, 5000)], &[interaction(2.0)], t(5000));
        assert!(kept.is_empty());
        assert!(!filter.is_continuous(1, t(5000)));
        assert_eq!(filter.summary(1, t(5000)).unwrap().last_gap_at, Some(t(3600)));
    }

    #[test]
    fn young_track_is_rejected() {
        let mut filter = TemporalFilter::new(TemporalConfig::default());
        feed(&mut filter, 0, 2000, |_| false);
        let kept = filter.filter(&[track(0, 2100)], &[interaction(2.0)], t(2100));
        assert!(kept.is_empty());
    }

    #[test]
    fn short_interaction_is_rejected() {
        let mut filter = TemporalFilter::new(TemporalConfig::default());
        feed(&mut filter, 0, 4900, |_| false);
        let kept = filter.filter(&[track(0, 5000)], &[interaction(1.4)], t(5000));
        assert!(kept.is_empty());
    }

    #[test]
    fn interaction_for_missing_track_is_dropped() {
        let mut filter = TemporalFilter::new(TemporalConfig::default());
        let kept = filter.filter(&[], &[interaction(2.0)], t(0));
        assert!(kept.is_empty());
    }

    #[test]
    fn history_is_bounded_to_window() {
        let mut filter = TemporalFilter::new(TemporalConfig::default());
        feed(&mut filter, 0, 40_000, |_| false);
        let summary = filter.summary(1, t(40_000)).unwrap();
        assert_eq!(summary.span_secs, 30.0);
        assert_eq!(summary.sample_count, 301);
        assert!(summary.continuous);
    }

    #[test]
    fn old_gap_outside_window_is_forgotten() {
        let mut filter = TemporalFilter::new(TemporalConfig::default());
        feed(&mut filter, 0, 45_000, |ms| (2100..3600).contains(&ms));
        assert!(filter.is_continuous(1, t(45_000)));
    }
}
