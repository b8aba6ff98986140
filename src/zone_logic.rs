//! Zone State Machine: ordered zone visits and exit-without-checkout.
//!
//! Per track, in this order every frame:
//! 1. append newly entered zones to the visit list (no adjacent duplicates)
//!    and latch `visited_checkout` the first time a checkout zone is seen;
//! 2. count confirmed interactions;
//! 3. if the track is in an exit zone, has at least one interaction and never
//!    visited checkout, emit `exit_without_checkout`.
//!
//! Whether step 3 re-fires every frame is [`ExitEventMode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::geometry::{is_checkout_zone, is_exit_zone};
use crate::interaction::{Action, Interaction};
use crate::tracking::Track;
use crate::TrackId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitEventMode {
    /// One event per track.
    #[default]
    OncePerTrack,
    /// Re-emit on every frame the condition holds.
    EveryFrame,
}

impl ExitEventMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "once_per_track" | "once" => Some(ExitEventMode::OncePerTrack),
            "every_frame" | "repeat" => Some(ExitEventMode::EveryFrame),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ZoneVisitLog {
    pub zones_visited: Vec<String>,
    pub visited_checkout: bool,
    pub object_picks: usize,
    #[serde(skip)]
    current: BTreeSet<String>,
    #[serde(skip)]
    exit_reported: bool,
}

impl ZoneVisitLog {
    fn enter(&mut self, zones: &BTreeSet<String>) {
        for zone in zones.difference(&self.current) {
            if self.zones_visited.last() != Some(zone) {
                self.zones_visited.push(zone.clone());
            }
            if is_checkout_zone(zone) && !self.visited_checkout {
                log::debug!("checkout visit recorded ({})", zone);
                self.visited_checkout = true;
            }
        }
        self.current = zones.clone();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZoneEvent {
    pub track_id: TrackId,
    #[serde(rename = "event")]
    pub event_type: Action,
    pub zones_visited: Vec<String>,
    pub object_picks: usize,
    pub visited_checkout: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ZoneStateMachine {
    mode: ExitEventMode,
    logs: HashMap<TrackId, ZoneVisitLog>,
}

impl ZoneStateMachine {
    pub fn new(mode: ExitEventMode) -> Self {
        Self {
            mode,
            logs: HashMap::new(),
        }
    }

    pub fn process(
        &mut self,
        tracks: &[Track],
        confirmed: &[Interaction],
        now: DateTime<Utc>,
    ) -> Vec<ZoneEvent> {
        for track in tracks {
            self.logs.entry(track.track_id).or_default().enter(&track.zones);
        }
        for interaction in confirmed {
            if interaction.action == Action::ObjectPick {
                self.logs
                    .entry(interaction.track_id)
                    .or_default()
                    .object_picks += 1;
            }
        }

        let mut events = Vec::new();
        for track in tracks {
            let Some(log) = self.logs.get_mut(&track.track_id) else {
                continue;
            };
            let at_exit = track.in_zone_matching(is_exit_zone);
            if !at_exit || log.object_picks == 0 || log.visited_checkout {
                continue;
            }
            if log.exit_reported && self.mode == ExitEventMode::OncePerTrack {
                continue;
            }
            if !log.exit_reported {
                log::info!(
                    "track {} exited without checkout after {} pick(s), path {:?}",
                    track.track_id,
                    log.object_picks,
                    log.zones_visited
                );
            }
            log.exit_reported = true;
            events.push(ZoneEvent {
                track_id: track.track_id,
                event_type: Action::ExitWithoutCheckout,
                zones_visited: log.zones_visited.clone(),
                object_picks: log.object_picks,
                visited_checkout: log.visited_checkout,
                timestamp: now,
            });
        }
        events
    }

    pub fn summary(&self, track_id: TrackId) -> Option<&ZoneVisitLog> {
        self.logs.get(&track_id)
    }

    pub fn forget_track(&mut self, track_id: TrackId) {
        self.logs.remove(&track_id);
    }
}
