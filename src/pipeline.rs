//! Per-camera pipeline: one sequential pass per frame through all seven
//! stages.
//!
//! All mutable state for a camera lives in one [`CameraState`] owned by that
//! camera's [`CameraPipeline`]. Nothing is shared between cameras; detector
//! backends are the only shared resource and sit behind the registry.
//!
//! Stage failures follow the graceful-failure flag: when set, the failing
//! stage is logged, listed in [`FrameOutcome::skipped_stages`] and contributes
//! nothing for the frame; when clear, the frame is abandoned with a
//! [`PipelineError`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

use crate::concealment::{ConcealmentConfig, ConcealmentDetector, ConcealmentEvent};
use crate::detect::{BackendRegistry, DetectionCapability, COCO_PERSON, RETAIL_OBJECT_CLASSES};
use crate::event::{actions_from_factors, Alert, EventDispatcher, EventMetadata, SnapshotPolicy};
use crate::frame::RawFrame;
use crate::geometry::{is_shelf_zone, ZoneSet};
use crate::interaction::{Interaction, InteractionConfig, InteractionDetector};
use crate::risk::{RiskAssessment, RiskEngine, RiskThresholds, RiskWeights};
use crate::temporal::{TemporalConfig, TemporalFilter};
use crate::tracking::{Track, TrackRegistry, TrackerConfig};
use crate::zone_logic::{ExitEventMode, ZoneEvent, ZoneStateMachine, ZoneVisitLog};
use crate::TrackId;

pub const DEFAULT_PERSON_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_OBJECT_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_MAX_EVENTS_PER_FRAME: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Tracking,
    Interaction,
    TemporalFilter,
    Concealment,
    ZoneLogic,
    RiskScoring,
    EventFormatting,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Tracking => "tracking",
            PipelineStage::Interaction => "interaction",
            PipelineStage::TemporalFilter => "temporal_filter",
            PipelineStage::Concealment => "concealment",
            PipelineStage::ZoneLogic => "zone_logic",
            PipelineStage::RiskScoring => "risk_scoring",
            PipelineStage::EventFormatting => "event_formatting",
        };
        f.write_str(name)
    }
}

/// A stage failure that abandoned a frame.
#[derive(Debug)]
pub struct PipelineError {
    pub camera_id: String,
    pub stage: PipelineStage,
    pub source: anyhow::Error,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "camera {}: {} stage failed: {:#}",
            self.camera_id, self.stage, self.source
        )
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub person_confidence: f32,
    pub object_confidence: f32,
    pub object_classes: Vec<u32>,
    pub tracker: TrackerConfig,
    pub interaction: InteractionConfig,
    pub temporal: TemporalConfig,
    pub concealment: ConcealmentConfig,
    pub exit_event_mode: ExitEventMode,
    pub risk_weights: RiskWeights,
    pub risk_thresholds: RiskThresholds,
    pub snapshots: SnapshotPolicy,
    pub graceful_failure: bool,
    pub max_events_per_frame: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            person_confidence: DEFAULT_PERSON_CONFIDENCE,
            object_confidence: DEFAULT_OBJECT_CONFIDENCE,
            object_classes: RETAIL_OBJECT_CLASSES.to_vec(),
            tracker: TrackerConfig::default(),
            interaction: InteractionConfig::default(),
            temporal: TemporalConfig::default(),
            concealment: ConcealmentConfig::default(),
            exit_event_mode: ExitEventMode::default(),
            risk_weights: RiskWeights::default(),
            risk_thresholds: RiskThresholds::default(),
            snapshots: SnapshotPolicy::default(),
            graceful_failure: true,
            max_events_per_frame: DEFAULT_MAX_EVENTS_PER_FRAME,
        }
    }
}

/// Signals accumulated for one track across frames. Scored afresh every
/// frame and dropped with the track.
#[derive(Clone, Debug, Default)]
pub struct TrackEvidence {
    pub interactions: Vec<Interaction>,
    /// Strongest concealment seen so far.
    pub concealment: Option<ConcealmentEvent>,
    pub zone_event: Option<ZoneEvent>,
    pub last_alert_score: Option<u32>,
}

/// Everything one camera remembers between frames.
#[derive(Debug, Default)]
pub struct CameraState {
    zones: ZoneSet,
    registry: TrackRegistry,
    interactions: InteractionDetector,
    temporal: TemporalFilter,
    zone_logic: ZoneStateMachine,
    evidence: HashMap<TrackId, TrackEvidence>,
    last_frame: Option<(u64, DateTime<Utc>)>,
}

impl CameraState {
    pub fn new(zones: ZoneSet, config: &PipelineConfig) -> Self {
        Self {
            zones,
            registry: TrackRegistry::new(config.tracker),
            interactions: InteractionDetector::new(config.interaction),
            temporal: TemporalFilter::new(config.temporal),
            zone_logic: ZoneStateMachine::new(config.exit_event_mode),
            evidence: HashMap::new(),
            last_frame: None,
        }
    }

    fn forget_track(&mut self, track_id: TrackId) {
        self.interactions.forget_track(track_id);
        self.temporal.forget_track(track_id);
        self.zone_logic.forget_track(track_id);
        self.evidence.remove(&track_id);
    }

    pub fn zones(&self) -> &ZoneSet {
        &self.zones
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn temporal(&self) -> &TemporalFilter {
        &self.temporal
    }

    pub fn zone_log(&self, track_id: TrackId) -> Option<&ZoneVisitLog> {
        self.zone_logic.summary(track_id)
    }

    pub fn evidence(&self, track_id: TrackId) -> Option<&TrackEvidence> {
        self.evidence.get(&track_id)
    }

    pub fn evidence_len(&self) -> usize {
        self.evidence.len()
    }
}

/// Result of one frame. `ignored` frames were out of order and touched no
/// state.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub sequence: u64,
    pub ignored: bool,
    pub tracks: Vec<Track>,
    pub interactions: Vec<Interaction>,
    pub concealments: Vec<ConcealmentEvent>,
    pub zone_events: Vec<ZoneEvent>,
    pub assessments: Vec<(TrackId, RiskAssessment)>,
    pub alerts: Vec<Alert>,
    pub skipped_stages: Vec<PipelineStage>,
    /// Alertable assessments held back by the per-frame cap.
    pub deferred_alerts: usize,
}

struct AlertCandidate {
    track: Track,
    assessment: RiskAssessment,
    interactions_count: usize,
    concealments_count: usize,
    zone_events_count: usize,
}

pub struct CameraPipeline {
    camera_id: String,
    config: PipelineConfig,
    backends: BackendRegistry,
    has_pose_estimator: bool,
    concealment: ConcealmentDetector,
    risk: RiskEngine,
    dispatcher: EventDispatcher,
    state: CameraState,
}

impl CameraPipeline {
    pub fn new(
        camera_id: impl Into<String>,
        zones: ZoneSet,
        config: PipelineConfig,
        backends: BackendRegistry,
    ) -> Self {
        let camera_id = camera_id.into();
        let has_pose_estimator = backends.has_pose_estimator();
        if !has_pose_estimator {
            log::info!(
                "camera {}: no pose estimator registered, using keypoint heuristic",
                camera_id
            );
        }
        Self {
            concealment: ConcealmentDetector::new(config.concealment.clone()),
            risk: RiskEngine::new(config.risk_weights, config.risk_thresholds),
            dispatcher: EventDispatcher::new(config.snapshots),
            state: CameraState::new(zones, &config),
            camera_id,
            config,
            backends,
            has_pose_estimator,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn has_pose_estimator(&self) -> bool {
        self.has_pose_estimator
    }

    pub fn state(&self) -> &CameraState {
        &self.state
    }

    /// Replace the zone set. Takes effect from the next frame.
    pub fn set_zones(&mut self, zones: ZoneSet) {
        log::debug!("camera {}: {} zone(s) loaded", self.camera_id, zones.len());
        self.state.zones = zones;
    }

    fn stage_failed(
        &self,
        stage: PipelineStage,
        error: anyhow::Error,
        outcome: &mut FrameOutcome,
    ) -> Result<(), PipelineError> {
        if self.config.graceful_failure {
            log::warn!(
                "camera {} frame {}: {} stage skipped: {:#}",
                self.camera_id,
                outcome.sequence,
                stage,
                error
            );
            outcome.skipped_stages.push(stage);
            Ok(())
        } else {
            Err(PipelineError {
                camera_id: self.camera_id.clone(),
                stage,
                source: error,
            })
        }
    }

    pub fn process_frame(&mut self, frame: &RawFrame) -> Result<FrameOutcome, PipelineError> {
        let now = frame.captured_at;
        let mut outcome = FrameOutcome {
            sequence: frame.sequence,
            ..FrameOutcome::default()
        };

        if frame.camera_id != self.camera_id {
            log::warn!(
                "camera {}: ignoring frame {} from camera {}",
                self.camera_id,
                frame.sequence,
                frame.camera_id
            );
            outcome.ignored = true;
            return Ok(outcome);
        }
        if let Some((last_sequence, last_at)) = self.state.last_frame {
            if frame.sequence <= last_sequence || now < last_at {
                log::warn!(
                    "camera {}: out-of-order frame {} (last {}), ignored",
                    self.camera_id,
                    frame.sequence,
                    last_sequence
                );
                outcome.ignored = true;
                return Ok(outcome);
            }
        }
        self.state.last_frame = Some((frame.sequence, now));
        let view = frame.inference_view();

        // 1. tracking
        let persons = view.detect(
            &self.backends,
            DetectionCapability::PersonDetection,
            &[COCO_PERSON],
            self.config.person_confidence,
        );
        let tracks = match persons {
            Ok(persons) => self.state.registry.update(&persons, &self.state.zones, now),
            Err(e) => {
                self.stage_failed(PipelineStage::Tracking, e, &mut outcome)?;
                self.state.registry.last_matched().to_vec()
            }
        };
        for track_id in self.state.registry.drain_expired() {
            self.state.forget_track(track_id);
        }

        // 2. interaction
        let confirmed = if tracks.iter().any(|t| t.in_zone_matching(is_shelf_zone)) {
            let objects = view.detect(
                &self.backends,
                DetectionCapability::ObjectDetection,
                &self.config.object_classes,
                self.config.object_confidence,
            );
            match objects {
                Ok(objects) => {
                    self.state
                        .interactions
                        .detect(&tracks, &objects, &self.state.zones, now)
                }
                Err(e) => {
                    self.stage_failed(PipelineStage::Interaction, e, &mut outcome)?;
                    Vec::new()
                }
            }
        } else {
            // Nobody at a shelf: drop their pending candidates, skip the detector.
            self.state
                .interactions
                .detect(&tracks, &[], &self.state.zones, now)
        };

        // 3. temporal filter, run every frame to keep the history current
        let filtered = self.state.temporal.filter(&tracks, &confirmed, now);
        if filtered.len() < confirmed.len() {
            log::debug!(
                "camera {}: {} of {} confirmed interaction(s) failed continuity",
                self.camera_id,
                confirmed.len() - filtered.len(),
                confirmed.len()
            );
        }
        for interaction in &filtered {
            self.state
                .evidence
                .entry(interaction.track_id)
                .or_default()
                .interactions
                .push(interaction.clone());
        }

        // Stages 3..5 commit together: a concealment failure is raised only
        // once the zone log has seen this frame's interactions.
        let mut deferred: Option<(PipelineStage, anyhow::Error)> = None;

        // 4. concealment, only for tracks holding a confirmed interaction
        let held: Vec<Interaction> = tracks
            .iter()
            .filter_map(|t| self.state.evidence.get(&t.track_id))
            .flat_map(|e| e.interactions.iter().cloned())
            .collect();
        if !held.is_empty() {
            let backends = &self.backends;
            let use_pose = self.has_pose_estimator;
            let concealments = self.concealment.detect(&tracks, &held, now, |track| {
                if use_pose {
                    view.estimate_pose(backends, &track.bbox)
                } else {
                    Ok(None)
                }
            });
            match concealments {
                Ok(events) => {
                    for event in &events {
                        let slot = &mut self
                            .state
                            .evidence
                            .entry(event.track_id)
                            .or_default()
                            .concealment;
                        if slot.as_ref().map_or(true, |s| event.confidence > s.confidence) {
                            *slot = Some(event.clone());
                        }
                    }
                    outcome.concealments = events;
                }
                Err(e) => deferred = Some((PipelineStage::Concealment, e)),
            }
        }

        // 5. zone logic
        let zone_events = self.state.zone_logic.process(&tracks, &filtered, now);
        for event in &zone_events {
            self.state
                .evidence
                .entry(event.track_id)
                .or_default()
                .zone_event = Some(event.clone());
        }
        if let Some((stage, error)) = deferred {
            self.stage_failed(stage, error, &mut outcome)?;
        }

        // 6. risk scoring
        let mut candidates = Vec::new();
        for track in &tracks {
            let Some(evidence) = self.state.evidence.get(&track.track_id) else {
                continue;
            };
            let assessment = self.risk.score(
                &[],
                &evidence.interactions,
                evidence.concealment.as_slice(),
                evidence.zone_event.as_slice(),
            );
            outcome.assessments.push((track.track_id, assessment.clone()));
            if !self.risk.should_generate_alert(&assessment) {
                log::debug!(
                    "camera {} track {}: score {} ({}) below alert level",
                    self.camera_id,
                    track.track_id,
                    assessment.score,
                    assessment.level
                );
                continue;
            }
            let escalated = evidence
                .last_alert_score
                .map_or(true, |last| assessment.score > last);
            let repeat_exit = self.config.exit_event_mode == ExitEventMode::EveryFrame
                && zone_events.iter().any(|e| e.track_id == track.track_id);
            if !escalated && !repeat_exit {
                continue;
            }
            candidates.push(AlertCandidate {
                track: track.clone(),
                interactions_count: evidence.interactions.len(),
                concealments_count: usize::from(evidence.concealment.is_some()),
                zone_events_count: usize::from(evidence.zone_event.is_some()),
                assessment,
            });
        }
        candidates.sort_by(|a, b| b.assessment.score.cmp(&a.assessment.score));
        if candidates.len() > self.config.max_events_per_frame {
            outcome.deferred_alerts = candidates.len() - self.config.max_events_per_frame;
            log::debug!(
                "camera {}: {} alert(s) deferred to later frames",
                self.camera_id,
                outcome.deferred_alerts
            );
            candidates.truncate(self.config.max_events_per_frame);
        }

        // 7. event formatting; alert scores are recorded only once every
        // alert of the frame is built, so an abandoned frame re-alerts later.
        let mut alerted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let track_id = candidate.track.track_id;
            let assessment = candidate.assessment;
            let metadata = EventMetadata {
                contributing_factors: assessment.contributing_factors.clone(),
                interactions_count: candidate.interactions_count,
                concealments_count: candidate.concealments_count,
                zone_events_count: candidate.zone_events_count,
                zones_visited: self
                    .state
                    .zone_logic
                    .summary(track_id)
                    .map(|log| log.zones_visited.clone())
                    .unwrap_or_default(),
                risk_description: assessment.level.description().to_string(),
            };
            let mut event = self.dispatcher.create_event(
                &self.camera_id,
                track_id,
                &assessment,
                actions_from_factors(&assessment.contributing_factors),
                Some(metadata),
                now,
            );
            match self
                .dispatcher
                .capture_snapshot(frame, &event, Some(&candidate.track.bbox))
            {
                Ok(snapshot) => event.snapshot = snapshot,
                Err(e) => self.stage_failed(PipelineStage::EventFormatting, e, &mut outcome)?,
            }
            let alert = self.dispatcher.create_alert(&event);
            log::info!(
                "camera {} track {}: {} (score {})",
                self.camera_id,
                track_id,
                alert.title,
                assessment.score
            );
            alerted.push((track_id, assessment.score));
            outcome.alerts.push(alert);
        }
        for (track_id, score) in alerted {
            if let Some(evidence) = self.state.evidence.get_mut(&track_id) {
                evidence.last_alert_score = Some(score);
            }
        }

        outcome.tracks = tracks;
        outcome.interactions = filtered;
        outcome.zone_events = zone_events;
        Ok(outcome)
    }
}
