//! Risk Scorer: weighted fusion of weak signals.
//!
//! Scoring is a pure function of the signals handed in. Each satisfied rule
//! adds its weight and names its factor; the sum maps to a level through
//! ascending thresholds. Only `high` and `critical` are alertable.

use serde::{Deserialize, Serialize};

use crate::concealment::ConcealmentEvent;
use crate::geometry::is_checkout_zone;
use crate::interaction::{Action, Interaction};
use crate::zone_logic::ZoneEvent;

pub const DEFAULT_WEIGHT_OBJECT_PICKED: u32 = 30;
pub const DEFAULT_WEIGHT_OBJECT_NOT_RETURNED: u32 = 15;
pub const DEFAULT_WEIGHT_CONCEALMENT_MOTION: u32 = 40;
pub const DEFAULT_WEIGHT_EXIT_WITHOUT_CHECKOUT: u32 = 35;

pub const DEFAULT_THRESHOLD_MEDIUM: u32 = 60;
pub const DEFAULT_THRESHOLD_HIGH: u32 = 90;
pub const DEFAULT_THRESHOLD_CRITICAL: u32 = 110;

const BASE_CONFIDENCE: f32 = 0.5;
const CONFIDENCE_PER_FACTOR: f32 = 0.15;
const MAX_CONFIDENCE: f32 = 0.95;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low Risk - Normal behavior observed",
            RiskLevel::Medium => "Medium Risk - Some suspicious activity detected",
            RiskLevel::High => "High Risk - Suspicious behavior detected",
            RiskLevel::Critical => "Critical Risk - Multiple suspicious behaviors detected",
        }
    }

    pub fn is_alertable(&self) -> bool {
        *self >= RiskLevel::High
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    ObjectPicked,
    ObjectNotReturned,
    ConcealmentMotion,
    ExitWithoutCheckout,
}

impl RiskFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFactor::ObjectPicked => "object_picked",
            RiskFactor::ObjectNotReturned => "object_not_returned",
            RiskFactor::ConcealmentMotion => "concealment_motion",
            RiskFactor::ExitWithoutCheckout => "exit_without_checkout",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskWeights {
    pub object_picked: u32,
    pub object_not_returned: u32,
    pub concealment_motion: u32,
    pub exit_without_checkout: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            object_picked: DEFAULT_WEIGHT_OBJECT_PICKED,
            object_not_returned: DEFAULT_WEIGHT_OBJECT_NOT_RETURNED,
            concealment_motion: DEFAULT_WEIGHT_CONCEALMENT_MOTION,
            exit_without_checkout: DEFAULT_WEIGHT_EXIT_WITHOUT_CHECKOUT,
        }
    }
}

impl RiskWeights {
    pub fn weight(&self, factor: RiskFactor) -> u32 {
        match factor {
            RiskFactor::ObjectPicked => self.object_picked,
            RiskFactor::ObjectNotReturned => self.object_not_returned,
            RiskFactor::ConcealmentMotion => self.concealment_motion,
            RiskFactor::ExitWithoutCheckout => self.exit_without_checkout,
        }
    }

    /// Replace zero weights with their defaults. A zero weight would let a
    /// signal bypass scoring silently.
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let pick = |name: &str, value: u32, default: u32| {
            if value == 0 {
                log::warn!("risk weight {} is zero, using default {}", name, default);
                default
            } else {
                value
            }
        };
        Self {
            object_picked: pick("object_picked", self.object_picked, defaults.object_picked),
            object_not_returned: pick(
                "object_not_returned",
                self.object_not_returned,
                defaults.object_not_returned,
            ),
            concealment_motion: pick(
                "concealment_motion",
                self.concealment_motion,
                defaults.concealment_motion,
            ),
            exit_without_checkout: pick(
                "exit_without_checkout",
                self.exit_without_checkout,
                defaults.exit_without_checkout,
            ),
        }
    }
}

/// Lower bounds of medium, high and critical.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: DEFAULT_THRESHOLD_MEDIUM,
            high: DEFAULT_THRESHOLD_HIGH,
            critical: DEFAULT_THRESHOLD_CRITICAL,
        }
    }
}

impl RiskThresholds {
    /// Thresholds must be strictly ascending and positive; otherwise the
    /// defaults apply as a whole.
    pub fn sanitized(self) -> Self {
        if 0 < self.medium && self.medium < self.high && self.high < self.critical {
            self
        } else {
            log::warn!(
                "risk thresholds {}/{}/{} are not strictly ascending, using defaults",
                self.medium,
                self.high,
                self.critical
            );
            Self::default()
        }
    }

    pub fn level(&self, score: u32) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Ephemeral scoring result; never stored.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub contributing_factors: Vec<RiskFactor>,
    pub confidence: f32,
}

#[derive(Clone, Debug, Default)]
pub struct RiskEngine {
    weights: RiskWeights,
    thresholds: RiskThresholds,
}

impl RiskEngine {
    pub fn new(weights: RiskWeights, thresholds: RiskThresholds) -> Self {
        Self {
            weights: weights.sanitized(),
            thresholds: thresholds.sanitized(),
        }
    }

    pub fn weights(&self) -> &RiskWeights {
        &self.weights
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    pub fn score(
        &self,
        actions: &[Action],
        interactions: &[Interaction],
        concealments: &[ConcealmentEvent],
        zone_events: &[ZoneEvent],
    ) -> RiskAssessment {
        let mut factors = Vec::new();

        let picked = interactions.iter().any(|i| i.action == Action::ObjectPick);
        if picked || actions.contains(&Action::ObjectPick) {
            factors.push(RiskFactor::ObjectPicked);
        }

        let checkout_seen = zone_events.iter().any(|e| {
            e.visited_checkout || e.zones_visited.iter().any(|z| is_checkout_zone(z))
        });
        if picked && !checkout_seen {
            factors.push(RiskFactor::ObjectNotReturned);
        }

        if !concealments.is_empty() {
            factors.push(RiskFactor::ConcealmentMotion);
        }

        if zone_events
            .iter()
            .any(|e| e.event_type == Action::ExitWithoutCheckout)
        {
            factors.push(RiskFactor::ExitWithoutCheckout);
        }

        let score = factors
            .iter()
            .fold(0u32, |total, f| total.saturating_add(self.weights.weight(*f)));
        let confidence =
            (BASE_CONFIDENCE + CONFIDENCE_PER_FACTOR * factors.len() as f32).min(MAX_CONFIDENCE);
        RiskAssessment {
            score,
            level: self.thresholds.level(score),
            contributing_factors: factors,
            confidence,
        }
    }

    pub fn should_generate_alert(&self, assessment: &RiskAssessment) -> bool {
        assessment.level.is_alertable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concealment::{ConcealmentTarget, Hand};
    use crate::detect::KeypointSource;
    use crate::geometry::BoundingBox;
    use chrono::{DateTime, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn pick() -> Interaction {
        Interaction {
            track_id: 1,
            action: Action::ObjectPick,
            object_bbox: BoundingBox::new(0.0, 0.0, 2.0, 2.0),
            shelf_zone: "shelf-1".into(),
            first_seen: now(),
            last_seen: now(),
            duration_secs: 2.0,
            confidence: 0.8,
            confirmed: true,
        }
    }

    fn concealment(confidence: f32) -> ConcealmentEvent {
        ConcealmentEvent {
            track_id: 1,
            confidence,
            target: ConcealmentTarget::Pocket,
            hand: Hand::Left,
            keypoint_source: KeypointSource::Estimator,
            timestamp: now(),
        }
    }

    fn exit_event(zones: &[&str]) -> ZoneEvent {
        ZoneEvent {
            track_id: 1,
            event_type: Action::ExitWithoutCheckout,
            zones_visited: zones.iter().map(|z| z.to_string()).collect(),
            object_picks: 1,
            visited_checkout: false,
            timestamp: now(),
        }
    }

    #[test]
    fn end_to_end_scores_escalate() {
        let engine = RiskEngine::default();
        let medium = engine.score(&[], &[pick()], &[concealment(0.8)], &[]);
        assert_eq!(medium.score, 85);
        assert_eq!(medium.level, RiskLevel::Medium);
        assert!(!engine.should_generate_alert(&medium));

        let critical = engine.score(
            &[],
            &[pick()],
            &[concealment(0.8)],
            &[exit_event(&["shelf-1", "exit"])],
        );
        assert_eq!(critical.score, 120);
        assert_eq!(critical.level, RiskLevel::Critical);
        assert_eq!(
            critical.contributing_factors,
            vec![
                RiskFactor::ObjectPicked,
                RiskFactor::ObjectNotReturned,
                RiskFactor::ConcealmentMotion,
                RiskFactor::ExitWithoutCheckout,
            ]
        );
        assert!((critical.confidence - 0.95).abs() < 1e-6);
        assert!(engine.should_generate_alert(&critical));
    }

    #[test]
    fn level_boundaries() {
        let thresholds = RiskThresholds::default();
        assert_eq!(thresholds.level(50), RiskLevel::Low);
        assert_eq!(thresholds.level(59), RiskLevel::Low);
        assert_eq!(thresholds.level(60), RiskLevel::Medium);
        assert_eq!(thresholds.level(95), RiskLevel::High);
        assert_eq!(thresholds.level(110), RiskLevel::Critical);
    }

    #[test]
    fn alert_gating_by_level() {
        let engine = RiskEngine::default();
        let at = |score| RiskAssessment {
            score,
            level: engine.thresholds().level(score),
            contributing_factors: vec![],
            confidence: 0.5,
        };
        assert!(engine.should_generate_alert(&at(95)));
        assert!(engine.should_generate_alert(&at(130)));
        assert!(!engine.should_generate_alert(&at(50)));
        assert!(!engine.should_generate_alert(&at(89)));
    }

    #[test]
    fn adding_signals_never_lowers_score() {
        let engine = RiskEngine::default();
        let picks: [&[Interaction]; 2] = [&[], &[pick()]];
        let concealments: [&[ConcealmentEvent]; 2] = [&[], &[concealment(0.9)]];
        let exits: [Vec<ZoneEvent>; 2] = [vec![], vec![exit_event(&["exit"])]];
        let mut scores = std::collections::BTreeMap::new();
        for (pi, p) in picks.iter().enumerate() {
            for (ci, c) in concealments.iter().enumerate() {
                for (ei, e) in exits.iter().enumerate() {
                    scores.insert((pi, ci, ei), engine.score(&[], p, c, e).score);
                }
            }
        }
        for (&(pi, ci, ei), &score) in &scores {
            if pi == 0 {
                assert!(scores[&(1, ci, ei)] >= score);
            }
            if ci == 0 {
                assert!(scores[&(pi, 1, ei)] >= score);
            }
            if ei == 0 {
                assert!(scores[&(pi, ci, 1)] >= score);
            }
        }
    }

    #[test]
    fn checkout_in_visit_list_suppresses_not_returned() {
        let engine = RiskEngine::default();
        let assessment = engine.score(&[], &[pick()], &[], &[exit_event(&["checkout", "exit"])]);
        assert!(!assessment
            .contributing_factors
            .contains(&RiskFactor::ObjectNotReturned));
    }

    #[test]
    fn invalid_configuration_falls_back_to_defaults() {
        let engine = RiskEngine::new(
            RiskWeights {
                concealment_motion: 0,
                ..RiskWeights::default()
            },
            RiskThresholds {
                medium: 100,
                high: 90,
                critical: 110,
            },
        );
        assert_eq!(engine.weights().concealment_motion, 40);
        assert_eq!(*engine.thresholds(), RiskThresholds::default());
    }

    #[test]
    fn custom_weights_apply() {
        let engine = RiskEngine::new(
            RiskWeights {
                object_picked: 70,
                ..RiskWeights::default()
            },
            RiskThresholds::default(),
        );
        let assessment = engine.score(&[Action::ObjectPick], &[], &[], &[]);
        assert_eq!(assessment.score, 70);
        assert_eq!(assessment.level, RiskLevel::Medium);
    }

    #[test]
    fn huge_weights_saturate_instead_of_wrapping() {
        let huge = 3_000_000_000;
        let engine = RiskEngine::new(
            RiskWeights {
                object_picked: huge,
                object_not_returned: huge,
                concealment_motion: huge,
                exit_without_checkout: huge,
            },
            RiskThresholds::default(),
        );
        let assessment = engine.score(
            &[],
            &[pick()],
            &[concealment(0.8)],
            &[exit_event(&["shelf-1", "exit"])],
        );
        assert_eq!(assessment.contributing_factors.len(), 4);
        assert_eq!(assessment.score, u32::MAX);
        assert_eq!(assessment.level, RiskLevel::Critical);
    }
}
