//! Event Formatter: event and alert records, redacted snapshots.
//!
//! Events and alerts are the compatibility contract with downstream sinks;
//! field names are stable. A snapshot is only ever produced from
//! `RawFrame::redacted_copy` with the face region blurred.

use anyhow::Result;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::frame::RawFrame;
use crate::geometry::BoundingBox;
use crate::interaction::Action;
use crate::risk::{RiskAssessment, RiskFactor, RiskLevel};
use crate::{TrackId, MODULE_NAME};

pub const EVENT_TYPE_SUSPICIOUS_BEHAVIOR: &str = "suspicious_behavior";

/// Face region as a fraction of the person box height, from the top.
const FACE_REGION_FRACTION: f32 = 0.3;
pub const FACE_BLUR_SIGMA: f32 = 8.0;
const JPEG_QUALITY: u8 = 85;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl From<RiskLevel> for Severity {
    fn from(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => Severity::Info,
            RiskLevel::Medium => Severity::Warning,
            RiskLevel::High => Severity::High,
            RiskLevel::Critical => Severity::Critical,
        }
    }
}

/// Heuristic face area: the top 30% of the person box.
pub fn face_region(person: &BoundingBox) -> BoundingBox {
    person.sub_region(0.0, 0.0, 1.0, FACE_REGION_FRACTION)
}

/// Observable actions behind a set of contributing factors.
pub fn actions_from_factors(factors: &[RiskFactor]) -> Vec<Action> {
    let mut actions: Vec<Action> = factors
        .iter()
        .filter_map(|factor| match factor {
            RiskFactor::ObjectPicked => Some(Action::ObjectPick),
            RiskFactor::ConcealmentMotion => Some(Action::Concealment),
            RiskFactor::ExitWithoutCheckout => Some(Action::ExitWithoutCheckout),
            RiskFactor::ObjectNotReturned => None,
        })
        .collect();
    actions.sort();
    actions.dedup();
    actions
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub enabled: bool,
    /// Restrict snapshots to high and critical events.
    pub only_high_risk: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            only_high_risk: true,
        }
    }
}

impl SnapshotPolicy {
    pub fn allows(&self, level: RiskLevel) -> bool {
        self.enabled && (!self.only_high_risk || level.is_alertable())
    }
}

/// Face-redacted frame copy. Serialised as dimensions, the redacted region
/// and hex-encoded JPEG bytes.
#[derive(Clone, Debug)]
pub struct Snapshot {
    image: RgbImage,
    pub redacted_region: BoundingBox,
    pub width: u32,
    pub height: u32,
}

impl Snapshot {
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder.encode_image(&self.image)?;
        Ok(out)
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let jpeg = self.encode_jpeg().map_err(serde::ser::Error::custom)?;
        let mut state = serializer.serialize_struct("Snapshot", 4)?;
        state.serialize_field("width", &self.width)?;
        state.serialize_field("height", &self.height)?;
        state.serialize_field("redacted_region", &self.redacted_region)?;
        state.serialize_field("jpeg_hex", &hex::encode(jpeg))?;
        state.end()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EventMetadata {
    pub contributing_factors: Vec<RiskFactor>,
    pub interactions_count: usize,
    pub concealments_count: usize,
    pub zone_events_count: usize,
    pub zones_visited: Vec<String>,
    pub risk_description: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub module: String,
    pub event_type: String,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub track_id: TrackId,
    pub camera_id: String,
    pub confidence: f32,
    pub actions: Vec<Action>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AlertMetadata {
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub track_id: TrackId,
    pub confidence: f32,
    pub actions: Vec<Action>,
    #[serde(flatten)]
    pub event: Option<EventMetadata>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub module: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: AlertMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

impl Alert {
    pub fn track_id(&self) -> TrackId {
        self.metadata.track_id
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventDispatcher {
    snapshots: SnapshotPolicy,
}

impl EventDispatcher {
    pub fn new(snapshots: SnapshotPolicy) -> Self {
        Self { snapshots }
    }

    pub fn snapshot_policy(&self) -> &SnapshotPolicy {
        &self.snapshots
    }

    pub fn create_event(
        &self,
        camera_id: &str,
        track_id: TrackId,
        assessment: &RiskAssessment,
        actions: Vec<Action>,
        metadata: Option<EventMetadata>,
        timestamp: DateTime<Utc>,
    ) -> Event {
        Event {
            module: MODULE_NAME.to_string(),
            event_type: EVENT_TYPE_SUSPICIOUS_BEHAVIOR.to_string(),
            risk_score: assessment.score,
            risk_level: assessment.level,
            track_id,
            camera_id: camera_id.to_string(),
            confidence: assessment.confidence,
            actions,
            timestamp,
            snapshot: None,
            metadata,
        }
    }

    pub fn create_alert(&self, event: &Event) -> Alert {
        let level = event.risk_level.as_str().to_uppercase();
        let mut description = format!("{} risk suspicious behavior detected.", level);
        if !event.actions.is_empty() {
            let phrases: Vec<&str> = event.actions.iter().map(Action::description).collect();
            description = format!("{} {}.", description, phrases.join(", "));
        }
        Alert {
            module: event.module.clone(),
            alert_type: event.event_type.clone(),
            severity: Severity::from(event.risk_level),
            title: format!("Suspicious Behavior Detected - {} Risk", level),
            description,
            camera_id: event.camera_id.clone(),
            timestamp: event.timestamp,
            metadata: AlertMetadata {
                risk_score: event.risk_score,
                risk_level: event.risk_level,
                track_id: event.track_id,
                confidence: event.confidence,
                actions: event.actions.clone(),
                event: event.metadata.clone(),
            },
            snapshot: event.snapshot.clone(),
        }
    }

    /// Face-redacted copy of `frame`, or `None` when policy skips this event
    /// or no person box is known. Blurring is not optional: if the face
    /// region cannot be redacted, this fails rather than return the frame.
    pub fn capture_snapshot(
        &self,
        frame: &RawFrame,
        event: &Event,
        person: Option<&BoundingBox>,
    ) -> Result<Option<Snapshot>> {
        if !self.snapshots.allows(event.risk_level) {
            return Ok(None);
        }
        let Some(person) = person else {
            log::debug!(
                "no person box for track {}, snapshot skipped",
                event.track_id
            );
            return Ok(None);
        };
        let face = face_region(person);
        let image = frame.redacted_copy(&[face], FACE_BLUR_SIGMA)?;
        let redacted_region = face.clamp_to(frame.width, frame.height).unwrap_or(face);
        Ok(Some(Snapshot {
            image,
            redacted_region,
            width: frame.width,
            height: frame.height,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn assessment(score: u32, level: RiskLevel, factors: Vec<RiskFactor>) -> RiskAssessment {
        RiskAssessment {
            score,
            level,
            contributing_factors: factors,
            confidence: 0.95,
        }
    }

    fn checkerboard(width: u32, height: u32) -> Result<RawFrame> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgb([255, 255, 255])
            } else {
                image::Rgb([0, 0, 0])
            }
        });
        RawFrame::from_image("cam-1", 1, now(), img)
    }

    #[test]
    fn severity_follows_level() {
        assert_eq!(Severity::from(RiskLevel::Low), Severity::Info);
        assert_eq!(Severity::from(RiskLevel::Medium), Severity::Warning);
        assert_eq!(Severity::from(RiskLevel::High), Severity::High);
        assert_eq!(Severity::from(RiskLevel::Critical), Severity::Critical);
    }

    #[test]
    fn alert_text_and_metadata() -> Result<()> {
        let dispatcher = EventDispatcher::default();
        let factors = vec![
            RiskFactor::ObjectPicked,
            RiskFactor::ObjectNotReturned,
            RiskFactor::ExitWithoutCheckout,
        ];
        let event = dispatcher.create_event(
            "cam-1",
            7,
            &assessment(120, RiskLevel::Critical, factors.clone()),
            actions_from_factors(&factors),
            Some(EventMetadata {
                contributing_factors: factors,
                zones_visited: vec!["shelf-1".into(), "exit".into()],
                ..EventMetadata::default()
            }),
            now(),
        );
        let alert = dispatcher.create_alert(&event);
        assert_eq!(alert.title, "Suspicious Behavior Detected - CRITICAL Risk");
        assert_eq!(
            alert.description,
            "CRITICAL risk suspicious behavior detected. Item picked from shelf, Exited without checkout."
        );
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.track_id(), 7);

        let json: serde_json::Value = serde_json::from_str(&alert.to_json()?)?;
        assert_eq!(json["type"], "suspicious_behavior");
        assert_eq!(json["module"], "market");
        assert_eq!(json["metadata"]["risk_level"], "critical");
        assert_eq!(json["metadata"]["actions"][1], "exit_without_checkout");
        assert_eq!(json["metadata"]["contributing_factors"][1], "object_not_returned");
        assert!(json.get("snapshot").is_none());
        Ok(())
    }

    #[test]
    fn snapshot_blurs_face_region_only() -> Result<()> {
        let frame = checkerboard(120, 200)?;
        let dispatcher = EventDispatcher::default();
        let event = dispatcher.create_event(
            "cam-1",
            1,
            &assessment(95, RiskLevel::High, vec![]),
            vec![],
            None,
            now(),
        );
        let person = BoundingBox::new(20.0, 20.0, 80.0, 160.0);
        let snapshot = dispatcher
            .capture_snapshot(&frame, &event, Some(&person))?
            .unwrap();

        // Face region is (20, 20) .. (100, 68).
        assert_eq!(snapshot.redacted_region, BoundingBox::new(20.0, 20.0, 80.0, 48.0));
        let mut changed = 0;
        let mut total = 0;
        for y in 20..68 {
            for x in 20..100 {
                total += 1;
                if snapshot.image().get_pixel(x, y).0 != frame.pixel_at(x, y) {
                    changed += 1;
                }
            }
        }
        assert!(changed * 10 >= total * 9, "{} of {} pixels changed", changed, total);
        assert_eq!(snapshot.image().get_pixel(60, 150).0, frame.pixel_at(60, 150));
        assert!(!snapshot.encode_jpeg()?.is_empty());
        Ok(())
    }

    #[test]
    fn snapshot_policy_gates_capture() -> Result<()> {
        let frame = checkerboard(40, 40)?;
        let person = BoundingBox::new(0.0, 0.0, 20.0, 40.0);
        let medium = EventDispatcher::default().create_event(
            "cam-1",
            1,
            &assessment(70, RiskLevel::Medium, vec![]),
            vec![],
            None,
            now(),
        );
        assert!(EventDispatcher::default()
            .capture_snapshot(&frame, &medium, Some(&person))?
            .is_none());

        let everything = EventDispatcher::new(SnapshotPolicy {
            enabled: true,
            only_high_risk: false,
        });
        assert!(everything
            .capture_snapshot(&frame, &medium, Some(&person))?
            .is_some());
        assert!(everything.capture_snapshot(&frame, &medium, None)?.is_none());

        let disabled = EventDispatcher::new(SnapshotPolicy {
            enabled: false,
            only_high_risk: false,
        });
        assert!(disabled
            .capture_snapshot(&frame, &medium, Some(&person))?
            .is_none());
        Ok(())
    }

    #[test]
    fn snapshot_serialises_as_hex_jpeg() -> Result<()> {
        let frame = checkerboard(32, 32)?;
        let dispatcher = EventDispatcher::default();
        let event = dispatcher.create_event(
            "cam-1",
            1,
            &assessment(100, RiskLevel::High, vec![]),
            vec![],
            None,
            now(),
        );
        let snapshot = dispatcher
            .capture_snapshot(&frame, &event, Some(&BoundingBox::new(0.0, 0.0, 16.0, 32.0)))?
            .unwrap();
        let json = serde_json::to_value(&snapshot)?;
        let bytes = hex::decode(json["jpeg_hex"].as_str().unwrap_or_default())?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(json["width"], 32);
        Ok(())
    }
}
