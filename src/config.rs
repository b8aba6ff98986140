use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::concealment::{ConcealmentConfig, ConcealmentTarget, DEFAULT_CONCEALMENT_CONFIDENCE};
use crate::detect::RETAIL_OBJECT_CLASSES;
use crate::event::SnapshotPolicy;
use crate::geometry::ZoneSet;
use crate::ingest::SourceConfig;
use crate::interaction::{InteractionConfig, DEFAULT_INTERACTION_TIME_SECS, DEFAULT_OVERLAP_THRESHOLD};
use crate::pipeline::{
    PipelineConfig, DEFAULT_MAX_EVENTS_PER_FRAME, DEFAULT_OBJECT_CONFIDENCE,
    DEFAULT_PERSON_CONFIDENCE,
};
use crate::risk::{RiskThresholds, RiskWeights};
use crate::temporal::{
    TemporalConfig, DEFAULT_MAX_TRACK_GAP_SECS, DEFAULT_MIN_TRACKING_DURATION_SECS,
};
use crate::tracking::{TrackerConfig, DEFAULT_IOU_THRESHOLD, DEFAULT_TRACK_EXPIRY_SECS};
use crate::transport::{parse_mqtt_endpoint, MqttSettings};
use crate::validate_zone_name;
use crate::zone_logic::ExitEventMode;

const DEFAULT_CAMERA_ID: &str = "cam-1";
const DEFAULT_CAMERA_SOURCE: &str = "stub://shop";
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;

const ENV_KEYS: [&str; 8] = [
    "MARKET_CONFIG",
    "MARKET_GRACEFUL_FAILURE",
    "MARKET_SNAPSHOTS_ENABLED",
    "MARKET_SNAPSHOTS_ONLY_HIGH_RISK",
    "MARKET_TRACK_EXPIRY_SECS",
    "MARKET_EXIT_EVENT_MODE",
    "MARKET_SINK",
    "MARKET_MQTT_BROKER",
];

#[derive(Debug, Deserialize, Default)]
struct MarketConfigFile {
    detection: Option<DetectionConfigFile>,
    tracking: Option<TrackingConfigFile>,
    risk_weights: Option<RiskWeightsFile>,
    risk_thresholds: Option<RiskThresholdsFile>,
    snapshots: Option<SnapshotsConfigFile>,
    behavior: Option<BehaviorConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
    sink: Option<String>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    person_confidence: Option<f32>,
    object_confidence: Option<f32>,
    shelf_interaction_time: Option<f64>,
    shelf_interaction_overlap: Option<f32>,
    min_tracking_duration: Option<f64>,
    max_track_gap: Option<f64>,
    concealment_confidence: Option<f32>,
    concealment_zones: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    track_expiry: Option<f64>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RiskWeightsFile {
    object_picked: Option<f64>,
    object_not_returned: Option<f64>,
    concealment_motion: Option<f64>,
    exit_without_checkout: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RiskThresholdsFile {
    medium: Option<f64>,
    high: Option<f64>,
    critical: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotsConfigFile {
    enabled: Option<bool>,
    only_high_risk: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct BehaviorConfigFile {
    graceful_failure: Option<bool>,
    exit_event_mode: Option<String>,
    max_events_per_frame: Option<usize>,
    drain_on_stop: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    source: Option<String>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    zones: Option<BTreeMap<String, Vec<[f32; 2]>>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SinkKind {
    #[default]
    Stdout,
    Mqtt,
}

impl SinkKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "stdout" | "jsonl" => Some(SinkKind::Stdout),
            "mqtt" => Some(SinkKind::Mqtt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub person_confidence: f32,
    pub object_confidence: f32,
    pub shelf_interaction_time: f64,
    pub shelf_interaction_overlap: f32,
    pub min_tracking_duration: f64,
    pub max_track_gap: f64,
    pub concealment_confidence: f32,
    pub concealment_zones: BTreeSet<ConcealmentTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSettings {
    pub track_expiry_secs: f64,
    pub iou_threshold: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorSettings {
    pub graceful_failure: bool,
    pub exit_event_mode: ExitEventMode,
    pub max_events_per_frame: usize,
    pub drain_on_stop: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub id: String,
    pub source: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub zones: ZoneSet,
}

impl CameraSettings {
    pub fn source_config(&self, realtime: bool) -> SourceConfig {
        SourceConfig {
            camera_id: self.id.clone(),
            url: self.source.clone(),
            fps: self.fps,
            width: self.width,
            height: self.height,
            realtime,
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub detection: DetectionSettings,
    pub tracking: TrackingSettings,
    pub risk_weights: RiskWeights,
    pub risk_thresholds: RiskThresholds,
    pub snapshots: SnapshotPolicy,
    pub behavior: BehaviorSettings,
    pub cameras: Vec<CameraSettings>,
    pub sink: SinkKind,
    pub mqtt: MqttSettings,
}

impl Default for MarketConfig {
    fn default() -> Self {
        let mut cfg = Self::from_file(MarketConfigFile::default());
        cfg.sanitize();
        cfg
    }
}

impl MarketConfig {
    /// File named by `MARKET_CONFIG` (if any), then environment overrides,
    /// then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MARKET_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment variables consulted by [`MarketConfig::load`].
    pub fn env_keys() -> &'static [&'static str] {
        &ENV_KEYS
    }

    fn from_file(file: MarketConfigFile) -> Self {
        let detection = file.detection.unwrap_or_default();
        let concealment_zones = match detection.concealment_zones {
            Some(names) => parse_targets(&names),
            None => default_targets(),
        };
        let detection = DetectionSettings {
            person_confidence: detection
                .person_confidence
                .unwrap_or(DEFAULT_PERSON_CONFIDENCE),
            object_confidence: detection
                .object_confidence
                .unwrap_or(DEFAULT_OBJECT_CONFIDENCE),
            shelf_interaction_time: detection
                .shelf_interaction_time
                .unwrap_or(DEFAULT_INTERACTION_TIME_SECS),
            shelf_interaction_overlap: detection
                .shelf_interaction_overlap
                .unwrap_or(DEFAULT_OVERLAP_THRESHOLD),
            min_tracking_duration: detection
                .min_tracking_duration
                .unwrap_or(DEFAULT_MIN_TRACKING_DURATION_SECS),
            max_track_gap: detection.max_track_gap.unwrap_or(DEFAULT_MAX_TRACK_GAP_SECS),
            concealment_confidence: detection
                .concealment_confidence
                .unwrap_or(DEFAULT_CONCEALMENT_CONFIDENCE),
            concealment_zones,
        };

        let tracking = file.tracking.unwrap_or_default();
        let tracking = TrackingSettings {
            track_expiry_secs: tracking.track_expiry.unwrap_or(DEFAULT_TRACK_EXPIRY_SECS),
            iou_threshold: tracking.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
        };

        let weights = file.risk_weights.unwrap_or_default();
        let defaults = RiskWeights::default();
        let risk_weights = RiskWeights {
            object_picked: points_or(
                "risk_weights.object_picked",
                weights.object_picked,
                defaults.object_picked,
            ),
            object_not_returned: points_or(
                "risk_weights.object_not_returned",
                weights.object_not_returned,
                defaults.object_not_returned,
            ),
            concealment_motion: points_or(
                "risk_weights.concealment_motion",
                weights.concealment_motion,
                defaults.concealment_motion,
            ),
            exit_without_checkout: points_or(
                "risk_weights.exit_without_checkout",
                weights.exit_without_checkout,
                defaults.exit_without_checkout,
            ),
        };

        let thresholds = file.risk_thresholds.unwrap_or_default();
        let defaults = RiskThresholds::default();
        let risk_thresholds = RiskThresholds {
            medium: points_or("risk_thresholds.medium", thresholds.medium, defaults.medium),
            high: points_or("risk_thresholds.high", thresholds.high, defaults.high),
            critical: points_or(
                "risk_thresholds.critical",
                thresholds.critical,
                defaults.critical,
            ),
        };

        let snapshots = file.snapshots.unwrap_or_default();
        let defaults = SnapshotPolicy::default();
        let snapshots = SnapshotPolicy {
            enabled: snapshots.enabled.unwrap_or(defaults.enabled),
            only_high_risk: snapshots.only_high_risk.unwrap_or(defaults.only_high_risk),
        };

        let behavior = file.behavior.unwrap_or_default();
        let exit_event_mode = match behavior.exit_event_mode.as_deref() {
            Some(raw) => ExitEventMode::parse(raw).unwrap_or_else(|| {
                log::warn!("unknown exit_event_mode {:?}, using once_per_track", raw);
                ExitEventMode::default()
            }),
            None => ExitEventMode::default(),
        };
        let behavior = BehaviorSettings {
            graceful_failure: behavior.graceful_failure.unwrap_or(true),
            exit_event_mode,
            max_events_per_frame: behavior
                .max_events_per_frame
                .unwrap_or(DEFAULT_MAX_EVENTS_PER_FRAME),
            drain_on_stop: behavior.drain_on_stop.unwrap_or(true),
        };

        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|camera| CameraSettings {
                    id: camera.id,
                    source: camera
                        .source
                        .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string()),
                    fps: camera.fps.unwrap_or(DEFAULT_CAMERA_FPS),
                    width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                    height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                    zones: camera.zones.map(ZoneSet::from).unwrap_or_default(),
                })
                .collect(),
            None => vec![CameraSettings {
                id: DEFAULT_CAMERA_ID.to_string(),
                source: DEFAULT_CAMERA_SOURCE.to_string(),
                fps: DEFAULT_CAMERA_FPS,
                width: DEFAULT_CAMERA_WIDTH,
                height: DEFAULT_CAMERA_HEIGHT,
                zones: ZoneSet::default(),
            }],
        };

        let sink = match file.sink.as_deref() {
            Some(raw) => SinkKind::parse(raw).unwrap_or_else(|| {
                log::warn!("unknown sink {:?}, using stdout", raw);
                SinkKind::Stdout
            }),
            None => SinkKind::default(),
        };

        let mqtt = file.mqtt.unwrap_or_default();
        let defaults = MqttSettings::default();
        let mqtt = MqttSettings {
            broker: mqtt.broker.unwrap_or(defaults.broker),
            client_id: mqtt.client_id.unwrap_or(defaults.client_id),
            topic_prefix: mqtt.topic_prefix.unwrap_or(defaults.topic_prefix),
        };

        Self {
            detection,
            tracking,
            risk_weights,
            risk_thresholds,
            snapshots,
            behavior,
            cameras,
            sink,
            mqtt,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_bool("MARKET_GRACEFUL_FAILURE")? {
            self.behavior.graceful_failure = value;
        }
        if let Some(value) = env_bool("MARKET_SNAPSHOTS_ENABLED")? {
            self.snapshots.enabled = value;
        }
        if let Some(value) = env_bool("MARKET_SNAPSHOTS_ONLY_HIGH_RISK")? {
            self.snapshots.only_high_risk = value;
        }
        if let Some(raw) = env_value("MARKET_TRACK_EXPIRY_SECS") {
            self.tracking.track_expiry_secs = raw.parse().map_err(|_| {
                anyhow!("MARKET_TRACK_EXPIRY_SECS must be a number of seconds")
            })?;
        }
        if let Some(raw) = env_value("MARKET_EXIT_EVENT_MODE") {
            self.behavior.exit_event_mode = ExitEventMode::parse(&raw).ok_or_else(|| {
                anyhow!("MARKET_EXIT_EVENT_MODE must be once_per_track or every_frame")
            })?;
        }
        if let Some(raw) = env_value("MARKET_SINK") {
            self.sink = SinkKind::parse(&raw)
                .ok_or_else(|| anyhow!("MARKET_SINK must be stdout or mqtt"))?;
        }
        if let Some(broker) = env_value("MARKET_MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        Ok(())
    }

    /// Hard errors for things that cannot be defaulted (names, camera
    /// geometry, broker address); everything numeric falls back to its
    /// default with a warning.
    fn validate(&mut self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for camera in &self.cameras {
            validate_zone_name(&camera.id).context("camera id")?;
            if !seen.insert(camera.id.clone()) {
                return Err(anyhow!("duplicate camera id {}", camera.id));
            }
            if camera.width == 0 || camera.height == 0 {
                return Err(anyhow!("camera {}: width and height must be positive", camera.id));
            }
            for zone in camera.zones.iter() {
                validate_zone_name(&zone.name)
                    .with_context(|| format!("camera {}", camera.id))?;
            }
        }
        if self.sink == SinkKind::Mqtt {
            parse_mqtt_endpoint(&self.mqtt.broker).context("mqtt.broker")?;
        }
        self.sanitize();
        Ok(())
    }

    fn sanitize(&mut self) {
        let d = &mut self.detection;
        d.person_confidence = unit_or("person_confidence", d.person_confidence, DEFAULT_PERSON_CONFIDENCE);
        d.object_confidence = unit_or("object_confidence", d.object_confidence, DEFAULT_OBJECT_CONFIDENCE);
        d.shelf_interaction_time = positive_or(
            "shelf_interaction_time",
            d.shelf_interaction_time,
            DEFAULT_INTERACTION_TIME_SECS,
        );
        d.shelf_interaction_overlap = unit_or(
            "shelf_interaction_overlap",
            d.shelf_interaction_overlap,
            DEFAULT_OVERLAP_THRESHOLD,
        );
        d.min_tracking_duration = positive_or(
            "min_tracking_duration",
            d.min_tracking_duration,
            DEFAULT_MIN_TRACKING_DURATION_SECS,
        );
        d.max_track_gap = positive_or("max_track_gap", d.max_track_gap, DEFAULT_MAX_TRACK_GAP_SECS);
        d.concealment_confidence = unit_or(
            "concealment_confidence",
            d.concealment_confidence,
            DEFAULT_CONCEALMENT_CONFIDENCE,
        );
        if d.concealment_zones.is_empty() {
            log::warn!("no usable concealment_zones, using pocket and waist");
            d.concealment_zones = default_targets();
        }

        let t = &mut self.tracking;
        t.track_expiry_secs = positive_or("track_expiry", t.track_expiry_secs, DEFAULT_TRACK_EXPIRY_SECS);
        t.iou_threshold = unit_or("iou_threshold", t.iou_threshold, DEFAULT_IOU_THRESHOLD);

        self.risk_weights = self.risk_weights.sanitized();
        self.risk_thresholds = self.risk_thresholds.sanitized();

        if self.behavior.max_events_per_frame == 0 {
            log::warn!(
                "max_events_per_frame must be positive, using {}",
                DEFAULT_MAX_EVENTS_PER_FRAME
            );
            self.behavior.max_events_per_frame = DEFAULT_MAX_EVENTS_PER_FRAME;
        }
        for camera in &mut self.cameras {
            if camera.fps == 0 {
                log::warn!("camera {}: fps must be positive, using {}", camera.id, DEFAULT_CAMERA_FPS);
                camera.fps = DEFAULT_CAMERA_FPS;
            }
            for zone in camera.zones.iter().filter(|zone| zone.is_degenerate()) {
                log::warn!(
                    "camera {}: zone {} has fewer than 3 vertices and will never match",
                    camera.id,
                    zone.name
                );
            }
        }
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let d = &self.detection;
        PipelineConfig {
            person_confidence: d.person_confidence,
            object_confidence: d.object_confidence,
            object_classes: RETAIL_OBJECT_CLASSES.to_vec(),
            tracker: TrackerConfig {
                iou_threshold: self.tracking.iou_threshold,
                expiry_secs: self.tracking.track_expiry_secs,
            },
            interaction: InteractionConfig {
                interaction_time_secs: d.shelf_interaction_time,
                overlap_threshold: d.shelf_interaction_overlap,
            },
            temporal: TemporalConfig {
                max_track_gap_secs: d.max_track_gap,
                min_tracking_duration_secs: d.min_tracking_duration,
            },
            concealment: ConcealmentConfig {
                min_confidence: d.concealment_confidence,
                targets: d.concealment_zones.clone(),
            },
            exit_event_mode: self.behavior.exit_event_mode,
            risk_weights: self.risk_weights,
            risk_thresholds: self.risk_thresholds,
            snapshots: self.snapshots,
            graceful_failure: self.behavior.graceful_failure,
            max_events_per_frame: self.behavior.max_events_per_frame,
        }
    }
}

fn read_config_file(path: &Path) -> Result<MarketConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    let Some(raw) = env_value(key) else {
        return Ok(None);
    };
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow!("{} must be true or false, got {:?}", key, raw)),
    }
}

fn default_targets() -> BTreeSet<ConcealmentTarget> {
    [ConcealmentTarget::Pocket, ConcealmentTarget::Waist].into()
}

fn parse_targets(names: &[String]) -> BTreeSet<ConcealmentTarget> {
    names
        .iter()
        .filter_map(|name| match ConcealmentTarget::parse(name) {
            Some(target) => Some(target),
            // Accepted for compatibility; wrist/hip keypoints cannot place a hand at a bag.
            None if name.trim().eq_ignore_ascii_case("bag") => {
                log::info!("concealment zone \"bag\" has no keypoint signal, skipped");
                None
            }
            None => {
                log::warn!("ignoring unknown concealment zone {:?}", name);
                None
            }
        })
        .collect()
}

fn positive_or(name: &str, value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        log::warn!("{} must be positive, using {}", name, default);
        default
    }
}

/// Weights and thresholds are whole, non-negative points.
fn points_or(name: &str, value: Option<f64>, default: u32) -> u32 {
    match value {
        None => default,
        Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => {
            v as u32
        }
        Some(v) => {
            log::warn!(
                "{} must be a whole number of points, got {}, using {}",
                name,
                v,
                default
            );
            default
        }
    }
}

fn unit_or(name: &str, value: f32, default: f32) -> f32 {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        value
    } else {
        log::warn!("{} must be in (0, 1], using {}", name, default);
        default
    }
}
