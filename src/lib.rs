//! Market Kernel
//!
//! Retail loss-prevention behavior correlation for edge cameras. Per-frame
//! person and merchandise detections are turned into a small number of scored
//! "suspicious behavior" events. The kernel reports risk scores, never
//! verdicts.
//!
//! # Pipeline
//!
//! Each camera runs one [`pipeline::CameraPipeline`], strictly in frame order:
//!
//! 1. `tracking`: person detections become camera-scoped tracks with zone membership.
//! 2. `interaction`: sustained hand/object overlap inside shelf zones confirms a pickup.
//! 3. `temporal`: continuity and minimum-duration checks on tracks and interactions.
//! 4. `concealment`: hand-near-body heuristic, only for tracks with a confirmed pickup.
//! 5. `zone_logic`: ordered zone visits and exit-without-checkout detection.
//! 6. `risk`: weighted fusion of the signals into a score and level.
//! 7. `event`: event/alert records with an optional face-redacted snapshot.
//!
//! # Privacy
//!
//! - Track ids are process-local and never reused; nothing persists across restarts.
//! - Raw pixels stay inside `RawFrame`; detectors see them only for the duration of a call.
//! - Snapshots always have the face region blurred before they leave the frame.
//! - No stage reads or stores facial data.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

pub mod concealment;
pub mod config;
pub mod detect;
pub mod event;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod interaction;
pub mod pipeline;
pub mod risk;
pub mod temporal;
pub mod tracking;
pub mod transport;
pub mod ui;
pub mod worker;
pub mod zone_logic;

pub use concealment::{ConcealmentDetector, ConcealmentEvent, ConcealmentTarget};
pub use detect::{BackendRegistry, DetectionCapability, ObjectDetector, PoseEstimator};
pub use event::{Alert, Event, EventDispatcher, Severity, Snapshot, SnapshotPolicy};
pub use frame::{InferenceView, RawFrame};
pub use geometry::{BoundingBox, Point, Zone, ZoneSet};
pub use interaction::{Action, Interaction, InteractionDetector};
pub use pipeline::{CameraPipeline, CameraState, FrameOutcome, PipelineConfig, PipelineError, PipelineStage};
pub use risk::{RiskAssessment, RiskEngine, RiskFactor, RiskLevel};
pub use temporal::TemporalFilter;
pub use tracking::{Track, TrackRegistry};
pub use zone_logic::{ExitEventMode, ZoneEvent, ZoneStateMachine};

/// Process-local person identity, unique per camera and never reused.
pub type TrackId = u64;

/// Module name stamped on every emitted event.
pub const MODULE_NAME: &str = "market";

/// Seconds from `earlier` to `later`, at millisecond resolution.
pub(crate) fn secs_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

/// Zone and camera names: 1..64 characters of `[A-Za-z0-9 _:.-]`.
pub fn validate_zone_name(name: &str) -> Result<()> {
    static ZONE_NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = match ZONE_NAME_RE.get() {
        Some(re) => re,
        None => {
            let compiled = Regex::new(r"^[A-Za-z0-9 _:.-]{1,64}$")
                .map_err(|e| anyhow!("zone name pattern: {}", e))?;
            ZONE_NAME_RE.get_or_init(|| compiled)
        }
    };
    if !re.is_match(name) {
        return Err(anyhow!(
            "zone name {:?} must match ^[A-Za-z0-9 _:.-]{{1,64}}$",
            name
        ));
    }
    Ok(())
}
