use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver};

use market_kernel::detect::{MarkerDetector, MarkerPoseEstimator};
use market_kernel::event::{Alert, EventDispatcher};
use market_kernel::ingest::{ReplaySource, SourceConfig, SyntheticSource};
use market_kernel::risk::RiskAssessment;
use market_kernel::transport::{EventSink, MemorySink};
use market_kernel::worker::{spawn_delivery, Supervisor};
use market_kernel::{BackendRegistry, CameraPipeline, PipelineConfig, RawFrame, RiskLevel, ZoneSet};

fn t(ms: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
}

fn marker_pipeline(camera_id: &str) -> CameraPipeline {
    let mut backends = BackendRegistry::new();
    backends.register(MarkerDetector::new());
    backends.register_pose_estimator(MarkerPoseEstimator::new());
    CameraPipeline::new(camera_id, ZoneSet::default(), PipelineConfig::default(), backends)
}

fn synthetic(camera_id: &str, max_frames: Option<u64>, realtime: bool) -> Box<SyntheticSource> {
    Box::new(
        SyntheticSource::new(SourceConfig {
            camera_id: camera_id.to_string(),
            max_frames,
            realtime,
            ..SourceConfig::default()
        })
        .starting_at(t(0))
        .with_default_zones(),
    )
}

fn blank(camera_id: &str, sequence: u64) -> Result<RawFrame> {
    RawFrame::blank(camera_id, sequence, t(sequence as i64 * 100), 64, 48)
}

fn alert(track_id: u64) -> Alert {
    let dispatcher = EventDispatcher::default();
    let assessment = RiskAssessment {
        score: 95,
        level: RiskLevel::High,
        contributing_factors: vec![],
        confidence: 0.8,
    };
    let event = dispatcher.create_event("cam-1", track_id, &assessment, vec![], None, t(0));
    dispatcher.create_alert(&event)
}

#[test]
fn wait_runs_every_camera_to_completion() -> Result<()> {
    let sink = MemorySink::new();
    let mut supervisor = Supervisor::new(Box::new(sink.clone()), true)?;
    for camera_id in ["cam-1", "cam-2"] {
        supervisor.add_camera(marker_pipeline(camera_id), synthetic(camera_id, Some(180), false))?;
    }
    assert_eq!(supervisor.camera_ids(), vec!["cam-1", "cam-2"]);

    let report = supervisor.wait()?;
    assert_eq!(report.cameras.len(), 2);
    for stats in report.cameras.values() {
        assert_eq!(stats.frames, 180);
        assert_eq!(stats.alerts, 1);
        assert_eq!(stats.failed_frames, 0);
    }
    assert_eq!(report.delivery.delivered, 2);
    assert_eq!(report.delivery.abandoned, 0);

    let cameras: BTreeSet<String> = sink.alerts().into_iter().map(|a| a.camera_id).collect();
    assert_eq!(
        cameras,
        BTreeSet::from(["cam-1".to_string(), "cam-2".to_string()])
    );
    Ok(())
}

#[test]
fn duplicate_camera_is_rejected() -> Result<()> {
    let mut supervisor = Supervisor::new(Box::new(MemorySink::new()), true)?;
    supervisor.add_camera(marker_pipeline("cam-1"), synthetic("cam-1", Some(5), false))?;
    assert!(supervisor
        .add_camera(marker_pipeline("cam-1"), synthetic("cam-1", Some(5), false))
        .is_err());
    supervisor.wait()?;
    Ok(())
}

#[test]
fn stopping_a_camera_releases_it() -> Result<()> {
    let mut supervisor = Supervisor::new(Box::new(MemorySink::new()), true)?;
    supervisor.add_camera(marker_pipeline("cam-1"), synthetic("cam-1", None, true))?;
    supervisor.add_camera(marker_pipeline("cam-2"), synthetic("cam-2", Some(3), false))?;
    assert!(supervisor.stop_camera("cam-9").is_err());

    supervisor.stop_camera("cam-1")?;
    assert_eq!(supervisor.camera_ids(), vec!["cam-2"]);
    let report = supervisor.shutdown()?;
    assert!(!report.cameras.contains_key("cam-1"));
    Ok(())
}

#[test]
fn source_errors_are_retried() -> Result<()> {
    let mut source = ReplaySource::new();
    source.push_frame(blank("cam-1", 1)?);
    source.push_error("transient decode failure");
    source.push_frame(blank("cam-1", 2)?);
    source.push_frame(blank("cam-1", 3)?);

    let mut supervisor = Supervisor::new(Box::new(MemorySink::new()), true)?;
    supervisor.add_camera(marker_pipeline("cam-1"), Box::new(source))?;
    let report = supervisor.wait()?;
    let stats = &report.cameras["cam-1"];
    assert_eq!(stats.source_errors, 1);
    assert_eq!(stats.frames, 3);
    Ok(())
}

#[test]
fn worker_gives_up_after_repeated_source_errors() -> Result<()> {
    let mut source = ReplaySource::new();
    for _ in 0..10 {
        source.push_error("camera offline");
    }
    source.push_frame(blank("cam-1", 1)?);

    let mut supervisor = Supervisor::new(Box::new(MemorySink::new()), true)?;
    supervisor.add_camera(marker_pipeline("cam-1"), Box::new(source))?;
    let report = supervisor.wait()?;
    let stats = &report.cameras["cam-1"];
    assert_eq!(stats.source_errors, 10);
    assert_eq!(stats.frames, 0);
    Ok(())
}

#[test]
fn foreign_and_stale_frames_are_ignored() -> Result<()> {
    let mut source = ReplaySource::new();
    source.push_frame(blank("cam-1", 1)?);
    source.push_frame(blank("cam-1", 2)?);
    source.push_frame(blank("cam-1", 2)?);
    source.push_frame(blank("cam-2", 3)?);
    source.push_frame(blank("cam-1", 4)?);

    let mut supervisor = Supervisor::new(Box::new(MemorySink::new()), true)?;
    supervisor.add_camera(marker_pipeline("cam-1"), Box::new(source))?;
    let report = supervisor.wait()?;
    let stats = &report.cameras["cam-1"];
    assert_eq!(stats.frames, 5);
    assert_eq!(stats.ignored_frames, 2);
    Ok(())
}

/// Blocks in `deliver` until the test opens the gate.
struct GatedSink {
    gate: Receiver<()>,
    entered: mpsc::Sender<()>,
    inner: MemorySink,
}

impl EventSink for GatedSink {
    fn name(&self) -> &str {
        "gated"
    }

    fn deliver(&mut self, alert: &Alert) -> Result<()> {
        let _ = self.entered.send(());
        self.gate.recv()?;
        self.inner.deliver(alert)
    }
}

struct Gate {
    open: mpsc::Sender<()>,
    entered: Receiver<()>,
    delivered: MemorySink,
}

fn gated() -> (GatedSink, Gate) {
    let (open, gate) = mpsc::channel();
    let (entered_tx, entered) = mpsc::channel();
    let delivered = MemorySink::new();
    let sink = GatedSink {
        gate,
        entered: entered_tx,
        inner: delivered.clone(),
    };
    (
        sink,
        Gate {
            open,
            entered,
            delivered,
        },
    )
}

#[test]
fn delivery_drains_queue_when_asked() -> Result<()> {
    let (sink, gate) = gated();
    let (tx, rx) = mpsc::channel();
    let handle = spawn_delivery(Box::new(sink), rx)?;
    for track_id in 1..=3 {
        tx.send(alert(track_id))?;
        gate.open.send(())?;
    }
    drop(tx);
    let stats = handle.finish(true)?;
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.abandoned, 0);
    let tracks: Vec<u64> = gate.delivered.alerts().iter().map(Alert::track_id).collect();
    assert_eq!(tracks, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn delivery_abandons_queue_when_not_draining() -> Result<()> {
    let (sink, gate) = gated();
    let (tx, rx) = mpsc::channel();
    let handle = spawn_delivery(Box::new(sink), rx)?;
    for track_id in 1..=3 {
        tx.send(alert(track_id))?;
    }
    drop(tx);

    // First alert is inside the sink; raise the abandon flag, then release it.
    gate.entered.recv()?;
    let finisher = std::thread::spawn(move || handle.finish(false));
    std::thread::sleep(std::time::Duration::from_millis(200));
    gate.open.send(())?;
    let stats = finisher
        .join()
        .map_err(|_| anyhow::anyhow!("finisher panicked"))??;

    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.abandoned, 2);
    assert_eq!(gate.delivered.len(), 1);
    Ok(())
}
