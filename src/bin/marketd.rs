//! marketd - retail behavior correlation daemon
//!
//! Loads `MarketConfig`, starts one worker per configured camera and hands
//! every alert to a single sink (stdout JSON lines or MQTT). Runs until all
//! sources are exhausted or Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use market_kernel::config::{CameraSettings, MarketConfig, SinkKind};
use market_kernel::detect::{MarkerDetector, MarkerPoseEstimator};
use market_kernel::ingest::{default_zones, open_source};
use market_kernel::transport::{EventSink, JsonLinesSink, MqttSink};
use market_kernel::worker::Supervisor;
use market_kernel::{BackendRegistry, CameraPipeline, PipelineConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (TOML or JSON). Overrides MARKET_CONFIG.
    #[arg(long, env = "MARKET_CONFIG")]
    config: Option<String>,
    /// Read sources as fast as possible instead of at their frame rate.
    #[arg(long)]
    no_realtime: bool,
    /// Stop each camera after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Only start these cameras (repeatable).
    #[arg(long = "camera")]
    cameras: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        std::env::set_var("MARKET_CONFIG", path);
    }
    let config = MarketConfig::load()?;
    let pipeline_config = config.to_pipeline_config();

    let cameras: Vec<&CameraSettings> = config
        .cameras
        .iter()
        .filter(|camera| args.cameras.is_empty() || args.cameras.contains(&camera.id))
        .collect();
    if cameras.is_empty() {
        return Err(anyhow!("no cameras selected"));
    }

    let mut backends = BackendRegistry::new();
    backends.register(MarkerDetector::new());
    backends.register_pose_estimator(MarkerPoseEstimator::new());
    backends.warm_up()?;
    log::info!("detector backends: {}", backends.list().join(", "));

    let sink = open_sink(&config)?;
    let mut supervisor = Supervisor::new(sink, config.behavior.drain_on_stop)?;
    for camera in cameras {
        start_camera(&mut supervisor, camera, &pipeline_config, &backends, &args)
            .with_context(|| format!("starting camera {}", camera.id))?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "marketd running with {} camera(s): {}",
        supervisor.camera_ids().len(),
        supervisor.camera_ids().join(", ")
    );
    while !stop.load(Ordering::SeqCst) && !supervisor.all_finished() {
        std::thread::sleep(POLL_INTERVAL);
    }

    let report = if stop.load(Ordering::SeqCst) {
        log::info!("shutdown signal received, stopping cameras...");
        supervisor.shutdown()?
    } else {
        log::info!("all sources finished");
        supervisor.wait()?
    };
    for (camera_id, stats) in &report.cameras {
        log::info!(
            "camera {}: {} frame(s), {} alert(s), {} failed, {} skipped stage(s), {} source error(s)",
            camera_id,
            stats.frames,
            stats.alerts,
            stats.failed_frames,
            stats.skipped_stages,
            stats.source_errors
        );
    }
    log::info!(
        "delivery: {} delivered, {} failed, {} abandoned",
        report.delivery.delivered,
        report.delivery.failed,
        report.delivery.abandoned
    );
    Ok(())
}

fn open_sink(config: &MarketConfig) -> Result<Box<dyn EventSink>> {
    Ok(match config.sink {
        SinkKind::Stdout => Box::new(JsonLinesSink::stdout()),
        SinkKind::Mqtt => Box::new(MqttSink::connect(&config.mqtt)?),
    })
}

fn start_camera(
    supervisor: &mut Supervisor,
    camera: &CameraSettings,
    pipeline_config: &PipelineConfig,
    backends: &BackendRegistry,
    args: &Args,
) -> Result<()> {
    let mut source_config = camera.source_config(!args.no_realtime);
    source_config.max_frames = args.max_frames;
    let source = open_source(source_config)?;

    let zones = if camera.zones.is_empty() && camera.source.starts_with("stub://") {
        log::info!("camera {}: no zones configured, using the synthetic scene layout", camera.id);
        default_zones(camera.width, camera.height)
    } else {
        camera.zones.clone()
    };
    if zones.is_empty() {
        log::warn!("camera {}: no zones configured, nothing will be scored", camera.id);
    }

    let pipeline = CameraPipeline::new(
        camera.id.clone(),
        zones,
        pipeline_config.clone(),
        backends.clone(),
    );
    supervisor.add_camera(pipeline, source)
}
