//! market_demo - scripted end-to-end run of the market pipeline
//!
//! Plays the synthetic shop scene (walk in, pick a bottle, conceal it, walk
//! out through the exit without visiting checkout) through one camera
//! pipeline and prints every alert as a JSON line on stdout.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;

use market_kernel::detect::{MarkerDetector, MarkerPoseEstimator};
use market_kernel::ingest::{FrameSource, SourceConfig, SyntheticSource};
use market_kernel::ui::{Ui, UiMode};
use market_kernel::zone_logic::ExitEventMode;
use market_kernel::{BackendRegistry, CameraPipeline, PipelineConfig, RiskLevel, ZoneSet};

const DEMO_CAMERA_ID: &str = "demo-cam";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Seconds of synthetic footage to process (the scene loops every 30s).
    #[arg(long, default_value_t = 20)]
    seconds: u64,
    /// Frames per second for the synthetic source.
    #[arg(long, default_value_t = 10)]
    fps: u32,
    /// Frame size as WIDTHxHEIGHT.
    #[arg(long, default_value = "640x480")]
    size: String,
    /// Use the keypoint heuristic instead of the marker pose estimator.
    #[arg(long)]
    no_pose: bool,
    /// Re-emit exit events on every frame.
    #[arg(long)]
    every_frame_exit: bool,
    /// Write redacted alert snapshots as JPEG files here.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// UI mode: auto, plain or pretty.
    #[arg(long, default_value = "auto")]
    ui: String,
}

fn parse_size(size: &str) -> Result<(u32, u32)> {
    let (w, h) = size
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("size must be WIDTHxHEIGHT"))?;
    let (w, h): (u32, u32) = (w.trim().parse()?, h.trim().parse()?);
    if w < 64 || h < 64 {
        return Err(anyhow!("size must be at least 64x64"));
    }
    Ok((w, h))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    let (width, height) = parse_size(&args.size)?;
    let mode = UiMode::parse(&args.ui).ok_or_else(|| anyhow!("ui must be auto, plain or pretty"))?;
    let ui = Ui::new(
        mode,
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );

    let (mut pipeline, mut source) = {
        let _stage = ui.stage("build pipeline");
        let mut backends = BackendRegistry::new();
        backends.register(MarkerDetector::new());
        if !args.no_pose {
            backends.register_pose_estimator(MarkerPoseEstimator::new());
        }
        backends.warm_up()?;

        let config = PipelineConfig {
            exit_event_mode: if args.every_frame_exit {
                ExitEventMode::EveryFrame
            } else {
                ExitEventMode::OncePerTrack
            },
            ..PipelineConfig::default()
        };
        let pipeline = CameraPipeline::new(DEMO_CAMERA_ID, ZoneSet::default(), config, backends);

        let total = args.seconds.saturating_mul(args.fps as u64);
        let mut source = SyntheticSource::new(SourceConfig {
            camera_id: DEMO_CAMERA_ID.to_string(),
            url: "stub://demo-shop".to_string(),
            fps: args.fps,
            width,
            height,
            realtime: false,
            max_frames: Some(total),
        })
        .with_default_zones();
        source.connect()?;
        (pipeline, source)
    };

    let total = args.seconds.saturating_mul(args.fps as u64);
    let mut alerts = Vec::new();
    let mut peak: BTreeMap<u64, (u32, RiskLevel)> = BTreeMap::new();
    let mut skipped = 0usize;
    {
        let mut stage = ui.frames("process frames", total);
        while let Some(next) = source.next_frame()? {
            if let Some(zones) = next.zones {
                pipeline.set_zones(zones);
            }
            let outcome = pipeline.process_frame(&next.frame)?;
            skipped += outcome.skipped_stages.len();
            for (track_id, assessment) in &outcome.assessments {
                let entry = peak.entry(*track_id).or_insert((0, RiskLevel::Low));
                if assessment.score > entry.0 {
                    *entry = (assessment.score, assessment.level);
                }
            }
            alerts.extend(outcome.alerts);
            stage.advance(alerts.len() as u64);
        }
        stage.set_summary(format!(
            "{} frame(s), {} alert(s), {} skipped stage(s)",
            source.stats().frames_captured,
            alerts.len(),
            skipped
        ));
    }

    {
        let _stage = ui.stage("emit alerts");
        if let Some(dir) = &args.snapshot_dir {
            std::fs::create_dir_all(dir)?;
        }
        for (index, alert) in alerts.iter().enumerate() {
            println!("{}", alert.to_json()?);
            if let (Some(dir), Some(snapshot)) = (&args.snapshot_dir, &alert.snapshot) {
                let path = dir.join(format!("alert-{}-track-{}.jpg", index + 1, alert.track_id()));
                std::fs::write(&path, snapshot.encode_jpeg()?)?;
                eprintln!("snapshot written to {}", path.display());
            }
        }
    }

    for (track_id, (score, level)) in &peak {
        eprintln!("track {}: peak score {} ({})", track_id, score, level);
    }
    if alerts.is_empty() {
        eprintln!("no alerts emitted; try --seconds 17 or more to reach the exit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse() {
        assert_eq!(parse_size("640x480").unwrap(), (640, 480));
        assert_eq!(parse_size("320X240").unwrap(), (320, 240));
        assert!(parse_size("640").is_err());
        assert!(parse_size("32x32").is_err());
    }
}
