//! Frame ingestion sources.
//!
//! Sources deliver decoded frames to a camera worker:
//! - `stub://` synthetic shop scene (daemon, demo, tests)
//! - local directory of JPEG frames
//! - in-memory replay (tests)
//!
//! A source may also hand over a zone set with any frame; the worker applies
//! it before that frame is processed.
//!
//! Sources MUST NOT store decoded frames to disk, transmit them, or log
//! their content.

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::frame::RawFrame;
use crate::geometry::ZoneSet;

pub mod file;
pub mod replay;
pub mod synthetic;

pub use file::ImageDirSource;
pub use replay::ReplaySource;
pub use synthetic::{default_zones, SyntheticSource};

pub const DEFAULT_FPS: u32 = 10;

/// A frame plus an optional zone refresh.
pub struct SourceFrame {
    pub frame: RawFrame,
    pub zones: Option<ZoneSet>,
}

impl SourceFrame {
    pub fn new(frame: RawFrame) -> Self {
        Self { frame, zones: None }
    }

    pub fn with_zones(mut self, zones: ZoneSet) -> Self {
        self.zones = Some(zones);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Next frame, or `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<SourceFrame>>;

    fn stats(&self) -> SourceStats;
}

/// Where and how one camera's frames are obtained.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub camera_id: String,
    /// `stub://<name>` or a local directory path.
    pub url: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Pace synthetic frames at `fps` on the wall clock.
    pub realtime: bool,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            camera_id: "cam-1".to_string(),
            url: "stub://shop".to_string(),
            fps: DEFAULT_FPS,
            width: 640,
            height: 480,
            realtime: false,
            max_frames: None,
        }
    }
}

/// Build the source named by `config.url`.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.fps == 0 {
        return Err(anyhow!("camera {}: fps must be positive", config.camera_id));
    }
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    if config.url.contains("://") {
        return Err(anyhow!(
            "camera {}: unsupported source {:?} (network camera I/O is external; use stub:// or a local directory)",
            config.camera_id,
            config.url
        ));
    }
    if !Path::new(&config.url).is_dir() {
        return Err(anyhow!(
            "camera {}: {} is not a directory of frames",
            config.camera_id,
            config.url
        ));
    }
    Ok(Box::new(ImageDirSource::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_source_dispatches_on_url() -> Result<()> {
        let mut source = open_source(SourceConfig::default())?;
        source.connect()?;
        assert_eq!(source.name(), "synthetic");
        assert!(source.next_frame()?.is_some());

        let remote = SourceConfig {
            url: "rtsp://10.0.0.2/stream".into(),
            ..SourceConfig::default()
        };
        assert!(open_source(remote).is_err());

        let missing = SourceConfig {
            url: "/definitely/not/here".into(),
            ..SourceConfig::default()
        };
        assert!(open_source(missing).is_err());

        let zero_fps = SourceConfig {
            fps: 0,
            ..SourceConfig::default()
        };
        assert!(open_source(zero_fps).is_err());
        Ok(())
    }
}
