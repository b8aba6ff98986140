//! Local directory of JPEG frames.
//!
//! Files are read in name order, one frame each, stamped at `1/fps`
//! intervals from the moment the source was opened. Decoded pixels go
//! straight into a `RawFrame`; nothing is written back to disk.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;

use super::{FrameSource, SourceConfig, SourceFrame, SourceStats};
use crate::frame::RawFrame;

pub struct ImageDirSource {
    config: SourceConfig,
    pending: VecDeque<PathBuf>,
    started: DateTime<Utc>,
    frame_count: u64,
}

fn is_jpeg(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
}

impl ImageDirSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&config.url)
            .with_context(|| format!("reading frame directory {}", config.url))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_jpeg(path))
            .collect();
        if files.is_empty() {
            return Err(anyhow!("no .jpg frames in {}", config.url));
        }
        files.sort();
        Ok(Self {
            pending: files.into(),
            started: Utc::now(),
            frame_count: 0,
            config,
        })
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.started = at;
        self
    }
}

impl FrameSource for ImageDirSource {
    fn name(&self) -> &str {
        "image-dir"
    }

    fn connect(&mut self) -> Result<()> {
        log::info!(
            "camera {}: reading {} frame(s) from {}",
            self.config.camera_id,
            self.pending.len(),
            self.config.url
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        if self
            .config
            .max_frames
            .is_some_and(|max| self.frame_count >= max)
        {
            return Ok(None);
        }
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let img = image::open(&path)
            .with_context(|| format!("decoding {}", path.display()))?
            .to_rgb8();
        let offset = (self.frame_count as i64 * 1000) / self.config.fps.max(1) as i64;
        self.frame_count += 1;
        let frame = RawFrame::from_image(
            self.config.camera_id.clone(),
            self.frame_count,
            self.started + Duration::milliseconds(offset),
            img,
        )?;
        Ok(Some(SourceFrame::new(frame)))
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn reads_jpegs_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for (name, shade) in [("b.jpg", 200u8), ("a.jpg", 20), ("notes.txt", 0)] {
            let path = dir.path().join(name);
            if name.ends_with(".jpg") {
                RgbImage::from_pixel(16, 8, Rgb([shade, shade, shade])).save(&path)?;
            } else {
                std::fs::write(&path, b"not a frame")?;
            }
        }
        let config = SourceConfig {
            url: dir.path().display().to_string(),
            fps: 5,
            ..SourceConfig::default()
        };
        let mut source = ImageDirSource::new(config)?;
        let first = source.next_frame()?.unwrap().frame;
        let second = source.next_frame()?.unwrap().frame;
        assert!(source.next_frame()?.is_none());

        assert_eq!((first.width, first.height), (16, 8));
        assert!(first.pixel_at(4, 4)[0] < 100);
        assert!(second.pixel_at(4, 4)[0] > 100);
        assert_eq!(second.captured_at - first.captured_at, Duration::milliseconds(200));
        Ok(())
    }

    #[test]
    fn empty_directory_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = SourceConfig {
            url: dir.path().display().to_string(),
            ..SourceConfig::default()
        };
        assert!(ImageDirSource::new(config).is_err());
        Ok(())
    }
}
