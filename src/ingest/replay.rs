use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use super::{FrameSource, SourceFrame, SourceStats};
use crate::frame::RawFrame;
use crate::geometry::ZoneSet;

enum ReplayItem {
    Frame(SourceFrame),
    Error(String),
}

/// Plays back prepared frames and scripted errors, then ends.
#[derive(Default)]
pub struct ReplaySource {
    items: VecDeque<ReplayItem>,
    delivered: u64,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self, frame: RawFrame) {
        self.items.push_back(ReplayItem::Frame(SourceFrame::new(frame)));
    }

    pub fn push_frame_with_zones(&mut self, frame: RawFrame, zones: ZoneSet) {
        self.items
            .push_back(ReplayItem::Frame(SourceFrame::new(frame).with_zones(zones)));
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.items.push_back(ReplayItem::Error(message.into()));
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl FrameSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        match self.items.pop_front() {
            Some(ReplayItem::Frame(frame)) => {
                self.delivered += 1;
                Ok(Some(frame))
            }
            Some(ReplayItem::Error(message)) => Err(anyhow!(message)),
            None => Ok(None),
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.delivered,
            url: "replay://memory".to_string(),
        }
    }
}
