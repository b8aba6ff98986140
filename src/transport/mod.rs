//! Alert delivery.
//!
//! An [`EventSink`] receives every alert a camera emits, in order, on the
//! delivery thread. Sinks never see frames; snapshots arrive already
//! redacted.

use anyhow::{anyhow, Result};
use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::event::Alert;

pub mod mqtt;

pub use mqtt::{alert_topic, parse_mqtt_endpoint, MqttEndpoint, MqttSettings, MqttSink};

pub trait EventSink: Send {
    fn name(&self) -> &str;

    fn deliver(&mut self, alert: &Alert) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flush and release the sink's resources. Called once at shutdown.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// One JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    delivered: u64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            delivered: 0,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn deliver(&mut self, alert: &Alert) -> Result<()> {
        let line = alert.to_json()?;
        writeln!(self.writer, "{}", line)?;
        self.delivered += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Collects alerts in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        match self.alerts.lock() {
            Ok(alerts) => alerts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.alerts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn deliver(&mut self, alert: &Alert) -> Result<()> {
        self.alerts
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?
            .push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDispatcher;
    use crate::risk::{RiskAssessment, RiskLevel};
    use chrono::{TimeZone, Utc};

    fn alert(camera_id: &str) -> Alert {
        let dispatcher = EventDispatcher::default();
        let assessment = RiskAssessment {
            score: 95,
            level: RiskLevel::High,
            contributing_factors: vec![],
            confidence: 0.8,
        };
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let event = dispatcher.create_event(camera_id, 3, &assessment, vec![], None, at);
        dispatcher.create_alert(&event)
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_alert() -> Result<()> {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.deliver(&alert("cam-1"))?;
        sink.deliver(&alert("cam-2"))?;
        sink.close()?;
        assert_eq!(sink.delivered(), 2);

        let out = String::from_utf8(sink.into_inner())?;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1])?;
        assert_eq!(second["camera_id"], "cam-2");
        assert_eq!(second["severity"], "high");
        Ok(())
    }

    #[test]
    fn memory_sink_clones_share_buffer() -> Result<()> {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.deliver(&alert("cam-1"))?;
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.alerts()[0].track_id(), 3);
        Ok(())
    }
}
