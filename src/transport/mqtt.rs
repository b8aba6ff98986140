//! MQTT alert sink.
//!
//! Alerts are published as JSON at QoS 1 to `<prefix>/<camera_id>/alerts`.
//! The rumqttc event loop runs on its own thread for the lifetime of the
//! sink.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use serde::Deserialize;
use std::thread::JoinHandle;
use std::time::Duration;

use super::EventSink;
use crate::event::Alert;

pub const DEFAULT_TOPIC_PREFIX: &str = "market";
pub const DEFAULT_CLIENT_ID: &str = "market-kernel";
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `[scheme://]host[:port]`. `mqtt`/`tcp` are plain, `mqtts`/`ssl`
/// use TLS with the platform roots. Bracketed IPv6 hosts are accepted.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut rest = addr.trim();
    if let Some((scheme, remainder)) = rest.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        rest = remainder;
    }
    let default_port = if use_tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        (host, tail.strip_prefix(':'))
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port = match port {
        Some(port) => port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?,
        None => default_port,
    };
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

pub fn alert_topic(prefix: &str, camera_id: &str) -> String {
    format!("{}/{}/alerts", prefix.trim_end_matches('/'), camera_id)
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MqttSettings {
    pub broker: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: "mqtt://127.0.0.1:1883".to_string(),
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

pub struct MqttSink {
    client: Client,
    topic_prefix: String,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        let (client, connection) = Client::new(options, 10);
        log::info!(
            "MQTT sink connecting to {}:{} (TLS: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls
        );
        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.clone(),
            connection_handle: Some(spawn_event_loop(connection)),
        })
    }
}

fn spawn_event_loop(mut connection: Connection) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                Err(e) => {
                    log::warn!("MQTT connection error: {}", e);
                    break;
                }
            }
        }
    })
}

impl EventSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn deliver(&mut self, alert: &Alert) -> Result<()> {
        let topic = alert_topic(&self.topic_prefix, &alert.camera_id);
        let payload = alert.to_json()?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(handle) = self.connection_handle.take() else {
            return Ok(());
        };
        self.client.disconnect()?;
        if handle.join().is_err() {
            log::warn!("MQTT event loop thread panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_parse_with_defaults() -> Result<()> {
        let plain = parse_mqtt_endpoint("127.0.0.1:1884")?;
        assert_eq!(plain.port, 1884);
        assert!(!plain.use_tls);

        let tls = parse_mqtt_endpoint("mqtts://broker.local")?;
        assert_eq!(tls.host, "broker.local");
        assert_eq!(tls.port, 8883);
        assert!(tls.use_tls);

        let v6 = parse_mqtt_endpoint("[::1]:1883")?;
        assert_eq!(v6.host, "::1");

        assert!(parse_mqtt_endpoint("http://broker:80").is_err());
        assert!(parse_mqtt_endpoint("broker:notaport").is_err());
        assert!(parse_mqtt_endpoint("mqtt://:1883").is_err());
        Ok(())
    }

    #[test]
    fn topics_are_per_camera() {
        assert_eq!(alert_topic("market", "cam-1"), "market/cam-1/alerts");
        assert_eq!(alert_topic("store/7/", "entrance"), "store/7/entrance/alerts");
    }
}
