//! Publish/subscribe transport reader built on `rumqttc`.
//!
//! The client subscribes to every configured topic after each successful
//! connection (a broker restart drops subscriptions), and every incoming publish
//! becomes one sample stamped with its arrival time.

use super::{decode_payload, sleep_or_shutdown, Backoff, TransportReader};
use crate::communicator::Communicator;
use crate::config::{MqttSettings, TransportSettings};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;

/// Subscribes to the configured topics and ingests every publish.
pub struct MqttReader {
    name: String,
    topics: Vec<String>,
    client: AsyncClient,
    eventloop: EventLoop,
    backoff: Backoff,
}

impl MqttReader {
    /// Create the client. Nothing is sent until [`TransportReader::run`] polls it.
    pub fn new(settings: &MqttSettings, transport: &TransportSettings) -> Self {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.hostname.clone(),
            settings.port,
        );
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            name: format!("mqtt:{}:{}", settings.hostname, settings.port),
            topics: settings.topics.clone(),
            client,
            eventloop,
            backoff: Backoff::from_settings(transport),
        }
    }

    /// Publisher sharing this reader's connection.
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }

    fn subscribe_all(&self) {
        for topic in &self.topics {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                warn!(reader = %self.name, topic = %topic, error = %e, "subscribe request failed");
            }
        }
    }

    /// React to one event loop notification.
    fn handle_event(&mut self, event: Event, sink: &Communicator) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!(reader = %self.name, topics = self.topics.len(), "connected to broker");
                self.backoff.reset();
                self.subscribe_all();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                match decode_payload(&publish.topic, &publish.payload, Utc::now()) {
                    Ok(sample) => {
                        debug!(reader = %self.name, topic = %publish.topic, value = %sample.value, "received");
                        sink.ingest(sample);
                    }
                    Err(e) => warn!(reader = %self.name, error = %e, "dropping publish"),
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl TransportReader for MqttReader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &mut self,
        sink: Communicator,
        mut shutdown: watch::Receiver<bool>,
    ) -> AppResult<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                polled = self.eventloop.poll() => polled,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            match polled {
                Ok(event) => self.handle_event(event, &sink),
                Err(e) => {
                    let error = DaqError::transport(&self.name, e.to_string());
                    warn!(
                        error = %error,
                        attempt = self.backoff.attempts() + 1,
                        "broker connection failed"
                    );
                    let delay = self.backoff.next_delay();
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        let _ = self.client.try_disconnect();
        info!(reader = %self.name, "mqtt reader stopped");
        Ok(())
    }
}

/// Outbound messages to remote units over the broker connection.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Queue `payload` as JSON on `topic`.
    pub fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> AppResult<()> {
        let body = serde_json::to_vec(payload)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, body)
            .map_err(|e| DaqError::transport(topic, e.to_string()))
    }

    /// Send a command to a unit on its `<unit>/sudo` topic.
    pub fn send_command(&self, unit_id: &str, command: &str) -> AppResult<()> {
        self.publish_json(&format!("{unit_id}/sudo"), &command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessThresholds;
    use crate::sample::Value;
    use crate::trim::TrimPolicy;
    use rumqttc::Publish;

    fn settings() -> MqttSettings {
        MqttSettings {
            hostname: "localhost".into(),
            port: 1883,
            keep_alive_secs: 1,
            topics: vec!["rm1/gps/lat".into()],
            client_id: "seatrack-test".into(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn publishes_become_samples() {
        let mut reader = MqttReader::new(&settings(), &TransportSettings::default());
        assert_eq!(reader.name(), "mqtt:localhost:1883");
        let sink = Communicator::new(TrimPolicy::new(10, 0.5), LivenessThresholds::default());

        let publish = Publish::new("rm1/gps/lat", QoS::AtMostOnce, "45.5");
        reader.handle_event(Event::Incoming(Packet::Publish(publish)), &sink);
        let garbage = Publish::new("lat", QoS::AtMostOnce, "1");
        reader.handle_event(Event::Incoming(Packet::Publish(garbage)), &sink);

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.value("rm1/gps/lat"), Some(&Value::Float(45.5)));
    }

    #[tokio::test]
    async fn publisher_queues_without_connection() {
        let reader = MqttReader::new(&settings(), &TransportSettings::default());
        let publisher = reader.publisher();
        assert!(publisher.send_command("rm1", "reboot").is_ok());
        assert!(publisher
            .publish_json("rm1/config/rate", &serde_json::json!({"hz": 5}))
            .is_ok());
    }

    #[tokio::test]
    async fn shutdown_before_connect_returns() {
        let mut reader = MqttReader::new(&settings(), &TransportSettings::default());
        let sink = Communicator::new(TrimPolicy::new(10, 0.5), LivenessThresholds::default());
        let (_tx, rx) = watch::channel(true);
        assert!(reader.run(sink, rx).await.is_ok());
    }
}
