use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use powerwatch::{ApplianceEvent, EventSink, Transition};
use rumqttc::{AsyncClient, ClientError, Event, Incoming, MqttOptions, QoS};
use tokio::task;
use tracing::{debug, error, info};

use crate::config::MqttConf;
use crate::health::HealthTracker;

/// Publishing half of an MQTT client.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish_json(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// Requests buffered while the broker is unreachable.
const REQUEST_QUEUE: usize = 10;

/// Never waits for queue space; a full queue means the broker is gone.
#[async_trait]
impl Publish for AsyncClient {
    async fn publish_json(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        match self.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => {
                Err(anyhow!("MQTT request queue full, dropped message for {topic}"))
            }
            Err(e) => Err(e).with_context(|| format!("failed to publish to {topic}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn transition(&self, transition: Transition) -> String {
        match transition {
            Transition::Started => format!("{}/appliances/started@v1", self.prefix),
            Transition::Stopped => format!("{}/appliances/stopped@v1", self.prefix),
        }
    }

    pub fn health(&self) -> String {
        format!("{}/daemon/health@v1", self.prefix)
    }
}

/// Creates the client and drives its event loop in the background.
pub fn connect(conf: &MqttConf, health: HealthTracker) -> AsyncClient {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_QUEUE);

    info!(host = %conf.host, port = conf.port, "connecting to MQTT broker");
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("MQTT connected");
                    health.mark_mqtt_connected();
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    health.mark_mqtt_disconnected();
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection error");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    client
}

/// Publishes every transition as JSON.
pub struct MqttSink<P> {
    client: P,
    topics: Topics,
}

impl<P: Publish> MqttSink<P> {
    pub fn new(client: P, topics: Topics) -> Self {
        Self { client, topics }
    }
}

#[async_trait]
impl<P: Publish> EventSink for MqttSink<P> {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn publish(&self, event: &ApplianceEvent) -> anyhow::Result<()> {
        let topic = self.topics.transition(event.transition);
        let payload = serde_json::to_vec(event).context("failed to serialize event")?;
        self.client.publish_json(&topic, payload).await?;
        debug!(%topic, ain = %event.ain, "published transition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerwatch::{Appliance, Metric};
    use powerwatch_devkit::MockMqttClient;
    use serde_json::Value;

    #[async_trait]
    impl Publish for MockMqttClient {
        async fn publish_json(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            self.publish(topic, QoS::AtLeastOnce, false, payload).await
        }
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast_instead_of_blocking() {
        let opts = MqttOptions::new("powerwatchd-test", "127.0.0.1", 1);
        // event loop never polled, so nothing leaves the queue
        let (client, _eventloop) = AsyncClient::new(opts, 2);

        let mut failures = 0;
        for i in 0..5 {
            let payload = format!("{{\"n\":{i}}}").into_bytes();
            let result = tokio::time::timeout(
                Duration::from_secs(1),
                client.publish_json("powerwatch/daemon/health@v1", payload),
            )
            .await
            .expect("publish blocked on a full queue");
            if result.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);

        // the disconnect request finds no room either
        assert!(client.try_disconnect().is_err());
    }

    #[test]
    fn topics_follow_prefix() {
        let topics = Topics::new("home/powerwatch/");
        assert_eq!(topics.transition(Transition::Started), "home/powerwatch/appliances/started@v1");
        assert_eq!(topics.transition(Transition::Stopped), "home/powerwatch/appliances/stopped@v1");
        assert_eq!(topics.health(), "home/powerwatch/daemon/health@v1");
    }

    #[tokio::test]
    async fn publishes_transition_json() {
        let client = MockMqttClient::new();
        let sink = MqttSink::new(client.clone(), Topics::new("powerwatch"));
        let washer = Appliance::new("11657 0240192", Metric::Power).with_name("Washer");

        sink.publish(&ApplianceEvent::new(Transition::Stopped, &washer, vec![5.0, 1.0]))
            .await
            .unwrap();

        let message: Value = client
            .last_json("powerwatch/appliances/stopped@v1")
            .unwrap()
            .unwrap();
        assert_eq!(message["ain"], "11657 0240192");
        assert_eq!(message["transition"], "stopped");
        assert_eq!(message["values"], serde_json::json!([5.0, 1.0]));
        assert!(client.messages_on("powerwatch/appliances/started@v1").is_empty());
    }

    #[tokio::test]
    async fn broker_failure_surfaces_as_error() {
        let client = MockMqttClient::new();
        client.set_offline(true);
        let sink = MqttSink::new(client, Topics::new("powerwatch"));
        let washer = Appliance::new("a1", Metric::Power);

        assert!(sink
            .publish(&ApplianceEvent::new(Transition::Started, &washer, vec![1.0]))
            .await
            .is_err());
    }
}
