/*!
In-memory MQTT publisher

Records every publish so tests can assert on topics and JSON payloads
without a broker. Mirrors the publish half of `rumqttc::AsyncClient`.
*/

use anyhow::Result;
use rumqttc::QoS;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Default)]
pub struct MockMqttClient {
    published: Arc<Mutex<Vec<MockMessage>>>,
    offline: Arc<Mutex<bool>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        if *self.offline.lock().unwrap() {
            anyhow::bail!("mock broker offline");
        }

        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        log::debug!("[mock] published to {}: {} bytes", message.topic, message.payload.len());
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    /// Makes every following publish fail until set back.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Last payload on `topic`, parsed as JSON.
    pub fn last_json<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.messages_on(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }
}
