use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use powerwatch::{FritzBox, LoopStats, StatsSnapshot};
use serde::Serialize;
use tokio::task;
use tracing::{debug, warn};

use crate::mqtt::Publish;

const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttStatus {
    Disabled,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Serialize)]
pub struct DaemonHealth {
    pub uptime_seconds: u64,
    pub appliances: usize,
    pub sampling: StatsSnapshot,
    pub router_logins: u64,
    pub mqtt_status: MqttStatus,
    pub mqtt_reconnects: u32,
}

/// What the health report is computed from.
#[derive(Clone)]
pub struct HealthSources {
    pub stats: Arc<LoopStats>,
    pub device: Arc<FritzBox>,
    pub appliances: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<MqttStatus>>,
}

impl HealthTracker {
    pub fn new(mqtt_enabled: bool) -> Self {
        let status = if mqtt_enabled {
            MqttStatus::Connecting
        } else {
            MqttStatus::Disabled
        };

        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new(status)),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = MqttStatus::Connected;
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = MqttStatus::Disconnected;
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = MqttStatus::Reconnecting;
    }

    pub fn report(&self, sources: &HealthSources) -> DaemonHealth {
        DaemonHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            appliances: sources.appliances,
            sampling: sources.stats.snapshot(),
            router_logins: sources.device.session().logins(),
            mqtt_status: *self.mqtt_status.lock(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publishes the health report to `topic` every 30 s.
    pub fn spawn_health_publisher<P>(&self, publisher: P, topic: String, sources: HealthSources)
    where
        P: Publish + 'static,
    {
        let tracker = self.clone();

        task::spawn(async move {
            let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = tracker.publish_once(&publisher, &topic, &sources).await {
                    warn!(error = %e, "failed to publish daemon health");
                }
            }
        });
    }

    async fn publish_once<P: Publish>(
        &self,
        publisher: &P,
        topic: &str,
        sources: &HealthSources,
    ) -> anyhow::Result<()> {
        let health = self.report(sources);
        publisher
            .publish_json(topic, serde_json::to_vec(&health)?)
            .await?;
        debug!(
            uptime_seconds = health.uptime_seconds,
            ticks = health.sampling.ticks,
            "published daemon health"
        );
        Ok(())
    }
}
