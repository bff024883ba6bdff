//! Transition events and the capabilities that consume readings and events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::appliance::Appliance;
use crate::device::Metric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    Started,
    Stopped,
}

impl Transition {
    /// Short label used in metric labels and logs.
    pub fn label(self) -> &'static str {
        match self {
            Transition::Started => "start",
            Transition::Stopped => "end",
        }
    }
}

/// An appliance durably crossed one of its thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct ApplianceEvent {
    pub id: Uuid,
    pub transition: Transition,
    pub ain: String,
    pub name: String,
    pub metric: Metric,
    /// The trigger window that fired, oldest reading first.
    pub values: Vec<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ApplianceEvent {
    pub fn new(transition: Transition, appliance: &Appliance, values: Vec<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transition,
            ain: appliance.id().to_string(),
            name: appliance.display_name().to_string(),
            metric: appliance.metric(),
            values,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<ApplianceEvent>;
pub type EventStream = mpsc::UnboundedReceiver<ApplianceEvent>;

/// Channel carrying events from trigger actions to the dispatcher.
pub fn event_stream() -> (EventSender, EventStream) {
    mpsc::unbounded_channel()
}

/// Receives every raw reading, whatever the triggers decide.
pub trait ReadingSink: Send + Sync {
    fn record(&self, appliance: &Appliance, value: f64);
}

/// Receives transition events. Delivery is at-most-once.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &ApplianceEvent) -> anyhow::Result<()>;
}

/// Upper bound for a single sink delivery.
pub const SINK_TIMEOUT: Duration = Duration::from_secs(15);

/// Drains `events` into every sink until all senders are gone.
///
/// A failing sink is logged and skipped; the event is not retried.
pub async fn dispatch(events: EventStream, sinks: Vec<Arc<dyn EventSink>>) {
    dispatch_with_timeout(events, sinks, SINK_TIMEOUT).await
}

/// Like [`dispatch`], giving up on a sink after `limit`.
pub async fn dispatch_with_timeout(
    mut events: EventStream,
    sinks: Vec<Arc<dyn EventSink>>,
    limit: Duration,
) {
    while let Some(event) = events.recv().await {
        for sink in &sinks {
            match tokio::time::timeout(limit, sink.publish(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    sink = sink.name(),
                    ain = %event.ain,
                    transition = event.transition.label(),
                    error = %e,
                    "failed to deliver event"
                ),
                Err(_) => warn!(
                    sink = sink.name(),
                    ain = %event.ain,
                    transition = event.transition.label(),
                    timeout_ms = limit.as_millis() as u64,
                    "event delivery timed out"
                ),
            }
        }
    }
    debug!("event stream closed");
}
