//! Prometheus metrics and the last reading of every appliance.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use powerwatch::{Appliance, ApplianceEvent, EventSink, Metric, ReadingSink};
use prometheus::{GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

type ReadingTable = Arc<Mutex<BTreeMap<String, LastReading>>>;

/// Readings older than this are reported as stale.
const STALE_AFTER: Duration = Duration::seconds(90);

#[derive(Debug, Clone)]
pub struct LastReading {
    pub ain: String,
    pub name: String,
    pub metric: Metric,
    pub value: f64,
    pub at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct ReadingView {
    pub ain: String,
    pub name: String,
    pub metric: Metric,
    pub value: f64,
    pub at: String,
    pub stale: bool,
    pub stale_for_seconds: i64,
}

pub fn to_view(reading: &LastReading, now: OffsetDateTime) -> ReadingView {
    let age = now - reading.at;
    ReadingView {
        ain: reading.ain.clone(),
        name: reading.name.clone(),
        metric: reading.metric,
        value: reading.value,
        at: reading.at.format(&Rfc3339).unwrap_or_default(),
        stale: age > STALE_AFTER,
        stale_for_seconds: age.whole_seconds().max(0),
    }
}

#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    readings: GaugeVec,
    info: GaugeVec,
    transitions: IntCounterVec,
    last: ReadingTable,
}

impl Telemetry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let readings = GaugeVec::new(
            Opts::new(
                "powerwatch_appliance_reading",
                "Last reading per appliance, in the metric's unit",
            ),
            &["ain", "metric"],
        )?;
        let info = GaugeVec::new(
            Opts::new("powerwatch_appliance_info", "Display name of every appliance"),
            &["ain", "name"],
        )?;
        let transitions = IntCounterVec::new(
            Opts::new(
                "powerwatch_appliance_transitions_total",
                "Detected appliance start and end transitions",
            ),
            &["ain", "event"],
        )?;

        registry.register(Box::new(readings.clone()))?;
        registry.register(Box::new(info.clone()))?;
        registry.register(Box::new(transitions.clone()))?;

        Ok(Self {
            registry,
            readings,
            info,
            transitions,
            last: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = String::new();
        TextEncoder::new().encode_utf8(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn last_readings(&self) -> Vec<ReadingView> {
        let now = OffsetDateTime::now_utc();
        self.last.lock().values().map(|r| to_view(r, now)).collect()
    }
}

impl ReadingSink for Telemetry {
    fn record(&self, appliance: &Appliance, value: f64) {
        let ain = appliance.id();
        let name = appliance.display_name();
        let metric = appliance.metric();
        self.readings.with_label_values(&[ain, metric.name()]).set(value);

        let previous = self.last.lock().insert(
            ain.to_string(),
            LastReading {
                ain: ain.to_string(),
                name: name.to_string(),
                metric,
                value,
                at: OffsetDateTime::now_utc(),
            },
        );

        // a resolved name replaces the AIN placeholder series
        if let Some(previous) = previous.filter(|p| p.name != name) {
            let _ = self.info.remove_label_values(&[ain, previous.name.as_str()]);
        }
        self.info.with_label_values(&[ain, name]).set(1.0);
    }
}

#[async_trait]
impl EventSink for Telemetry {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn publish(&self, event: &ApplianceEvent) -> anyhow::Result<()> {
        self.transitions
            .with_label_values(&[event.ain.as_str(), event.transition.label()])
            .inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powerwatch::Transition;

    #[tokio::test]
    async fn renders_readings_and_transitions() {
        let telemetry = Telemetry::new().unwrap();
        let washer = Appliance::new("11657 0240192", Metric::Power).with_name("Washer");

        telemetry.record(&washer, 12.5);
        telemetry
            .publish(&ApplianceEvent::new(Transition::Started, &washer, vec![0.0, 12.5]))
            .await
            .unwrap();

        let text = telemetry.render().unwrap();
        assert!(text.contains(
            r#"powerwatch_appliance_reading{ain="11657 0240192",metric="power"} 12.5"#
        ));
        assert!(text.contains(r#"powerwatch_appliance_info{ain="11657 0240192",name="Washer"} 1"#));
        assert!(text.contains(
            r#"powerwatch_appliance_transitions_total{ain="11657 0240192",event="start"} 1"#
        ));
    }

    #[test]
    fn keeps_only_the_latest_reading() {
        let telemetry = Telemetry::new().unwrap();
        let dryer = Appliance::new("087610000434", Metric::Temperature);

        telemetry.record(&dryer, 21.5);
        telemetry.record(&dryer, 22.0);

        let views = telemetry.last_readings();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].value, 22.0);
        assert_eq!(views[0].name, "087610000434");
        assert!(!views[0].stale);
    }

    #[test]
    fn resolved_name_replaces_placeholder_series() {
        let telemetry = Telemetry::new().unwrap();
        let washer = Appliance::new("11657 0240192", Metric::Power);

        telemetry.record(&washer, 3.0);
        washer.resolve_name("Washer".to_string());
        telemetry.record(&washer, 4.0);

        let text = telemetry.render().unwrap();
        assert!(text.contains(r#"powerwatch_appliance_info{ain="11657 0240192",name="Washer"} 1"#));
        assert!(!text.contains(r#"name="11657 0240192""#));
        assert_eq!(text.matches("powerwatch_appliance_reading{").count(), 1);
        assert!(text.contains(r#"powerwatch_appliance_reading{ain="11657 0240192",metric="power"} 4"#));
    }

    #[test]
    fn old_reading_is_stale() {
        let now = OffsetDateTime::now_utc();
        let reading = LastReading {
            ain: "a1".into(),
            name: "Fridge".into(),
            metric: Metric::Power,
            value: 80.0,
            at: now - Duration::seconds(120),
        };

        let view = to_view(&reading, now);
        assert!(view.stale);
        assert_eq!(view.stale_for_seconds, 120);
    }
}
