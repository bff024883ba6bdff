//! Appliances and their start/stop detectors.

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use serde::Deserialize;
use tracing::{info, warn};

use crate::device::Metric;
use crate::events::{ApplianceEvent, EventSender, Transition};
use crate::trigger::HysteresisTrigger;

/// Window and thresholds for detecting start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TriggerConfig {
    pub window_size: NonZeroUsize,
    /// Started once readings stay above this.
    pub threshold_start: f64,
    /// Stopped once readings stay below this.
    pub threshold_end: f64,
}

/// A plug behind the router. Only the display name may change after
/// construction, and only once.
#[derive(Debug)]
pub struct Appliance {
    id: String,
    name: OnceLock<String>,
    metric: Metric,
    trigger: Option<TriggerConfig>,
}

impl Appliance {
    pub fn new(id: impl Into<String>, metric: Metric) -> Self {
        Self {
            id: id.into(),
            name: OnceLock::new(),
            metric,
            trigger: None,
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.resolve_name(name.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// The AIN.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolved name, or the AIN until a name is known.
    pub fn display_name(&self) -> &str {
        self.name.get().map(String::as_str).unwrap_or(&self.id)
    }

    pub fn has_name(&self) -> bool {
        self.name.get().is_some()
    }

    /// Sets the name unless one is already known.
    pub fn resolve_name(&self, name: String) {
        let _ = self.name.set(name);
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn trigger(&self) -> Option<&TriggerConfig> {
        self.trigger.as_ref()
    }
}

type Predicate = Box<dyn Fn(f64) -> bool + Send>;
type Action = Box<dyn FnMut(Vec<f64>) + Send>;

/// Start and stop detectors of one appliance, fed in reading order.
pub struct ApplianceMonitor {
    appliance: Arc<Appliance>,
    triggers: Vec<HysteresisTrigger<Predicate, Action>>,
}

impl ApplianceMonitor {
    /// Builds the detectors; an appliance without trigger config is only sampled.
    pub fn new(appliance: Arc<Appliance>, events: EventSender) -> Self {
        let triggers = match appliance.trigger().copied() {
            Some(cfg) => {
                let start = cfg.threshold_start;
                let end = cfg.threshold_end;
                let above: Predicate = Box::new(move |v: f64| v > start);
                let below: Predicate = Box::new(move |v: f64| v < end);
                vec![
                    detector(&appliance, cfg.window_size, Transition::Started, above, events.clone()),
                    detector(&appliance, cfg.window_size, Transition::Stopped, below, events),
                ]
            }
            None => Vec::new(),
        };

        Self { appliance, triggers }
    }

    pub fn appliance(&self) -> &Arc<Appliance> {
        &self.appliance
    }

    /// Feeds one reading to every detector; returns how many fired.
    pub fn submit(&mut self, value: f64) -> usize {
        self.triggers
            .iter_mut()
            .map(|trigger| trigger.add(value))
            .filter(|fired| *fired)
            .count()
    }
}

fn detector(
    appliance: &Arc<Appliance>,
    window_size: NonZeroUsize,
    transition: Transition,
    predicate: Predicate,
    events: EventSender,
) -> HysteresisTrigger<Predicate, Action> {
    let appliance = Arc::clone(appliance);
    let action: Action = Box::new(move |values| {
        info!(
            ain = appliance.id(),
            name = appliance.display_name(),
            transition = transition.label(),
            ?values,
            "appliance transition"
        );
        let event = ApplianceEvent::new(transition, &appliance, values);
        if events.send(event).is_err() {
            warn!(ain = appliance.id(), "event stream closed, transition dropped");
        }
    });

    HysteresisTrigger::new(window_size, predicate, action)
}
