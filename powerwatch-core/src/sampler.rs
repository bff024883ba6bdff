//! Periodic sampling of every configured appliance.
//!
//! Each tick reads the appliances one after another through the shared
//! [`FritzBox`], hands every reading to the [`ReadingSink`] and then to
//! the appliance's detectors. A failed reading is logged and skipped;
//! only a rejected login ends the loop.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::appliance::{Appliance, ApplianceMonitor};
use crate::device::FritzBox;
use crate::error::DeviceError;
use crate::events::ReadingSink;

/// Counters shared with whoever reports on the loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    ticks: AtomicU64,
    readings: AtomicU64,
    failures: AtomicU64,
    last_tick: Mutex<Option<OffsetDateTime>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub readings: u64,
    pub failures: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_tick: Option<OffsetDateTime>,
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            readings: self.readings.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_tick: *self.last_tick.lock(),
        }
    }

    fn record(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.readings.fetch_add(report.readings as u64, Ordering::Relaxed);
        self.failures.fetch_add(report.skipped as u64, Ordering::Relaxed);
        *self.last_tick.lock() = Some(OffsetDateTime::now_utc());
    }
}

/// Outcome of one pass over all appliances.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub readings: usize,
    pub skipped: usize,
    pub transitions: usize,
}

pub struct SamplingLoop {
    device: Arc<FritzBox>,
    monitors: Vec<ApplianceMonitor>,
    readings: Arc<dyn ReadingSink>,
    interval: Duration,
    stats: Arc<LoopStats>,
}

impl SamplingLoop {
    pub fn new(
        device: Arc<FritzBox>,
        monitors: Vec<ApplianceMonitor>,
        readings: Arc<dyn ReadingSink>,
        interval: Duration,
    ) -> Self {
        Self {
            device,
            monitors,
            readings,
            interval,
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.stats)
    }

    pub fn appliances(&self) -> impl Iterator<Item = &Arc<Appliance>> + '_ {
        self.monitors.iter().map(ApplianceMonitor::appliance)
    }

    /// Samples every appliance once, in configuration order.
    pub async fn tick(&mut self) -> Result<TickReport, DeviceError> {
        let mut report = TickReport::default();

        for monitor in &mut self.monitors {
            let appliance = Arc::clone(monitor.appliance());
            if !appliance.has_name() {
                resolve_name(&self.device, &appliance).await?;
            }

            match self.device.read(appliance.id(), appliance.metric()).await {
                Ok(value) => {
                    info!(
                        ain = appliance.id(),
                        name = appliance.display_name(),
                        metric = %appliance.metric(),
                        value,
                        "reading"
                    );
                    self.readings.record(&appliance, value);
                    report.transitions += monitor.submit(value);
                    report.readings += 1;
                }
                Err(err) if err.is_fatal() => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                Err(err) => {
                    warn!(ain = appliance.id(), error = %err, "reading skipped");
                    report.skipped += 1;
                }
            }
        }

        self.stats.record(&report);
        Ok(report)
    }

    /// Ticks every `interval` until `shutdown` resolves or a tick fails fatally.
    ///
    /// A tick in progress always completes before shutdown is observed.
    pub async fn run<S>(mut self, shutdown: S) -> Result<(), DeviceError>
    where
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            appliances = self.monitors.len(),
            interval_ms = self.interval.as_millis() as u64,
            "sampling loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("sampling loop stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let report = self.tick().await?;
                    debug!(?report, "tick complete");
                }
            }
        }
    }
}

async fn resolve_name(device: &FritzBox, appliance: &Appliance) -> Result<(), DeviceError> {
    match device.name(appliance.id()).await {
        Ok(name) if !name.is_empty() => {
            debug!(ain = appliance.id(), %name, "resolved appliance name");
            appliance.resolve_name(name);
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            debug!(ain = appliance.id(), error = %err, "name lookup failed, keeping AIN");
            Ok(())
        }
    }
}
