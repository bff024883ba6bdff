//! powerwatchd - appliance power monitoring daemon
//!
//! Polls the smart plugs behind the home router, exports every reading as
//! Prometheus metrics and announces appliance start/stop transitions over
//! MQTT, Discord and Todoist.

mod config;
mod health;
mod http;
mod mqtt;
mod notify;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use powerwatch::{dispatch, event_stream, ApplianceMonitor, EventSink, FritzBox, SamplingLoop};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, DaemonConfig};
use crate::health::{HealthSources, HealthTracker};
use crate::http::{AppState, API_KEY_ENV};
use crate::mqtt::{MqttSink, Topics};
use crate::notify::{DiscordNotifier, TodoistNotifier};
use crate::telemetry::Telemetry;

/// How long pending notifications may take to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "powerwatchd", version, about = "Appliance power monitoring daemon")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "POWERWATCH_CONFIG", default_value = "powerwatch.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Sample appliances and report transitions (default).
    Run,
    /// Print every switch the router knows, with its name.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("powerwatch=info,powerwatchd=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .await
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::List => list(config).await,
    }
}

async fn list(config: DaemonConfig) -> Result<()> {
    let device = FritzBox::new(&config.device).context("Failed to create router client")?;

    let ains = device.list().await.context("Failed to list switches")?;
    for ain in ains {
        let name = device.name(&ain).await.unwrap_or_default();
        println!("{ain}\t{name}");
    }

    if let Err(e) = device.logout().await {
        warn!(error = %e, "router logout failed");
    }
    Ok(())
}

async fn run(config: DaemonConfig) -> Result<()> {
    info!("powerwatchd starting");

    let device = Arc::new(FritzBox::new(&config.device).context("Failed to create router client")?);
    let telemetry = Telemetry::new().context("Failed to register metrics")?;
    let health_tracker = HealthTracker::new(config.mqtt.is_some());

    let (events, stream) = event_stream();
    let monitors: Vec<ApplianceMonitor> = config
        .appliances()
        .into_iter()
        .map(|appliance| ApplianceMonitor::new(Arc::new(appliance), events.clone()))
        .collect();
    drop(events);

    let sampler = SamplingLoop::new(
        device.clone(),
        monitors,
        Arc::new(telemetry.clone()),
        config.sampling.interval(),
    );
    let health_sources = HealthSources {
        stats: sampler.stats(),
        device: device.clone(),
        appliances: config.appliances.len(),
    };

    // event sinks
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(telemetry.clone())];

    let mqtt_client = config.mqtt.as_ref().map(|conf| {
        let client = mqtt::connect(conf, health_tracker.clone());
        let topics = Topics::new(&conf.topic_prefix);
        health_tracker.spawn_health_publisher(client.clone(), topics.health(), health_sources.clone());
        sinks.push(Arc::new(MqttSink::new(client.clone(), topics)));
        client
    });

    if let Some(conf) = config.discord.clone() {
        let notifier = DiscordNotifier::new(conf, config.messages())
            .context("Failed to create Discord notifier")?;
        sinks.push(Arc::new(notifier));
    }
    if let Some(conf) = config.todoist.clone() {
        let notifier = TodoistNotifier::new(conf, config.messages())
            .context("Failed to create Todoist notifier")?;
        sinks.push(Arc::new(notifier));
    }

    info!(sinks = sinks.len(), "event dispatcher started");
    let dispatcher = tokio::spawn(dispatch(stream, sinks));

    // HTTP
    let app_state = AppState {
        telemetry,
        health_tracker,
        health_sources,
        api_key: std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.is_empty())
            .map(Arc::from),
    };
    if app_state.api_key.is_none() {
        warn!("{API_KEY_ENV} not set - HTTP API is unauthenticated");
    }

    let listener = TcpListener::bind(config.http.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.http.listen))?;
    info!("listening on http://{}", config.http.listen);

    let app = http::build_router(app_state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server stopped");
        }
    });

    let result = sampler.run(shutdown_signal()).await;
    if let Err(e) = &result {
        error!(error = %e, "sampling stopped");
    }

    // release external connections
    if tokio::time::timeout(DRAIN_TIMEOUT, dispatcher).await.is_err() {
        warn!("pending notifications dropped on shutdown");
    }
    if let Err(e) = device.logout().await {
        warn!(error = %e, "router logout failed");
    }
    if let Some(client) = mqtt_client {
        if let Err(e) = client.try_disconnect() {
            warn!(error = %e, "MQTT disconnect failed");
        }
    }

    result.context("Sampling loop failed")?;
    info!("powerwatchd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
