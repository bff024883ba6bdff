//! powerwatchd configuration.
//!
//! One YAML file, path from `--config` / `POWERWATCH_CONFIG`. The router
//! password may instead come from `POWERWATCH_DEVICE_PASSWORD`, which wins
//! over the file.

use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use powerwatch::{Appliance, DeviceSettings, Metric, Transition, TriggerConfig};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::fs;

pub const PASSWORD_ENV: &str = "POWERWATCH_DEVICE_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub device: DeviceSettings,
    #[serde(default)]
    pub sampling: SamplingConf,
    #[serde(default)]
    pub http: HttpConf,
    pub mqtt: Option<MqttConf>,
    pub discord: Option<DiscordConf>,
    pub todoist: Option<TodoistConf>,
    /// Sampled in the order written.
    #[serde(deserialize_with = "ordered_map")]
    pub appliances: Vec<(String, ApplianceConf)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConf {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SamplingConf {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl SamplingConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConf {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8888))
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConf {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "powerwatchd".into()
}

fn default_topic_prefix() -> String {
    "powerwatch".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConf {
    pub webhook_url: String,
    #[serde(default = "default_discord_username")]
    pub username: String,
}

fn default_discord_username() -> String {
    "powerwatch".into()
}

#[derive(Clone, Deserialize)]
pub struct TodoistConf {
    pub access_token: String,
    pub project_id: String,
    #[serde(default = "default_todoist_url")]
    pub api_url: String,
}

fn default_todoist_url() -> String {
    "https://api.todoist.com/rest/v2/tasks".into()
}

impl fmt::Debug for TodoistConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TodoistConf")
            .field("access_token", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplianceConf {
    pub ain: String,
    pub name: Option<String>,
    #[serde(default)]
    pub metric: Metric,
    pub trigger: Option<TriggerConfig>,
    #[serde(default)]
    pub notify: NotifyMessages,
}

/// Per-appliance notification texts. A missing text means no notification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyMessages {
    pub discord_started: Option<String>,
    pub discord_stopped: Option<String>,
    pub todoist_started: Option<String>,
    pub todoist_stopped: Option<String>,
}

impl NotifyMessages {
    pub fn discord(&self, transition: Transition) -> Option<&str> {
        match transition {
            Transition::Started => self.discord_started.as_deref(),
            Transition::Stopped => self.discord_stopped.as_deref(),
        }
    }

    pub fn todoist(&self, transition: Transition) -> Option<&str> {
        match transition {
            Transition::Started => self.todoist_started.as_deref(),
            Transition::Stopped => self.todoist_stopped.as_deref(),
        }
    }
}

impl DaemonConfig {
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Replaces the file password when `password` is set and non-empty.
    pub fn with_password_override(mut self, password: Option<String>) -> Self {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.device.password = password;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.appliances.is_empty() {
            return Err(ConfigError::Invalid("no appliances configured".into()));
        }
        if self.sampling.interval_secs == 0 {
            return Err(ConfigError::Invalid("sampling.interval_secs must be > 0".into()));
        }

        for (key, appliance) in &self.appliances {
            if appliance.ain.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("appliance {key}: empty ain")));
            }
            if let Some(trigger) = &appliance.trigger {
                if !trigger.threshold_start.is_finite() || !trigger.threshold_end.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "appliance {key}: thresholds must be finite"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Core appliances, in configuration order.
    pub fn appliances(&self) -> Vec<Appliance> {
        self.appliances
            .iter()
            .map(|(_, conf)| {
                let mut appliance = Appliance::new(conf.ain.trim(), conf.metric);
                if let Some(trigger) = conf.trigger {
                    appliance = appliance.with_trigger(trigger);
                }
                match &conf.name {
                    Some(name) => appliance.with_name(name.clone()),
                    None => appliance,
                }
            })
            .collect()
    }

    /// Notification texts keyed by AIN.
    pub fn messages(&self) -> Vec<(String, NotifyMessages)> {
        self.appliances
            .iter()
            .map(|(_, conf)| (conf.ain.trim().to_string(), conf.notify.clone()))
            .collect()
    }
}

/// Loads the file at `path`, then applies `POWERWATCH_DEVICE_PASSWORD`.
pub async fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(DaemonConfig::parse(&text)?.with_password_override(std::env::var(PASSWORD_ENV).ok()))
}

fn ordered_map<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OrderedMap<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMap<T> {
        type Value = Vec<(String, T)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of appliances")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedMap(PhantomData))
}
