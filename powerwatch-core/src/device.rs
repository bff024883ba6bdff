//! Smart-plug readings through the router's `homeautoswitch.lua` web service.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DeviceError;
use crate::session::{DeviceSettings, SessionManager};

/// What a reading measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Watts (device reports mW).
    #[default]
    Power,
    /// Watt hours since the counter was reset.
    Energy,
    /// Degrees Celsius (device reports 0.1 °C steps).
    Temperature,
}

impl Metric {
    pub fn command(self) -> &'static str {
        match self {
            Metric::Power => "getswitchpower",
            Metric::Energy => "getswitchenergy",
            Metric::Temperature => "gettemperature",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Metric::Power => "power",
            Metric::Energy => "energy",
            Metric::Temperature => "temperature",
        }
    }

    /// Converts the raw device integer into the unit above.
    pub fn scale(self, raw: f64) -> f64 {
        match self {
            Metric::Power => raw / 1000.0,
            Metric::Energy => raw,
            Metric::Temperature => raw / 10.0,
        }
    }

    /// Parses a raw response body into a scaled reading.
    pub fn parse(self, body: &str) -> Result<f64, DeviceError> {
        let text = body.trim();
        match text.parse::<f64>() {
            Ok(raw) if raw.is_finite() => Ok(self.scale(raw)),
            _ => Err(DeviceError::NumericFormat(text.to_string())),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The router, as seen by everything that wants readings.
pub struct FritzBox {
    session: SessionManager,
}

impl FritzBox {
    pub fn new(settings: &DeviceSettings) -> Result<Self, DeviceError> {
        Ok(Self {
            session: SessionManager::new(settings)?,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// One scaled reading of `metric` from the plug `ain`.
    pub async fn read(&self, ain: &str, metric: Metric) -> Result<f64, DeviceError> {
        let body = self
            .session
            .authenticated_fetch(|sid| self.switch_command(sid, Some(ain), metric.command()))
            .await?;

        let value = metric.parse(&body)?;
        debug!(ain, %metric, value, "reading");
        Ok(value)
    }

    pub async fn power(&self, ain: &str) -> Result<f64, DeviceError> {
        self.read(ain, Metric::Power).await
    }

    pub async fn energy(&self, ain: &str) -> Result<f64, DeviceError> {
        self.read(ain, Metric::Energy).await
    }

    pub async fn temperature(&self, ain: &str) -> Result<f64, DeviceError> {
        self.read(ain, Metric::Temperature).await
    }

    /// Display name configured on the router for `ain`.
    pub async fn name(&self, ain: &str) -> Result<String, DeviceError> {
        let body = self
            .session
            .authenticated_fetch(|sid| self.switch_command(sid, Some(ain), "getswitchname"))
            .await?;
        Ok(body.trim().to_string())
    }

    /// AINs of every switch known to the router.
    pub async fn list(&self) -> Result<Vec<String>, DeviceError> {
        let body = self
            .session
            .authenticated_fetch(|sid| self.switch_command(sid, None, "getswitchlist"))
            .await?;

        Ok(body
            .trim()
            .split(',')
            .map(str::trim)
            .filter(|ain| !ain.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn logout(&self) -> Result<(), DeviceError> {
        self.session.logout().await
    }

    async fn switch_command(
        &self,
        sid: String,
        ain: Option<&str>,
        command: &str,
    ) -> Result<String, DeviceError> {
        let mut query = vec![("sid", sid.as_str()), ("switchcmd", command)];
        if let Some(ain) = ain {
            query.push(("ain", ain));
        }

        let body = self
            .session
            .get("/webservices/homeautoswitch.lua")
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}
