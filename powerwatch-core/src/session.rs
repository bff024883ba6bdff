//! Router session handling.
//!
//! ```text
//!             fetch (no valid sid)                 response accepted
//!  Unauthenticated ─────────────────► handshake ─────────────────────► Authenticated
//!        ▲                               │                                   │
//!        │        AuthRejected           │        TransientFetch on a fetch  │
//!        └───────────────────────────────┘◄──────────────────────────────────┘
//! ```
//!
//! One [`SessionManager`] is shared by every appliance. The handshake runs
//! under an async mutex so at most one login is in flight.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::digest::Challenge;
use crate::error::DeviceError;

/// SID the router hands out while nobody is logged in.
pub const INVALID_SID: &str = "0000000000000000";

/// Timeout for every single HTTP request to the router.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and as whom to log in.
#[derive(Clone, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_base_url() -> String {
    "http://fritz.box".to_string()
}

impl fmt::Debug for DeviceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSettings")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// `login_sid.lua` response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "SessionInfo")]
pub struct SessionInfo {
    #[serde(rename = "SID")]
    pub sid: String,
    #[serde(rename = "Challenge", default)]
    pub challenge: String,
    #[serde(rename = "BlockTime", default)]
    pub block_time: u64,
}

impl SessionInfo {
    pub fn parse(xml: &str) -> Result<Self, DeviceError> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    pub fn is_valid(&self) -> bool {
        !self.sid.is_empty() && self.sid != INVALID_SID
    }
}

#[derive(Debug, Clone, Default)]
struct Session {
    sid: String,
    valid: bool,
}

pub struct SessionManager {
    http: reqwest::Client,
    base_url: String,
    username: String,
    secret: String,
    session: Mutex<Session>,
    logins: AtomicU64,
}

impl SessionManager {
    pub fn new(settings: &DeviceSettings) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            secret: settings.password.clone(),
            session: Mutex::new(Session::default()),
            logins: AtomicU64::new(0),
        })
    }

    /// Runs `op` with a valid session id, logging in first when needed.
    ///
    /// A [`DeviceError::TransientFetch`] from `op` drops the session and the
    /// login + `op` pair is retried exactly once.
    pub async fn authenticated_fetch<T, F, Fut>(&self, op: F) -> Result<T, DeviceError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let sid = self.session_id().await?;

        match op(sid.clone()).await {
            Err(err) if err.may_be_stale_session() => {
                debug!(error = %err, "request failed, re-authenticating once");
                self.invalidate(&sid).await;
                let sid = self.session_id().await?;
                op(sid).await
            }
            result => result,
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.lock().await.valid
    }

    /// Number of logins completed since start.
    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    /// Ends the router session, if any.
    pub async fn logout(&self) -> Result<(), DeviceError> {
        let mut session = self.session.lock().await;
        if !session.valid {
            return Ok(());
        }
        let sid = std::mem::take(&mut *session).sid;

        self.get("/login_sid.lua")
            .query(&[("version", "2"), ("logout", "1"), ("sid", sid.as_str())])
            .send()
            .await?
            .error_for_status()?;

        info!("logged out of router session");
        Ok(())
    }

    pub(crate) fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(format!("{}{}", self.base_url, path))
    }

    async fn session_id(&self) -> Result<String, DeviceError> {
        let mut session = self.session.lock().await;
        if session.valid {
            return Ok(session.sid.clone());
        }

        let sid = self.login(&session.sid).await?;
        *session = Session {
            sid: sid.clone(),
            valid: true,
        };
        Ok(sid)
    }

    async fn invalidate(&self, sid: &str) {
        let mut session = self.session.lock().await;
        // Another caller may already hold a fresh sid.
        if session.valid && session.sid == sid {
            *session = Session {
                sid: sid.to_string(),
                valid: false,
            };
        }
    }

    async fn login(&self, previous_sid: &str) -> Result<String, DeviceError> {
        let info = match previous_sid {
            "" => self.session_info(None).await?,
            sid => self.session_info(Some(("sid", sid))).await?,
        };
        if info.is_valid() {
            debug!("router confirmed existing session");
            self.logins.fetch_add(1, Ordering::Relaxed);
            return Ok(info.sid);
        }

        let challenge: Challenge = info.challenge.parse()?;
        let response = challenge.solve(&self.secret);

        let info = self
            .session_info(Some(("response", response.as_str())))
            .await?;
        if !info.is_valid() {
            warn!(
                username = %self.username,
                block_time_secs = info.block_time,
                "router rejected auth credentials"
            );
            return Err(DeviceError::AuthRejected {
                block_time_secs: info.block_time,
            });
        }

        self.logins.fetch_add(1, Ordering::Relaxed);
        info!(username = %self.username, "logged in to router");
        Ok(info.sid)
    }

    async fn session_info(&self, param: Option<(&str, &str)>) -> Result<SessionInfo, DeviceError> {
        let mut query = vec![("version", "2"), ("username", self.username.as_str())];
        query.extend(param);

        let body = self
            .get("/login_sid.lua")
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        SessionInfo::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_info() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<SessionInfo><SID>0000000000000000</SID><Challenge>2$10000$5A1711$2000$5A1722</Challenge><BlockTime>0</BlockTime><Rights></Rights><Users><User last="1">fritz1234</User></Users></SessionInfo>"#;

        let info = SessionInfo::parse(xml).unwrap();
        assert_eq!(info.sid, INVALID_SID);
        assert_eq!(info.challenge, "2$10000$5A1711$2000$5A1722");
        assert_eq!(info.block_time, 0);
        assert!(!info.is_valid());
    }

    #[test]
    fn valid_sid_marks_session_valid() {
        let xml = "<SessionInfo><SID>9f2a0c1d44e7b3a1</SID><Challenge>ab12cd34</Challenge><BlockTime>0</BlockTime></SessionInfo>";
        assert!(SessionInfo::parse(xml).unwrap().is_valid());
    }

    #[test]
    fn garbage_body_is_protocol_error() {
        let err = SessionInfo::parse("<html>503</html>").unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn settings_debug_hides_password() {
        let settings = DeviceSettings {
            base_url: default_base_url(),
            username: "fritz1234".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{settings:?}").contains("hunter2"));
    }
}
