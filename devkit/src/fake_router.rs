/*!
Fake router speaking `login_sid.lua` and `homeautoswitch.lua`

Runs an axum server on an ephemeral local port. The challenge and the
response it accepts are fixed up front, so tests need no digest code of
their own. Every request is counted so tests can assert how many
handshakes a client performed.
*/

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TEST_USERNAME: &str = "fritz1234";
pub const TEST_PASSWORD: &str = "1example!";
/// Versioned challenge whose solution for [`TEST_PASSWORD`] is [`TEST_RESPONSE`].
pub const TEST_CHALLENGE: &str = "2$10000$5A1711$2000$5A1722";
pub const TEST_RESPONSE: &str =
    "5A1722$1798a1672bca7c6463d6b245f82b53703b0f50813401b03e4045a5861e689adb";

const INVALID_SID: &str = "0000000000000000";

/// Request counters, snapshotted by [`FakeFritzBox::counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    /// `login_sid.lua` calls without a response (challenge fetch or sid check).
    pub challenge_requests: usize,
    pub login_attempts: usize,
    pub rejected_logins: usize,
    /// Accepted `homeautoswitch.lua` calls.
    pub commands: usize,
    /// `homeautoswitch.lua` calls refused for an unknown sid.
    pub unauthorized: usize,
    pub logouts: usize,
}

#[derive(Debug, Clone)]
pub struct FakeConfig {
    pub username: String,
    pub challenge: String,
    pub accepted_response: String,
    /// Reported in `BlockTime` when a response is rejected.
    pub block_time: u64,
    /// Served verbatim instead of SessionInfo XML for challenge requests.
    pub session_body: Option<String>,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            username: TEST_USERNAME.to_string(),
            challenge: TEST_CHALLENGE.to_string(),
            accepted_response: TEST_RESPONSE.to_string(),
            block_time: 8,
            session_body: None,
        }
    }
}

#[derive(Default)]
struct RouterState {
    config: FakeConfig,
    next_sid: u64,
    active_sid: Option<String>,
    counters: Counters,
    /// Bodies per `(ain, switchcmd)`; the last one repeats forever.
    bodies: HashMap<(String, String), VecDeque<String>>,
    switches: Vec<(String, String)>,
    failures: usize,
}

type SharedRouter = Arc<Mutex<RouterState>>;

pub struct FakeFritzBox {
    addr: SocketAddr,
    state: SharedRouter,
    server: JoinHandle<()>,
}

impl FakeFritzBox {
    /// Starts a router that accepts [`TEST_USERNAME`] / [`TEST_PASSWORD`].
    pub async fn start() -> anyhow::Result<Self> {
        Self::with_config(FakeConfig::default()).await
    }

    pub async fn with_config(config: FakeConfig) -> anyhow::Result<Self> {
        let state: SharedRouter = Arc::new(Mutex::new(RouterState {
            config,
            next_sid: 0x5e55_1000_0000_0001,
            ..RouterState::default()
        }));

        let app = Router::new()
            .route("/login_sid.lua", get(login_sid))
            .route("/webservices/homeautoswitch.lua", get(homeautoswitch))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("fake router stopped: {}", e);
            }
        });

        log::debug!("fake router listening on {}", addr);
        Ok(Self { addr, state, server })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Registers a switch for `getswitchlist` and `getswitchname`.
    pub fn add_switch(&self, ain: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .switches
            .push((ain.to_string(), name.to_string()));
    }

    /// Scripts the bodies returned for `command` on `ain`, in order.
    pub fn script(&self, ain: &str, command: &str, bodies: &[&str]) {
        self.state.lock().unwrap().bodies.insert(
            (ain.to_string(), command.to_string()),
            bodies.iter().map(|b| format!("{}\n", b)).collect(),
        );
    }

    /// Forgets the active session, as the router does after its idle timeout.
    pub fn expire_session(&self) {
        self.state.lock().unwrap().active_sid = None;
    }

    /// Answers the next `n` authorized commands with HTTP 500.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().failures = n;
    }

    pub fn active_sid(&self) -> Option<String> {
        self.state.lock().unwrap().active_sid.clone()
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().unwrap().counters.clone()
    }
}

impl Drop for FakeFritzBox {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn session_info(sid: &str, challenge: &str, block_time: u64) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <SessionInfo><SID>{}</SID><Challenge>{}</Challenge><BlockTime>{}</BlockTime>\
         <Rights></Rights><Users><User last=\"1\">{}</User></Users></SessionInfo>",
        sid, challenge, block_time, TEST_USERNAME
    );
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

async fn login_sid(
    State(state): State<SharedRouter>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();
    let challenge = state.config.challenge.clone();
    let sid_param = params.get("sid").map(String::as_str);

    if params.get("logout").map(String::as_str) == Some("1") {
        if sid_param.is_some() && sid_param == state.active_sid.as_deref() {
            state.active_sid = None;
            state.counters.logouts += 1;
        }
        return session_info(INVALID_SID, &challenge, 0);
    }

    if let Some(response) = params.get("response") {
        state.counters.login_attempts += 1;
        let user_ok = params.get("username") == Some(&state.config.username);
        if user_ok && *response == state.config.accepted_response {
            let sid = format!("{:016x}", state.next_sid);
            state.next_sid += 1;
            state.active_sid = Some(sid.clone());
            log::info!("fake router issued sid {}", sid);
            return session_info(&sid, &challenge, 0);
        }

        state.counters.rejected_logins += 1;
        let block_time = state.config.block_time;
        return session_info(INVALID_SID, &challenge, block_time);
    }

    state.counters.challenge_requests += 1;
    if let Some(body) = state.config.session_body.clone() {
        return ([(header::CONTENT_TYPE, "text/html")], body).into_response();
    }
    match (&state.active_sid, sid_param) {
        (Some(active), Some(sid)) if active == sid => session_info(sid, &challenge, 0),
        _ => session_info(INVALID_SID, &challenge, 0),
    }
}

async fn homeautoswitch(
    State(state): State<SharedRouter>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut state = state.lock().unwrap();

    let sid = params.get("sid").map(String::as_str);
    if sid.is_none() || sid != state.active_sid.as_deref() {
        state.counters.unauthorized += 1;
        return (StatusCode::FORBIDDEN, "403 Forbidden").into_response();
    }

    if state.failures > 0 {
        state.failures -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, "500").into_response();
    }

    state.counters.commands += 1;
    let command = params.get("switchcmd").cloned().unwrap_or_default();
    let ain = params.get("ain").cloned().unwrap_or_default();

    let body = match command.as_str() {
        "getswitchlist" => {
            let ains: Vec<&str> = state.switches.iter().map(|(ain, _)| ain.as_str()).collect();
            format!("{}\n", ains.join(","))
        }
        "getswitchname" => state
            .switches
            .iter()
            .find(|(known, _)| *known == ain)
            .map(|(_, name)| format!("{}\n", name))
            .unwrap_or_else(|| "\n".to_string()),
        _ => match state.bodies.get_mut(&(ain.clone(), command.clone())) {
            Some(bodies) if bodies.len() > 1 => bodies.pop_front().unwrap_or_default(),
            Some(bodies) => bodies.front().cloned().unwrap_or_default(),
            None => "inval\n".to_string(),
        },
    };

    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(url: String) -> (u16, String) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    #[tokio::test]
    async fn hands_out_sid_for_the_accepted_response() {
        let router = FakeFritzBox::start().await.unwrap();
        let base = router.base_url();

        let (_, body) = get(format!("{}/login_sid.lua?version=2&username={}", base, TEST_USERNAME)).await;
        assert!(body.contains(TEST_CHALLENGE));
        assert!(body.contains(INVALID_SID));

        let (_, body) = get(format!(
            "{}/login_sid.lua?version=2&username={}&response={}",
            base, TEST_USERNAME, TEST_RESPONSE
        ))
        .await;
        let sid = router.active_sid().unwrap();
        assert!(body.contains(&sid));
        assert_eq!(router.counters().login_attempts, 1);
    }

    #[tokio::test]
    async fn rejects_wrong_response_with_block_time() {
        let router = FakeFritzBox::start().await.unwrap();
        let (_, body) = get(format!(
            "{}/login_sid.lua?version=2&username={}&response=5A1722$00",
            router.base_url(),
            TEST_USERNAME
        ))
        .await;

        assert!(body.contains("<BlockTime>8</BlockTime>"));
        assert_eq!(router.counters().rejected_logins, 1);
        assert!(router.active_sid().is_none());
    }

    #[tokio::test]
    async fn commands_need_the_active_sid() {
        let router = FakeFritzBox::start().await.unwrap();
        let (status, _) = get(format!(
            "{}/webservices/homeautoswitch.lua?sid=deadbeefdeadbeef&switchcmd=getswitchlist",
            router.base_url()
        ))
        .await;

        assert_eq!(status, 403);
        assert_eq!(router.counters().unauthorized, 1);
    }
}
