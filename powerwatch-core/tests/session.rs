//! Session and device client against the devkit router.

use powerwatch::{DeviceError, DeviceSettings, FritzBox};
use powerwatch_devkit::fake_router::{TEST_PASSWORD, TEST_USERNAME};
use powerwatch_devkit::{init_logging, FakeConfig, FakeFritzBox};

const WASHER: &str = "11657 0240192";

fn settings(router: &FakeFritzBox, password: &str) -> DeviceSettings {
    DeviceSettings {
        base_url: router.base_url(),
        username: TEST_USERNAME.to_string(),
        password: password.to_string(),
    }
}

async fn setup() -> (FakeFritzBox, FritzBox) {
    init_logging();
    let router = FakeFritzBox::start().await.unwrap();
    let device = FritzBox::new(&settings(&router, TEST_PASSWORD)).unwrap();
    (router, device)
}

#[tokio::test]
async fn logs_in_once_then_reuses_the_sid() {
    let (router, device) = setup().await;
    router.script(WASHER, "getswitchpower", &["12345"]);

    assert!(!device.session().is_authenticated().await);
    assert_eq!(device.power(WASHER).await.unwrap(), 12.345);

    let after_first = router.counters();
    assert_eq!(after_first.challenge_requests, 1);
    assert_eq!(after_first.login_attempts, 1);
    assert_eq!(after_first.commands, 1);

    assert_eq!(device.power(WASHER).await.unwrap(), 12.345);
    let after_second = router.counters();
    assert_eq!(after_second.challenge_requests, 1);
    assert_eq!(after_second.login_attempts, 1);
    assert_eq!(after_second.commands, 2);

    assert!(device.session().is_authenticated().await);
    assert_eq!(device.session().logins(), 1);
}

#[tokio::test]
async fn expired_session_is_renewed_transparently() {
    let (router, device) = setup().await;
    router.script(WASHER, "getswitchenergy", &["4711", "4712"]);

    assert_eq!(device.energy(WASHER).await.unwrap(), 4711.0);
    let first_sid = router.active_sid().unwrap();

    router.expire_session();
    assert_eq!(device.energy(WASHER).await.unwrap(), 4712.0);

    let counters = router.counters();
    assert_eq!(counters.unauthorized, 1);
    assert_eq!(counters.login_attempts, 2);
    assert_ne!(router.active_sid().unwrap(), first_sid);
}

#[tokio::test]
async fn wrong_password_is_rejected_with_block_time() {
    init_logging();
    let router = FakeFritzBox::start().await.unwrap();
    let device = FritzBox::new(&settings(&router, "not-the-password")).unwrap();

    let err = device.power(WASHER).await.unwrap_err();
    assert!(matches!(err, DeviceError::AuthRejected { block_time_secs: 8 }));
    assert!(err.is_fatal());

    let counters = router.counters();
    assert_eq!(counters.rejected_logins, 1);
    assert_eq!(counters.commands, 0);
    assert!(!device.session().is_authenticated().await);
}

#[tokio::test]
async fn server_errors_are_retried_exactly_once() {
    let (router, device) = setup().await;
    router.script(WASHER, "getswitchpower", &["2000"]);
    router.fail_next(2);

    let err = device.power(WASHER).await.unwrap_err();
    assert!(matches!(err, DeviceError::TransientFetch(_)));

    // The router still knew the sid, so the retry only re-checked it.
    let counters = router.counters();
    assert_eq!(counters.challenge_requests, 2);
    assert_eq!(counters.login_attempts, 1);

    assert_eq!(device.power(WASHER).await.unwrap(), 2.0);
}

#[tokio::test]
async fn inval_is_a_numeric_format_error_and_not_retried() {
    let (router, device) = setup().await;
    router.script(WASHER, "gettemperature", &["inval"]);

    let err = device.temperature(WASHER).await.unwrap_err();
    assert!(matches!(err, DeviceError::NumericFormat(ref body) if body == "inval"));
    assert_eq!(router.counters().commands, 1);
    assert_eq!(router.counters().challenge_requests, 1);
}

#[tokio::test]
async fn lists_switches_and_names() {
    let (router, device) = setup().await;
    router.add_switch(WASHER, "Washer");
    router.add_switch("087610000434", "Dryer");

    assert_eq!(device.list().await.unwrap(), vec![WASHER.to_string(), "087610000434".to_string()]);
    assert_eq!(device.name("087610000434").await.unwrap(), "Dryer");
    assert_eq!(router.counters().login_attempts, 1);
}

#[tokio::test]
async fn concurrent_reads_share_one_login() {
    let (router, device) = setup().await;
    router.script(WASHER, "getswitchpower", &["1000"]);

    let (a, b, c) = tokio::join!(device.power(WASHER), device.power(WASHER), device.power(WASHER));
    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1.0, 1.0, 1.0));
    assert_eq!(router.counters().login_attempts, 1);
}

#[tokio::test]
async fn logout_ends_the_router_session() {
    let (router, device) = setup().await;
    router.script(WASHER, "getswitchpower", &["0"]);
    device.power(WASHER).await.unwrap();

    device.logout().await.unwrap();
    assert_eq!(router.counters().logouts, 1);
    assert!(router.active_sid().is_none());
    assert!(!device.session().is_authenticated().await);

    // Nothing left to end.
    device.logout().await.unwrap();
    assert_eq!(router.counters().logouts, 1);
}

#[tokio::test]
async fn legacy_challenge_login() {
    init_logging();
    let router = FakeFritzBox::with_config(FakeConfig {
        challenge: "1234567z".to_string(),
        accepted_response: "1234567z-9e224a41eeefa284df7bb0f26c2913e2".to_string(),
        ..FakeConfig::default()
    })
    .await
    .unwrap();
    router.script(WASHER, "getswitchpower", &["7000"]);

    let device = FritzBox::new(&settings(&router, "äbc")).unwrap();
    assert_eq!(device.power(WASHER).await.unwrap(), 7.0);
    assert_eq!(router.counters().rejected_logins, 0);
}

#[tokio::test]
async fn malformed_challenge_fails_without_login_attempt() {
    init_logging();
    let router = FakeFritzBox::with_config(FakeConfig {
        challenge: "2$10000$5A17".to_string(),
        ..FakeConfig::default()
    })
    .await
    .unwrap();
    router.script(WASHER, "getswitchpower", &["7000"]);

    let device = FritzBox::new(&settings(&router, TEST_PASSWORD)).unwrap();
    let err = device.power(WASHER).await.unwrap_err();
    assert!(matches!(err, DeviceError::Protocol(_)), "unexpected {err:?}");

    let counters = router.counters();
    assert_eq!(counters.challenge_requests, 1);
    assert_eq!(counters.login_attempts, 0);
    assert_eq!(counters.commands, 0);
}

#[tokio::test]
async fn non_xml_login_page_is_a_protocol_error() {
    init_logging();
    let router = FakeFritzBox::with_config(FakeConfig {
        session_body: Some("<html><body>Service unavailable</body></html>".to_string()),
        ..FakeConfig::default()
    })
    .await
    .unwrap();

    let device = FritzBox::new(&settings(&router, TEST_PASSWORD)).unwrap();
    let err = device.power(WASHER).await.unwrap_err();
    assert!(matches!(err, DeviceError::Protocol(_)), "unexpected {err:?}");

    let counters = router.counters();
    assert_eq!(counters.challenge_requests, 1);
    assert_eq!(counters.login_attempts, 0);
}
