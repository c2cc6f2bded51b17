use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::post;
use axum::{Form, Router};
use serde_json::json;

use cloud_client::{hash_password, CloudClient, CloudConfig, CloudError, TokenCache};

const USERNAME: &str = "mvolli";
const PASSWORD: &str = "123456";
const SERIAL: &str = "0PVPH6ZR23QT01AX";

#[test]
fn password_hash_matches_vendor_algorithm() {
    // MD5("123456") = e10adc3949ba59abbe56e057f20f883e; the '0' at even
    // indices 2 and 26 must flip to 'c', the '0' at odd index 21 must not.
    assert_eq!(hash_password(PASSWORD), "e1cadc3949ba59abbe56e057f2cf883e");
    assert_eq!(hash_password(PASSWORD), hash_password(PASSWORD));
}

#[tokio::test]
async fn test_connection_without_credentials_makes_no_network_call() {
    // An unroutable server would hang or error if the client tried to talk
    // to it; missing credentials must short-circuit first.
    let mut config = CloudConfig::default();
    config.server_url = "http://192.0.2.1:9/".to_string();
    config.timeout = Duration::from_millis(100);
    let mut client = CloudClient::new(config).expect("client");
    assert!(!client.test_connection().await);
}

#[tokio::test]
async fn login_discovery_and_status_happy_path() {
    let mock = Mock::default();
    let addr = serve(mock.clone()).await;
    let mut client = client_for(addr, None);

    let device = client.discover_device().await.expect("discover");
    assert_eq!(device.plant_id, "98765");
    assert_eq!(device.device_serial, SERIAL);

    let raw = client.fetch_status().await.expect("status");
    assert_eq!(raw.get("soc").and_then(|v| v.as_str()), Some("76.5"));
    assert_eq!(raw.get("chargePower").and_then(|v| v.as_str()), Some("120"));
    assert_eq!(mock.login_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_credentials_surface_the_vendor_message() {
    let mock = Mock::default();
    let addr = serve(mock.clone()).await;

    let mut config = CloudConfig::default();
    config.server_url = format!("http://{addr}/");
    config.username = USERNAME.to_string();
    config.password = "wrong".to_string();
    let mut client = CloudClient::new(config).expect("client");

    match client.login().await {
        Err(CloudError::Auth(message)) => assert!(message.contains("password")),
        other => panic!("expected auth error, got {other:?}"),
    }
    assert!(!client.test_connection().await);
}

#[tokio::test]
async fn empty_plant_list_is_a_typed_error() {
    let mock = Mock::default();
    mock.no_plants.store(true, Ordering::SeqCst);
    let addr = serve(mock.clone()).await;
    let mut client = client_for(addr, None);

    match client.discover_device().await {
        Err(CloudError::NoPlants) => {}
        other => panic!("expected NoPlants, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_session_triggers_exactly_one_relogin() {
    let mock = Mock::default();
    // Serve the login page on the status endpoint until a second login
    // happened, then answer normally.
    mock.expire_until_login.store(2, Ordering::SeqCst);
    let addr = serve(mock.clone()).await;
    let mut client = client_for(addr, None);

    let raw = client.fetch_status().await.expect("status after relogin");
    assert_eq!(raw.get("soc").and_then(|v| v.as_str()), Some("76.5"));
    assert_eq!(mock.login_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_expiry_fails_after_one_retry() {
    let mock = Mock::default();
    mock.expire_until_login.store(usize::MAX, Ordering::SeqCst);
    let addr = serve(mock.clone()).await;
    let mut client = client_for(addr, None);

    match client.fetch_status().await {
        Err(CloudError::SessionExpired) => {}
        other => panic!("expected SessionExpired, got {other:?}"),
    }
    // Initial login for the session plus exactly one recovery attempt.
    assert_eq!(mock.login_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn device_config_merges_info_and_storage_fields() {
    let mock = Mock::default();
    let addr = serve(mock.clone()).await;
    let mut client = client_for(addr, None);

    let raw = client.fetch_device_config().await.expect("config");
    assert_eq!(raw.get("model").and_then(|v| v.as_str()), Some("Noah 2000"));
    assert_eq!(raw.get("version").and_then(|v| v.as_str()), Some("1.3.0"));
    assert_eq!(
        raw.get("chargingSocHighLimit").and_then(|v| v.as_str()),
        Some("95")
    );
    // Storage overview contributes its scalar fields too.
    assert_eq!(raw.get("useEnergyToday").and_then(|v| v.as_str()), Some("3.4"));
}

#[test]
fn token_cache_rejects_other_identities() {
    let path = std::env::temp_dir().join(format!("noah-token-{}.json", std::process::id()));
    let cache = TokenCache::new(Some(path.clone()));

    cache.save("mvolli", "12345");
    assert_eq!(cache.load("mvolli").as_deref(), Some("12345"));
    assert_eq!(cache.load("someone_else"), None);

    cache.save("someone_else", "99999");
    assert_eq!(cache.load("mvolli"), None);
    assert_eq!(cache.load("someone_else").as_deref(), Some("99999"));

    let _ = std::fs::remove_file(path);
}

#[derive(Clone, Default)]
struct Mock {
    login_calls: Arc<AtomicUsize>,
    no_plants: Arc<std::sync::atomic::AtomicBool>,
    /// Status answers the login page while fewer logins than this happened.
    expire_until_login: Arc<AtomicUsize>,
}

fn client_for(addr: SocketAddr, token_cache: Option<std::path::PathBuf>) -> CloudClient {
    let mut config = CloudConfig::default();
    config.server_url = format!("http://{addr}/");
    config.username = USERNAME.to_string();
    config.password = PASSWORD.to_string();
    config.token_cache_path = token_cache;
    CloudClient::new(config).expect("client")
}

async fn serve(mock: Mock) -> SocketAddr {
    let app = Router::new()
        .route("/newTwoLoginAPI.do", post(login))
        .route("/PlantListAPI.do", post(plant_list))
        .route("/noahDeviceApi/noah/isPlantNoahSystem", post(noah_check))
        .route("/noahDeviceApi/noah/getSystemStatus", post(system_status))
        .route("/noahDeviceApi/noah/getNoahInfoBySn", post(noah_info))
        .route("/newStorageAPI.do", post(storage))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn login(
    State(mock): State<Mock>,
    Form(form): Form<std::collections::HashMap<String, String>>,
) -> Json<serde_json::Value> {
    mock.login_calls.fetch_add(1, Ordering::SeqCst);
    let expected = hash_password(PASSWORD);
    if form.get("userName").map(String::as_str) == Some(USERNAME)
        && form.get("password").map(String::as_str) == Some(expected.as_str())
    {
        Json(json!({"back": {"success": true, "user": {"id": "12345"}}}))
    } else {
        Json(json!({"back": {"success": false, "msg": "wrong password"}}))
    }
}

async fn plant_list(State(mock): State<Mock>) -> Json<serde_json::Value> {
    if mock.no_plants.load(Ordering::SeqCst) {
        return Json(json!({"back": {"success": true, "data": []}}));
    }
    Json(json!({
        "back": {
            "success": true,
            "data": [{
                "plantId": "98765",
                "plantName": "Home",
                "deviceList": [{"deviceSn": SERIAL, "deviceType": "noah"}]
            }]
        }
    }))
}

async fn noah_check(State(_mock): State<Mock>) -> Json<serde_json::Value> {
    Json(json!({
        "result": 1,
        "obj": {
            "isPlantNoahSystem": true,
            "isPlantHaveNoah": true,
            "deviceSn": SERIAL
        }
    }))
}

async fn system_status(State(mock): State<Mock>) -> axum::response::Response {
    let gate = mock.expire_until_login.load(Ordering::SeqCst);
    if mock.login_calls.load(Ordering::SeqCst) < gate {
        return Html("<html><body>please sign in</body></html>").into_response();
    }
    Json(json!({
        "result": 1,
        "obj": {
            "soc": "76.5",
            "chargePower": "120",
            "disChargePower": "0",
            "ppv": "300",
            "pac": "50",
            "workMode": "2",
            "status": "1"
        }
    }))
    .into_response()
}

async fn noah_info(State(_mock): State<Mock>) -> Json<serde_json::Value> {
    Json(json!({
        "result": 1,
        "obj": {
            "noah": {
                "model": "Noah 2000",
                "version": "1.3.0",
                "chargingSocHighLimit": "95",
                "chargingSocLowLimit": "11",
                "batSns": ["BAT1"]
            }
        }
    }))
}

async fn storage(State(_mock): State<Mock>) -> Json<serde_json::Value> {
    Json(json!({
        "result": 1,
        "obj": {"useEnergyToday": "3.4", "capacity": "2.1"}
    }))
}
