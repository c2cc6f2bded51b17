#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use types::{coerce_string, RawTelemetry};

const DEFAULT_SERVER_URL: &str = "https://openapi.growatt.com/";
const USER_AGENT: &str = "noah-collector/0.1";

const LOGIN_PATH: &str = "newTwoLoginAPI.do";
const PLANT_LIST_PATH: &str = "PlantListAPI.do";
const NOAH_CHECK_PATH: &str = "noahDeviceApi/noah/isPlantNoahSystem";
const NOAH_STATUS_PATH: &str = "noahDeviceApi/noah/getSystemStatus";
const NOAH_INFO_PATH: &str = "noahDeviceApi/noah/getNoahInfoBySn";
const STORAGE_DETAIL_PATH: &str = "newStorageAPI.do?op=getStorageInfo_sacolar";
const STORAGE_PARAMS_PATH: &str = "newStorageAPI.do?op=getStorageParams_sacolar";
const STORAGE_OVERVIEW_PATH: &str = "newStorageAPI.do?op=getEnergyOverviewData_sacolar";

/// Vendor password obfuscation: hex MD5, then every even-indexed '0' becomes
/// 'c'. The server performs the same substitution before comparing.
pub fn hash_password(password: &str) -> String {
    let digest = Md5::digest(password.as_bytes());
    let mut hashed: Vec<u8> = hex::encode(digest).into_bytes();
    for index in (0..hashed.len()).step_by(2) {
        if hashed[index] == b'0' {
            hashed[index] = b'c';
        }
    }
    String::from_utf8(hashed).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("vendor throttled the account: {0}")]
    RateLimited(String),
    #[error("no plants registered for this account")]
    NoPlants,
    #[error("no matching device found in plant {0}")]
    NoDevice(String),
    #[error("cloud session expired and one re-login did not recover it")]
    SessionExpired,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    /// Optional explicit plant id/name or device serial.
    pub device_id: Option<String>,
    pub timeout: Duration,
    pub token_cache_path: Option<PathBuf>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            username: String::new(),
            password: String::new(),
            device_id: None,
            timeout: Duration::from_secs(10),
            token_cache_path: None,
        }
    }
}

/// A logged-in identity. Cookies live inside the HTTP client's cookie store;
/// only the token and the identity it was issued for are tracked here.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub identity: String,
}

/// Result of the account -> plant -> device discovery chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PlantDeviceRef {
    pub plant_id: String,
    pub device_serial: String,
    pub device_type: String,
}

/// Persists the auth token keyed by account identity so process restarts do
/// not hammer the login endpoint. A cached entry is only honored when its
/// identity matches the configured username.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    identity: String,
    token: String,
}

impl TokenCache {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn load(&self, identity: &str) -> Option<String> {
        let path = self.path.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let cached: CachedToken = serde_json::from_str(&content).ok()?;
        if cached.identity == identity {
            debug!(identity, "reusing cached auth token");
            Some(cached.token)
        } else {
            debug!(
                cached = %cached.identity,
                configured = identity,
                "cached token belongs to another account, discarding"
            );
            None
        }
    }

    pub fn save(&self, identity: &str, token: &str) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        let cached = CachedToken {
            identity: identity.to_string(),
            token: token.to_string(),
        };
        match serde_json::to_string(&cached) {
            Ok(content) => {
                if let Err(err) = std::fs::write(path, content) {
                    warn!(path = %path.display(), error = %err, "token cache write failed");
                }
            }
            Err(err) => warn!(error = %err, "token cache serialize failed"),
        }
    }
}

/// Client for the vendor cloud API: login, plant/device discovery and
/// telemetry/config fetches, with a one-shot re-login on session expiry.
#[derive(Debug)]
pub struct CloudClient {
    http: reqwest::Client,
    config: CloudConfig,
    token_cache: TokenCache,
    session: Option<AuthSession>,
    device: Option<PlantDeviceRef>,
}

impl CloudClient {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()?;
        let token_cache = TokenCache::new(config.token_cache_path.clone());
        Ok(Self {
            http,
            config,
            token_cache,
            session: None,
            device: None,
        })
    }

    pub fn session(&self) -> Option<&AuthSession> {
        self.session.as_ref()
    }

    /// Connection probe for setup validation. Swallows every error into a
    /// bool; missing credentials short-circuit without any network call.
    pub async fn test_connection(&mut self) -> bool {
        if self.config.username.is_empty() || self.config.password.is_empty() {
            return false;
        }
        match self.login().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "cloud connection test failed");
                false
            }
        }
    }

    /// Authenticate and install a fresh session. The extracted account id
    /// doubles as the auth token and is written through the token cache.
    pub async fn login(&mut self) -> Result<(), CloudError> {
        let hashed = hash_password(&self.config.password);
        let form = vec![
            ("userName".to_string(), self.config.username.clone()),
            ("password".to_string(), hashed),
        ];
        let body = self.post_once(LOGIN_PATH, &form).await.map_err(|err| match err {
            // A login page in response to the login call is a vendor error,
            // not an expired session.
            CloudError::SessionExpired => CloudError::Protocol("login returned a redirect page".to_string()),
            other => other,
        })?;

        let back = body
            .get("back")
            .ok_or_else(|| CloudError::Protocol("login response missing 'back'".to_string()))?;
        let success = back.get("success").and_then(Value::as_bool).unwrap_or(false);
        if !success {
            let message = back
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown login failure")
                .to_string();
            if message.to_lowercase().contains("frequent") || message == "507" {
                return Err(CloudError::RateLimited(message));
            }
            return Err(CloudError::Auth(message));
        }

        let token = back
            .get("user")
            .and_then(|user| user.get("id"))
            .and_then(coerce_string)
            .ok_or_else(|| CloudError::Protocol("login response missing user id".to_string()))?;

        info!(identity = %self.config.username, "cloud login successful");
        self.token_cache.save(&self.config.username, &token);
        self.session = Some(AuthSession {
            token,
            identity: self.config.username.clone(),
        });
        Ok(())
    }

    /// Resolve the plant and device serial for this account.
    ///
    /// Serial priority: explicit configured device id (when it is not spent
    /// on plant selection), then the serial reported by the Noah system
    /// check, then the first structurally matching entry of the plant's
    /// device list.
    pub async fn discover_device(&mut self) -> Result<PlantDeviceRef, CloudError> {
        self.ensure_session().await?;
        let token = self
            .session
            .as_ref()
            .map(|session| session.token.clone())
            .unwrap_or_default();

        let body = self
            .post_json(PLANT_LIST_PATH, &[("userId".to_string(), token)])
            .await?;
        let back = body
            .get("back")
            .ok_or_else(|| CloudError::Protocol("plant list response missing 'back'".to_string()))?;
        let plants = back
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if plants.is_empty() {
            return Err(CloudError::NoPlants);
        }

        let configured = self.config.device_id.clone();
        let mut plant = &plants[0];
        let mut configured_matched_plant = false;
        if let Some(wanted) = configured.as_deref() {
            for candidate in &plants {
                let id = plant_id_of(candidate);
                let name = candidate
                    .get("plantName")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if id.as_deref() == Some(wanted) || name == wanted {
                    plant = candidate;
                    configured_matched_plant = true;
                    break;
                }
            }
        }

        let plant_id = plant_id_of(plant)
            .ok_or_else(|| CloudError::Protocol("plant entry missing id".to_string()))?;
        info!(
            plant_id = %plant_id,
            plant_name = plant.get("plantName").and_then(serde_json::Value::as_str).unwrap_or("?"),
            "plant selected"
        );

        // Best-effort battery-subsystem check; a negative or failing answer
        // narrows nothing, it only loses the reported serial.
        let mut checked_serial = None;
        match self
            .post_json(NOAH_CHECK_PATH, &[("plantId".to_string(), plant_id.clone())])
            .await
        {
            Ok(check) => {
                let obj = check.get("obj").cloned().unwrap_or_default();
                let is_noah = obj
                    .get("isPlantNoahSystem")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let has_noah = obj
                    .get("isPlantHaveNoah")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !is_noah && !has_noah {
                    info!(plant_id = %plant_id, "plant does not report the battery subsystem");
                }
                checked_serial = obj
                    .get("deviceSn")
                    .and_then(coerce_string)
                    .filter(|serial| !serial.is_empty());
            }
            Err(err) => warn!(error = %err, "battery subsystem check failed"),
        }

        let (device_serial, device_type) = if let (Some(wanted), false) =
            (configured.clone(), configured_matched_plant)
        {
            (wanted, "noah".to_string())
        } else if let Some(serial) = checked_serial {
            (serial, "noah".to_string())
        } else if let Some((serial, kind)) = first_matching_device(plant) {
            (serial, kind)
        } else {
            return Err(CloudError::NoDevice(plant_id));
        };

        let device = PlantDeviceRef {
            plant_id,
            device_serial,
            device_type,
        };
        info!(serial = %device.device_serial, "device resolved");
        self.device = Some(device.clone());
        Ok(device)
    }

    /// Fetch the flat status record for the resolved device.
    pub async fn fetch_status(&mut self) -> Result<RawTelemetry, CloudError> {
        let device = self.ensure_device().await?;
        let serial = device.device_serial.clone();
        let body = self
            .post_json(NOAH_STATUS_PATH, &[("deviceSn".to_string(), serial.clone())])
            .await?;
        let obj = result_obj(&body, "system status")?;
        let mut raw = object_to_raw(&obj);
        raw.entry("deviceSn".to_string())
            .or_insert(Value::String(serial));
        Ok(raw)
    }

    /// Best-effort configuration/info fetch: device info plus the storage
    /// detail/params/overview endpoints, merged. Individual failures are
    /// logged and skipped; the result may be empty.
    pub async fn fetch_device_config(&mut self) -> Result<RawTelemetry, CloudError> {
        let device = self.ensure_device().await?;
        let serial = device.device_serial.clone();
        let plant_id = device.plant_id.clone();
        let mut merged = RawTelemetry::new();

        match self
            .post_json(NOAH_INFO_PATH, &[("deviceSn".to_string(), serial.clone())])
            .await
        {
            Ok(body) => {
                let noah = body
                    .get("obj")
                    .and_then(|obj| obj.get("noah"))
                    .cloned()
                    .unwrap_or_default();
                merge_scalars(&mut merged, &noah);
            }
            Err(err) => warn!(error = %err, "device info fetch failed"),
        }

        let storage_calls: [(&str, Vec<(String, String)>); 3] = [
            (
                STORAGE_DETAIL_PATH,
                vec![("storageId".to_string(), serial.clone())],
            ),
            (
                STORAGE_PARAMS_PATH,
                vec![("storageId".to_string(), serial.clone())],
            ),
            (
                STORAGE_OVERVIEW_PATH,
                vec![
                    ("plantId".to_string(), plant_id),
                    ("storageSn".to_string(), serial),
                ],
            ),
        ];
        for (path, form) in storage_calls {
            match self.post_json(path, &form).await {
                Ok(body) => {
                    let obj = body.get("obj").cloned().unwrap_or(body);
                    merge_scalars(&mut merged, &obj);
                }
                Err(err) => debug!(path, error = %err, "storage fetch skipped"),
            }
        }

        Ok(merged)
    }

    /// Drop the session and connection state. In-flight requests fail
    /// naturally; the cookie store goes away with the client.
    pub fn close(&mut self) {
        self.session = None;
        self.device = None;
    }

    async fn ensure_session(&mut self) -> Result<(), CloudError> {
        if let Some(session) = &self.session {
            if session.identity == self.config.username {
                return Ok(());
            }
            debug!("session identity changed, discarding");
            self.session = None;
        }
        if let Some(token) = self.token_cache.load(&self.config.username) {
            self.session = Some(AuthSession {
                token,
                identity: self.config.username.clone(),
            });
            return Ok(());
        }
        self.login().await
    }

    async fn ensure_device(&mut self) -> Result<PlantDeviceRef, CloudError> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }
        self.discover_device().await
    }

    /// POST with the one-shot expiry recovery: on a login-redirect-shaped
    /// response the session is cleared, one re-login runs, and the request
    /// is re-issued once. A second expiry surfaces to the caller.
    async fn post_json(
        &mut self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<Value, CloudError> {
        self.ensure_session().await?;
        match self.post_once(path, form).await {
            Err(CloudError::SessionExpired) => {
                warn!(path, "cloud session expired, re-authenticating once");
                self.session = None;
                self.login().await?;
                self.post_once(path, form).await
            }
            other => other,
        }
    }

    async fn post_once(&self, path: &str, form: &[(String, String)]) -> Result<Value, CloudError> {
        let url = format!("{}{}", self.config.server_url, path);
        let response = self.http.post(&url).form(form).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if text.trim_start().starts_with('<') {
            // The backend answers authenticated endpoints with the login
            // page instead of a 401 once the session lapses.
            return Err(CloudError::SessionExpired);
        }
        if !status.is_success() {
            return Err(CloudError::Protocol(format!("http status {status} from {path}")));
        }
        serde_json::from_str(&text)
            .map_err(|err| CloudError::Protocol(format!("invalid json from {path}: {err}")))
    }
}

fn plant_id_of(plant: &Value) -> Option<String> {
    plant
        .get("plantId")
        .and_then(coerce_string)
        .or_else(|| plant.get("id").and_then(coerce_string))
}

fn first_matching_device(plant: &Value) -> Option<(String, String)> {
    let devices = plant.get("deviceList").and_then(Value::as_array)?;
    let serial_of = |device: &Value| {
        device
            .get("deviceSn")
            .and_then(coerce_string)
            .or_else(|| device.get("serialNum").and_then(coerce_string))
            .or_else(|| device.get("sn").and_then(coerce_string))
    };
    let kind_of = |device: &Value| {
        device
            .get("deviceType")
            .and_then(coerce_string)
            .unwrap_or_default()
            .to_lowercase()
    };

    for device in devices {
        let kind = kind_of(device);
        if kind.contains("noah") || kind.contains("storage") || kind.contains("battery") {
            if let Some(serial) = serial_of(device) {
                return Some((serial, kind));
            }
        }
    }
    devices
        .first()
        .and_then(|device| serial_of(device).map(|serial| (serial, kind_of(device))))
}

fn result_obj(body: &Value, what: &str) -> Result<Value, CloudError> {
    let ok = match body.get("result") {
        Some(Value::Number(number)) => number.as_i64() == Some(1),
        Some(Value::Bool(flag)) => *flag,
        _ => false,
    };
    if !ok {
        let message = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(CloudError::Protocol(format!("{what} request failed: {message}")));
    }
    body.get("obj")
        .filter(|obj| obj.is_object())
        .cloned()
        .ok_or_else(|| CloudError::Protocol(format!("{what} response missing 'obj'")))
}

fn object_to_raw(value: &Value) -> RawTelemetry {
    match value.as_object() {
        Some(map) => map
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        None => RawTelemetry::new(),
    }
}

fn merge_scalars(target: &mut RawTelemetry, value: &Value) {
    let Some(map) = value.as_object() else {
        return;
    };
    for (key, entry) in map {
        if !entry.is_object() && !entry.is_array() {
            target.insert(key.clone(), entry.clone());
        }
    }
}
