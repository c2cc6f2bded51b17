use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use types::{ConnectionKind, DeviceVariant};

const DEFAULT_SERVER_URL: &str = "https://openapi.growatt.com/";
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MQTT_TOPIC: &str = "noah";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub connection: ConnectionKind,
    pub variant: DeviceVariant,
    pub username: String,
    pub password: String,
    pub device_id: Option<String>,
    pub server_url: String,
    pub token_cache_path: Option<String>,
    pub host: String,
    pub port: u16,
    pub serial_port: String,
    pub baudrate: u32,
    pub modbus_unit_id: u8,
    pub modbus_timeout_ms: u64,
    pub modbus_retry_count: usize,
    pub modbus_retry_backoff_ms: u64,
    pub modbus_retry_max_backoff_ms: u64,
    pub modbus_inter_read_delay_ms: Option<u64>,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub scan_interval_secs: u64,
    pub timeout_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);

        if !config.server_url.ends_with('/') {
            config.server_url.push('/');
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.connection {
            ConnectionKind::Api => {
                if self.username.is_empty() {
                    anyhow::bail!("cloud.username is required for the api connection");
                }
                if self.password.is_empty() {
                    anyhow::bail!("cloud.password is required for the api connection");
                }
            }
            ConnectionKind::Mqtt => {
                if self.mqtt_broker.is_empty() {
                    anyhow::bail!("mqtt.broker is required for the mqtt connection");
                }
                if self.mqtt_port == 0 {
                    anyhow::bail!("mqtt.port must be between 1 and 65535");
                }
                if self.mqtt_topic.is_empty() {
                    anyhow::bail!("mqtt.topic must be non-empty");
                }
            }
            ConnectionKind::ModbusTcp => {
                if self.host.is_empty() {
                    anyhow::bail!("modbus.host is required for the modbus_tcp connection");
                }
                if self.port == 0 {
                    anyhow::bail!("modbus.port must be between 1 and 65535");
                }
            }
            ConnectionKind::ModbusRtu => {
                if self.serial_port.is_empty() {
                    anyhow::bail!("modbus.serial_port is required for the modbus_rtu connection");
                }
                if self.baudrate == 0 {
                    anyhow::bail!("modbus.baudrate must be >= 1");
                }
            }
        }

        if self.scan_interval_secs == 0 {
            anyhow::bail!("poll.scan_interval_secs must be >= 1");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("poll.timeout_secs must be >= 1");
        }
        if self.modbus_timeout_ms == 0 {
            anyhow::bail!("modbus.timeout_ms must be >= 1");
        }
        if self.modbus_retry_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_backoff_ms must be >= 1");
        }
        if self.modbus_retry_max_backoff_ms == 0 {
            anyhow::bail!("modbus.retry_max_backoff_ms must be >= 1");
        }
        if let Some(delay) = self.modbus_inter_read_delay_ms {
            if delay == 0 {
                anyhow::bail!("modbus.inter_read_delay_ms must be >= 1 when set");
            }
        }
        if self.server_url.is_empty() {
            anyhow::bail!("cloud.server_url must be non-empty");
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionKind::Api,
            variant: DeviceVariant::Noah2000,
            username: String::new(),
            password: String::new(),
            device_id: None,
            server_url: DEFAULT_SERVER_URL.to_string(),
            token_cache_path: None,
            host: String::new(),
            port: 502,
            serial_port: String::new(),
            baudrate: 9_600,
            modbus_unit_id: 1,
            modbus_timeout_ms: 1_000,
            modbus_retry_count: 2,
            modbus_retry_backoff_ms: 100,
            modbus_retry_max_backoff_ms: 2_000,
            modbus_inter_read_delay_ms: None,
            mqtt_broker: String::new(),
            mqtt_port: 1_883,
            mqtt_topic: DEFAULT_MQTT_TOPIC.to_string(),
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    device: Option<FileDeviceConfig>,
    cloud: Option<FileCloudConfig>,
    modbus: Option<FileModbusConfig>,
    mqtt: Option<FileMqttConfig>,
    poll: Option<FilePollConfig>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    connection: Option<String>,
    #[serde(rename = "type")]
    variant: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileCloudConfig {
    username: Option<String>,
    password: Option<String>,
    server_url: Option<String>,
    token_cache_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileModbusConfig {
    host: Option<String>,
    port: Option<u16>,
    serial_port: Option<String>,
    baudrate: Option<u32>,
    unit_id: Option<u8>,
    timeout_ms: Option<u64>,
    retry_count: Option<usize>,
    retry_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    inter_read_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileMqttConfig {
    broker: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilePollConfig {
    scan_interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("NOAH_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut AppConfig, file: FileConfig) {
    if let Some(device) = file.device {
        if let Some(connection) = device.connection {
            if let Some(kind) = ConnectionKind::parse(&connection) {
                config.connection = kind;
            }
        }
        if let Some(variant) = device.variant {
            if let Some(parsed) = DeviceVariant::parse(&variant) {
                config.variant = parsed;
            }
        }
        if let Some(id) = device.id {
            config.device_id = Some(id);
        }
    }

    if let Some(cloud) = file.cloud {
        if let Some(username) = cloud.username {
            config.username = username;
        }
        if let Some(password) = cloud.password {
            config.password = password;
        }
        if let Some(server_url) = cloud.server_url {
            config.server_url = server_url;
        }
        if let Some(path) = cloud.token_cache_path {
            config.token_cache_path = Some(path);
        }
    }

    if let Some(modbus) = file.modbus {
        if let Some(host) = modbus.host {
            config.host = host;
        }
        if let Some(port) = modbus.port {
            config.port = port;
        }
        if let Some(serial_port) = modbus.serial_port {
            config.serial_port = serial_port;
        }
        if let Some(baudrate) = modbus.baudrate {
            config.baudrate = baudrate;
        }
        if let Some(unit_id) = modbus.unit_id {
            config.modbus_unit_id = unit_id;
        }
        if let Some(timeout_ms) = modbus.timeout_ms {
            config.modbus_timeout_ms = timeout_ms;
        }
        if let Some(retry_count) = modbus.retry_count {
            config.modbus_retry_count = retry_count;
        }
        if let Some(backoff) = modbus.retry_backoff_ms {
            config.modbus_retry_backoff_ms = backoff;
        }
        if let Some(max_backoff) = modbus.retry_max_backoff_ms {
            config.modbus_retry_max_backoff_ms = max_backoff;
        }
        if let Some(delay) = modbus.inter_read_delay_ms {
            config.modbus_inter_read_delay_ms = Some(delay);
        }
    }

    if let Some(mqtt) = file.mqtt {
        if let Some(broker) = mqtt.broker {
            config.mqtt_broker = broker;
        }
        if let Some(port) = mqtt.port {
            config.mqtt_port = port;
        }
        if let Some(topic) = mqtt.topic {
            config.mqtt_topic = topic;
        }
    }

    if let Some(poll) = file.poll {
        if let Some(interval) = poll.scan_interval_secs {
            config.scan_interval_secs = interval;
        }
        if let Some(timeout) = poll.timeout_secs {
            config.timeout_secs = timeout;
        }
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(value) = env::var("NOAH_CONNECTION") {
        if let Some(kind) = ConnectionKind::parse(&value) {
            config.connection = kind;
        }
    }
    if let Ok(value) = env::var("NOAH_DEVICE_TYPE") {
        if let Some(variant) = DeviceVariant::parse(&value) {
            config.variant = variant;
        }
    }
    if let Ok(value) = env::var("NOAH_USERNAME") {
        config.username = value;
    }
    if let Ok(value) = env::var("NOAH_PASSWORD") {
        config.password = value;
    }
    if let Ok(value) = env::var("NOAH_DEVICE_ID") {
        config.device_id = Some(value);
    }
    if let Ok(value) = env::var("NOAH_SERVER_URL") {
        config.server_url = value;
    }
    if let Ok(value) = env::var("NOAH_TOKEN_CACHE") {
        config.token_cache_path = Some(value);
    }
    if let Ok(value) = env::var("NOAH_HOST") {
        config.host = value;
    }
    if let Some(port) = parse_env_u16("NOAH_PORT") {
        config.port = port;
    }
    if let Ok(value) = env::var("NOAH_SERIAL_PORT") {
        config.serial_port = value;
    }
    if let Some(baudrate) = parse_env_u32("NOAH_BAUDRATE") {
        config.baudrate = baudrate;
    }
    if let Ok(value) = env::var("NOAH_MQTT_BROKER") {
        config.mqtt_broker = value;
    }
    if let Some(port) = parse_env_u16("NOAH_MQTT_PORT") {
        config.mqtt_port = port;
    }
    if let Ok(value) = env::var("NOAH_MQTT_TOPIC") {
        config.mqtt_topic = value;
    }

    config.scan_interval_secs =
        parse_env_u64("NOAH_SCAN_INTERVAL_SECS").unwrap_or(config.scan_interval_secs);
    config.timeout_secs = parse_env_u64("NOAH_TIMEOUT_SECS").unwrap_or(config.timeout_secs);
    config.modbus_timeout_ms =
        parse_env_u64("NOAH_MODBUS_TIMEOUT_MS").unwrap_or(config.modbus_timeout_ms);
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
