#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw field->value payload as produced by a transport, before normalization.
/// The key vocabulary is transport-specific and never crosses the normalizer.
pub type RawTelemetry = HashMap<String, serde_json::Value>;

/// Which transport a running instance talks through. Selected once at
/// construction time, never re-dispatched per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Api,
    Mqtt,
    ModbusTcp,
    ModbusRtu,
}

impl ConnectionKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api" => Some(Self::Api),
            "mqtt" => Some(Self::Mqtt),
            "modbus_tcp" => Some(Self::ModbusTcp),
            "modbus_rtu" => Some(Self::ModbusRtu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Mqtt => "mqtt",
            Self::ModbusTcp => "modbus_tcp",
            Self::ModbusRtu => "modbus_rtu",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported device variants. The two variants expose disjoint register
/// layouts and partially different cloud/MQTT vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceVariant {
    Noah2000,
    Neo800,
}

impl DeviceVariant {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "noah_2000" => Some(Self::Noah2000),
            "neo_800" => Some(Self::Neo800),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noah2000 => "noah_2000",
            Self::Neo800 => "neo_800",
        }
    }
}

impl fmt::Display for DeviceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryStatus {
    Charging,
    Discharging,
    Idle,
    Unknown,
}

impl Default for BatteryStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for BatteryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Charging => "Charging",
            Self::Discharging => "Discharging",
            Self::Idle => "Idle",
            Self::Unknown => "Unknown",
        };
        f.write_str(text)
    }
}

/// Battery block of the canonical snapshot. Power is signed, positive while
/// charging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub soc: f64,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub temperature: f64,
    pub status: BatteryStatus,
    pub health: Option<f64>,
    pub capacity: Option<f64>,
    pub energy_charged_today: Option<f64>,
    pub energy_discharged_today: Option<f64>,
    pub soc_high_limit: Option<f64>,
    pub soc_low_limit: Option<f64>,
}

impl Default for BatterySnapshot {
    fn default() -> Self {
        Self {
            soc: 0.0,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            temperature: 0.0,
            status: BatteryStatus::Unknown,
            health: None,
            capacity: None,
            energy_charged_today: None,
            energy_discharged_today: None,
            soc_high_limit: None,
            soc_low_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PvString {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SolarSnapshot {
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub energy_today: f64,
    pub energy_total: f64,
    pub pv1: Option<PvString>,
    pub pv2: Option<PvString>,
    pub inverter_temperature: Option<f64>,
}

/// Grid block. The sign convention of `power` varies by transport: the cloud
/// reports output power (device to grid/load), Modbus and MQTT report signed
/// import-positive power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub power: f64,
    pub voltage: f64,
    pub frequency: f64,
    pub energy_imported_today: f64,
    pub energy_exported_today: f64,
    pub energy_imported_total: f64,
    pub energy_exported_total: f64,
    pub connected: bool,
}

impl Default for GridSnapshot {
    fn default() -> Self {
        Self {
            power: 0.0,
            voltage: 0.0,
            frequency: 0.0,
            energy_imported_today: 0.0,
            energy_exported_today: 0.0,
            energy_imported_total: 0.0,
            energy_exported_total: 0.0,
            connected: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub power: f64,
    pub energy_today: f64,
    pub energy_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub status: String,
    pub mode: String,
    pub error_code: Option<i64>,
    pub error_message: Option<String>,
    pub firmware_version: String,
    pub serial_number: String,
    pub model: String,
    pub output_power_factor: Option<f64>,
    pub fault_codes: Vec<String>,
    pub warning_codes: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for SystemSnapshot {
    fn default() -> Self {
        Self {
            status: "Unknown".to_string(),
            mode: "Unknown".to_string(),
            error_code: None,
            error_message: None,
            firmware_version: "Unknown".to_string(),
            serial_number: "Unknown".to_string(),
            model: "Unknown".to_string(),
            output_power_factor: None,
            fault_codes: Vec::new(),
            warning_codes: Vec::new(),
            last_update: None,
        }
    }
}

/// Canonical, transport-agnostic device state. Always fully constructed:
/// numeric fields default to 0, string fields to "Unknown".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub battery: BatterySnapshot,
    pub solar: SolarSnapshot,
    pub grid: GridSnapshot,
    pub load: LoadSnapshot,
    pub system: SystemSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            battery: BatterySnapshot::default(),
            solar: SolarSnapshot::default(),
            grid: GridSnapshot::default(),
            load: LoadSnapshot::default(),
            system: SystemSnapshot::default(),
            timestamp,
        }
    }
}

/// Tolerant numeric coercion: numbers pass through, numeric strings parse,
/// everything else collapses to 0 rather than failing the whole payload.
pub fn coerce_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::Number(number) => number.as_f64().unwrap_or(0.0),
        serde_json::Value::String(text) => text.trim().parse().unwrap_or(0.0),
        serde_json::Value::Bool(flag) => {
            if *flag {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

pub fn coerce_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn raw_f64(raw: &RawTelemetry, key: &str) -> Option<f64> {
    raw.get(key).map(coerce_f64)
}

pub fn raw_string(raw: &RawTelemetry, key: &str) -> Option<String> {
    raw.get(key).and_then(coerce_string)
}

pub fn raw_bool(raw: &RawTelemetry, key: &str) -> Option<bool> {
    match raw.get(key) {
        Some(serde_json::Value::Bool(flag)) => Some(*flag),
        Some(other) => Some(coerce_f64(other) != 0.0),
        None => None,
    }
}
