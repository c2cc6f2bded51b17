#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::Value;

use types::{
    coerce_f64, coerce_string, raw_bool, raw_f64, raw_string, BatteryStatus, ConnectionKind,
    DeviceSnapshot, PvString, RawTelemetry,
};

/// Cloud field names mapped onto the generic vocabulary shared with the MQTT
/// and Modbus payloads. Both the battery-status call vocabulary (soc,
/// chargePower, ...) and the classic inverter vocabulary (vpv1, vac1, ...)
/// are covered; the first table entry present wins.
const CLOUD_FIELDS: &[(&str, &str)] = &[
    ("soc", "battery_soc"),
    ("vBat", "battery_voltage"),
    ("iBat", "battery_current"),
    ("batTemp", "battery_temperature"),
    ("chargePower", "battery_charge_power"),
    ("disChargePower", "battery_discharge_power"),
    ("capacity", "battery_capacity"),
    ("chargingSocHighLimit", "battery_soc_high_limit"),
    ("chargingSocLowLimit", "battery_soc_low_limit"),
    ("ppv", "solar_power"),
    ("eToday", "solar_energy_today"),
    ("eTotal", "solar_energy_total"),
    ("vpv1", "pv1_voltage"),
    ("ipv1", "pv1_current"),
    ("ppv1", "pv1_power"),
    ("vpv2", "pv2_voltage"),
    ("ipv2", "pv2_current"),
    ("ppv2", "pv2_power"),
    ("pac", "grid_power"),
    ("vac1", "grid_voltage"),
    ("fac1", "grid_frequency"),
    // Vendor API really spells it this way.
    ("tempperature", "inverter_temperature"),
    ("eacToday", "load_energy_today"),
    ("eacTotal", "load_energy_total"),
    ("useEnergyToday", "load_energy_today"),
    ("otherPower", "aux_power"),
    ("workMode", "work_mode"),
    ("status", "system_status"),
    ("deviceSn", "serial_number"),
    ("model", "model"),
    ("version", "firmware_version"),
];

/// Work-mode code to operator-facing text.
///
/// Vendor app builds disagree on whether code 0 means "No Response" with the
/// rest shifted up by one; the on-device status endpoint uses the mapping
/// below, so that is the canonical one here.
pub fn work_mode_text(code: i64) -> String {
    match code {
        0 => "Load First".to_string(),
        1 => "Battery First".to_string(),
        2 => "Grid First".to_string(),
        3 => "Backup Mode".to_string(),
        other => format!("Unknown ({other})"),
    }
}

/// System status code to text.
pub fn status_text(code: i64) -> String {
    match code {
        0 => "Offline".to_string(),
        1 => "Online".to_string(),
        2 => "Fault".to_string(),
        3 => "Checking".to_string(),
        other => format!("Unknown ({other})"),
    }
}

/// Map a raw transport payload into the canonical snapshot.
///
/// Pure and side-effect-free: identical input and clock produce identical
/// output. Absent numeric fields become 0, absent string fields "Unknown".
pub fn normalize(raw: &RawTelemetry, kind: ConnectionKind, now: DateTime<Utc>) -> DeviceSnapshot {
    let generic = match kind {
        ConnectionKind::Api => translate_cloud(raw),
        _ => raw.clone(),
    };
    build_snapshot(&generic, now)
}

fn translate_cloud(raw: &RawTelemetry) -> RawTelemetry {
    let mut generic = RawTelemetry::with_capacity(raw.len());
    for (cloud_key, generic_key) in CLOUD_FIELDS {
        if let Some(value) = raw.get(*cloud_key) {
            generic
                .entry((*generic_key).to_string())
                .or_insert_with(|| value.clone());
        }
    }
    generic
}

fn build_snapshot(raw: &RawTelemetry, now: DateTime<Utc>) -> DeviceSnapshot {
    let mut snapshot = DeviceSnapshot::empty(now);

    // Battery. Charge/discharge may arrive as one signed field or as a
    // separate pair; the pair collapses to charge - discharge.
    let charge = raw_f64(raw, "battery_charge_power");
    let discharge = raw_f64(raw, "battery_discharge_power");
    let battery_power = match raw_f64(raw, "battery_power") {
        Some(power) => Some(power),
        None if charge.is_some() || discharge.is_some() => {
            Some(charge.unwrap_or(0.0) - discharge.unwrap_or(0.0))
        }
        None => None,
    };
    snapshot.battery.soc = raw_f64(raw, "battery_soc").unwrap_or(0.0);
    snapshot.battery.voltage = raw_f64(raw, "battery_voltage").unwrap_or(0.0);
    snapshot.battery.current = raw_f64(raw, "battery_current").unwrap_or(0.0);
    snapshot.battery.power = battery_power.unwrap_or(0.0);
    snapshot.battery.temperature = raw_f64(raw, "battery_temperature").unwrap_or(0.0);
    snapshot.battery.status = match raw_string(raw, "battery_status").as_deref() {
        Some(text) if text.eq_ignore_ascii_case("charging") => BatteryStatus::Charging,
        Some(text) if text.eq_ignore_ascii_case("discharging") => BatteryStatus::Discharging,
        Some(text) if text.eq_ignore_ascii_case("idle") => BatteryStatus::Idle,
        _ => match battery_power {
            Some(power) if power > 0.0 => BatteryStatus::Charging,
            Some(power) if power < 0.0 => BatteryStatus::Discharging,
            Some(_) => BatteryStatus::Idle,
            None => BatteryStatus::Unknown,
        },
    };
    snapshot.battery.health = raw_f64(raw, "battery_health");
    snapshot.battery.capacity = raw_f64(raw, "battery_capacity");
    snapshot.battery.energy_charged_today = raw_f64(raw, "battery_energy_charged_today");
    snapshot.battery.energy_discharged_today = raw_f64(raw, "battery_energy_discharged_today");
    snapshot.battery.soc_high_limit = raw_f64(raw, "battery_soc_high_limit");
    snapshot.battery.soc_low_limit = raw_f64(raw, "battery_soc_low_limit");

    // Solar. The micro-inverter vocabulary calls total output "output_power"
    // and its daily counters "energy_today"/"energy_total".
    snapshot.solar.power = raw_f64(raw, "solar_power")
        .or_else(|| raw_f64(raw, "output_power"))
        .unwrap_or(0.0);
    snapshot.solar.voltage = raw_f64(raw, "solar_voltage").unwrap_or(0.0);
    snapshot.solar.current = raw_f64(raw, "solar_current").unwrap_or(0.0);
    snapshot.solar.energy_today = raw_f64(raw, "solar_energy_today")
        .or_else(|| raw_f64(raw, "energy_today"))
        .unwrap_or(0.0);
    snapshot.solar.energy_total = raw_f64(raw, "solar_energy_total")
        .or_else(|| raw_f64(raw, "energy_total"))
        .unwrap_or(0.0);
    snapshot.solar.pv1 = pv_string(raw, "pv1");
    snapshot.solar.pv2 = pv_string(raw, "pv2");
    snapshot.solar.inverter_temperature =
        raw_f64(raw, "inverter_temperature").or_else(|| raw_f64(raw, "temperature"));

    // Grid.
    let grid_power = raw_f64(raw, "grid_power");
    snapshot.grid.power = grid_power.unwrap_or(0.0);
    snapshot.grid.voltage = raw_f64(raw, "grid_voltage").unwrap_or(0.0);
    snapshot.grid.frequency = raw_f64(raw, "grid_frequency").unwrap_or(0.0);
    snapshot.grid.energy_imported_today = raw_f64(raw, "grid_energy_imported_today").unwrap_or(0.0);
    snapshot.grid.energy_exported_today = raw_f64(raw, "grid_energy_exported_today").unwrap_or(0.0);
    snapshot.grid.energy_imported_total = raw_f64(raw, "grid_energy_imported_total").unwrap_or(0.0);
    snapshot.grid.energy_exported_total = raw_f64(raw, "grid_energy_exported_total").unwrap_or(0.0);
    if let Some(connected) = raw_bool(raw, "grid_connected") {
        snapshot.grid.connected = connected;
    }

    // Load. Reported directly where available, otherwise derived from the
    // power balance; either way it can never go negative. A lone signed
    // battery power field splits into its charge/discharge components.
    let (effective_charge, effective_discharge) = match (charge, discharge) {
        (None, None) => match battery_power {
            Some(power) if power >= 0.0 => (power, 0.0),
            Some(power) => (0.0, -power),
            None => (0.0, 0.0),
        },
        _ => (charge.unwrap_or(0.0), discharge.unwrap_or(0.0)),
    };
    let derived_load = snapshot.solar.power + effective_discharge - effective_charge
        - grid_power.unwrap_or(0.0)
        + raw_f64(raw, "aux_power").unwrap_or(0.0);
    snapshot.load.power = raw_f64(raw, "load_power").unwrap_or(derived_load).max(0.0);
    snapshot.load.energy_today = raw_f64(raw, "load_energy_today").unwrap_or(0.0);
    snapshot.load.energy_total = raw_f64(raw, "load_energy_total").unwrap_or(0.0);

    // System.
    if let Some(value) = raw.get("system_status").or_else(|| raw.get("inverter_status")) {
        snapshot.system.status = match numeric_code(value) {
            Some(code) => status_text(code),
            None => coerce_string(value).unwrap_or_else(|| "Unknown".to_string()),
        };
    }
    if let Some(value) = raw.get("work_mode").or_else(|| raw.get("system_mode")) {
        snapshot.system.mode = match numeric_code(value) {
            Some(code) => work_mode_text(code),
            None => coerce_string(value).unwrap_or_else(|| "Unknown".to_string()),
        };
    }
    if let Some(version) = raw_string(raw, "firmware_version") {
        snapshot.system.firmware_version = version;
    }
    if let Some(serial) = raw_string(raw, "serial_number") {
        snapshot.system.serial_number = serial;
    }
    if let Some(model) = raw_string(raw, "model") {
        snapshot.system.model = model;
    }
    snapshot.system.output_power_factor = raw_f64(raw, "power_factor");
    snapshot.system.error_code = raw.get("error_code").and_then(numeric_code);
    snapshot.system.error_message = raw_string(raw, "error_message");
    snapshot.system.fault_codes = code_list(raw, "fault_codes", "fault_code");
    snapshot.system.warning_codes = code_list(raw, "warning_codes", "warning_code");
    snapshot.system.last_update = Some(now);

    snapshot
}

fn pv_string(raw: &RawTelemetry, prefix: &str) -> Option<PvString> {
    let voltage = raw_f64(raw, &format!("{prefix}_voltage"));
    let current = raw_f64(raw, &format!("{prefix}_current"));
    let power = raw_f64(raw, &format!("{prefix}_power"));
    if voltage.is_none() && current.is_none() && power.is_none() {
        return None;
    }
    Some(PvString {
        voltage: voltage.unwrap_or(0.0),
        current: current.unwrap_or(0.0),
        power: power.unwrap_or(0.0),
    })
}

fn numeric_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|float| float as i64))
        }
        _ => None,
    }
}

/// A list key ("fault_codes") wins over a scalar key ("fault_code"); a
/// scalar zero means no fault and yields an empty list.
fn code_list(raw: &RawTelemetry, list_key: &str, scalar_key: &str) -> Vec<String> {
    if let Some(Value::Array(entries)) = raw.get(list_key) {
        return entries.iter().filter_map(coerce_string).collect();
    }
    match raw.get(scalar_key).map(coerce_f64) {
        Some(code) if code != 0.0 => vec![format!("{}", code as i64)],
        _ => Vec::new(),
    }
}
