use chrono::{TimeZone, Utc};
use serde_json::json;

use normalizer::{normalize, status_text, work_mode_text};
use types::{BatteryStatus, ConnectionKind, RawTelemetry};

fn clock() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn raw_from(value: serde_json::Value) -> RawTelemetry {
    value
        .as_object()
        .expect("object")
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[test]
fn empty_payload_yields_fully_defaulted_snapshot() {
    let snapshot = normalize(&RawTelemetry::new(), ConnectionKind::Mqtt, clock());

    assert_eq!(snapshot.battery.soc, 0.0);
    assert_eq!(snapshot.battery.voltage, 0.0);
    assert_eq!(snapshot.battery.power, 0.0);
    assert_eq!(snapshot.battery.status, BatteryStatus::Unknown);
    assert_eq!(snapshot.solar.power, 0.0);
    assert_eq!(snapshot.solar.energy_total, 0.0);
    assert_eq!(snapshot.grid.power, 0.0);
    assert_eq!(snapshot.load.power, 0.0);
    assert_eq!(snapshot.system.status, "Unknown");
    assert_eq!(snapshot.system.mode, "Unknown");
    assert_eq!(snapshot.system.firmware_version, "Unknown");
    assert_eq!(snapshot.system.serial_number, "Unknown");
    assert_eq!(snapshot.system.model, "Unknown");
    assert!(snapshot.system.fault_codes.is_empty());
    assert_eq!(snapshot.timestamp, clock());
}

#[test]
fn normalize_is_idempotent_under_a_fixed_clock() {
    let raw = raw_from(json!({
        "soc": "76.5",
        "chargePower": "120",
        "disChargePower": "0",
        "ppv": "300",
        "pac": "50",
        "workMode": "2",
        "status": "1"
    }));

    let first = normalize(&raw, ConnectionKind::Api, clock());
    let second = normalize(&raw, ConnectionKind::Api, clock());
    assert_eq!(first, second);
}

#[test]
fn cloud_status_record_end_to_end() {
    let raw = raw_from(json!({
        "soc": "76.5",
        "chargePower": "120",
        "disChargePower": "0",
        "ppv": "300",
        "pac": "50",
        "workMode": "2",
        "status": "1"
    }));

    let snapshot = normalize(&raw, ConnectionKind::Api, clock());
    assert_eq!(snapshot.battery.soc, 76.5);
    assert_eq!(snapshot.battery.power, 120.0);
    assert_eq!(snapshot.battery.status, BatteryStatus::Charging);
    assert_eq!(snapshot.system.status, "Online");
    assert_eq!(snapshot.system.mode, "Grid First");
    assert_eq!(snapshot.solar.power, 300.0);
    assert_eq!(snapshot.grid.power, 50.0);
    // 300 solar + 0 discharge - 120 charge - 50 grid = 130 to the load.
    assert_eq!(snapshot.load.power, 130.0);
}

#[test]
fn load_power_never_goes_negative() {
    // Charging harder than solar plus discharge minus grid can cover.
    let raw = raw_from(json!({
        "chargePower": "800",
        "disChargePower": "0",
        "ppv": "100",
        "pac": "50"
    }));
    let snapshot = normalize(&raw, ConnectionKind::Api, clock());
    assert_eq!(snapshot.load.power, 0.0);

    // A directly reported negative value clamps too.
    let raw = raw_from(json!({"load_power": -25}));
    let snapshot = normalize(&raw, ConnectionKind::Mqtt, clock());
    assert_eq!(snapshot.load.power, 0.0);
}

#[test]
fn discharging_battery_and_signed_power_field() {
    let raw = raw_from(json!({
        "battery_soc": 42,
        "battery_power": -200,
        "solar_power": 0,
        "grid_power": -150
    }));

    let snapshot = normalize(&raw, ConnectionKind::ModbusTcp, clock());
    assert_eq!(snapshot.battery.power, -200.0);
    assert_eq!(snapshot.battery.status, BatteryStatus::Discharging);
    // 0 solar + 200 discharge - 0 charge - (-150) grid export = 350.
    assert_eq!(snapshot.load.power, 350.0);
}

#[test]
fn idle_battery_and_unknown_status_codes() {
    let raw = raw_from(json!({
        "battery_power": 0,
        "system_status": 7,
        "work_mode": 9
    }));

    let snapshot = normalize(&raw, ConnectionKind::Mqtt, clock());
    assert_eq!(snapshot.battery.status, BatteryStatus::Idle);
    assert_eq!(snapshot.system.status, "Unknown (7)");
    assert_eq!(snapshot.system.mode, "Unknown (9)");
}

#[test]
fn unparseable_numbers_collapse_to_zero() {
    let raw = raw_from(json!({
        "soc": "not-a-number",
        "chargePower": "",
        "status": "1"
    }));

    let snapshot = normalize(&raw, ConnectionKind::Api, clock());
    assert_eq!(snapshot.battery.soc, 0.0);
    assert_eq!(snapshot.battery.power, 0.0);
    assert_eq!(snapshot.system.status, "Online");
}

#[test]
fn generic_vocabulary_populates_all_blocks() {
    let raw = raw_from(json!({
        "battery_soc": 55.0,
        "battery_voltage": 48.2,
        "battery_power": 300,
        "battery_temperature": 25.3,
        "solar_power": 450,
        "solar_energy_today": 3.2,
        "grid_power": 80,
        "grid_voltage": 230.1,
        "grid_frequency": 49.98,
        "grid_connected": true,
        "load_power": 130,
        "load_energy_today": 4.1,
        "system_status": 1,
        "work_mode": 0,
        "serial_number": "0PVPH6ZR23QT01AX",
        "firmware_version": "1.3.0",
        "model": "Noah 2000"
    }));

    let snapshot = normalize(&raw, ConnectionKind::ModbusTcp, clock());
    assert_eq!(snapshot.battery.voltage, 48.2);
    assert_eq!(snapshot.battery.status, BatteryStatus::Charging);
    assert_eq!(snapshot.solar.energy_today, 3.2);
    assert_eq!(snapshot.grid.frequency, 49.98);
    assert!(snapshot.grid.connected);
    assert_eq!(snapshot.load.power, 130.0);
    assert_eq!(snapshot.system.mode, "Load First");
    assert_eq!(snapshot.system.serial_number, "0PVPH6ZR23QT01AX");
    assert_eq!(snapshot.system.model, "Noah 2000");
}

#[test]
fn inverter_vocabulary_covers_pv_strings_and_temperature() {
    let raw = raw_from(json!({
        "pac": "120",
        "vpv1": "35.1",
        "ipv1": "8.2",
        "ppv1": "288",
        "vpv2": "34.8",
        "eToday": "2.5",
        "eTotal": "810.3",
        "fac1": "50.02",
        "vac1": "231.5",
        "tempperature": "41.2",
        "status": "1"
    }));

    let snapshot = normalize(&raw, ConnectionKind::Api, clock());
    let pv1 = snapshot.solar.pv1.expect("pv1");
    assert_eq!(pv1.voltage, 35.1);
    assert_eq!(pv1.power, 288.0);
    let pv2 = snapshot.solar.pv2.expect("pv2");
    assert_eq!(pv2.voltage, 34.8);
    assert_eq!(pv2.current, 0.0);
    assert_eq!(snapshot.solar.inverter_temperature, Some(41.2));
    assert_eq!(snapshot.solar.energy_today, 2.5);
    assert_eq!(snapshot.grid.voltage, 231.5);
    assert_eq!(snapshot.system.status, "Online");
}

#[test]
fn textual_status_fields_pass_through() {
    // MQTT payloads may report the mode and battery state as text already.
    let raw = raw_from(json!({
        "battery_status": "discharging",
        "battery_power": 500,
        "system_mode": "Load First",
        "system_status": "online"
    }));

    let snapshot = normalize(&raw, ConnectionKind::Mqtt, clock());
    // The explicit text wins over the sign of the power field.
    assert_eq!(snapshot.battery.status, BatteryStatus::Discharging);
    assert_eq!(snapshot.system.mode, "Load First");
    assert_eq!(snapshot.system.status, "online");
}

#[test]
fn scalar_fault_code_becomes_single_entry_list() {
    let raw = raw_from(json!({"fault_code": 3, "warning_code": 0}));
    let snapshot = normalize(&raw, ConnectionKind::ModbusTcp, clock());
    assert_eq!(snapshot.system.fault_codes, vec!["3".to_string()]);
    assert!(snapshot.system.warning_codes.is_empty());
}

#[test]
fn translation_tables_match_vendor_codes() {
    assert_eq!(status_text(0), "Offline");
    assert_eq!(status_text(1), "Online");
    assert_eq!(status_text(2), "Fault");
    assert_eq!(status_text(3), "Checking");
    assert_eq!(status_text(9), "Unknown (9)");

    assert_eq!(work_mode_text(0), "Load First");
    assert_eq!(work_mode_text(1), "Battery First");
    assert_eq!(work_mode_text(2), "Grid First");
    assert_eq!(work_mode_text(3), "Backup Mode");
    assert_eq!(work_mode_text(5), "Unknown (5)");
}
