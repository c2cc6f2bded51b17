use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use cloud_client::{CloudClient, CloudConfig};
use modbus_client::{ClientConfig, Endpoint, ModbusClient};
use mqtt_client::{MqttConfig, MqttTransport};
use noah_app::AppConfig;
use poller::{Coordinator, RefreshOutcome, Transport};
use types::ConnectionKind;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = parse_config_arg();
    let config = AppConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;

    info!(
        connection = %config.connection,
        device_type = %config.variant,
        scan_interval_secs = config.scan_interval_secs,
        "starting collector"
    );

    let transport = build_transport(&config).await.context("transport setup failed")?;
    let coordinator = Arc::new(Coordinator::new(transport, config.variant));

    if coordinator.test_connection().await {
        info!("connection test passed");
    } else {
        // The coordinator keeps retrying on every tick, so a failed probe
        // delays data instead of aborting startup.
        warn!("connection test failed, polling will retry");
    }

    notify_ready();

    let mut ticker = interval(Duration::from_secs(config.scan_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.refresh().await {
                    RefreshOutcome::Ready(snapshot) => {
                        info!(
                            soc = snapshot.battery.soc,
                            battery_w = snapshot.battery.power,
                            solar_w = snapshot.solar.power,
                            grid_w = snapshot.grid.power,
                            load_w = snapshot.load.power,
                            status = %snapshot.system.status,
                            mode = %snapshot.system.mode,
                            "snapshot updated"
                        );
                    }
                    RefreshOutcome::Degraded(error) => {
                        warn!(error = %error, "poll degraded, serving last good snapshot");
                    }
                    RefreshOutcome::Skipped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    coordinator.close().await;
    Ok(())
}

async fn build_transport(config: &AppConfig) -> Result<Transport> {
    match config.connection {
        ConnectionKind::Api => {
            let cloud = CloudConfig {
                server_url: config.server_url.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
                device_id: config.device_id.clone(),
                timeout: Duration::from_secs(config.timeout_secs),
                token_cache_path: config.token_cache_path.clone().map(PathBuf::from),
            };
            Ok(Transport::Cloud(CloudClient::new(cloud)?))
        }
        ConnectionKind::Mqtt => {
            let mut mqtt = MqttConfig::default();
            mqtt.broker = config.mqtt_broker.clone();
            mqtt.port = config.mqtt_port;
            mqtt.topic_prefix = config.mqtt_topic.clone();
            if !config.username.is_empty() && !config.password.is_empty() {
                mqtt.username = Some(config.username.clone());
                mqtt.password = Some(config.password.clone());
            }
            Ok(Transport::Mqtt(MqttTransport::connect(mqtt).await?))
        }
        ConnectionKind::ModbusTcp => {
            let client = ModbusClient::connect(modbus_config(
                config,
                Endpoint::Tcp {
                    host: config.host.clone(),
                    port: config.port,
                },
            ))
            .await?;
            Ok(Transport::ModbusTcp(client))
        }
        ConnectionKind::ModbusRtu => {
            let client = ModbusClient::connect(modbus_config(
                config,
                Endpoint::Rtu {
                    serial_port: config.serial_port.clone(),
                    baudrate: config.baudrate,
                },
            ))
            .await?;
            Ok(Transport::ModbusRtu(client))
        }
    }
}

fn modbus_config(config: &AppConfig, endpoint: Endpoint) -> ClientConfig {
    ClientConfig {
        endpoint,
        unit_id: config.modbus_unit_id,
        timeout_ms: config.modbus_timeout_ms,
        retry_count: config.modbus_retry_count,
        retry_backoff_ms: config.modbus_retry_backoff_ms,
        retry_max_backoff_ms: config.modbus_retry_max_backoff_ms,
        inter_read_delay_ms: config.modbus_inter_read_delay_ms,
    }
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}
