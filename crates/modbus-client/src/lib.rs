#![allow(dead_code)]

use std::cmp::min;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, SlaveContext};
use tokio_serial::SerialStream;
use tracing::{debug, warn};

use register_map::{decode, registers_for, RegisterDef};
use types::{DeviceVariant, RawTelemetry};

/// Where the device lives: a Modbus TCP gateway or a local serial adapter.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Rtu { serial_port: String, baudrate: u32 },
}

/// Configuration options for connecting and polling the device registers.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub unit_id: u8,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of retries per request after the initial attempt.
    pub retry_count: usize,
    /// Base delay between retries in milliseconds (exponential backoff).
    pub retry_backoff_ms: u64,
    /// Upper bound for retry backoff delay in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Optional delay between register reads to placate slower devices.
    pub inter_read_delay_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
            },
            unit_id: 1,
            timeout_ms: 1_000,
            retry_count: 2,
            retry_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
            inter_read_delay_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("modbus transport error: {0}")]
    Modbus(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

#[derive(Debug)]
pub struct ModbusClient {
    config: ClientConfig,
    context: Mutex<Context>,
}

impl ModbusClient {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let context = match &config.endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = format!("{host}:{port}")
                    .parse::<SocketAddr>()
                    .map_err(|_| ClientError::InvalidAddress(host.clone(), *port))?;
                tcp::connect_slave(addr, Slave(config.unit_id)).await?
            }
            Endpoint::Rtu { serial_port, baudrate } => {
                let builder = tokio_serial::new(serial_port, *baudrate);
                let stream = SerialStream::open(&builder)?;
                rtu::attach_slave(stream, Slave(config.unit_id))
            }
        };
        Ok(Self {
            config,
            context: Mutex::new(context),
        })
    }

    /// Poll every named register of the variant's fixed map with independent
    /// single-register reads. A failing register is logged and omitted so one
    /// bad address never costs the whole poll cycle.
    pub async fn poll_variant(&self, variant: DeviceVariant) -> Result<RawTelemetry, ClientError> {
        let registers = registers_for(variant);
        let mut raw = RawTelemetry::with_capacity(registers.len());
        let mut failed = 0usize;
        let mut last_error = None;

        for register in registers {
            match self.read_register(register).await {
                Ok(value) => {
                    if let Some(number) = serde_json::Number::from_f64(value) {
                        raw.insert(register.name.to_string(), serde_json::Value::Number(number));
                    }
                }
                Err(err) => {
                    failed += 1;
                    warn!(
                        register = register.name,
                        address = register.address,
                        error = %err,
                        "register read failed, omitting from poll"
                    );
                    last_error = Some(err);
                }
            }

            if let Some(delay_ms) = self.config.inter_read_delay_ms {
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        // Partial telemetry is fine; a cycle where every register failed is
        // a dead connection, not partial data.
        if raw.is_empty() {
            if let Some(err) = last_error {
                return Err(err);
            }
        }

        debug!(
            variant = %variant,
            read = raw.len(),
            failed,
            "modbus poll cycle complete"
        );
        Ok(raw)
    }

    /// Read one scaled register value.
    pub async fn read_register(&self, register: &RegisterDef) -> Result<f64, ClientError> {
        let mut ctx = self.context.lock().await;
        let words = self.read_with_retry(&mut ctx, register.address, 1).await?;
        let word = words.first().copied().unwrap_or_default();
        Ok(decode(register, word))
    }

    /// Probe the connection with a single read of the variant's first
    /// register.
    pub async fn probe(&self, variant: DeviceVariant) -> bool {
        match registers_for(variant).first() {
            Some(register) => self.read_register(register).await.is_ok(),
            None => false,
        }
    }

    async fn read_with_retry(
        &self,
        ctx: &mut Context,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        ctx.set_slave(Slave(self.config.unit_id));
        let mut attempts = 0usize;
        let mut last_error = None;

        loop {
            let request = ctx.read_holding_registers(start, count);
            let result = timeout(Duration::from_millis(self.config.timeout_ms), request).await;
            match result {
                Ok(Ok(values)) => {
                    debug!(start, count, "modbus read ok");
                    return Ok(values);
                }
                Ok(Err(err)) => {
                    warn!(start, count, error = %err, "modbus read error");
                    last_error = Some(ClientError::Modbus(err));
                }
                Err(_) => {
                    warn!(start, count, "modbus read timeout");
                    last_error = Some(ClientError::Timeout {
                        timeout_ms: self.config.timeout_ms,
                    });
                }
            }

            if attempts >= self.config.retry_count {
                return Err(last_error.unwrap_or(ClientError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }));
            }

            let delay_ms = self.retry_delay_ms(attempts);
            attempts += 1;
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    fn retry_delay_ms(&self, attempt: usize) -> u64 {
        let base = self.config.retry_backoff_ms.max(1);
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay = base.saturating_mul(factor);
        let max = self.config.retry_max_backoff_ms.max(base);
        min(delay, max)
    }
}
