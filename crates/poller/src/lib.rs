#![allow(dead_code)]

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use cloud_client::{CloudClient, CloudError};
use modbus_client::{ClientError, ModbusClient};
use mqtt_client::{MqttError, MqttTransport};
use normalizer::normalize;
use types::{ConnectionKind, DeviceSnapshot, DeviceVariant, RawTelemetry};

const MQTT_PROBE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Mqtt(#[from] MqttError),
    #[error(transparent)]
    Modbus(#[from] ClientError),
}

/// Closed set of transports, selected once at construction time.
pub enum Transport {
    Cloud(CloudClient),
    Mqtt(MqttTransport),
    ModbusTcp(ModbusClient),
    ModbusRtu(ModbusClient),
}

impl Transport {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Self::Cloud(_) => ConnectionKind::Api,
            Self::Mqtt(_) => ConnectionKind::Mqtt,
            Self::ModbusTcp(_) => ConnectionKind::ModbusTcp,
            Self::ModbusRtu(_) => ConnectionKind::ModbusRtu,
        }
    }

    /// Connection probe for setup validation; swallows all errors.
    pub async fn test_connection(&mut self, variant: DeviceVariant) -> bool {
        match self {
            Self::Cloud(client) => client.test_connection().await,
            Self::Mqtt(transport) => transport.probe(MQTT_PROBE_DEADLINE).await,
            Self::ModbusTcp(client) | Self::ModbusRtu(client) => client.probe(variant).await,
        }
    }

    pub async fn fetch_raw(&mut self, variant: DeviceVariant) -> Result<RawTelemetry, TransportError> {
        match self {
            Self::Cloud(client) => Ok(client.fetch_status().await?),
            Self::Mqtt(transport) => Ok(transport.fetch_raw().await),
            Self::ModbusTcp(client) | Self::ModbusRtu(client) => {
                Ok(client.poll_variant(variant).await?)
            }
        }
    }

    /// Secondary best-effort fetch; only the cloud transport has a config
    /// surface, the others contribute nothing.
    pub async fn fetch_config(&mut self) -> Result<RawTelemetry, TransportError> {
        match self {
            Self::Cloud(client) => Ok(client.fetch_device_config().await?),
            _ => Ok(RawTelemetry::new()),
        }
    }

    pub async fn close(self) {
        match self {
            Self::Cloud(mut client) => client.close(),
            Self::Mqtt(transport) => transport.close().await,
            // Dropping the client closes the socket; an in-flight request is
            // allowed to fail naturally.
            Self::ModbusTcp(_) | Self::ModbusRtu(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    RateLimited,
    DeviceNotFound,
    Network,
    Protocol,
}

/// A transport failure folded into the small user-facing taxonomy, with a
/// remediation hint for the collaborating layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
    pub hint: &'static str,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} ({})", self.category, self.message, self.hint)
    }
}

pub fn classify(error: &TransportError) -> ClassifiedError {
    let (category, hint) = match error {
        TransportError::Cloud(cloud) => match cloud {
            CloudError::Auth(_) => (
                ErrorCategory::Authentication,
                "check the configured username and password",
            ),
            CloudError::SessionExpired => (
                ErrorCategory::Authentication,
                "re-login failed, credentials may have been revoked",
            ),
            CloudError::RateLimited(_) => (
                ErrorCategory::RateLimited,
                "the vendor throttled this account, retrying automatically",
            ),
            CloudError::NoPlants | CloudError::NoDevice(_) => (
                ErrorCategory::DeviceNotFound,
                "verify the device id and that the account owns this device",
            ),
            CloudError::Http(_) => (
                ErrorCategory::Network,
                "cloud unreachable, retrying on the next poll",
            ),
            CloudError::Protocol(_) => (
                ErrorCategory::Protocol,
                "unexpected vendor response, please report the payload",
            ),
        },
        TransportError::Mqtt(_) => (
            ErrorCategory::Network,
            "broker unreachable, retrying on the next poll",
        ),
        TransportError::Modbus(modbus) => match modbus {
            ClientError::InvalidAddress(_, _) => (
                ErrorCategory::Protocol,
                "check the configured host and port",
            ),
            _ => (
                ErrorCategory::Network,
                "device unreachable, retrying on the next poll",
            ),
        },
    };
    ClassifiedError {
        category,
        message: error.to_string(),
        hint,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching,
    Ready,
    Degraded,
}

/// The coordinator's observable state: the last good snapshot survives any
/// number of failed polls, and a failure never becomes terminal.
#[derive(Debug)]
pub struct PollState {
    phase: Phase,
    last_snapshot: Option<DeviceSnapshot>,
    last_error: Option<ClassifiedError>,
    consecutive_failures: u32,
}

impl Default for PollState {
    fn default() -> Self {
        Self::new()
    }
}

impl PollState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_snapshot: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }

    pub fn begin(&mut self) {
        self.phase = Phase::Fetching;
    }

    pub fn on_success(&mut self, snapshot: DeviceSnapshot) {
        self.phase = Phase::Ready;
        self.last_snapshot = Some(snapshot);
        self.last_error = None;
        self.consecutive_failures = 0;
    }

    pub fn on_failure(&mut self, error: ClassifiedError) {
        self.phase = Phase::Degraded;
        self.last_error = Some(error);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn latest(&self) -> Option<&DeviceSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn last_error(&self) -> Option<&ClassifiedError> {
        self.last_error.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

pub enum RefreshOutcome {
    /// A fetch was already in flight (or the coordinator is closed); the
    /// tick is skipped, never queued.
    Skipped,
    Ready(DeviceSnapshot),
    Degraded(ClassifiedError),
}

/// Owns exactly one transport and serializes every poll through a
/// single-flight refresh.
pub struct Coordinator {
    transport: tokio::sync::Mutex<Option<Transport>>,
    kind: ConnectionKind,
    variant: DeviceVariant,
    state: std::sync::Mutex<PollState>,
}

impl Coordinator {
    pub fn new(transport: Transport, variant: DeviceVariant) -> Self {
        let kind = transport.kind();
        Self {
            transport: tokio::sync::Mutex::new(Some(transport)),
            kind,
            variant,
            state: std::sync::Mutex::new(PollState::new()),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub async fn test_connection(&self) -> bool {
        let mut guard = self.transport.lock().await;
        match guard.as_mut() {
            Some(transport) => transport.test_connection(self.variant).await,
            None => false,
        }
    }

    /// Run one poll cycle: fetch, merge the best-effort config fetch,
    /// normalize, store. Returns what happened; a tick arriving while a
    /// fetch is in flight is skipped.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Ok(mut guard) = self.transport.try_lock() else {
            debug!("refresh already in flight, skipping tick");
            return RefreshOutcome::Skipped;
        };
        let Some(transport) = guard.as_mut() else {
            debug!("coordinator closed, skipping tick");
            return RefreshOutcome::Skipped;
        };

        self.with_state(|state| state.begin());

        match transport.fetch_raw(self.variant).await {
            Ok(mut raw) => {
                // The secondary fetch can only add fields; its failure never
                // downgrades a successful poll.
                match transport.fetch_config().await {
                    Ok(extra) => {
                        for (key, value) in extra {
                            raw.entry(key).or_insert(value);
                        }
                    }
                    Err(err) => debug!(error = %err, "config fetch failed, keeping primary result"),
                }

                let snapshot = normalize(&raw, self.kind, Utc::now());
                info!(
                    soc = snapshot.battery.soc,
                    solar_w = snapshot.solar.power,
                    load_w = snapshot.load.power,
                    status = %snapshot.system.status,
                    "poll cycle complete"
                );
                self.with_state(|state| state.on_success(snapshot.clone()));
                RefreshOutcome::Ready(snapshot)
            }
            Err(err) => {
                let classified = classify(&err);
                warn!(
                    category = ?classified.category,
                    error = %err,
                    hint = classified.hint,
                    "poll cycle failed"
                );
                self.with_state(|state| state.on_failure(classified.clone()));
                RefreshOutcome::Degraded(classified)
            }
        }
    }

    pub fn latest(&self) -> Option<DeviceSnapshot> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.latest().cloned()
    }

    pub fn last_error(&self) -> Option<ClassifiedError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_error().cloned()
    }

    pub fn phase(&self) -> Phase {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.phase()
    }

    /// Tear down the owned transport. Subsequent refreshes are skipped.
    pub async fn close(&self) {
        let transport = {
            let mut guard = self.transport.lock().await;
            guard.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    fn with_state<R>(&self, apply: impl FnOnce(&mut PollState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut state)
    }
}
