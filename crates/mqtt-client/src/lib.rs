#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use types::RawTelemetry;

/// Topic suffixes the device publishes under the configured prefix. The
/// order is also the merge order: later topics overwrite on key collision.
pub const TOPIC_SUFFIXES: [&str; 5] = ["status", "battery", "solar", "grid", "load"];

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("broker connection failed: {0}")]
    Connection(String),
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    /// Delay before the first merge so at least one message per topic can
    /// arrive after subscribing.
    pub grace_delay: Duration,
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: "noah".to_string(),
            grace_delay: Duration::from_secs(1),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Last-message-per-topic cache. Entries never expire; a topic's value is
/// used until the next message overwrites it.
#[derive(Debug, Default)]
pub struct TopicCache {
    topics: HashMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl TopicCache {
    /// Store a message under the last segment of its topic. Non-object and
    /// malformed payloads are rejected so a single bad message never poisons
    /// the cache.
    pub fn ingest(&mut self, topic: &str, payload: &[u8]) -> Result<(), serde_json::Error> {
        let key = topic.rsplit('/').next().unwrap_or(topic).to_string();
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        match value {
            serde_json::Value::Object(map) => {
                self.topics.insert(key, map);
                Ok(())
            }
            other => {
                // Coerce scalars into a single-field object keyed by topic,
                // matching devices that publish bare sensor values.
                let mut map = serde_json::Map::new();
                map.insert(key.clone(), other);
                self.topics.insert(key, map);
                Ok(())
            }
        }
    }

    /// Merge all cached topic payloads into one flat map, in the fixed
    /// topic order.
    pub fn merged(&self) -> RawTelemetry {
        let mut raw = RawTelemetry::new();
        for suffix in TOPIC_SUFFIXES {
            if let Some(map) = self.topics.get(suffix) {
                for (key, value) in map {
                    raw.insert(key.clone(), value.clone());
                }
            }
        }
        raw
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Subscribes to the fixed topic set and keeps the last JSON payload per
/// topic in a cache the poller merges on demand.
pub struct MqttTransport {
    client: AsyncClient,
    cache: Arc<Mutex<TopicCache>>,
    connected: Arc<AtomicBool>,
    config: MqttConfig,
    eventloop_task: tokio::task::JoinHandle<()>,
}

impl MqttTransport {
    pub async fn connect(config: MqttConfig) -> Result<Self, MqttError> {
        let client_id = format!("noah-collector-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &config.broker, config.port);
        options.set_keep_alive(config.keep_alive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        for suffix in TOPIC_SUFFIXES {
            client
                .subscribe(format!("{}/{}", config.topic_prefix, suffix), QoS::AtMostOnce)
                .await?;
        }

        let cache = Arc::new(Mutex::new(TopicCache::default()));
        let connected = Arc::new(AtomicBool::new(false));
        let loop_cache = Arc::clone(&cache);
        let loop_connected = Arc::clone(&connected);
        let eventloop_task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt broker connected");
                        loop_connected.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let mut cache = loop_cache.lock().unwrap_or_else(|e| e.into_inner());
                        if let Err(err) = cache.ingest(&publish.topic, &publish.payload) {
                            warn!(topic = %publish.topic, error = %err, "dropping malformed mqtt payload");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt broker disconnected");
                        loop_connected.store(false, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        loop_connected.store(false, Ordering::SeqCst);
                        warn!(error = %err, "mqtt eventloop error, reconnecting");
                        sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            cache,
            connected,
            config,
            eventloop_task,
        })
    }

    /// Wait out the grace delay, then merge everything the topics delivered
    /// so far. An empty map just means nothing arrived yet.
    pub async fn fetch_raw(&self) -> RawTelemetry {
        sleep(self.config.grace_delay).await;
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let raw = cache.merged();
        debug!(topics = cache.topic_count(), fields = raw.len(), "mqtt cache merged");
        raw
    }

    /// True once the broker acknowledged the connection, polled up to the
    /// given deadline.
    pub async fn probe(&self, deadline: Duration) -> bool {
        let step = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        while waited < deadline {
            if self.connected.load(Ordering::SeqCst) {
                return true;
            }
            sleep(step).await;
            waited += step;
        }
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn close(self) {
        if let Err(err) = self.client.disconnect().await {
            debug!(error = %err, "mqtt disconnect failed");
        }
        self.eventloop_task.abort();
    }
}
