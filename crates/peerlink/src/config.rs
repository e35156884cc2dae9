//! Configuration types for peerlink nodes

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a PeerNode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerLinkConfig {
    /// Local peer ID (random if None)
    pub peer_id: Option<String>,

    /// Pub/sub broker connection settings
    pub broker: BrokerConfig,

    /// Shared topic carrying presence and signaling envelopes
    pub signaling_topic: String,

    /// Topic for application telemetry published through the supervisor outbox
    pub telemetry_topic: String,

    /// Presence heartbeat and aging thresholds
    pub presence: PresenceConfig,

    /// Broker reconnection policy
    pub reconnect: ReconnectConfig,

    /// STUN/TURN servers handed to the real-time engine
    pub ice_servers: Vec<IceServerConfig>,

    /// Peer session tuning
    pub session: SessionConfig,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker hostname
    pub host: String,

    /// Broker port (default: 1883, 8883 with TLS)
    pub port: u16,

    /// Connect over TLS
    pub use_tls: bool,

    /// Username for broker authentication
    pub username: Option<String>,

    /// Password for broker authentication
    pub password: Option<String>,

    /// Keep-alive interval in seconds (default: 20)
    pub keep_alive_secs: u64,

    /// Connect (CONNACK) timeout in milliseconds (default: 10000)
    pub connect_timeout_ms: u64,

    /// Prefix for the broker client identifier; the peer ID is appended
    pub client_id_prefix: String,
}

/// Presence heartbeat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Heartbeat publication interval in milliseconds (default: 1000)
    pub heartbeat_interval_ms: u64,

    /// Silence after which an Online peer turns Stale (default: 3500)
    pub offline_threshold_ms: u64,

    /// Silence after which a peer is removed (default: 10500)
    pub expire_threshold_ms: u64,

    /// Registry aging tick in milliseconds (default: 1000)
    pub tick_interval_ms: u64,
}

/// Reconnect supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt (default: 3000)
    pub base_delay_ms: u64,

    /// Upper bound on the backoff delay (default: 30000)
    pub max_delay_ms: u64,

    /// Attempts before going dormant until the network returns (default: 20)
    pub max_attempts: u32,

    /// Add up to 25% random jitter to each delay (default: false)
    pub jitter: bool,

    /// Pause between teardown and reconnect on a forced reconnect (default: 500)
    pub force_reconnect_pause_ms: u64,

    /// Interval of the silent-failure health probe (default: 30000)
    pub health_check_interval_ms: u64,

    /// Capacity of the telemetry outbox used while disconnected (default: 100)
    pub outbox_capacity: usize,
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (stun:, turn:, turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Peer session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Outbound message queue capacity while the channel is not ready (default: 100)
    pub outbound_queue_capacity: usize,

    /// Buffered amount above which the channel counts as backpressured (default: 1 MiB)
    pub high_water_mark_bytes: usize,

    /// Transparent ICE restarts before a terminal failure (default: 3)
    pub max_ice_restarts: u32,

    /// Watchdog for the data channel to open, in milliseconds (default: 15000)
    pub channel_open_timeout_ms: u64,

    /// Label of the data channel created by the caller
    pub data_channel_label: String,

    /// Ordered delivery on the data channel (default: true)
    pub ordered: bool,

    /// Maximum retransmits on the data channel (default: 30)
    pub max_retransmits: Option<u16>,
}

impl Default for PeerLinkConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            broker: BrokerConfig::default(),
            signaling_topic: "webrtc/signaling".to_string(),
            telemetry_topic: "gps/demo/nmea".to_string(),
            presence: PresenceConfig::default(),
            reconnect: ReconnectConfig::default(),
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
            ],
            session: SessionConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            username: None,
            password: None,
            keep_alive_secs: 20,
            connect_timeout_ms: 10_000,
            client_id_prefix: "peerlink_".to_string(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            offline_threshold_ms: 3500,
            expire_threshold_ms: 10_500,
            tick_interval_ms: 1000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 3000,
            max_delay_ms: 30_000,
            max_attempts: 20,
            jitter: false,
            force_reconnect_pause_ms: 500,
            health_check_interval_ms: 30_000,
            outbox_capacity: 100,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 100,
            high_water_mark_bytes: 1024 * 1024,
            max_ice_restarts: 3,
            channel_open_timeout_ms: 15_000,
            data_channel_label: "chat".to_string(),
            ordered: true,
            max_retransmits: Some(30),
        }
    }
}

impl IceServerConfig {
    /// STUN entry without credentials
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// TURN entry with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_millis(self.offline_threshold_ms)
    }

    pub fn expire_threshold(&self) -> Duration {
        Duration::from_millis(self.expire_threshold_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl ReconnectConfig {
    pub fn force_reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.force_reconnect_pause_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl SessionConfig {
    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_open_timeout_ms)
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl PeerLinkConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a topic or the broker host is empty
    /// - the heartbeat interval or tick interval is zero
    /// - the offline threshold does not exceed the heartbeat interval
    /// - the expire threshold is below 3x the offline threshold
    /// - the reconnect base delay is zero or exceeds the max delay
    /// - `max_attempts`, a queue capacity or the high-water mark is zero
    /// - an ICE server entry has no URL or an unknown scheme
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(Error::InvalidConfig("broker.host must not be empty".to_string()));
        }

        if self.signaling_topic.trim().is_empty() || self.telemetry_topic.trim().is_empty() {
            return Err(Error::InvalidConfig("topics must not be empty".to_string()));
        }

        if let Some(id) = &self.peer_id {
            if id.trim().is_empty() {
                return Err(Error::InvalidConfig("peer_id must not be blank".to_string()));
            }
        }

        let presence = &self.presence;
        if presence.heartbeat_interval_ms == 0 || presence.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "presence intervals must be greater than zero".to_string(),
            ));
        }

        if presence.offline_threshold_ms <= presence.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "presence.offline_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                presence.offline_threshold_ms, presence.heartbeat_interval_ms
            )));
        }

        if presence.expire_threshold_ms < presence.offline_threshold_ms.saturating_mul(3) {
            return Err(Error::InvalidConfig(format!(
                "presence.expire_threshold_ms ({}) must be at least 3x offline_threshold_ms ({})",
                presence.expire_threshold_ms, presence.offline_threshold_ms
            )));
        }

        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 || reconnect.base_delay_ms > reconnect.max_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnect.base_delay_ms must be in range 1-{}, got {}",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }

        if reconnect.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.max_attempts must be greater than zero".to_string(),
            ));
        }

        if reconnect.outbox_capacity == 0 || self.session.outbound_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue capacities must be greater than zero".to_string(),
            ));
        }

        if self.session.high_water_mark_bytes == 0 {
            return Err(Error::InvalidConfig(
                "session.high_water_mark_bytes must be greater than zero".to_string(),
            ));
        }

        if self.session.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "session.data_channel_label must not be empty".to_string(),
            ));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::InvalidConfig("ICE server without URLs".to_string()));
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
                {
                    return Err(Error::InvalidConfig(format!(
                        "ICE server URL must start with stun:, turn: or turns:, got {}",
                        url
                    )));
                }
            }
        }

        Ok(())
    }

    /// Parse a configuration from TOML; missing keys take their defaults
    ///
    /// # Example
    ///
    /// ```
    /// use peerlink::config::PeerLinkConfig;
    ///
    /// let config = PeerLinkConfig::from_toml_str(r#"
    ///     signaling_topic = "chat/signaling"
    ///     [broker]
    ///     host = "broker.example.com"
    ///     port = 8883
    ///     use_tls = true
    /// "#).unwrap();
    /// assert_eq!(config.broker.port, 8883);
    /// assert_eq!(config.presence.heartbeat_interval_ms, 1000);
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Serialize this configuration to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Create a configuration preset for cellular or flaky networks
    ///
    /// Settings:
    /// - Reconnect: 20 attempts, 3s base, 30s cap (the GPS tracker profile)
    /// - Presence: 1s heartbeat, 3.5s offline, 10.5s expire
    /// - Session: 15s channel-open watchdog, 3 ICE restarts
    /// - TURN relays are usually required (set via `with_ice_servers()`)
    ///
    /// # Example
    ///
    /// ```
    /// use peerlink::config::{IceServerConfig, PeerLinkConfig};
    ///
    /// let config = PeerLinkConfig::mobile_network_preset("broker.example.com")
    ///     .with_ice_servers(vec![
    ///         IceServerConfig::stun("stun:stun.l.google.com:19302"),
    ///         IceServerConfig::turn("turn:turn.example.com:3478", "user", "pass"),
    ///     ]);
    /// assert!(config.broker.use_tls);
    /// assert_eq!(config.reconnect.max_attempts, 20);
    /// ```
    pub fn mobile_network_preset(broker_host: &str) -> Self {
        Self {
            broker: BrokerConfig {
                host: broker_host.to_string(),
                port: 8883,
                use_tls: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration preset for a local network broker
    ///
    /// Faster presence aging and shorter backoff; plain TCP.
    pub fn lan_preset(broker_host: &str) -> Self {
        Self {
            broker: BrokerConfig {
                host: broker_host.to_string(),
                port: 1883,
                use_tls: false,
                connect_timeout_ms: 3000,
                ..Default::default()
            },
            presence: PresenceConfig {
                heartbeat_interval_ms: 500,
                offline_threshold_ms: 1750,
                expire_threshold_ms: 5250,
                tick_interval_ms: 500,
            },
            reconnect: ReconnectConfig {
                base_delay_ms: 1000,
                max_delay_ms: 10_000,
                ..Default::default()
            },
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    /// Replace the ICE server list
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    /// Set the local peer ID
    pub fn with_peer_id(mut self, peer_id: &str) -> Self {
        self.peer_id = Some(peer_id.to_string());
        self
    }

    /// Set broker credentials
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.broker.username = Some(username.to_string());
        self.broker.password = Some(password.to_string());
        self
    }
}
