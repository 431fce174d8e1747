//! Daemon configuration.
//!
//! One JSON file configures both roles; each subcommand reads only its
//! own section:
//! - `secret_key`: hex ed25519 seed of the daemon's identity
//! - `rendezvous`: Rendezvous server settings
//! - `relay`: relay node and gossip settings

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use npp_core::TransportCredentials;
use npp_relay::{GossipConfig, RelayServerConfig, default_node_name};
use npp_rendezvous::{PublicIpSource, ServerConfig};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config file '{path}': {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for this schema.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range or malformed.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Rendezvous server section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RendezvousSection {
    /// TCP address to listen on.
    pub listen: SocketAddr,
    /// Also serve QUIC on the same port number.
    pub quic: bool,
    /// Where the server learns its public IP.
    pub public_ip: PublicIpSource,
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Maximum number of in-flight calls per session.
    pub max_calls_per_session: usize,
}

impl Default for RendezvousSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            listen: defaults.bind_addr,
            quic: true,
            public_ip: defaults.public_ip,
            max_sessions: defaults.max_sessions,
            max_calls_per_session: defaults.max_calls_per_session,
        }
    }
}

/// Gossip membership section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterSection {
    /// Member name; `<hostname>-<uuid>` when empty.
    pub name: String,
    /// UDP address to gossip on.
    pub listen: SocketAddr,
    /// Gossip address announced to other members.
    pub announce: Option<SocketAddr>,
    /// Hex shared secret of the cluster.
    pub secret: String,
    /// Gossip addresses of members to join through.
    pub seeds: Vec<SocketAddr>,
    /// Heartbeat interval in milliseconds.
    pub interval_ms: u64,
    /// Milliseconds without a heartbeat before a member is declared gone.
    pub failure_timeout_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            listen: SocketAddr::from(([0, 0, 0, 0], npp_relay::DEFAULT_GOSSIP_PORT)),
            announce: None,
            secret: String::new(),
            seeds: Vec::new(),
            interval_ms: 1000,
            failure_timeout_ms: 5000,
        }
    }
}

/// Relay node section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelaySection {
    /// TCP address to accept relay connections on.
    pub listen: SocketAddr,
    /// Relay address announced to other members.
    pub announce: Option<SocketAddr>,
    /// Monitoring service address; disabled when absent.
    pub monitor: Option<SocketAddr>,
    /// Seconds allowed for the handshake frame.
    pub handshake_timeout_secs: u64,
    /// Seconds a SERVER waits for a CLIENT.
    pub server_wait_timeout_secs: u64,
    /// Seconds a CLIENT waits for a SERVER.
    pub client_wait_timeout_secs: u64,
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Gossip membership.
    pub cluster: ClusterSection,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], npp_relay::DEFAULT_PORT)),
            announce: None,
            monitor: Some(SocketAddr::from(([127, 0, 0, 1], npp_relay::DEFAULT_PORT + 2))),
            handshake_timeout_secs: 30,
            server_wait_timeout_secs: 60,
            client_wait_timeout_secs: 30,
            max_connections: 10_000,
            cluster: ClusterSection::default(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Hex ed25519 seed; an ephemeral key is generated when empty.
    #[serde(default)]
    pub secret_key: String,
    /// Rendezvous server settings.
    #[serde(default)]
    pub rendezvous: RendezvousSection,
    /// Relay node settings.
    #[serde(default)]
    pub relay: RelaySection,
}

impl DaemonConfig {
    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parses and validates a JSON config.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// A sample configuration with freshly generated secrets.
    pub fn sample() -> Self {
        let mut config = Self {
            secret_key: random_hex(),
            ..Self::default()
        };
        config.relay.cluster.secret = random_hex();
        config
    }

    /// Writes the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io)
    }

    /// Checks values the servers cannot run with.
    ///
    /// The relay gossip secret is checked by [`Self::relay_config`], since
    /// a Rendezvous-only deployment has none.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.secret_key.is_empty() {
            parse_secret_key(&self.secret_key)?;
        }
        if self.rendezvous.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "rendezvous.max_sessions must be greater than 0".to_string(),
            ));
        }
        if self.rendezvous.max_calls_per_session == 0 {
            return Err(ConfigError::Invalid(
                "rendezvous.max_calls_per_session must be greater than 0".to_string(),
            ));
        }
        if self.relay.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_connections must be greater than 0".to_string(),
            ));
        }
        if self.relay.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "relay.handshake_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Credentials from `secret_key`, or ephemeral ones when it is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed.
    pub fn credentials(&self) -> anyhow::Result<TransportCredentials> {
        let key = if self.secret_key.is_empty() {
            SigningKey::generate(&mut OsRng)
        } else {
            parse_secret_key(&self.secret_key)?
        };
        Ok(TransportCredentials::new(key)?)
    }

    /// Rendezvous server configuration.
    pub fn rendezvous_config(&self) -> ServerConfig {
        let section = &self.rendezvous;
        let config = ServerConfig::new(section.listen)
            .with_public_ip(section.public_ip.clone())
            .with_max_sessions(section.max_sessions)
            .with_max_calls_per_session(section.max_calls_per_session);
        if section.quic { config.with_quic() } else { config }
    }

    /// Relay node configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the gossip secret is missing or malformed, or
    /// the resulting configuration fails validation.
    pub fn relay_config(&self) -> anyhow::Result<RelayServerConfig> {
        let section = &self.relay;
        let cluster = &section.cluster;
        if cluster.secret.is_empty() {
            anyhow::bail!("relay.cluster.secret must be set");
        }
        let name = if cluster.name.is_empty() {
            default_node_name()
        } else {
            cluster.name.clone()
        };
        let mut gossip = GossipConfig::new(name, cluster.listen, GossipConfig::secret_from_hex(&cluster.secret)?)
            .with_seeds(cluster.seeds.clone())
            .with_interval(Duration::from_millis(cluster.interval_ms))
            .with_failure_timeout(Duration::from_millis(cluster.failure_timeout_ms));
        if let Some(announce) = cluster.announce {
            gossip = gossip.with_announce(announce);
        }

        let mut config = RelayServerConfig::new(section.listen, gossip)
            .with_handshake_timeout(Duration::from_secs(section.handshake_timeout_secs))
            .with_wait_timeouts(
                Duration::from_secs(section.server_wait_timeout_secs),
                Duration::from_secs(section.client_wait_timeout_secs),
            )
            .with_max_connections(section.max_connections);
        if let Some(announce) = section.announce {
            config = config.with_announce(announce);
        }
        if let Some(monitor) = section.monitor {
            config = config.with_monitor(monitor);
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_secret_key(hex_key: &str) -> Result<SigningKey, ConfigError> {
    let bytes = hex::decode(hex_key.trim_start_matches("0x"))
        .map_err(|e| ConfigError::Invalid(format!("secret_key is not hex: {e}")))?;
    let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        ConfigError::Invalid(format!("secret_key must be 32 bytes, got {}", bytes.len()))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

fn random_hex() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
