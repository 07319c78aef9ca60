//! Server configuration
//!
//! Loaded from an optional TOML file (`FLEET_CONFIG`, default `fleet.toml`)
//! overlaid with `FLEET__*` environment variables, e.g.
//! `FLEET__SESSIONS__TTL_SECS=600`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Base URL handed to clients when building WebSocket URLs
    pub public_url: String,
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/fleet.db`
    pub database_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/recordings`
    pub recordings_dir: Option<PathBuf>,
    pub jwt_secret: String,
    /// `text` or `json`
    pub log_format: String,
    pub sessions: SessionConfig,
    pub terminal: TerminalConfig,
    pub recording: RecordingConfig,
    pub inventory: InventoryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:16790".to_string(),
            public_url: "ws://localhost:16790".to_string(),
            data_dir: PathBuf::from("/var/lib/fleet"),
            database_path: None,
            recordings_dir: None,
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            log_format: "text".to_string(),
            sessions: SessionConfig::default(),
            terminal: TerminalConfig::default(),
            recording: RecordingConfig::default(),
            inventory: InventoryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("fleet.db"))
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("recordings"))
    }
}

/// Session registry tuning. Channel capacities are tunables, not a contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub ready_timeout_ms: u64,
    pub data_capacity: usize,
    pub input_capacity: usize,
    pub input_send_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            ready_timeout_ms: 10_000,
            data_capacity: 256,
            input_capacity: 64,
            input_send_timeout_ms: 2000,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn input_send_timeout(&self) -> Duration {
        Duration::from_millis(self.input_send_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub heartbeat_interval_ms: u64,
    pub inactivity_timeout_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            inactivity_timeout_ms: 120_000,
        }
    }
}

impl TerminalConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    /// Upper bound of one in-memory recording; unbounded when unset
    pub max_buffer_bytes: Option<usize>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_buffer_bytes: None,
        }
    }
}

/// Agents and instances upserted into the database at startup
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub agents: Vec<AgentEntry>,
    pub instances: Vec<InstanceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    pub host_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceEntry {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
}

pub fn load_config() -> Result<ServerConfig> {
    let path = std::env::var("FLEET_CONFIG").unwrap_or_else(|_| "fleet.toml".to_string());
    info!("Loading configuration (file={}, env prefix=FLEET)", path);

    let settings = config::Config::builder()
        .add_source(config::File::with_name(&path).required(false))
        .add_source(
            config::Environment::with_prefix("FLEET")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .context("Failed to read configuration sources")?;

    let config: ServerConfig = settings
        .try_deserialize()
        .context("Failed to parse configuration")?;

    if config.jwt_secret == DEFAULT_JWT_SECRET {
        warn!("jwt_secret not set, using default (insecure for production)");
    }

    Ok(config)
}
