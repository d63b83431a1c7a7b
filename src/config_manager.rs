// src/config_manager.rs
// Node configuration: one JSON file under ~/.dkg, seeded from the environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::network::codec::DEFAULT_MAX_MESSAGE_BYTES;
use crate::network::{GuardConfig, PeerId, RetryPolicy, ServiceConfig, WindowPolicy};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub bootstrap_peers: Vec<String>,
    pub dial_timeout_ms: u64,
    pub refresh_interval_secs: u64,
    pub max_message_bytes: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base58 peer id; generated on first start when empty
    pub peer_id: String,
    pub created_at: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub basic_window_secs: u64,
    pub basic_max_requests: usize,
    pub spam_window_secs: u64,
    pub spam_max_requests: usize,
    pub blacklist_minutes: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub max_open_sessions: usize,
    pub response_timeout_secs: u64,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub busy_retry_attempts: u32,
    pub busy_retry_delay_ms: u64,
    pub busy_retry_deadline_secs: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoadConfig {
    pub max_lag_ms: u64,
    pub sample_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub replication_factor: usize,
    pub max_candidates: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            identity: IdentityConfig::default(),
            rate_limit: RateLimitConfig::default(),
            sessions: SessionConfig::default(),
            load: LoadConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9000".to_string(),
            bootstrap_peers: vec![],
            dial_timeout_ms: 2_000,
            refresh_interval_secs: 600,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            created_at: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            basic_window_secs: 60,
            basic_max_requests: 20,
            spam_window_secs: 60,
            spam_max_requests: 150,
            blacklist_minutes: 60,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_open_sessions: 10,
            response_timeout_secs: 30,
            idle_ttl_secs: 300,
            sweep_interval_secs: 60,
            busy_retry_attempts: 5,
            busy_retry_delay_ms: 5_000,
            busy_retry_deadline_secs: 60,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_lag_ms: 70,
            sample_interval_ms: 500,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            replication_factor: 5,
            max_candidates: 100,
        }
    }
}

impl NodeConfig {
    /// Load from the default location, creating it from the environment
    /// on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: NodeConfig = serde_json::from_str(&json)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        } else {
            let mut config = Self::from_env();
            config.ensure_identity();
            config.save_to(path)?;
            tracing::info!("Created configuration at {}", path.display());
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// Defaults overridden by `DKG_*` variables (a `.env` file is honoured).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DKG_LISTEN_ADDR") {
            config.network.listen_addr = addr;
        }
        if let Ok(peers) = std::env::var("DKG_BOOTSTRAP_PEERS") {
            config.network.bootstrap_peers = peers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(peer_id) = std::env::var("DKG_PEER_ID") {
            config.identity.peer_id = peer_id.trim().to_string();
        }
        if let Some(n) = env_parse("DKG_MAX_OPEN_SESSIONS") {
            config.sessions.max_open_sessions = n;
        }
        if let Some(n) = env_parse("DKG_REPLICATION_FACTOR") {
            config.discovery.replication_factor = n;
        }
        config
    }

    /// Generate a peer id if none is configured. Returns true when one was made.
    pub fn ensure_identity(&mut self) -> bool {
        if !self.identity.peer_id.is_empty() {
            return false;
        }
        self.identity.peer_id = PeerId::random().to_base58();
        self.identity.created_at = Some(chrono::Utc::now().to_rfc3339());
        true
    }

    pub fn peer_id(&self) -> Result<PeerId> {
        self.identity
            .peer_id
            .parse()
            .with_context(|| format!("invalid peer id {:?}", self.identity.peer_id))
    }

    pub fn guard_config(&self) -> GuardConfig {
        let r = &self.rate_limit;
        GuardConfig {
            basic: WindowPolicy {
                window: Duration::from_secs(r.basic_window_secs),
                max_requests: r.basic_max_requests,
            },
            spam: WindowPolicy {
                window: Duration::from_secs(r.spam_window_secs),
                max_requests: r.spam_max_requests,
            },
            blacklist_window: Duration::from_secs(r.blacklist_minutes * 60),
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        let s = &self.sessions;
        ServiceConfig {
            guard: self.guard_config(),
            max_open_sessions: s.max_open_sessions,
            max_lag: Duration::from_millis(self.load.max_lag_ms),
            lag_sample_interval: Duration::from_millis(self.load.sample_interval_ms),
            response_timeout: Duration::from_secs(s.response_timeout_secs),
            retry: RetryPolicy {
                max_attempts: s.busy_retry_attempts,
                delay: Duration::from_millis(s.busy_retry_delay_ms),
                deadline: Duration::from_secs(s.busy_retry_deadline_secs),
            },
            session_ttl: Duration::from_secs(s.idle_ttl_secs),
            sweep_interval: Duration::from_secs(s.sweep_interval_secs),
            replication_factor: self.discovery.replication_factor,
            max_candidates: self.discovery.max_candidates,
            max_message_bytes: self.network.max_message_bytes,
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.network.dial_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.network.refresh_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn get_config_path() -> PathBuf {
    let home = if cfg!(windows) {
        std::env::var("USERPROFILE").unwrap_or_else(|_| "C:\\Users\\Default".to_string())
    } else {
        std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string())
    };
    PathBuf::from(home).join(".dkg").join("config.json")
}
