// src/config.rs
// Configuration validation

use log::{error, info, warn};
use std::net::SocketAddr;

use crate::config_manager::NodeConfig;
use crate::network::PeerId;

/// Validation result for configuration checks
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        if !self.warnings.is_empty() {
            warn!("Configuration warnings:");
            for w in &self.warnings {
                warn!(" - {}", w);
            }
        }

        if !self.errors.is_empty() {
            error!("Configuration errors:");
            for e in &self.errors {
                error!(" - {}", e);
            }
        }

        if self.valid && self.warnings.is_empty() {
            info!("Configuration validation passed");
        }
    }
}

/// Check a loaded configuration before the node starts
pub fn validate_config(config: &NodeConfig) -> ConfigValidation {
    let mut validation = ConfigValidation::new();

    validate_addresses(config, &mut validation);
    validate_identity(config, &mut validation);
    validate_rate_limits(config, &mut validation);
    validate_sessions(config, &mut validation);

    validation
}

fn validate_addresses(config: &NodeConfig, validation: &mut ConfigValidation) {
    let listen_addr = &config.network.listen_addr;
    if listen_addr.parse::<SocketAddr>().is_err() {
        validation.add_error(format!(
            "network.listen_addr has invalid format: '{}' (expected IP:PORT)",
            listen_addr
        ));
    }

    if config.network.bootstrap_peers.is_empty() {
        validation.add_warning("No bootstrap peers configured - node will only be reachable by others".into());
    }
    for peer in &config.network.bootstrap_peers {
        if peer.parse::<SocketAddr>().is_err() && !peer.contains(':') {
            validation.add_error(format!("Bootstrap peer '{}' is not HOST:PORT", peer));
        }
    }
    if config.network.refresh_interval_secs == 0 {
        validation.add_error("network.refresh_interval_secs must be greater than zero".into());
    }
}

fn validate_identity(config: &NodeConfig, validation: &mut ConfigValidation) {
    let peer_id = &config.identity.peer_id;
    if peer_id.is_empty() {
        validation.add_warning("identity.peer_id is empty - a random identity will be used".into());
    } else if peer_id.parse::<PeerId>().is_err() {
        validation.add_error(format!("identity.peer_id '{}' is not valid base58", peer_id));
    }
}

fn validate_rate_limits(config: &NodeConfig, validation: &mut ConfigValidation) {
    let r = &config.rate_limit;
    if r.basic_max_requests == 0 || r.spam_max_requests == 0 {
        validation.add_error("rate_limit max requests must be greater than zero".into());
    }
    if r.basic_window_secs == 0 || r.spam_window_secs == 0 {
        validation.add_error("rate_limit windows must be at least one second".into());
    }
    if r.spam_max_requests <= r.basic_max_requests {
        validation.add_warning(format!(
            "rate_limit.spam_max_requests ({}) <= basic_max_requests ({}) - ordinary bursts will blacklist peers",
            r.spam_max_requests, r.basic_max_requests
        ));
    }
    if r.basic_max_requests > 10_000 {
        validation.add_warning(format!(
            "rate_limit.basic_max_requests is very high ({}) - may not prevent DoS effectively",
            r.basic_max_requests
        ));
    }
}

fn validate_sessions(config: &NodeConfig, validation: &mut ConfigValidation) {
    let s = &config.sessions;
    if s.max_open_sessions == 0 {
        validation.add_warning("sessions.max_open_sessions is 0 - every new session will be declined".into());
    }
    if s.response_timeout_secs == 0 {
        validation.add_error("sessions.response_timeout_secs must be greater than zero".into());
    }
    if s.busy_retry_attempts == 0 {
        validation.add_error("sessions.busy_retry_attempts must be at least 1".into());
    }
    if s.sweep_interval_secs == 0 || s.idle_ttl_secs == 0 {
        validation.add_error("sessions.idle_ttl_secs and sweep_interval_secs must be greater than zero".into());
    }
    if config.load.sample_interval_ms == 0 {
        validation.add_error("load.sample_interval_ms must be greater than zero".into());
    }
    if config.discovery.replication_factor == 0 {
        validation.add_error("discovery.replication_factor must be at least 1".into());
    }
    if config.discovery.max_candidates < config.discovery.replication_factor {
        validation.add_warning(format!(
            "discovery.max_candidates ({}) is below the replication factor ({})",
            config.discovery.max_candidates, config.discovery.replication_factor
        ));
    }
}
