//! Controller configuration
//!
//! Settings come from `OFC_*` environment variables, optionally seeded from an
//! env file (see [`load_environment`]), and end up in a [`ControllerConfig`].
//!
//! ```rust
//! use ofc_core::config::{load_environment, ControllerConfig};
//!
//! load_environment();
//! let config = ControllerConfig::from_env();
//! assert!(config.packet_in_workers > 0);
//! ```

use serde::Serialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Environment files tried after `$OFC_ENV_FILE`, first match wins
pub const ENV_FILE_PATHS: &[&str] = &["/etc/ofc/environment", "/etc/ofc.env", ".env"];

/// Standard OpenFlow 1.0 controller port
pub const DEFAULT_LISTEN_PORT: u16 = 6633;

/// Load `KEY=VALUE` pairs from the first environment file that exists.
///
/// `$OFC_ENV_FILE` is tried before [`ENV_FILE_PATHS`]. Variables already present
/// in the process environment win over the file. Returns the file used.
pub fn load_environment() -> Option<String> {
    let override_path = std::env::var("OFC_ENV_FILE").ok();
    let candidates = override_path
        .iter()
        .map(String::as_str)
        .chain(ENV_FILE_PATHS.iter().copied());

    for candidate in candidates {
        if !Path::new(candidate).is_file() {
            continue;
        }
        let content = match fs::read_to_string(candidate) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = candidate, error = %e, "Cannot read environment file");
                continue;
            }
        };
        let (applied, kept) = apply_env_pairs(parse_env_file(&content));
        info!(path = candidate, applied, kept, "Environment file loaded");
        return Some(candidate.to_string());
    }

    debug!("No environment file present");
    None
}

/// Set every pair not already in the environment; returns (applied, kept)
fn apply_env_pairs(pairs: Vec<(String, String)>) -> (usize, usize) {
    let mut applied = 0;
    let mut kept = 0;
    for (key, value) in pairs {
        if std::env::var_os(&key).is_some() {
            kept += 1;
            continue;
        }
        std::env::set_var(&key, &value);
        applied += 1;
    }
    (applied, kept)
}

/// Pairs from an env file; blank lines, `#` comments and lines without a key are dropped.
/// An optional `export ` prefix and one layer of matching quotes are stripped.
fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

/// Value of `key`, or `default` when unset.
pub fn get_config(key: &str, default: &str) -> String {
    get_config_opt(key).unwrap_or_else(|| default.to_owned())
}

/// Value of `key` if set and non-empty.
pub fn get_config_opt(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

/// Parsed value of `key`; unset or unparseable falls back to `default`.
pub fn get_config_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    get_config_opt(key)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// `true`/`1`/`yes`/`on` (any case) are true, `false`/`0`/`no`/`off` false.
pub fn get_config_bool(key: &str, default: bool) -> bool {
    match get_config_opt(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if ["true", "1", "yes", "on"].contains(&v.as_str()) => true,
        Some(v) if ["false", "0", "no", "off"].contains(&v.as_str()) => false,
        _ => default,
    }
}

pub fn get_config_int(key: &str, default: i64) -> i64 {
    get_config_parsed(key, default)
}

fn get_config_ms(key: &str, default: Duration) -> Duration {
    let ms = get_config_parsed::<u64>(key, default.as_millis() as u64);
    Duration::from_millis(ms)
}

fn get_config_usize(key: &str, default: usize) -> usize {
    match get_config_parsed::<usize>(key, default) {
        0 => default,
        value => value,
    }
}

/// Parse a comma separated list of IP addresses.
pub fn parse_ip_list(raw: &str) -> Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", s, e)))
        })
        .collect()
}

/// Tunables for one controller process
#[derive(Debug, Clone, Serialize)]
pub struct ControllerConfig {
    /// TCP port the switch connects to
    pub listen_port: u16,
    /// Remotes allowed to connect; empty means any
    pub allowed_remotes: Vec<IpAddr>,
    /// Number of packet-in worker tasks
    pub packet_in_workers: usize,
    /// Capacity of the outbound transaction queue
    pub pending_queue_capacity: usize,
    /// Capacity of the inbound message queue
    pub async_queue_capacity: usize,
    /// Capacity of the packet-in queue
    pub packet_in_queue_capacity: usize,
    /// Period of the maintenance loop (barrier injection)
    pub maintenance_interval: Duration,
    /// Upper bound for the HELLO/ECHO handshake
    pub handshake_timeout: Duration,
    /// Bytes of each unmatched packet the switch sends in a packet-in
    pub miss_send_len: u16,
    /// Period of flow statistics polling
    pub stats_poll_interval: Duration,
    /// How long DELETED flow entries stay observable
    pub deleted_grace_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            allowed_remotes: Vec::new(),
            packet_in_workers: 4,
            pending_queue_capacity: 1024,
            async_queue_capacity: 1024,
            packet_in_queue_capacity: 1024,
            maintenance_interval: Duration::from_millis(1000),
            handshake_timeout: Duration::from_millis(5000),
            miss_send_len: 128,
            stats_poll_interval: Duration::from_millis(10_000),
            deleted_grace_period: Duration::from_millis(5000),
        }
    }
}

impl ControllerConfig {
    /// Build the configuration from `OFC_*` environment variables.
    ///
    /// Unparseable values fall back to the defaults; an invalid
    /// `OFC_ALLOWED_REMOTES` entry is skipped with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let allowed_remotes = match get_config_opt("OFC_ALLOWED_REMOTES") {
            Some(raw) => parse_ip_list(&raw).unwrap_or_else(|e| {
                warn!("Ignoring OFC_ALLOWED_REMOTES: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        Self {
            listen_port: get_config_parsed("OFC_LISTEN_PORT", defaults.listen_port),
            allowed_remotes,
            packet_in_workers: get_config_usize(
                "OFC_PACKET_IN_WORKERS",
                defaults.packet_in_workers,
            ),
            pending_queue_capacity: get_config_usize(
                "OFC_PENDING_QUEUE_CAPACITY",
                defaults.pending_queue_capacity,
            ),
            async_queue_capacity: get_config_usize(
                "OFC_ASYNC_QUEUE_CAPACITY",
                defaults.async_queue_capacity,
            ),
            packet_in_queue_capacity: get_config_usize(
                "OFC_PACKET_IN_QUEUE_CAPACITY",
                defaults.packet_in_queue_capacity,
            ),
            maintenance_interval: get_config_ms(
                "OFC_MAINTENANCE_INTERVAL_MS",
                defaults.maintenance_interval,
            ),
            handshake_timeout: get_config_ms(
                "OFC_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout,
            ),
            miss_send_len: get_config_parsed("OFC_MISS_SEND_LEN", defaults.miss_send_len),
            stats_poll_interval: get_config_ms(
                "OFC_STATS_POLL_INTERVAL_MS",
                defaults.stats_poll_interval,
            ),
            deleted_grace_period: get_config_ms(
                "OFC_DELETED_GRACE_MS",
                defaults.deleted_grace_period,
            ),
        }
    }

    /// Check the values that would make the controller unusable
    pub fn validate(&self) -> Result<()> {
        if self.packet_in_workers == 0 {
            return Err(Error::Config("packet_in_workers must be at least 1".into()));
        }
        if self.pending_queue_capacity == 0
            || self.async_queue_capacity == 0
            || self.packet_in_queue_capacity == 0
        {
            return Err(Error::Config("queue capacities must be non-zero".into()));
        }
        if self.maintenance_interval.is_zero() {
            return Err(Error::Config("maintenance_interval must be non-zero".into()));
        }
        Ok(())
    }
}
