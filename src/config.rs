//! Engine configuration.
//!
//! Loaded from a TOML file or built in code. Everything except
//! `max_connections` has a default.

use std::path::Path;

use serde::Deserialize;

use crate::connection::DEFAULT_RECV_TIMEOUT;
use crate::notifier::Backend;

/// TCP keep-alive probing parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KeepAlive {
    pub enable: bool,
    /// Seconds of idleness before the first probe.
    pub idle_secs: u32,
    /// Seconds between probes.
    pub interval_secs: u32,
    /// Unanswered probes before the connection is declared dead.
    pub probe_count: u32,
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive {
            enable: false,
            idle_secs: 7200,
            interval_secs: 75,
            probe_count: 9,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter; the RUST_LOG environment variable overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Whether to include timestamps in log lines.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Whether to include the emitting module target.
    #[serde(default = "default_true")]
    pub target: bool,

    /// Whether to include thread names (useful with acceptor pools).
    #[serde(default)]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: true,
            thread_names: false,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upper bound on registry and notifier sizes. Required, > 0.
    pub max_connections: usize,

    /// Per-connection receive-inactivity timeout in seconds.
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_seconds: f64,

    /// Suggested interval for application-level keep-alive traffic;
    /// connection `on_update` hooks are the natural place to act on it.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: f64,

    /// Upper bound on a single accept wait.
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_seconds: f64,

    /// Sleep after the OS reports file-table exhaustion in accept.
    #[serde(default = "default_overload_wait")]
    pub overload_wait_seconds: f64,

    /// SO_SNDBUF / SO_RCVBUF target for accepted connections. 0 leaves the
    /// kernel defaults alone.
    #[serde(default = "default_tcp_buffer")]
    pub tcp_buffer_bytes: usize,

    /// Disable Nagle on accepted connections.
    #[serde(default)]
    pub tcp_no_delay: bool,

    #[serde(default)]
    pub keep_alive: KeepAlive,

    /// Bind the listener with address reuse.
    #[serde(default)]
    pub reuse_address: bool,

    /// Restrict a v6 listener to v6 peers.
    #[serde(default)]
    pub ipv6_only: bool,

    /// Size of the acceptor thread pool. 0 means one per CPU.
    #[serde(default = "default_acceptor_threads")]
    pub acceptor_threads: usize,

    /// Readiness backend: "level-set", "edge-interest", "dual-filter", or
    /// "auto".
    #[serde(default)]
    pub notifier_backend: Backend,

    /// TCP listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_recv_timeout() -> f64 {
    DEFAULT_RECV_TIMEOUT
}

fn default_heartbeat() -> f64 {
    30.0
}

fn default_accept_timeout() -> f64 {
    60.0
}

fn default_overload_wait() -> f64 {
    10.0
}

fn default_tcp_buffer() -> usize {
    262_144
}

fn default_acceptor_threads() -> usize {
    1
}

fn default_backlog() -> i32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// A configuration with every optional field at its default.
    pub fn new(max_connections: usize) -> Self {
        Config {
            max_connections,
            recv_timeout_seconds: default_recv_timeout(),
            heartbeat_seconds: default_heartbeat(),
            accept_timeout_seconds: default_accept_timeout(),
            overload_wait_seconds: default_overload_wait(),
            tcp_buffer_bytes: default_tcp_buffer(),
            tcp_no_delay: false,
            keep_alive: KeepAlive::default(),
            reuse_address: false,
            ipv6_only: false,
            acceptor_threads: default_acceptor_threads(),
            notifier_backend: Backend::default(),
            backlog: default_backlog(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".into());
        }
        if self.recv_timeout_seconds < 0.0 {
            return Err("recv_timeout_seconds cannot be negative".into());
        }
        if self.accept_timeout_seconds < 0.0 {
            return Err("accept_timeout_seconds cannot be negative".into());
        }
        if self.overload_wait_seconds < 0.0 {
            return Err("overload_wait_seconds cannot be negative".into());
        }
        if self.backlog <= 0 {
            return Err("backlog must be greater than 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_gets_defaults() {
        let config: Config = toml::from_str("max_connections = 512").unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_connections, 512);
        assert_eq!(config.recv_timeout_seconds, 120.0);
        assert_eq!(config.heartbeat_seconds, 30.0);
        assert_eq!(config.accept_timeout_seconds, 60.0);
        assert_eq!(config.overload_wait_seconds, 10.0);
        assert_eq!(config.tcp_buffer_bytes, 262_144);
        assert!(!config.tcp_no_delay);
        assert!(!config.keep_alive.enable);
        assert!(!config.reuse_address);
        assert!(!config.ipv6_only);
        assert_eq!(config.acceptor_threads, 1);
        assert_eq!(config.notifier_backend, Backend::Auto);
    }

    #[test]
    fn backend_names_parse() {
        let config: Config = toml::from_str(
            "max_connections = 1\nnotifier_backend = \"edge-interest\"",
        )
        .unwrap();
        assert_eq!(config.notifier_backend, Backend::EdgeInterest);

        let config: Config =
            toml::from_str("max_connections = 1\nnotifier_backend = \"level-set\"").unwrap();
        assert_eq!(config.notifier_backend, Backend::LevelSet);

        let config: Config =
            toml::from_str("max_connections = 1\nnotifier_backend = \"dual-filter\"").unwrap();
        assert_eq!(config.notifier_backend, Backend::DualFilter);
    }

    #[test]
    fn keep_alive_table_parses() {
        let config: Config = toml::from_str(
            "max_connections = 1\n[keep_alive]\nenable = true\nidle_secs = 60\ninterval_secs = 10\nprobe_count = 3",
        )
        .unwrap();
        assert!(config.keep_alive.enable);
        assert_eq!(config.keep_alive.idle_secs, 60);
        assert_eq!(config.keep_alive.interval_secs, 10);
        assert_eq!(config.keep_alive.probe_count, 3);
    }

    #[test]
    fn zero_max_connections_fails_validation() {
        let config: Config = toml::from_str("max_connections = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("max_connections = 1\nbogus = true").is_err());
    }
}
