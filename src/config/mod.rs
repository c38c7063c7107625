//! Proxy configuration: the listener, the backend servers and their roles,
//! and the router options that shape every routing decision.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Locations probed when no explicit config path is given
const DEFAULT_CONFIG_PATHS: &[&str] = &["config/janus.toml", "janus.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Invalid {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendAuthConfig,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub router: RouterOptions,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The first config that loads from the conventional locations, or the
    /// built-in defaults when none does
    pub fn load_or_default() -> Self {
        for path in DEFAULT_CONFIG_PATHS.iter().copied() {
            match Self::load(path) {
                Ok(config) => {
                    info!(path, "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    warn!(path, error = %e, "Skipping config location");
                }
            }
        }

        info!("Using default configuration");
        Self::default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    4006
}

/// Credentials the proxy uses towards every backend server
#[derive(Debug, Clone, Deserialize)]
pub struct BackendAuthConfig {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

/// One monitored backend server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub role: ServerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Master,
    Slave,
    Relay,
    Down,
}

impl Default for ServerRole {
    fn default() -> Self {
        Self::Slave
    }
}

/// Tie-breaker used when more than one replica qualifies for a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCriteria {
    LeastCurrentOperations,
    LeastConnections,
    LeastBehindMaster,
    LeastRecentlyUsed,
    Adaptive,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self::LeastCurrentOperations
    }
}

/// What to do when a write arrives and no primary is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Terminate the client connection with a diagnostic
    FailInstantly,
    /// Reply with a read-only error but keep the session alive
    ErrorOnWrite,
    /// Close any lingering primary connection, keep the session for reads
    FailOnWrite,
}

impl Default for MasterFailureMode {
    fn default() -> Self {
        Self::FailInstantly
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterOptions {
    #[serde(default)]
    pub slave_selection_criteria: SelectionCriteria,
    #[serde(default = "default_max_slave_connections")]
    pub max_slave_connections: usize,
    /// Unlimited when negative
    #[serde(default = "default_max_slave_replication_lag")]
    pub max_slave_replication_lag: i64,
    #[serde(default)]
    pub master_accept_reads: bool,
    #[serde(default)]
    pub master_reconnection: bool,
    #[serde(default)]
    pub master_failure_mode: MasterFailureMode,
    #[serde(default = "default_true")]
    pub strict_multi_stmt: bool,
    #[serde(default = "default_true")]
    pub strict_sp_calls: bool,
    #[serde(default = "default_true")]
    pub retry_failed_reads: bool,
    /// Idle ping interval in seconds; 0 disables
    #[serde(default = "default_connection_keepalive")]
    pub connection_keepalive: u64,
    #[serde(default)]
    pub disable_sescmd_history: bool,
    /// Above this many retained session commands, history is dropped
    #[serde(default = "default_max_sescmd_history")]
    pub max_sescmd_history: usize,
    #[serde(default)]
    pub causal_reads: bool,
    /// GTID wait timeout in seconds
    #[serde(default = "default_causal_reads_timeout")]
    pub causal_reads_timeout: u64,
    /// Deferred statements allowed per session before backpressure kicks in
    #[serde(default = "default_max_query_queue_length")]
    pub max_query_queue_length: usize,
}

fn default_max_slave_connections() -> usize {
    255
}

fn default_max_slave_replication_lag() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

fn default_connection_keepalive() -> u64 {
    300
}

fn default_max_sescmd_history() -> usize {
    50
}

fn default_causal_reads_timeout() -> u64 {
    10
}

fn default_max_query_queue_length() -> usize {
    100
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            slave_selection_criteria: SelectionCriteria::default(),
            max_slave_connections: default_max_slave_connections(),
            max_slave_replication_lag: default_max_slave_replication_lag(),
            master_accept_reads: false,
            master_reconnection: false,
            master_failure_mode: MasterFailureMode::default(),
            strict_multi_stmt: true,
            strict_sp_calls: true,
            retry_failed_reads: true,
            connection_keepalive: default_connection_keepalive(),
            disable_sescmd_history: false,
            max_sescmd_history: default_max_sescmd_history(),
            causal_reads: false,
            causal_reads_timeout: default_causal_reads_timeout(),
            max_query_queue_length: default_max_query_queue_length(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: default_listen_port(),
            },
            backend: BackendAuthConfig {
                user: "root".to_string(),
                password: String::new(),
                database: None,
            },
            servers: vec![ServerEntry {
                name: "server1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 3306,
                role: ServerRole::Master,
            }],
            router: RouterOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let opts = RouterOptions::default();
        assert_eq!(
            opts.slave_selection_criteria,
            SelectionCriteria::LeastCurrentOperations
        );
        assert_eq!(opts.max_slave_connections, 255);
        assert_eq!(opts.max_slave_replication_lag, -1);
        assert!(!opts.master_accept_reads);
        assert!(!opts.master_reconnection);
        assert_eq!(opts.master_failure_mode, MasterFailureMode::FailInstantly);
        assert!(opts.strict_multi_stmt);
        assert!(opts.strict_sp_calls);
        assert!(opts.retry_failed_reads);
        assert_eq!(opts.connection_keepalive, 300);
        assert!(!opts.disable_sescmd_history);
        assert_eq!(opts.max_sescmd_history, 50);
        assert!(!opts.causal_reads);
        assert_eq!(opts.causal_reads_timeout, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [server]
            listen_addr = "0.0.0.0"
            listen_port = 4006

            [backend]
            user = "maxuser"
            password = "maxpwd"

            [[servers]]
            name = "db1"
            host = "10.0.0.1"
            port = 3306
            role = "master"

            [[servers]]
            name = "db2"
            host = "10.0.0.2"
            port = 3306
            role = "slave"

            [router]
            slave_selection_criteria = "least_behind_master"
            master_failure_mode = "error_on_write"
            causal_reads = true
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].role, ServerRole::Master);
        assert_eq!(
            config.router.slave_selection_criteria,
            SelectionCriteria::LeastBehindMaster
        );
        assert_eq!(
            config.router.master_failure_mode,
            MasterFailureMode::ErrorOnWrite
        );
        assert!(config.router.causal_reads);
        // Unset options keep their defaults
        assert_eq!(config.router.max_sescmd_history, 50);
    }

    #[test]
    fn test_load_missing_file_names_the_path() {
        let err = Config::load("does/not/exist.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
        assert!(err.to_string().contains("does/not/exist.toml"));
    }
}
