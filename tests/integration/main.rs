//! Integration test entry point
//!
//! Run with: JANUS_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! The tests expect a running janus proxy in front of one primary and at
//! least one replica, all sharing the credentials below.

mod prepared;
mod rw_split;
mod sescmd;

use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("JANUS_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip the current test unless integration tests are enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !$crate::should_run_integration_tests() {
            eprintln!("Skipping: set JANUS_RUN_INTEGRATION_TESTS=1 to run");
            return;
        }
    };
}

/// Proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("JANUS_TEST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("JANUS_TEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4006),
        user: env::var("JANUS_TEST_USER").unwrap_or_else(|_| "maxuser".to_string()),
        password: env::var("JANUS_TEST_PASS").unwrap_or_default(),
        database: env::var("JANUS_TEST_DB").unwrap_or_else(|_| "test".to_string()),
    }
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// Open one pooled connection through the proxy
    pub fn conn(&self) -> mysql::PooledConn {
        let pool = mysql::Pool::new(self.connection_string().as_str())
            .expect("Failed to create connection pool");
        pool.get_conn().expect("Failed to get connection")
    }
}
