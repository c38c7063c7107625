//! Shared view of the backend cluster.
//!
//! Roles and replication lag are maintained by an external monitor and read
//! by router sessions on every routing decision. All mutable fields are
//! atomics so a published update is visible to sessions without locking.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::{ServerEntry, ServerRole};

/// Replication lag value meaning "not reported by the monitor"
pub const RLAG_NOT_AVAILABLE: i64 = -1;

/// Flavor of the backend server, decided from its handshake greeting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    MySql,
    MariaDb,
}

/// One known backend server. Shared between the monitor and every session.
#[derive(Debug)]
pub struct Server {
    pub name: String,
    pub host: String,
    pub port: u16,
    role: AtomicU8,
    rlag: AtomicI64,
    server_type: AtomicU8,
    /// Router connections currently open to this server
    connections: AtomicUsize,
    /// Statements currently executing on this server
    operations: AtomicUsize,
    /// Exponentially weighted average response time, microseconds
    avg_response_us: AtomicU64,
}

fn role_to_u8(role: ServerRole) -> u8 {
    match role {
        ServerRole::Master => 0,
        ServerRole::Slave => 1,
        ServerRole::Relay => 2,
        ServerRole::Down => 3,
    }
}

fn role_from_u8(v: u8) -> ServerRole {
    match v {
        0 => ServerRole::Master,
        1 => ServerRole::Slave,
        2 => ServerRole::Relay,
        _ => ServerRole::Down,
    }
}

impl Server {
    pub fn new(entry: &ServerEntry) -> Arc<Self> {
        Arc::new(Self {
            name: entry.name.clone(),
            host: entry.host.clone(),
            port: entry.port,
            role: AtomicU8::new(role_to_u8(entry.role)),
            rlag: AtomicI64::new(RLAG_NOT_AVAILABLE),
            server_type: AtomicU8::new(0),
            connections: AtomicUsize::new(0),
            operations: AtomicUsize::new(0),
            avg_response_us: AtomicU64::new(0),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn role(&self) -> ServerRole {
        role_from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: ServerRole) {
        self.role.store(role_to_u8(role), Ordering::Release);
    }

    pub fn is_master(&self) -> bool {
        self.role() == ServerRole::Master
    }

    pub fn is_slave(&self) -> bool {
        self.role() == ServerRole::Slave
    }

    pub fn is_relay(&self) -> bool {
        self.role() == ServerRole::Relay
    }

    pub fn is_down(&self) -> bool {
        self.role() == ServerRole::Down
    }

    pub fn replication_lag(&self) -> i64 {
        self.rlag.load(Ordering::Acquire)
    }

    pub fn set_replication_lag(&self, seconds: i64) {
        self.rlag.store(seconds, Ordering::Release);
    }

    pub fn server_type(&self) -> ServerType {
        if self.server_type.load(Ordering::Acquire) == 1 {
            ServerType::MariaDb
        } else {
            ServerType::MySql
        }
    }

    pub fn set_server_type(&self, server_type: ServerType) {
        let v = if server_type == ServerType::MariaDb { 1 } else { 0 };
        self.server_type.store(v, Ordering::Release);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn operation_started(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_finished(&self) {
        self.operations.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn avg_response_us(&self) -> u64 {
        self.avg_response_us.load(Ordering::Relaxed)
    }

    /// Fold one observed response time into the running average (EWMA,
    /// alpha = 1/8)
    pub fn record_response_time(&self, micros: u64) {
        let prev = self.avg_response_us.load(Ordering::Relaxed);
        let next = if prev == 0 {
            micros
        } else {
            prev - prev / 8 + micros / 8
        };
        self.avg_response_us.store(next, Ordering::Relaxed);
    }
}

/// The set of servers this router knows about
pub struct Topology {
    servers: Vec<Arc<Server>>,
    by_name: DashMap<String, Arc<Server>>,
}

impl Topology {
    pub fn from_config(entries: &[ServerEntry]) -> Self {
        let servers: Vec<Arc<Server>> = entries.iter().map(Server::new).collect();
        let by_name = DashMap::new();
        for server in &servers {
            by_name.insert(server.name.to_lowercase(), server.clone());
        }
        Self { servers, by_name }
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// Look a server up by name, case-insensitively
    pub fn find(&self, name: &str) -> Option<Arc<Server>> {
        self.by_name.get(&name.to_lowercase()).map(|e| e.clone())
    }

    /// The cluster's unique primary, if the monitor has designated one
    pub fn master(&self) -> Option<Arc<Server>> {
        self.servers.iter().find(|s| s.is_master()).cloned()
    }
}
