use std::collections::HashSet;

use crate::router::SessionContext;

/// Client-visible session state the router tracks across statements
#[derive(Debug, Default)]
pub struct SessionState {
    /// Client username
    pub username: String,
    /// Current database
    pub database: Option<String>,
    /// Client capability flags
    pub capability_flags: u32,
    /// Character set
    pub character_set: u8,
    /// Autocommit; on until the client turns it off
    pub autocommit: bool,
    pub in_transaction: bool,
    pub read_only_transaction: bool,
    /// Forced onto the primary for the rest of the session
    pub locked_to_master: bool,
    /// Latest GTID position observed from OK-packet session tracking
    pub gtid_pos: Option<String>,
    /// Temporary tables created on the primary; they exist nowhere else
    temp_tables: HashSet<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            autocommit: true,
            ..Self::default()
        }
    }

    /// Update state after parsing the handshake response
    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
    }

    pub fn begin_transaction(&mut self, read_only: bool) {
        self.in_transaction = true;
        self.read_only_transaction = read_only;
    }

    pub fn end_transaction(&mut self) {
        self.in_transaction = false;
        self.read_only_transaction = false;
    }

    pub fn track_temp_table(&mut self, name: &str) {
        self.temp_tables.insert(name.to_lowercase());
    }

    pub fn drop_temp_table(&mut self, name: &str) {
        self.temp_tables.remove(&name.to_lowercase());
    }

    pub fn have_temp_tables(&self) -> bool {
        !self.temp_tables.is_empty()
    }

    /// Temporary tables do not survive a primary change
    pub fn clear_temp_tables(&mut self) {
        self.temp_tables.clear();
    }

    pub fn uses_temp_table(&self, tables: &[String]) -> bool {
        tables.iter().any(|t| {
            // Qualified names still hit the unqualified temp table
            self.temp_tables.contains(t)
                || t.rsplit('.')
                    .next()
                    .map(|short| self.temp_tables.contains(short))
                    .unwrap_or(false)
        })
    }

    /// The slice of state the route decider reads
    pub fn route_context(&self, uses_temp_table: bool) -> SessionContext {
        SessionContext {
            in_transaction: self.in_transaction,
            read_only_transaction: self.read_only_transaction,
            locked_to_master: self.locked_to_master,
            autocommit: self.autocommit,
            uses_temp_table,
        }
    }
}
