//! Statement classification.
//!
//! The router only needs a shallow reading of each statement: is it a write,
//! does it mutate connection-scoped state, does it open or close a
//! transaction, which prepared-statement id does it carry. A quick keyword
//! pass handles the statements the wire protocol or transaction control make
//! unambiguous; sqlparser covers the rest.

mod hint;

pub use hint::{parse_hints, Hint};

use sqlparser::ast::{SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::trace;

use crate::protocol::{Command, Packet};

/// What kind of statement a COM_QUERY carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT / SHOW / EXPLAIN / DESCRIBE
    Read,
    /// INSERT / UPDATE / DELETE / DDL / anything else that mutates data
    Write,
    /// SET in any form
    Set,
    /// USE <db>
    Use(String),
    /// BEGIN / START TRANSACTION
    Begin { read_only: bool },
    Commit,
    Rollback,
    /// Text-protocol PREPARE name FROM '...'
    PrepareText,
    /// Text-protocol DEALLOCATE / DROP PREPARE
    DeallocateText,
    /// CALL proc(...)
    Call,
    /// Connection-scoped state changes: XA, SAVEPOINT, ROLLBACK TO, LOCK TABLES
    SessionState,
    Other,
}

/// Everything the route decider needs to know about one client packet
#[derive(Debug, Clone)]
pub struct Classification {
    pub command: Command,
    pub kind: StatementKind,
    /// Binary-protocol statement id, for COM_STMT_* commands
    pub stmt_id: Option<u32>,
    pub hints: Vec<Hint>,
    /// Statement mutates connection-scoped state and must be replayed on
    /// every backend
    pub session_write: bool,
    /// Safe to serve from a replica
    pub read_only: bool,
    /// More than one statement in a single COM_QUERY
    pub multi_statement: bool,
    /// Assigns a user variable outside SET (SELECT @x := ...)
    pub user_var_write: bool,
    /// Statement pins the rest of the session to the primary (LOCK TABLES)
    pub locks_to_master: bool,
    /// SET autocommit seen; the new value
    pub autocommit: Option<bool>,
    pub temp_tables_created: Vec<String>,
    pub tables_dropped: Vec<String>,
    /// Tables the statement touches, lowercased
    pub tables: Vec<String>,
}

impl Classification {
    fn for_command(command: Command) -> Self {
        Self {
            command,
            kind: StatementKind::Other,
            stmt_id: None,
            hints: Vec::new(),
            session_write: false,
            read_only: false,
            multi_statement: false,
            user_var_write: false,
            locks_to_master: false,
            autocommit: None,
            temp_tables_created: Vec::new(),
            tables_dropped: Vec::new(),
            tables: Vec::new(),
        }
    }

    /// Whether the server replies to this statement
    pub fn expects_response(&self) -> bool {
        self.command.will_respond()
    }

    pub fn starts_transaction(&self) -> bool {
        matches!(self.kind, StatementKind::Begin { .. })
    }

    pub fn ends_transaction(&self) -> bool {
        matches!(self.kind, StatementKind::Commit | StatementKind::Rollback)
    }
}

/// Statement classifier; one per session
pub struct Classifier {
    dialect: MySqlDialect,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    /// Classify one framed client packet
    pub fn classify(&self, packet: &Packet) -> Classification {
        let Some(&first) = packet.payload.first() else {
            return Classification::for_command(Command::Unknown);
        };

        let command = Command::from(first);
        let mut c = Classification::for_command(command);
        let data = &packet.payload[1..];

        match command {
            Command::Query => {
                let sql = String::from_utf8_lossy(data);
                self.classify_sql(&sql, &mut c);
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(data).to_string();
                c.kind = StatementKind::Use(db);
                c.session_write = true;
            }
            Command::StmtPrepare => {
                // Prepared on every backend so any of them can execute it
                c.session_write = true;
            }
            Command::ChangeUser | Command::SetOption | Command::ResetConnection => {
                c.session_write = true;
            }
            cmd if cmd.is_ps_command() => {
                if data.len() >= 4 {
                    c.stmt_id = Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                }
                if cmd == Command::StmtFetch {
                    c.read_only = true;
                }
            }
            _ => {}
        }

        c
    }

    fn classify_sql(&self, sql: &str, c: &mut Classification) {
        c.hints = parse_hints(sql);
        c.multi_statement = contains_multiple_statements(sql);

        let trimmed = sql.trim();
        let upper = trimmed.to_uppercase();

        // Transaction control and connection state first; these must never
        // depend on whether the full statement parses.
        if upper.starts_with("BEGIN") {
            c.kind = StatementKind::Begin { read_only: false };
            return;
        }
        if upper.starts_with("START TRANSACTION") {
            c.kind = StatementKind::Begin {
                read_only: upper.contains("READ ONLY"),
            };
            return;
        }
        if upper.starts_with("COMMIT") {
            c.kind = StatementKind::Commit;
            return;
        }
        if upper.starts_with("ROLLBACK TO") {
            c.kind = StatementKind::SessionState;
            c.session_write = true;
            return;
        }
        if upper.starts_with("ROLLBACK") {
            c.kind = StatementKind::Rollback;
            return;
        }
        if upper.starts_with("SAVEPOINT") || upper.starts_with("RELEASE SAVEPOINT") {
            c.kind = StatementKind::SessionState;
            c.session_write = true;
            return;
        }
        if upper.starts_with("XA ") {
            c.kind = StatementKind::SessionState;
            c.session_write = true;
            return;
        }
        // Table locks are held by one connection; the statement and the
        // rest of the session belong on the primary
        if upper.starts_with("LOCK TABLE") {
            c.kind = StatementKind::Other;
            c.locks_to_master = true;
            return;
        }
        if upper.starts_with("UNLOCK TABLE") {
            c.kind = StatementKind::Other;
            return;
        }
        if upper.starts_with("USE ") {
            let db = trimmed[4..].trim().trim_matches('`').to_string();
            c.kind = StatementKind::Use(db);
            c.session_write = true;
            return;
        }
        if upper.starts_with("SET ") || upper == "SET" {
            c.kind = StatementKind::Set;
            c.session_write = true;
            c.autocommit = parse_autocommit(&upper);
            return;
        }
        if upper.starts_with("PREPARE ") {
            c.kind = StatementKind::PrepareText;
            c.session_write = true;
            return;
        }
        if upper.starts_with("DEALLOCATE") || upper.starts_with("DROP PREPARE") {
            c.kind = StatementKind::DeallocateText;
            c.session_write = true;
            return;
        }

        c.user_var_write = upper.contains(":=");

        match Parser::parse_sql(&self.dialect, trimmed) {
            Ok(statements) if !statements.is_empty() => {
                self.classify_statement(&statements[0], &upper, c);
            }
            Ok(_) => {
                c.kind = StatementKind::Other;
            }
            Err(e) => {
                // Unparseable SQL is routed conservatively (to the primary)
                trace!(error = %e, "Statement did not parse, classifying as write");
                c.kind = StatementKind::Other;
            }
        }
    }

    fn classify_statement(&self, stmt: &Statement, upper: &str, c: &mut Classification) {
        match stmt {
            Statement::Query(query) => {
                if let SetExpr::Select(select) = query.body.as_ref() {
                    for table_with_joins in &select.from {
                        collect_tables(table_with_joins, &mut c.tables);
                    }
                }
                // Locking reads and last-insert-id lookups only make sense
                // on the primary
                if upper.contains("FOR UPDATE")
                    || upper.contains("LOCK IN SHARE MODE")
                    || upper.contains("LAST_INSERT_ID")
                {
                    c.kind = StatementKind::Write;
                } else {
                    c.kind = StatementKind::Read;
                    c.read_only = true;
                }
            }
            Statement::Insert { table_name, .. } => {
                c.tables.push(table_name.to_string().to_lowercase());
                c.kind = StatementKind::Write;
            }
            Statement::Update { table, .. } => {
                collect_tables(table, &mut c.tables);
                c.kind = StatementKind::Write;
            }
            Statement::Delete { from, .. } => {
                for table_with_joins in from {
                    collect_tables(table_with_joins, &mut c.tables);
                }
                c.kind = StatementKind::Write;
            }
            Statement::CreateTable {
                temporary, name, ..
            } => {
                // A temporary table exists only on the server that creates
                // it, so it is written to the primary and remembered so
                // later reads against it stay there
                let table = name.to_string().to_lowercase();
                if *temporary {
                    c.temp_tables_created.push(table.clone());
                }
                c.kind = StatementKind::Write;
                c.tables.push(table);
            }
            Statement::Drop { names, .. } => {
                for name in names {
                    c.tables_dropped.push(name.to_string().to_lowercase());
                }
                c.kind = StatementKind::Write;
            }
            Statement::SetVariable { .. }
            | Statement::SetNames { .. }
            | Statement::SetNamesDefault { .. }
            | Statement::SetTimeZone { .. }
            | Statement::SetTransaction { .. } => {
                c.kind = StatementKind::Set;
                c.session_write = true;
            }
            Statement::Use { db_name } => {
                c.kind = StatementKind::Use(db_name.to_string());
                c.session_write = true;
            }
            Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowVariable { .. } => {
                c.kind = StatementKind::Read;
                c.read_only = true;
            }
            Statement::Explain { .. } => {
                c.kind = StatementKind::Read;
                c.read_only = true;
            }
            Statement::Call(_) => {
                c.kind = StatementKind::Call;
            }
            Statement::Prepare { .. } => {
                c.kind = StatementKind::PrepareText;
                c.session_write = true;
            }
            Statement::Deallocate { .. } => {
                c.kind = StatementKind::DeallocateText;
                c.session_write = true;
            }
            _ => {
                c.kind = StatementKind::Write;
            }
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_tables(table_with_joins: &TableWithJoins, out: &mut Vec<String>) {
    if let TableFactor::Table { name, .. } = &table_with_joins.relation {
        out.push(name.to_string().to_lowercase());
    }
    for join in &table_with_joins.joins {
        if let TableFactor::Table { name, .. } = &join.relation {
            out.push(name.to_string().to_lowercase());
        }
    }
}

fn parse_autocommit(upper: &str) -> Option<bool> {
    let idx = upper.find("AUTOCOMMIT")?;
    let rest = upper[idx + "AUTOCOMMIT".len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    if rest.starts_with('1') || rest.starts_with("ON") || rest.starts_with("TRUE") {
        Some(true)
    } else if rest.starts_with('0') || rest.starts_with("OFF") || rest.starts_with("FALSE") {
        Some(false)
    } else {
        None
    }
}

/// True when the payload holds more than one statement. String literals and
/// comments are skipped so embedded semicolons don't count.
fn contains_multiple_statements(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'#' => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i += 2;
                    while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                        i += 1;
                    }
                    i += 1;
                }
                b';' => {
                    // A trailing semicolon is not a second statement
                    return !sql[i + 1..].trim().is_empty();
                }
                _ => {}
            },
        }
        i += 1;
    }

    false
}
