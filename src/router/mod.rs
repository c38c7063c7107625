//! Route decision and backend selection.
//!
//! `decide` is a pure function from the classified statement and session
//! state to a target class; the `get_*_backend` helpers then resolve the
//! class against the session's backends. Large-query continuation frames
//! never reach the decider: they carry no command byte and the session
//! forces them to the previous target.

use tracing::info;

use crate::backend::{Backend, BackendId};
use crate::classifier::{Classification, Hint, StatementKind};
use crate::config::{RouterOptions, SelectionCriteria};
use crate::protocol::Command;
use crate::topology::RLAG_NOT_AVAILABLE;

/// Which class of backend a statement must go to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Broadcast to every in-use backend (session writes)
    All,
    Master,
    Slave,
    /// A server named by a routing hint
    NamedServer(String),
    /// Any replica whose replication lag is within the bound
    LagMax(i64),
}

/// A target class plus selection constraints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub target: RouteTarget,
    /// Archive the packet so a failed read can be retried elsewhere
    pub store_for_retry: bool,
}

/// The slice of session state the decider reads
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionContext {
    pub in_transaction: bool,
    pub read_only_transaction: bool,
    pub locked_to_master: bool,
    pub autocommit: bool,
    /// The statement touches a temporary table, which only the primary has
    pub uses_temp_table: bool,
}

/// Decide the target class for one classified statement.
/// Rules are evaluated in order; the first match wins.
pub fn decide(c: &Classification, ctx: &SessionContext, opts: &RouterOptions) -> RouteDecision {
    let no_retry = RouteDecision {
        target: RouteTarget::Master,
        store_for_retry: false,
    };

    // Routing hints name a server or bound the acceptable lag
    for hint in &c.hints {
        match hint {
            Hint::RouteToServer(name) => {
                return RouteDecision {
                    target: RouteTarget::NamedServer(name.clone()),
                    store_for_retry: false,
                }
            }
            Hint::MaxReplicationLag(lag) => {
                return RouteDecision {
                    target: RouteTarget::LagMax(*lag),
                    store_for_retry: false,
                }
            }
        }
    }

    // Session writes go everywhere
    if c.session_write {
        return RouteDecision {
            target: RouteTarget::All,
            store_for_retry: false,
        };
    }

    // An open write transaction, or a session pinned by earlier statements
    if (ctx.in_transaction && !ctx.read_only_transaction) || ctx.locked_to_master {
        return no_retry;
    }

    // Read-only transactions stay on the backend pinned at the first
    // statement; the selection step resolves the pin
    if ctx.read_only_transaction {
        return RouteDecision {
            target: RouteTarget::Slave,
            store_for_retry: false,
        };
    }

    // Fetches follow their execute; resolution happens via the exec map
    if c.command == Command::StmtFetch {
        return RouteDecision {
            target: RouteTarget::Slave,
            store_for_retry: false,
        };
    }

    // Statement shapes that only behave on the primary
    if c.multi_statement && opts.strict_multi_stmt {
        return no_retry;
    }
    if c.kind == StatementKind::Call && opts.strict_sp_calls {
        return no_retry;
    }
    if c.user_var_write || ctx.uses_temp_table {
        return no_retry;
    }

    if !c.read_only {
        return no_retry;
    }

    // Reads outside any transaction may use a replica
    if ctx.autocommit && !ctx.in_transaction {
        return RouteDecision {
            target: RouteTarget::Slave,
            store_for_retry: opts.retry_failed_reads,
        };
    }

    no_retry
}

/// Check replication lag against a bound; a negative bound means unlimited.
/// The primary has nothing to lag behind.
fn rpl_lag_is_ok(backend: &Backend, max_rlag: i64) -> bool {
    if max_rlag < 0 || backend.server().is_master() {
        return true;
    }
    let rlag = backend.server().replication_lag();
    rlag != RLAG_NOT_AVAILABLE && rlag <= max_rlag
}

/// The backend named by a hint. It must be in use and a valid master,
/// slave or relay.
pub fn get_hinted_backend(backends: &[Backend], name: &str) -> Option<BackendId> {
    backends
        .iter()
        .find(|b| {
            b.in_use()
                && b.name().eq_ignore_ascii_case(name)
                && (b.server().is_master() || b.server().is_slave() || b.server().is_relay())
        })
        .map(|b| b.id())
}

/// Pick the best replica for a read.
///
/// The master qualifies as a last resort (or on equal footing with
/// `master_accept_reads`); new connections are admitted only while the
/// session's replica count is under the configured cap.
pub fn get_slave_backend(
    backends: &[Backend],
    current_master: Option<BackendId>,
    max_rlag: i64,
    opts: &RouterOptions,
) -> Option<BackendId> {
    let connected_slaves = backends
        .iter()
        .filter(|b| b.in_use() && b.server().is_slave())
        .count();

    let mut best: Option<&Backend> = None;

    for backend in backends {
        if backend.is_closed() {
            continue;
        }
        let server = backend.server();
        let readable_master = server.is_master() && opts.master_accept_reads;
        if !(server.is_slave() || readable_master) {
            continue;
        }
        if !rpl_lag_is_ok(backend, max_rlag) {
            continue;
        }
        // Opening one more connection is only allowed below the replica cap
        if !backend.in_use() && connected_slaves >= opts.max_slave_connections {
            continue;
        }

        best = match best {
            None => Some(backend),
            Some(candidate) => {
                if compare_backends(backend, candidate, opts.slave_selection_criteria) {
                    Some(backend)
                } else {
                    Some(candidate)
                }
            }
        };
    }

    // The session's own primary serves the read when no replica qualifies
    best.map(|b| b.id()).or_else(|| {
        current_master.filter(|&id| {
            let backend = &backends[id];
            backend.in_use() && backend.server().is_master()
        })
    })
}

/// The cluster's unique primary; it must be usable from this session
pub fn get_master_backend(backends: &[Backend]) -> Option<BackendId> {
    let master = backends.iter().find(|b| b.server().is_master())?;

    if master.in_use() || (!master.is_closed() && master.can_connect()) {
        Some(master.id())
    } else {
        info!(
            backend = %master.name(),
            "Master exists but is not in use and cannot be connected to"
        );
        None
    }
}

/// True when `challenger` ranks better than `candidate` under the criterion
fn compare_backends(challenger: &Backend, candidate: &Backend, sc: SelectionCriteria) -> bool {
    let (a, b) = (challenger.server(), candidate.server());
    match sc {
        SelectionCriteria::LeastCurrentOperations => a.operations() < b.operations(),
        SelectionCriteria::LeastConnections => a.connections() < b.connections(),
        SelectionCriteria::LeastBehindMaster => {
            lag_rank(a.replication_lag()) < lag_rank(b.replication_lag())
        }
        SelectionCriteria::LeastRecentlyUsed => challenger.idle_for() > candidate.idle_for(),
        SelectionCriteria::Adaptive => a.avg_response_us() < b.avg_response_us(),
    }
}

/// Unknown lag ranks behind any reported lag
fn lag_rank(rlag: i64) -> i64 {
    if rlag == RLAG_NOT_AVAILABLE {
        i64::MAX
    } else {
        rlag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::config::{ServerEntry, ServerRole};
    use crate::protocol::Packet;
    use crate::topology::Topology;

    fn classify(sql: &str) -> Classification {
        Classifier::new().classify(&Packet::command(Command::Query, sql.as_bytes()))
    }

    fn autocommit_ctx() -> SessionContext {
        SessionContext {
            autocommit: true,
            ..SessionContext::default()
        }
    }

    fn opts() -> RouterOptions {
        RouterOptions::default()
    }

    fn make_backends(roles: &[(&str, ServerRole)]) -> (Topology, Vec<Backend>) {
        let entries: Vec<ServerEntry> = roles
            .iter()
            .map(|(name, role)| ServerEntry {
                name: name.to_string(),
                host: "127.0.0.1".to_string(),
                port: 3306,
                role: *role,
            })
            .collect();
        let topology = Topology::from_config(&entries);
        let backends = topology
            .servers()
            .iter()
            .enumerate()
            .map(|(id, server)| Backend::new(id, server.clone()))
            .collect();
        (topology, backends)
    }

    #[test]
    fn test_reads_go_to_slave_with_retry() {
        let d = decide(&classify("SELECT 1"), &autocommit_ctx(), &opts());
        assert_eq!(d.target, RouteTarget::Slave);
        assert!(d.store_for_retry);
    }

    #[test]
    fn test_retry_disabled() {
        let mut o = opts();
        o.retry_failed_reads = false;
        let d = decide(&classify("SELECT 1"), &autocommit_ctx(), &o);
        assert!(!d.store_for_retry);
    }

    #[test]
    fn test_writes_go_to_master() {
        let d = decide(&classify("INSERT INTO t VALUES (1)"), &autocommit_ctx(), &opts());
        assert_eq!(d.target, RouteTarget::Master);
    }

    #[test]
    fn test_session_writes_go_to_all() {
        let d = decide(&classify("SET @x = 1"), &autocommit_ctx(), &opts());
        assert_eq!(d.target, RouteTarget::All);
        let d = decide(&classify("USE shop"), &autocommit_ctx(), &opts());
        assert_eq!(d.target, RouteTarget::All);
    }

    #[test]
    fn test_transaction_pins_to_master() {
        let ctx = SessionContext {
            in_transaction: true,
            autocommit: true,
            ..SessionContext::default()
        };
        let d = decide(&classify("SELECT 1"), &ctx, &opts());
        assert_eq!(d.target, RouteTarget::Master);
    }

    #[test]
    fn test_read_only_transaction_targets_slave_class() {
        let ctx = SessionContext {
            in_transaction: true,
            read_only_transaction: true,
            autocommit: true,
            ..SessionContext::default()
        };
        let d = decide(&classify("SELECT 1"), &ctx, &opts());
        assert_eq!(d.target, RouteTarget::Slave);
    }

    #[test]
    fn test_locked_to_master_overrides_reads() {
        let ctx = SessionContext {
            locked_to_master: true,
            autocommit: true,
            ..SessionContext::default()
        };
        let d = decide(&classify("SELECT 1"), &ctx, &opts());
        assert_eq!(d.target, RouteTarget::Master);
    }

    #[test]
    fn test_hints_win_over_everything() {
        let ctx = SessionContext {
            in_transaction: true,
            ..SessionContext::default()
        };
        let d = decide(
            &classify("SELECT /* maxscale route to server db2 */ 1"),
            &ctx,
            &opts(),
        );
        assert_eq!(d.target, RouteTarget::NamedServer("db2".to_string()));

        let d = decide(
            &classify("SELECT /* maxscale max_slave_replication_lag=30 */ 1"),
            &autocommit_ctx(),
            &opts(),
        );
        assert_eq!(d.target, RouteTarget::LagMax(30));
    }

    #[test]
    fn test_strict_multi_stmt() {
        let d = decide(&classify("SELECT 1; SELECT 2"), &autocommit_ctx(), &opts());
        assert_eq!(d.target, RouteTarget::Master);

        let mut o = opts();
        o.strict_multi_stmt = false;
        let d = decide(&classify("SELECT 1; SELECT 2"), &autocommit_ctx(), &o);
        assert_eq!(d.target, RouteTarget::Slave);
    }

    #[test]
    fn test_strict_sp_calls() {
        let d = decide(&classify("CALL report()"), &autocommit_ctx(), &opts());
        assert_eq!(d.target, RouteTarget::Master);
    }

    #[test]
    fn test_temp_table_reads_use_master() {
        let ctx = SessionContext {
            autocommit: true,
            uses_temp_table: true,
            ..SessionContext::default()
        };
        let d = decide(&classify("SELECT * FROM tmp1"), &ctx, &opts());
        assert_eq!(d.target, RouteTarget::Master);
    }

    #[test]
    fn test_reads_without_autocommit_use_master() {
        let ctx = SessionContext::default();
        let d = decide(&classify("SELECT 1"), &ctx, &opts());
        assert_eq!(d.target, RouteTarget::Master);
    }

    #[test]
    fn test_hinted_backend_lookup() {
        let (_topology, backends) = make_backends(&[
            ("db1", ServerRole::Master),
            ("db2", ServerRole::Slave),
        ]);
        // Nothing connected yet: hinted selection requires an in-use backend
        assert_eq!(get_hinted_backend(&backends, "db2"), None);
    }

    #[test]
    fn test_slave_selection_prefers_least_loaded() {
        let (topology, backends) = make_backends(&[
            ("db1", ServerRole::Master),
            ("db2", ServerRole::Slave),
            ("db3", ServerRole::Slave),
        ]);
        topology.find("db2").unwrap().operation_started();
        topology.find("db2").unwrap().operation_started();
        topology.find("db3").unwrap().operation_started();

        let picked = get_slave_backend(&backends, None, -1, &opts()).unwrap();
        assert_eq!(backends[picked].name(), "db3");
    }

    #[test]
    fn test_slave_selection_least_behind() {
        let (topology, backends) = make_backends(&[
            ("db2", ServerRole::Slave),
            ("db3", ServerRole::Slave),
        ]);
        topology.find("db2").unwrap().set_replication_lag(10);
        topology.find("db3").unwrap().set_replication_lag(2);

        let mut o = opts();
        o.slave_selection_criteria = SelectionCriteria::LeastBehindMaster;
        let picked = get_slave_backend(&backends, None, -1, &o).unwrap();
        assert_eq!(backends[picked].name(), "db3");
    }

    #[test]
    fn test_lag_bound_excludes_stale_replicas() {
        let (topology, backends) = make_backends(&[
            ("db2", ServerRole::Slave),
            ("db3", ServerRole::Slave),
        ]);
        topology.find("db2").unwrap().set_replication_lag(120);
        topology.find("db3").unwrap().set_replication_lag(1);

        let picked = get_slave_backend(&backends, None, 30, &opts()).unwrap();
        assert_eq!(backends[picked].name(), "db3");

        // No replica within bound: nothing qualifies
        topology.find("db3").unwrap().set_replication_lag(120);
        assert_eq!(get_slave_backend(&backends, None, 30, &opts()), None);
    }

    #[test]
    fn test_unknown_lag_excluded_when_bounded() {
        let (_topology, backends) = make_backends(&[("db2", ServerRole::Slave)]);
        // Lag never reported; a bounded read cannot use it
        assert_eq!(get_slave_backend(&backends, None, 30, &opts()), None);
        // Unbounded reads can
        assert!(get_slave_backend(&backends, None, -1, &opts()).is_some());
    }

    #[test]
    fn test_master_backend_selection() {
        let (topology, backends) = make_backends(&[
            ("db1", ServerRole::Master),
            ("db2", ServerRole::Slave),
        ]);
        assert_eq!(get_master_backend(&backends), Some(0));

        topology.find("db1").unwrap().set_role(ServerRole::Down);
        assert_eq!(get_master_backend(&backends), None);
    }

    #[test]
    fn test_master_accepts_reads_only_when_configured() {
        let (_topology, backends) = make_backends(&[("db1", ServerRole::Master)]);

        // No replicas and no session master connection: the read fails
        assert_eq!(get_slave_backend(&backends, None, -1, &opts()), None);

        // With master_accept_reads the primary is a read candidate
        let mut o = opts();
        o.master_accept_reads = true;
        assert_eq!(get_slave_backend(&backends, None, -1, &o), Some(0));
    }

    #[test]
    fn test_down_servers_never_selected() {
        let (topology, backends) = make_backends(&[
            ("db2", ServerRole::Slave),
            ("db3", ServerRole::Slave),
        ]);
        topology.find("db2").unwrap().set_role(ServerRole::Down);
        let picked = get_slave_backend(&backends, None, -1, &opts()).unwrap();
        assert_eq!(backends[picked].name(), "db3");
    }
}
