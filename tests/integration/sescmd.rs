//! Session command replay tests: connection-scoped state must be visible
//! no matter which backend answers a read.

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn test_user_variable_visible_on_any_backend() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET @rw_probe = 42")
        .expect("SET should succeed");

    // Reads are spread over replicas; every one must see the variable
    for _ in 0..20 {
        let v: Option<i64> = conn
            .query_first("SELECT @rw_probe")
            .expect("SELECT should succeed");
        assert_eq!(v, Some(42), "A backend missed the session variable");
    }
}

#[test]
fn test_exactly_one_reply_per_session_command() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    // Each SET is broadcast to every backend but must produce exactly one
    // client-visible reply; a stray duplicate would desynchronise the
    // statements that follow.
    for i in 0..10 {
        conn.query_drop(format!("SET @x = {}", i))
            .expect("SET should succeed");
        let v: Option<i64> = conn
            .query_first("SELECT @x")
            .expect("SELECT should succeed");
        assert_eq!(v, Some(i));
    }
}

#[test]
fn test_use_database_followed_by_reads() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop(format!("USE {}", config.database))
        .expect("USE should succeed");

    for _ in 0..10 {
        let db: Option<String> = conn
            .query_first("SELECT DATABASE()")
            .expect("SELECT DATABASE() should succeed");
        assert_eq!(db.as_deref(), Some(config.database.as_str()));
    }
}

#[test]
fn test_repeated_session_commands_replay_correctly() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    // The duplicate-purge must keep enough history to reproduce both the
    // environment of the middle command and the final state
    conn.query_drop(format!("USE {}", config.database))
        .expect("USE should succeed");
    conn.query_drop("SET @y = 7").expect("SET should succeed");
    conn.query_drop(format!("USE {}", config.database))
        .expect("USE should succeed");

    for _ in 0..10 {
        let v: Option<i64> = conn
            .query_first("SELECT @y")
            .expect("SELECT should succeed");
        assert_eq!(v, Some(7));
        let db: Option<String> = conn
            .query_first("SELECT DATABASE()")
            .expect("SELECT DATABASE() should succeed");
        assert_eq!(db.as_deref(), Some(config.database.as_str()));
    }
}

/// Requires a proxy running with `causal_reads = true`; gated separately
/// because the default configuration leaves it off.
#[test]
fn test_causal_read_sees_own_write() {
    skip_if_not_enabled!();
    if std::env::var("JANUS_TEST_CAUSAL_READS").map(|v| v == "1") != Ok(true) {
        eprintln!("Skipping: set JANUS_TEST_CAUSAL_READS=1 to run");
        return;
    }

    let config = get_proxy_config();
    let mut conn = config.conn();

    let _ = conn.query_drop("DELETE FROM orders WHERE user_id = 'it_causal'");

    // Without the GTID wait a fast replica-bound read may miss the write;
    // with causal reads it must always observe it
    for i in 0..10 {
        conn.query_drop(format!(
            "INSERT INTO orders (user_id, order_no, amount) VALUES ('it_causal', 'ORD_c{}', {})",
            i, i
        ))
        .expect("INSERT should succeed");

        let count: Option<i64> = conn
            .query_first("SELECT COUNT(*) FROM orders WHERE user_id = 'it_causal'")
            .expect("SELECT should succeed");
        assert_eq!(count, Some(i + 1), "Read missed a preceding write");
    }

    let _ = conn.query_drop("DELETE FROM orders WHERE user_id = 'it_causal'");
}

#[test]
fn test_long_session_survives_history_limit() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    // Push the history over any reasonable limit; the session must stay
    // usable even after the history is dropped
    for i in 0..100 {
        conn.query_drop(format!("SET @v{} = {}", i, i))
            .expect("SET should succeed");
    }

    let v: Option<i64> = conn
        .query_first("SELECT @v99")
        .expect("SELECT should succeed");
    assert_eq!(v, Some(99));
}
