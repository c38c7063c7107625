//! Prepared statement tests: the PREPARE is broadcast, executes keep their
//! backend affinity, and ids are rewritten per backend transparently.

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "it_ps_";

fn cleanup_user_id(conn: &mut mysql::PooledConn, user_id: &str) {
    let sql = format!("DELETE FROM orders WHERE user_id = '{}'", user_id);
    let _ = conn.query_drop(&sql);
}

#[test]
fn test_binary_prepare_execute_close() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let stmt = conn
        .prep("SELECT ? + ?")
        .expect("PREPARE should succeed on every backend");

    for i in 0..10i64 {
        let row: Option<i64> = conn
            .exec_first(&stmt, (i, 1i64))
            .expect("EXECUTE should succeed");
        assert_eq!(row, Some(i + 1));
    }

    conn.close(stmt).expect("CLOSE should succeed");
}

#[test]
fn test_prepared_read_after_write() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}raw", TEST_PREFIX);
    let order_no = format!("ORD_{}raw", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    let insert = conn
        .prep("INSERT INTO orders (user_id, order_no, amount) VALUES (?, ?, ?)")
        .expect("PREPARE should succeed");
    conn.exec_drop(&insert, (&user_id, &order_no, 300.00f64))
        .expect("EXECUTE should succeed");

    let select = conn
        .prep("SELECT order_no FROM orders WHERE user_id = ?")
        .expect("PREPARE should succeed");
    let row: Option<String> = conn
        .exec_first(&select, (&user_id,))
        .expect("EXECUTE should succeed");
    assert_eq!(row, Some(order_no));

    conn.close(insert).expect("CLOSE should succeed");
    conn.close(select).expect("CLOSE should succeed");
    cleanup_user_id(&mut conn, &user_id);
}

#[test]
fn test_many_prepared_statements() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    // Several live handles at once: id mapping must not mix them up
    let stmts: Vec<_> = (0..5)
        .map(|i| {
            conn.prep(format!("SELECT {} + ?", i * 100))
                .expect("PREPARE should succeed")
        })
        .collect();

    for (i, stmt) in stmts.iter().enumerate() {
        let row: Option<i64> = conn
            .exec_first(stmt, (1i64,))
            .expect("EXECUTE should succeed");
        assert_eq!(row, Some(i as i64 * 100 + 1));
    }

    for stmt in stmts {
        conn.close(stmt).expect("CLOSE should succeed");
    }
}

#[test]
fn test_text_protocol_prepare() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("PREPARE txt FROM 'SELECT 6 * 7'")
        .expect("text PREPARE should succeed");

    // The prepare is part of the session state: every backend the session
    // uses holds the handle
    for _ in 0..5 {
        let v: Option<i64> = conn
            .query_first("EXECUTE txt")
            .expect("EXECUTE should succeed");
        assert_eq!(v, Some(42));
    }

    conn.query_drop("DEALLOCATE PREPARE txt")
        .expect("DEALLOCATE should succeed");
}
