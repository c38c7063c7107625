//! Read-write split integration tests

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "it_rw_";

fn cleanup_user_id(conn: &mut mysql::PooledConn, user_id: &str) {
    let sql = format!("DELETE FROM orders WHERE user_id = '{}'", user_id);
    let _ = conn.query_drop(&sql);
}

fn parse_amount(s: &str) -> i64 {
    s.parse::<f64>().unwrap_or(0.0) as i64
}

fn server_id(conn: &mut mysql::PooledConn) -> u64 {
    conn.query_first("SELECT @@server_id")
        .expect("SELECT @@server_id should succeed")
        .expect("@@server_id should return a row")
}

#[test]
fn test_read_can_route_to_slave() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..20 {
        server_ids.insert(server_id(&mut conn));
    }

    if server_ids.len() > 1 {
        eprintln!("Read-write split detected: {} servers", server_ids.len());
    } else {
        eprintln!("No slave routing detected (expected if no slaves)");
    }
}

#[test]
fn test_write_routes_to_master() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}write_test", TEST_PREFIX);
    let order_no = format!("ORD_{}wr", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    let sql = format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ('{}', '{}', 100.00)",
        user_id, order_no
    );
    conn.query_drop(&sql).expect("INSERT should succeed");

    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let result: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(result.map(|s| parse_amount(&s)), Some(100));

    cleanup_user_id(&mut conn, &user_id);
}

#[test]
fn test_transaction_pins_to_master() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let master_id: u64 = {
        // A write transaction is answered by the primary
        conn.query_drop("BEGIN").expect("BEGIN should succeed");
        let id = server_id(&mut conn);
        conn.query_drop("COMMIT").expect("COMMIT should succeed");
        id
    };

    // Every statement in a transaction hits the same server
    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    for _ in 0..10 {
        assert_eq!(
            server_id(&mut conn),
            master_id,
            "Transaction statement left the primary"
        );
    }
    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
}

#[test]
fn test_read_only_transaction_pins_to_one_backend() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("START TRANSACTION READ ONLY")
        .expect("START TRANSACTION READ ONLY should succeed");

    let first = server_id(&mut conn);
    for _ in 0..10 {
        assert_eq!(
            server_id(&mut conn),
            first,
            "Read-only transaction statement switched backends"
        );
    }

    conn.query_drop("COMMIT").expect("COMMIT should succeed");
}

#[test]
fn test_read_your_writes_in_transaction() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}ryw", TEST_PREFIX);
    let order_no = format!("ORD_{}ryw", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");

    let sql = format!(
        "INSERT INTO orders (user_id, order_no, amount) VALUES ('{}', '{}', 100.00)",
        user_id, order_no
    );
    conn.query_drop(&sql).expect("INSERT should succeed");

    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let v1: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(v1.map(|s| parse_amount(&s)), Some(100));

    let sql = format!(
        "UPDATE orders SET amount = 200.00 WHERE user_id = '{}'",
        user_id
    );
    conn.query_drop(&sql).expect("UPDATE should succeed");

    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let v2: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(v2.map(|s| parse_amount(&s)), Some(200));

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
}

#[test]
fn test_reply_order_matches_send_order() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    // Interleave reads and writes; each reply must answer its own statement
    for i in 0..25 {
        let n: Option<i64> = conn
            .query_first(format!("SELECT {}", i))
            .expect("SELECT should succeed");
        assert_eq!(n, Some(i));
    }
}
