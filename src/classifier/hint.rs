//! Routing hints embedded in SQL comments.
//!
//! A hint comment names a target server or caps acceptable replication lag:
//!
//! ```sql
//! SELECT /* maxscale route to server db2 */ * FROM t;
//! SELECT /* maxscale max_slave_replication_lag=120 */ * FROM t;
//! ```
//!
//! Unrecognised hint kinds are ignored.

/// A single routing hint attached to a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    /// `route to server <name>`
    RouteToServer(String),
    /// `max_slave_replication_lag=<seconds>`
    MaxReplicationLag(i64),
}

/// Extract hints from every block comment in the statement text
pub fn parse_hints(sql: &str) -> Vec<Hint> {
    let mut hints = Vec::new();
    let mut rest = sql;

    while let Some(start) = rest.find("/*") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("*/") else {
            break;
        };
        if let Some(hint) = parse_comment(&after[..end]) {
            hints.push(hint);
        }
        rest = &after[end + 2..];
    }

    hints
}

fn parse_comment(body: &str) -> Option<Hint> {
    let body = body.trim();

    // An optional "maxscale" prefix marks the comment as a hint; accept the
    // bare directives as well.
    let directive = body
        .strip_prefix("maxscale")
        .or_else(|| body.strip_prefix("MAXSCALE"))
        .unwrap_or(body)
        .trim();

    let lower = directive.to_lowercase();

    if let Some(rest) = lower.strip_prefix("route to server") {
        let offset = directive.len() - rest.len();
        let name = directive[offset..].trim();
        if !name.is_empty() {
            // Preserve the original casing; lookup is case-insensitive anyway
            return Some(Hint::RouteToServer(
                name.split_whitespace().next().unwrap_or(name).to_string(),
            ));
        }
    } else if let Some(rest) = lower.strip_prefix("max_slave_replication_lag") {
        let value = rest.trim_start().strip_prefix('=')?.trim();
        if let Ok(lag) = value.parse::<i64>() {
            return Some(Hint::MaxReplicationLag(lag));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_to_server() {
        let hints = parse_hints("SELECT /* maxscale route to server db2 */ 1");
        assert_eq!(hints, vec![Hint::RouteToServer("db2".to_string())]);
    }

    #[test]
    fn test_route_preserves_case() {
        let hints = parse_hints("SELECT /* route to server ReplicaA */ 1");
        assert_eq!(hints, vec![Hint::RouteToServer("ReplicaA".to_string())]);
    }

    #[test]
    fn test_max_replication_lag() {
        let hints = parse_hints("SELECT /* maxscale max_slave_replication_lag=120 */ * FROM t");
        assert_eq!(hints, vec![Hint::MaxReplicationLag(120)]);
    }

    #[test]
    fn test_unrecognised_hints_ignored() {
        assert!(parse_hints("SELECT /* not a hint */ 1").is_empty());
        assert!(parse_hints("SELECT /* maxscale begin */ 1").is_empty());
        assert!(parse_hints("SELECT 1").is_empty());
    }

    #[test]
    fn test_multiple_hints_in_order() {
        let hints = parse_hints(
            "SELECT /* maxscale route to server db3 */ /* maxscale max_slave_replication_lag=5 */ 1",
        );
        assert_eq!(
            hints,
            vec![
                Hint::RouteToServer("db3".to_string()),
                Hint::MaxReplicationLag(5)
            ]
        );
    }

    #[test]
    fn test_unterminated_comment() {
        assert!(parse_hints("SELECT /* maxscale route to server db2").is_empty());
    }
}
