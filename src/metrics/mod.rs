//! Prometheus metrics and the JSON stats document.
//!
//! `/metrics` serves the Prometheus text format; `/stats` serves the routing
//! counters as a JSON document.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Router metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    /// Queries routed by target (master/slave/all)
    pub queries_routed_total: IntCounterVec,
    /// Session commands appended to histories
    pub session_commands_total: IntCounter,
    /// Statements re-routed after a backend failure
    pub reroutes_total: IntCounter,
    /// Query errors by type
    pub query_errors_total: IntCounterVec,
    /// Replica connections opened by sessions
    pub slave_connections_total: IntCounter,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "janus_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();

        let connections_active = IntGauge::new(
            "janus_connections_active",
            "Current number of active client connections",
        )
        .unwrap();

        let connections_closed = IntCounter::new(
            "janus_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();

        let queries_routed_total = IntCounterVec::new(
            Opts::new(
                "janus_queries_routed_total",
                "Total number of queries routed by target",
            ),
            &["target"], // master/slave/all
        )
        .unwrap();

        let session_commands_total = IntCounter::new(
            "janus_session_commands_total",
            "Total number of session commands recorded",
        )
        .unwrap();

        let reroutes_total = IntCounter::new(
            "janus_reroutes_total",
            "Total number of statements re-routed after a backend failure",
        )
        .unwrap();

        let query_errors_total = IntCounterVec::new(
            Opts::new("janus_query_errors_total", "Total number of query errors"),
            &["type"], // no_backend, backend_error, queue_full, divergence
        )
        .unwrap();

        let slave_connections_total = IntCounter::new(
            "janus_slave_connections_total",
            "Total number of replica connections opened by sessions",
        )
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_closed.clone()))
            .unwrap();
        registry
            .register(Box::new(queries_routed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(session_commands_total.clone()))
            .unwrap();
        registry.register(Box::new(reroutes_total.clone())).unwrap();
        registry
            .register(Box::new(query_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(slave_connections_total.clone()))
            .unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            queries_routed_total,
            session_commands_total,
            reroutes_total,
            query_errors_total,
            slave_connections_total,
        }
    }

    /// Record a new connection
    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Record one routed statement
    pub fn record_route(&self, target: &str) {
        self.queries_routed_total.with_label_values(&[target]).inc();
    }

    pub fn record_session_command(&self) {
        self.session_commands_total.inc();
    }

    pub fn record_reroute(&self) {
        self.reroutes_total.inc();
    }

    pub fn record_query_error(&self, error_type: &str) {
        self.query_errors_total
            .with_label_values(&[error_type])
            .inc();
    }

    pub fn record_slave_connection(&self) {
        self.slave_connections_total.inc();
    }

    /// The routing counters as a JSON document
    pub fn stats_document(&self) -> StatsDocument {
        let sessions = self.connections_total.get();
        let slave_connections = self.slave_connections_total.get();
        StatsDocument {
            queries_to_master: self.queries_routed_total.with_label_values(&["master"]).get(),
            queries_to_slave: self.queries_routed_total.with_label_values(&["slave"]).get(),
            queries_to_all: self.queries_routed_total.with_label_values(&["all"]).get(),
            session_commands: self.session_commands_total.get(),
            average_slave_count: if sessions == 0 {
                0.0
            } else {
                slave_connections as f64 / sessions as f64
            },
            reroutes: self.reroutes_total.get(),
        }
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// The JSON shape served under `/stats`
#[derive(Debug, Serialize)]
pub struct StatsDocument {
    pub queries_to_master: u64,
    pub queries_to_slave: u64,
    pub queries_to_all: u64,
    pub session_commands: u64,
    pub average_slave_count: f64,
    pub reroutes: u64,
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/stats" => {
                let body = serde_json::to_string_pretty(&metrics().stats_document())
                    .unwrap_or_else(|_| "{}".to_string());
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_document_shape() {
        let m = Metrics::new();
        m.record_route("master");
        m.record_route("slave");
        m.record_route("slave");
        m.record_session_command();
        m.record_connection_accepted();
        m.record_slave_connection();
        m.record_slave_connection();

        let doc = m.stats_document();
        assert_eq!(doc.queries_to_master, 1);
        assert_eq!(doc.queries_to_slave, 2);
        assert_eq!(doc.queries_to_all, 0);
        assert_eq!(doc.session_commands, 1);
        assert!((doc.average_slave_count - 2.0).abs() < f64::EPSILON);

        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("queries_to_master").is_some());
        assert!(json.get("average_slave_count").is_some());
    }
}
