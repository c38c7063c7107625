mod backend;
mod classifier;
mod config;
mod metrics;
mod protocol;
mod ps;
mod router;
mod sescmd;
mod session;
mod topology;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;
use session::RouterSession;
use topology::Topology;

/// Source of unique session ids
static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// How long a shutdown waits for sessions still talking to clients
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Arc::new(Config::load_or_default());
    let topology = Arc::new(Topology::from_config(&config.servers));
    info!(
        servers = ?topology.servers().iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
        master = ?topology.master().map(|s| s.name.clone()),
        "Cluster configured"
    );

    let listen_addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "Janus read/write split proxy listening");

    let metrics_addr = format!(
        "{}:{}",
        config.server.listen_addr,
        config.server.listen_port + 1000
    );
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let mut sessions: JoinSet<()> = JoinSet::new();
    serve(&listener, &mut sessions, &topology, &config).await;

    // A shutdown signal landed. Sessions mid-statement get a grace period
    // to finish their reply streams; whatever is left gets cut off.
    if !sessions.is_empty() {
        info!(
            sessions = sessions.len(),
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "Draining sessions"
        );
        if tokio::time::timeout(SHUTDOWN_GRACE, drain(&mut sessions))
            .await
            .is_err()
        {
            warn!(
                aborted = sessions.len(),
                "Grace period over, aborting remaining sessions"
            );
            sessions.shutdown().await;
        }
    }

    info!("Janus shutdown complete");
    Ok(())
}

/// Accept clients until a shutdown signal arrives, reaping finished session
/// tasks along the way so the set never accumulates dead entries.
async fn serve(
    listener: &TcpListener,
    sessions: &mut JoinSet<()>,
    topology: &Arc<Topology>,
    config: &Arc<Config>,
) {
    let mut shutdown = std::pin::pin!(shutdown_requested());

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, no longer accepting clients");
                return;
            }

            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                reap(finished);
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => spawn_session(sessions, stream, peer, topology, config),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                }
            }
        }
    }
}

fn spawn_session(
    sessions: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    topology: &Arc<Topology>,
    config: &Arc<Config>,
) {
    let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let topology = topology.clone();
    let config = config.clone();

    info!(session_id, peer = %peer, "New client connection");
    metrics::metrics().record_connection_accepted();

    sessions.spawn(async move {
        let session = RouterSession::new(session_id, &topology, &config);
        match session.run(stream).await {
            Ok(()) => info!(session_id, "Session ended"),
            Err(e) => warn!(session_id, error = %e, "Session ended with error"),
        }
        metrics::metrics().record_connection_closed();
    });
}

/// Wait for every remaining session to finish on its own
async fn drain(sessions: &mut JoinSet<()>) {
    while let Some(finished) = sessions.join_next().await {
        reap(finished);
        if !sessions.is_empty() {
            info!(remaining = sessions.len(), "Session drained");
        }
    }
}

fn reap(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        if !e.is_cancelled() {
            error!(error = %e, "Session task panicked");
        }
    }
}

/// Resolves when the process is asked to stop
async fn shutdown_requested() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.expect("Ctrl+C handler");
}
