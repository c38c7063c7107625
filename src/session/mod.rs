//! The per-client router session.
//!
//! Consumes one client packet at a time, classifies it, broadcasts session
//! commands, routes everything else to a chosen backend, and coalesces the
//! replies so the client sees exactly one response per statement, in order.

mod state;

pub use state::SessionState;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, BackendId, ReplyState, ResponseMode};
use crate::classifier::{Classification, Classifier, StatementKind};
use crate::config::{BackendAuthConfig, Config, MasterFailureMode, RouterOptions};
use crate::metrics::metrics;
use crate::protocol::{
    is_err_packet, is_ok_packet, ok_packet_gtid, parse_stmt_prepare_ok, Command, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec,
};
use crate::ps::{rewrite_stmt_id, PsManager};
use crate::router::{self, RouteDecision, RouteTarget};
use crate::sescmd::{AppendOutcome, ResponseMatch, SessionCommandLog};
use crate::topology::{ServerType, Topology};

/// A read archived so it can be replayed once if its backend fails. The
/// packet is the client's original: any prepared-statement id rewrite or
/// causal-read prefix is redone for the backend that serves the retry.
struct ArchivedRead {
    packet: Packet,
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("No backends available")]
    NoBackends,

    #[error("Lost connection to master: {0}")]
    MasterLost(String),
}

/// Handle a single client session
pub struct RouterSession {
    /// Unique session ID
    pub id: u32,
    /// Client-visible session state
    pub state: SessionState,
    backends: Vec<Backend>,
    /// The session's primary connection; may change across failover
    current_master: Option<BackendId>,
    /// Backend pinned by an open read-only transaction
    target_node: Option<BackendId>,
    /// Backend of the previous packet of a multi-packet query
    prev_target: Option<BackendId>,
    large_query: bool,
    large_query_command: Command,
    sescmd_log: SessionCommandLog,
    ps: PsManager,
    classifier: Classifier,
    opts: RouterOptions,
    auth: BackendAuthConfig,
    query_queue: VecDeque<Packet>,
    archive: Option<ArchivedRead>,
    /// Highest session command position written to any backend
    sent_sescmd: u64,
    /// Session commands whose first response has been consumed
    recv_sescmd: u64,
    history_warned: bool,
}

impl RouterSession {
    pub fn new(id: u32, topology: &Topology, config: &Config) -> Self {
        let backends = topology
            .servers()
            .iter()
            .enumerate()
            .map(|(backend_id, server)| Backend::new(backend_id, server.clone()))
            .collect();

        Self {
            id,
            state: SessionState::new(),
            backends,
            current_master: None,
            target_node: None,
            prev_target: None,
            large_query: false,
            large_query_command: Command::Query,
            sescmd_log: SessionCommandLog::new(
                config.router.max_sescmd_history,
                config.router.disable_sescmd_history,
            ),
            ps: PsManager::new(),
            classifier: Classifier::new(),
            opts: config.router.clone(),
            auth: config.backend.clone(),
            query_queue: VecDeque::new(),
            archive: None,
            sent_sescmd: 0,
            recv_sescmd: 0,
            history_warned: false,
        }
    }

    /// Run the session: handshake, then the command loop
    pub async fn run<S>(mut self, client_stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec);

        // Handshake with the client
        let handshake = InitialHandshake::new(self.id);
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;

        debug!(
            session_id = self.id,
            username = %response.username,
            database = ?response.database,
            "Received handshake response"
        );

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags,
            response.character_set,
        );

        self.open_initial_backends().await?;

        let ok = OkPacket::new();
        client
            .send(ok.encode(2, self.state.capability_flags))
            .await?;

        info!(
            session_id = self.id,
            username = %self.state.username,
            backends = self.backends.iter().filter(|b| b.in_use()).count(),
            "Client authenticated"
        );

        let result = self.command_loop(&mut client).await;

        // Teardown: replay on idle backends is abandoned, sockets dropped
        for backend in &mut self.backends {
            backend.close();
        }

        debug!(
            session_id = self.id,
            sescmd_sent = self.sent_sescmd,
            sescmd_recv = self.recv_sescmd,
            prepared_statements = self.ps.len(),
            "Session closed"
        );

        result
    }

    /// Open the primary plus replicas, up to the configured replica cap
    async fn open_initial_backends(&mut self) -> Result<(), SessionError> {
        if let Some(master_id) = self.backends.iter().position(|b| b.server().is_master()) {
            match self.connect_backend(master_id).await {
                Ok(()) => self.current_master = Some(master_id),
                Err(e) => {
                    if self.opts.master_failure_mode == MasterFailureMode::FailInstantly {
                        return Err(e.into());
                    }
                    warn!(
                        session_id = self.id,
                        error = %e,
                        "No master connection; session starts in read-only mode"
                    );
                }
            }
        }

        let slave_ids: Vec<BackendId> = self
            .backends
            .iter()
            .filter(|b| b.server().is_slave() || b.server().is_relay())
            .map(|b| b.id())
            .collect();

        let mut connected = 0;
        for backend_id in slave_ids {
            if connected >= self.opts.max_slave_connections {
                break;
            }
            match self.connect_backend(backend_id).await {
                Ok(()) => {
                    connected += 1;
                    metrics().record_slave_connection();
                }
                Err(e) => {
                    warn!(
                        session_id = self.id,
                        backend = %self.backends[backend_id].name(),
                        error = %e,
                        "Failed to connect replica"
                    );
                }
            }
        }

        if !self.backends.iter().any(|b| b.in_use()) {
            return Err(SessionError::NoBackends);
        }
        Ok(())
    }

    async fn connect_backend(&mut self, backend_id: BackendId) -> Result<(), BackendError> {
        let database = self.state.database.clone();
        self.backends[backend_id]
            .connect(&self.auth, database.as_deref(), &self.sescmd_log)
            .await
    }

    /// Main command processing loop
    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packet = match client.next().await {
                Some(Ok(p)) => p,
                Some(Err(e)) => {
                    warn!(session_id = self.id, error = %e, "Client read error");
                    return Err(e.into());
                }
                None => {
                    info!(session_id = self.id, "Client disconnected");
                    return Ok(());
                }
            };

            // Continuation frames of a multi-packet query carry no command
            // byte; they follow the previous packet's target unconditionally.
            if self.large_query {
                self.route_large_continuation(client, packet).await?;
                continue;
            }

            let c = self.classifier.classify(&packet);
            debug!(session_id = self.id, command = ?c.command, kind = ?c.kind, "Received command");

            if c.command == Command::Quit {
                info!(session_id = self.id, "Client sent QUIT");
                return Ok(());
            }

            self.route_statement(client, packet, c).await?;
        }
    }

    /// Drive one classified statement through decision, selection and reply
    async fn route_statement<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        mut c: Classification,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        // A COM_STMT_EXECUTE is as read-only as the statement it executes
        if c.command == Command::StmtExecute {
            if let Some(stmt_id) = c.stmt_id {
                if let Some(ps) = self.ps.get(stmt_id) {
                    let inner = self
                        .classifier
                        .classify(&Packet::command(Command::Query, ps.sql().as_bytes()));
                    c.read_only = inner.read_only;
                }
            }
        }

        // Transaction state must be visible to the decider for the
        // statement that opens it
        if let StatementKind::Begin { read_only } = c.kind {
            self.state.begin_transaction(read_only);
            self.target_node = None;
        }
        if let Some(autocommit) = c.autocommit {
            self.state.autocommit = autocommit;
        }

        // Statement shapes that pin the rest of the session to the primary
        if (c.multi_statement && self.opts.strict_multi_stmt)
            || (c.kind == StatementKind::Call && self.opts.strict_sp_calls)
            || c.user_var_write
            || c.locks_to_master
        {
            self.state.locked_to_master = true;
        }

        // COM_STMT_CLOSE has no response and fans out to every backend
        // holding the handle
        if c.command == Command::StmtClose {
            self.handle_stmt_close(&packet, &c).await;
            return Ok(());
        }

        let uses_temp_table = self.state.have_temp_tables() && self.state.uses_temp_table(&c.tables);
        let ctx = self.state.route_context(uses_temp_table);
        let decision = router::decide(&c, &ctx, &self.opts);

        let result = if decision.target == RouteTarget::All {
            self.route_session_write(client, packet, &c).await
        } else {
            self.route_single(client, packet, &c, decision).await
        };

        if c.ends_transaction() {
            self.state.end_transaction();
            self.target_node = None;
        }
        for table in &c.temp_tables_created {
            self.state.track_temp_table(table);
        }
        for table in &c.tables_dropped {
            self.state.drop_temp_table(table);
        }

        result
    }

    // --- session writes (TARGET ALL) ---------------------------------------

    /// Append to the history and broadcast to every in-use backend. The
    /// first reply is forwarded; the rest are absorbed after an equivalence
    /// check.
    async fn route_session_write<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        c: &Classification,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let expects_response = c.expects_response();
        let (cmd, outcome) = self.sescmd_log.append(packet.clone(), expects_response);
        let position = cmd.position();

        metrics().record_route("all");
        metrics().record_session_command();
        debug!(session_id = self.id, position, "Session write, routing to all servers");

        if outcome == AppendOutcome::HistoryDropped && !self.history_warned {
            warn!(
                session_id = self.id,
                limit = self.opts.max_sescmd_history,
                "Session command history limit exceeded; history dropped and \
                 backend reconnection disabled for this session"
            );
            self.history_warned = true;
        }

        if c.command == Command::StmtPrepare {
            self.ps.store(&packet, position);
        }

        // Fan out
        let mut executed: Vec<BackendId> = Vec::new();
        for backend_id in 0..self.backends.len() {
            if !self.backends[backend_id].in_use() {
                continue;
            }
            self.backends[backend_id].append_session_command(cmd.clone());
            match self.backends[backend_id].execute_session_command().await {
                Ok(_) => executed.push(backend_id),
                Err(e) => {
                    warn!(
                        session_id = self.id,
                        backend = %self.backends[backend_id].name(),
                        error = %e,
                        "Failed to execute session command"
                    );
                    self.backends[backend_id].close();
                    self.ps.forget_backend(backend_id);
                }
            }
        }

        if self.sescmd_log.is_disabled() {
            let lowest = self
                .backends
                .iter()
                .filter(|b| b.in_use())
                .filter_map(|b| b.next_session_command_position())
                .min()
                .unwrap_or(position);
            self.sescmd_log.prune_responses_below(lowest);
        }

        if executed.is_empty() {
            metrics().record_query_error("no_backend");
            return Err(SessionError::NoBackends);
        }

        self.sent_sescmd = position;

        if !expects_response {
            self.recv_sescmd += 1;
            return Ok(());
        }

        // Collect replies: forward the first, absorb the rest
        let mut forwarded = false;
        for backend_id in executed {
            if !self.backends[backend_id].in_use() {
                continue;
            }
            let reply = if forwarded {
                self.backends[backend_id]
                    .take_session_command_reply()
                    .await
            } else {
                self.forward_sescmd_reply(client, backend_id).await
            };

            match reply {
                Ok(Some((sescmd, payload))) => {
                    if c.command == Command::StmtPrepare {
                        if let Some(native_id) = parse_stmt_prepare_ok(&payload) {
                            self.ps.set_backend_id(sescmd.position(), backend_id, native_id);
                        }
                    }
                    match self.sescmd_log.record_response(sescmd.position(), &payload) {
                        ResponseMatch::First => {
                            self.recv_sescmd += 1;
                            if c.command == Command::StmtPrepare {
                                if let Some(external_id) = parse_stmt_prepare_ok(&payload) {
                                    self.ps.complete(sescmd.position(), external_id);
                                }
                            }
                        }
                        ResponseMatch::Duplicate => {}
                        ResponseMatch::Divergent => {
                            warn!(
                                session_id = self.id,
                                backend = %self.backends[backend_id].name(),
                                position = sescmd.position(),
                                "Session command response diverged; closing backend"
                            );
                            metrics().record_query_error("divergence");
                            self.backends[backend_id].close();
                            self.ps.forget_backend(backend_id);
                        }
                    }
                    if !forwarded {
                        forwarded = true;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        session_id = self.id,
                        backend = %self.backends[backend_id].name(),
                        error = %e,
                        "Backend failed while answering a session command"
                    );
                    self.backends[backend_id].close();
                    self.ps.forget_backend(backend_id);
                }
            }
        }

        if !forwarded {
            // Every backend died before answering
            metrics().record_query_error("backend_error");
            return Err(SessionError::NoBackends);
        }

        Ok(())
    }

    /// Stream one session-command reply to the client while tracking it
    async fn forward_sescmd_reply<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        backend_id: BackendId,
    ) -> Result<Option<(crate::sescmd::SharedSessionCommand, Bytes)>, BackendError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let backend = &mut self.backends[backend_id];
        let Some(sescmd) = backend.take_pending_sescmd() else {
            return Ok(None);
        };

        let mut first: Option<Bytes> = None;
        loop {
            let (packet, reply_state) = backend.read_reply_packet().await?;
            if first.is_none() {
                first = Some(packet.payload.clone());
            }
            if client.send(packet).await.is_err() {
                return Err(BackendError::Io("client write failed".into()));
            }
            if reply_state == ReplyState::Done {
                backend.finish_reply();
                return Ok(Some((sescmd, first.unwrap_or_default())));
            }
        }
    }

    // --- single-target statements ------------------------------------------

    async fn route_single<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        c: &Classification,
        decision: RouteDecision,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut target = None;

        // A temporarily missing backend is retried once
        for attempt in 0..2 {
            target = match self.resolve_target(client, c, &decision).await? {
                Resolved::Backend(id) => Some(id),
                Resolved::AnsweredClient => return Ok(()),
                Resolved::NotFound => {
                    if attempt == 0 {
                        info!(session_id = self.id, target = ?decision.target, "No suitable backend, retrying once");
                        continue;
                    }
                    None
                }
            };
            break;
        }

        let Some(target) = target else {
            metrics().record_query_error("no_backend");
            self.send_error(client, 1045, "HY000", "No suitable backend for statement")
                .await?;
            return Ok(());
        };

        // Open lazily if needed; refuse when history replay is impossible
        if !self.prepare_target(client, target, &decision.target).await? {
            return Ok(());
        }

        // Write-gating: queued session commands must finish first
        if self.backends[target].have_session_commands() {
            if self.query_queue.len() >= self.opts.max_query_queue_length {
                metrics().record_query_error("queue_full");
                self.send_error(client, 1040, "08004", "Session query queue limit exceeded")
                    .await?;
                return Ok(());
            }
            self.query_queue.push_back(packet.clone());
            if let Err(e) = self.drain_session_commands(target).await {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[target].name(),
                    error = %e,
                    "Session command replay failed"
                );
                self.query_queue.pop_back();
                self.backends[target].close();
                self.ps.forget_backend(target);
                self.send_error(client, 1053, "08S01", "Backend lost during replay")
                    .await?;
                return Ok(());
            }
            self.query_queue.pop_front();
        }

        // Rewrite binary prepared statement ids, replaying the PREPARE
        // on backends that never saw it
        let original = packet;
        let packet = match self
            .prepare_ps_for_target(client, target, &original, c)
            .await?
        {
            Some(p) => p,
            None => return Ok(()),
        };

        // Pin a fresh read-only transaction to the first backend chosen
        if self.state.read_only_transaction && self.target_node.is_none() {
            debug!(
                session_id = self.id,
                backend = %self.backends[target].name(),
                "Pinning read-only transaction"
            );
            self.target_node = Some(target);
        }

        let is_master_target = Some(target) == self.current_master;
        metrics().record_route(if is_master_target { "master" } else { "slave" });

        // Causal read: make the replica wait for the session's GTID
        let mut wait_gtid = false;
        let send_packet = if self.opts.causal_reads
            && c.command == Command::Query
            && !is_master_target
            && !packet.is_large()
        {
            if let Some(gtid) = self.state.gtid_pos.clone() {
                wait_gtid = true;
                add_prefix_wait_gtid(
                    &packet,
                    &gtid,
                    self.opts.causal_reads_timeout,
                    self.backends[target].server().server_type(),
                )
            } else {
                packet.clone()
            }
        } else {
            packet.clone()
        };

        if decision.store_for_retry {
            self.archive = Some(ArchivedRead { packet: original });
        }

        // First frame of a large query: no response until the last frame
        if packet.is_large() {
            self.backends[target]
                .write(&send_packet, ResponseMode::NoResponse)
                .await?;
            self.large_query = true;
            self.large_query_command = c.command;
            self.prev_target = Some(target);
            return Ok(());
        }

        let expects = c.expects_response();
        let mode = if expects {
            ResponseMode::ExpectResponse
        } else {
            ResponseMode::NoResponse
        };

        self.backends[target].server().operation_started();
        if let Err(e) = self.backends[target].write(&send_packet, mode).await {
            self.backends[target].server().operation_finished();
            return self
                .handle_backend_failure(client, target, c, e, decision.store_for_retry)
                .await;
        }

        if c.command == Command::StmtExecute {
            if let Some(stmt_id) = c.stmt_id {
                self.ps.record_execute(stmt_id, target);
                debug!(session_id = self.id, stmt_id, backend = %self.backends[target].name(), "COM_STMT_EXECUTE");
            }
        }

        if expects {
            let result = self.forward_reply(client, target, wait_gtid).await;
            self.backends[target].server().operation_finished();
            match result {
                Ok(ReplyOutcome::Forwarded) => {}
                Ok(ReplyOutcome::WaitGtidFailed) => {
                    // The replica never ran the query; run it on the primary
                    self.retry_on_master(client, c).await?;
                }
                Err(e) => {
                    return self
                        .handle_backend_failure(client, target, c, e, decision.store_for_retry)
                        .await;
                }
            }
        } else {
            self.backends[target].server().operation_finished();
        }

        self.handle_connection_keepalive(target).await;
        Ok(())
    }

    /// Resolve a target class to a concrete backend
    async fn resolve_target<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        c: &Classification,
        decision: &RouteDecision,
    ) -> Result<Resolved, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        match &decision.target {
            RouteTarget::NamedServer(name) => {
                match router::get_hinted_backend(&self.backends, name) {
                    Some(id) => {
                        info!(session_id = self.id, server = %name, "Hint: route to server");
                        Ok(Resolved::Backend(id))
                    }
                    None => {
                        info!(
                            session_id = self.id,
                            server = %name,
                            "Hinted server not found in a suitable state"
                        );
                        Ok(Resolved::NotFound)
                    }
                }
            }
            RouteTarget::LagMax(lag) => {
                Ok(
                    match router::get_slave_backend(
                        &self.backends,
                        self.current_master,
                        *lag,
                        &self.opts,
                    ) {
                        Some(id) => Resolved::Backend(id),
                        None => Resolved::NotFound,
                    },
                )
            }
            RouteTarget::Slave => {
                // Read-only transactions stay pinned
                if let Some(pinned) = self.target_node {
                    if self.state.read_only_transaction {
                        return Ok(Resolved::Backend(pinned));
                    }
                }
                // Fetches follow their execute
                if c.command == Command::StmtFetch {
                    if let Some(stmt_id) = c.stmt_id {
                        match self.ps.fetch_target(stmt_id) {
                            Some(id) if self.backends[id].in_use() => {
                                debug!(session_id = self.id, stmt_id, backend = %self.backends[id].name(), "COM_STMT_FETCH");
                                return Ok(Resolved::Backend(id));
                            }
                            Some(_) => {}
                            None => {
                                warn!(
                                    session_id = self.id,
                                    stmt_id, "Unknown statement ID used in COM_STMT_FETCH"
                                );
                            }
                        }
                    }
                }
                Ok(
                    match router::get_slave_backend(
                        &self.backends,
                        self.current_master,
                        self.opts.max_slave_replication_lag,
                        &self.opts,
                    ) {
                        Some(id) => Resolved::Backend(id),
                        None => {
                            info!(
                                session_id = self.id,
                                "Was supposed to route to slave but finding one failed"
                            );
                            Resolved::NotFound
                        }
                    },
                )
            }
            RouteTarget::Master => self.resolve_master(client).await,
            RouteTarget::All => unreachable!("broadcasts are handled by route_session_write"),
        }
    }

    /// Find the primary, replacing the session's master when allowed.
    /// Failure is answered according to `master_failure_mode`.
    async fn resolve_master<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<Resolved, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let target = router::get_master_backend(&self.backends);

        let should_replace = self.opts.master_reconnection
            && target.is_some()
            && target != self.current_master
            && !self.state.in_transaction
            && !self.state.locked_to_master;

        if should_replace {
            let new_master = target.unwrap();
            info!(
                session_id = self.id,
                old = self
                    .current_master
                    .map(|id| self.backends[id].name().to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
                new = %self.backends[new_master].name(),
                "Replacing master"
            );
            self.current_master = Some(new_master);
            // Temporary tables did not survive the old primary
            self.state.clear_temp_tables();
        }

        if target.is_some() && target == self.current_master {
            // Relaxed multi-statement mode: the pin to the current master
            // is dropped once a master-targeted statement routes
            if !self.opts.strict_multi_stmt
                && !self.opts.strict_sp_calls
                && self.state.locked_to_master
            {
                self.state.locked_to_master = false;
            }
            return Ok(Resolved::Backend(target.unwrap()));
        }

        match self.opts.master_failure_mode {
            MasterFailureMode::FailInstantly => {
                let message = self.master_failure_message(target);
                warn!(
                    session_id = self.id,
                    user = %self.state.username,
                    "{}. Closing client connection.",
                    message
                );
                self.send_error(client, 1045, "HY000", &message).await?;
                Err(SessionError::MasterLost(message))
            }
            MasterFailureMode::ErrorOnWrite => {
                self.send_error(
                    client,
                    1290,
                    "HY000",
                    "The MariaDB server is running with the --read-only option so it cannot execute this statement",
                )
                .await?;
                self.close_lingering_master();
                Ok(Resolved::AnsweredClient)
            }
            MasterFailureMode::FailOnWrite => {
                self.close_lingering_master();
                self.send_error(client, 1045, "HY000", "No master available for write")
                    .await?;
                Ok(Resolved::AnsweredClient)
            }
        }
    }

    fn master_failure_message(&self, target: Option<BackendId>) -> String {
        match (self.current_master, target) {
            (None, _) => "Could not find a valid master connection".to_string(),
            (Some(old), Some(new)) if old != new => format!(
                "Master server changed from '{}' to '{}'",
                self.backends[old].name(),
                self.backends[new].name()
            ),
            (Some(old), _) => format!(
                "The connection to master server '{}' is not available",
                self.backends[old].name()
            ),
        }
    }

    fn close_lingering_master(&mut self) {
        if let Some(master_id) = self.current_master {
            if self.backends[master_id].in_use() {
                self.backends[master_id].close();
                self.ps.forget_backend(master_id);
            }
        }
    }

    /// Connect a not-yet-open target. Only replica-class targets connect
    /// freely; the primary reconnects only under `master_reconnection`.
    async fn prepare_target<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        target: BackendId,
        route_target: &RouteTarget,
    ) -> Result<bool, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if self.backends[target].in_use() {
            return Ok(true);
        }
        if !self.backends[target].can_connect() {
            self.send_error(client, 1053, "08S01", "Target backend is not available")
                .await?;
            return Ok(false);
        }

        let is_master = matches!(route_target, RouteTarget::Master);
        if is_master && !self.opts.master_reconnection {
            self.send_error(
                client,
                1053,
                "08S01",
                "The connection to the master was lost and 'master_reconnection' is not enabled",
            )
            .await?;
            return Ok(false);
        }

        match self.connect_backend(target).await {
            Ok(()) => {
                if !is_master {
                    metrics().record_slave_connection();
                }
                Ok(true)
            }
            Err(BackendError::HistoryDisabled) => {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[target].name(),
                    sescmds = self.recv_sescmd,
                    "Cannot attach backend: session command history is disabled"
                );
                self.send_error(
                    client,
                    1053,
                    "08S01",
                    "Cannot use server: session command history is disabled",
                )
                .await?;
                Ok(false)
            }
            Err(e) => {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[target].name(),
                    error = %e,
                    "Failed to open backend"
                );
                self.send_error(client, 2003, "HY000", "Could not connect to backend")
                    .await?;
                Ok(false)
            }
        }
    }

    /// Execute queued session commands on one backend, comparing each reply
    /// with the stored response
    async fn drain_session_commands(&mut self, backend_id: BackendId) -> Result<(), BackendError> {
        while self.backends[backend_id].have_session_commands() {
            self.backends[backend_id].execute_session_command().await?;
            let Some((sescmd, payload)) = self.backends[backend_id]
                .take_session_command_reply()
                .await?
            else {
                continue;
            };

            if sescmd.command() == Command::StmtPrepare {
                if let Some(native_id) = parse_stmt_prepare_ok(&payload) {
                    self.ps
                        .set_backend_id(sescmd.position(), backend_id, native_id);
                }
            }

            if self.sescmd_log.record_response(sescmd.position(), &payload)
                == ResponseMatch::Divergent
            {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[backend_id].name(),
                    position = sescmd.position(),
                    "Replayed session command diverged"
                );
                return Err(BackendError::Protocol(
                    "session command replay diverged".into(),
                ));
            }
        }
        Ok(())
    }

    /// Make sure the target holds the prepared statement a COM_STMT_*
    /// payload refers to, and rewrite the id to the one it assigned
    async fn prepare_ps_for_target<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        target: BackendId,
        packet: &Packet,
        c: &Classification,
    ) -> Result<Option<Packet>, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if !c.command.is_ps_command() {
            return Ok(Some(packet.clone()));
        }
        let Some(stmt_id) = c.stmt_id else {
            return Ok(Some(packet.clone()));
        };
        let Some(ps) = self.ps.get(stmt_id) else {
            // Unknown handle: the backend will answer with its own error
            warn!(session_id = self.id, stmt_id, "Unknown prepared statement id");
            return Ok(Some(packet.clone()));
        };

        let internal_id = ps.internal_id();
        let prepare_packet = ps.prepare_packet().clone();

        if ps.backend_stmt_id(target).is_none() {
            debug!(
                session_id = self.id,
                stmt_id,
                backend = %self.backends[target].name(),
                "Replaying PREPARE before first use"
            );
            self.backends[target]
                .write(&prepare_packet, ResponseMode::ExpectResponse)
                .await?;
            let payload = self.backends[target].consume_reply().await?;
            if is_err_packet(&payload) {
                self.send_error(client, 1243, "HY000", "Unknown prepared statement handler")
                    .await?;
                return Ok(None);
            }
            let Some(native_id) = parse_stmt_prepare_ok(&payload) else {
                return Err(SessionError::Protocol(
                    "Malformed COM_STMT_PREPARE response".into(),
                ));
            };
            self.ps.set_backend_id(internal_id, target, native_id);
        }

        let native_id = self
            .ps
            .get(stmt_id)
            .and_then(|ps| ps.backend_stmt_id(target))
            .unwrap_or(stmt_id);
        Ok(Some(rewrite_stmt_id(packet, native_id)))
    }

    /// Close a prepared statement everywhere it exists
    async fn handle_stmt_close(&mut self, packet: &Packet, c: &Classification) {
        let Some(stmt_id) = c.stmt_id else { return };
        let Some(ps) = self.ps.erase(stmt_id) else {
            return;
        };
        for (backend_id, native_id) in ps.backends() {
            if !self.backends[backend_id].in_use() {
                continue;
            }
            let close = rewrite_stmt_id(packet, native_id);
            if let Err(e) = self.backends[backend_id]
                .write(&close, ResponseMode::NoResponse)
                .await
            {
                warn!(
                    session_id = self.id,
                    backend = %self.backends[backend_id].name(),
                    error = %e,
                    "Failed to forward COM_STMT_CLOSE"
                );
                self.backends[backend_id].close();
                self.ps.forget_backend(backend_id);
            }
        }
    }

    // --- replies ------------------------------------------------------------

    /// Forward one backend reply to the client. With `wait_gtid` the first
    /// result is the GTID-wait prefix: its OK is absorbed (and sequence ids
    /// shifted down), its error aborts the read for a retry on the primary.
    async fn forward_reply<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        backend_id: BackendId,
        wait_gtid: bool,
    ) -> Result<ReplyOutcome, BackendError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let causal_reads = self.opts.causal_reads;
        let retry_reads = self.opts.retry_failed_reads;
        let backend = &mut self.backends[backend_id];
        let mut awaiting_wait_result = wait_gtid;
        let mut seq_offset: u8 = 0;
        let mut last_payload: Option<Bytes> = None;

        loop {
            let (packet, reply_state) = backend.read_reply_packet().await?;

            if awaiting_wait_result {
                awaiting_wait_result = false;
                if is_err_packet(&packet.payload) {
                    // The wait function failed; the client query never ran
                    debug_assert_eq!(reply_state, ReplyState::Done);
                    backend.finish_reply();
                    if retry_reads {
                        return Ok(ReplyOutcome::WaitGtidFailed);
                    }
                    // Retries are off: the wait error goes to the client
                    // unchanged
                    client
                        .send(packet)
                        .await
                        .map_err(|e| BackendError::Io(e.to_string()))?;
                    return Ok(ReplyOutcome::Forwarded);
                }
                // Absorb the prefix OK; renumber what follows
                seq_offset = 1;
                continue;
            }

            last_payload = Some(packet.payload.clone());
            let forwarded = Packet::new(packet.sequence_id.wrapping_sub(seq_offset), packet.payload);
            client
                .send(forwarded)
                .await
                .map_err(|e| BackendError::Io(e.to_string()))?;

            if reply_state == ReplyState::Done {
                backend.finish_reply();
                break;
            }
        }

        backend
            .server()
            .record_response_time(started.elapsed().as_micros() as u64);

        // Track the GTID position for causal reads
        if causal_reads {
            if let Some(payload) = last_payload {
                if is_ok_packet(&payload) {
                    if let Some(gtid) = ok_packet_gtid(&payload, backend.capabilities()) {
                        self.state.gtid_pos = Some(gtid);
                    }
                }
            }
        }

        Ok(ReplyOutcome::Forwarded)
    }

    /// Run the archived statement on the primary after a causal-read
    /// failure. With retries disabled the wait error would have been
    /// forwarded instead.
    async fn retry_on_master<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        c: &Classification,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(archived) = self.archive.take() else {
            self.send_error(client, 1053, "08S01", "Causal read failed")
                .await?;
            return Ok(());
        };

        metrics().record_reroute();
        info!(session_id = self.id, "Causal read failed, retrying on master");

        let master = match self.resolve_master(client).await? {
            Resolved::Backend(id) => id,
            _ => return Ok(()),
        };
        if !self.prepare_target(client, master, &RouteTarget::Master).await? {
            return Ok(());
        }

        self.backends[master]
            .write(&archived.packet, ResponseMode::ExpectResponse)
            .await?;
        match self.forward_reply(client, master, false).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.handle_backend_failure(client, master, c, e, false)
                    .await
            }
        }
    }

    /// React to a backend dying mid-statement: replica reads are replayed
    /// once elsewhere, master failures follow `master_failure_mode`.
    async fn handle_backend_failure<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        failed: BackendId,
        c: &Classification,
        error: BackendError,
        retryable: bool,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        warn!(
            session_id = self.id,
            backend = %self.backends[failed].name(),
            error = %error,
            "Backend failed during statement"
        );
        self.backends[failed].close();
        self.ps.forget_backend(failed);

        if Some(failed) == self.current_master {
            return match self.opts.master_failure_mode {
                MasterFailureMode::FailInstantly => {
                    let message = format!(
                        "Lost connection to master server '{}'",
                        self.backends[failed].name()
                    );
                    self.send_error(client, 2013, "HY000", &message).await?;
                    Err(SessionError::MasterLost(message))
                }
                MasterFailureMode::ErrorOnWrite | MasterFailureMode::FailOnWrite => {
                    self.send_error(client, 1053, "08S01", "Master failed during statement")
                        .await?;
                    Ok(())
                }
            };
        }

        // A replica died: replay the archived read on another one, once
        if retryable && self.opts.retry_failed_reads {
            if let Some(archived) = self.archive.take() {
                if let Some(next) = router::get_slave_backend(
                    &self.backends,
                    self.current_master,
                    self.opts.max_slave_replication_lag,
                    &self.opts,
                ) {
                    metrics().record_reroute();
                    info!(
                        session_id = self.id,
                        backend = %self.backends[next].name(),
                        "Retrying failed read"
                    );
                    if self.prepare_target(client, next, &RouteTarget::Slave).await? {
                        let repacked = match self
                            .prepare_ps_for_target(client, next, &archived.packet, c)
                            .await?
                        {
                            Some(p) => p,
                            None => return Ok(()),
                        };
                        self.backends[next]
                            .write(&repacked, ResponseMode::ExpectResponse)
                            .await?;
                        if let Err(e) = self.forward_reply(client, next, false).await {
                            warn!(session_id = self.id, error = %e, "Read retry failed");
                            self.backends[next].close();
                            self.ps.forget_backend(next);
                            self.send_error(client, 1053, "08S01", "Backend failed during statement")
                                .await?;
                        }
                    }
                    return Ok(());
                }
            }
        }

        self.send_error(client, 1053, "08S01", "Backend failed during statement")
            .await?;
        Ok(())
    }

    /// Route a continuation frame of a multi-packet query to the previous
    /// target; the last frame opens the reply
    async fn route_large_continuation<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(target) = self.prev_target else {
            return Err(SessionError::Protocol(
                "Multi-packet continuation without a previous target".into(),
            ));
        };

        let is_last = !packet.is_large();
        let command = self.large_query_command;
        let expects = is_last && command.will_respond();
        let mode = if expects {
            ResponseMode::ExpectResponse
        } else {
            ResponseMode::NoResponse
        };

        self.backends[target]
            .write_tracked(&packet, mode, command)
            .await?;

        if is_last {
            self.large_query = false;
            self.prev_target = None;
            if expects {
                if let Err(e) = self.forward_reply(client, target, false).await {
                    let c = Classification::default_for(command);
                    return self
                        .handle_backend_failure(client, target, &c, e, false)
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Ping idle backends so their connections survive quiet sessions
    async fn handle_connection_keepalive(&mut self, target: BackendId) {
        if self.opts.connection_keepalive == 0 {
            return;
        }
        let keepalive = Duration::from_secs(self.opts.connection_keepalive);

        for backend_id in 0..self.backends.len() {
            let backend = &mut self.backends[backend_id];
            if backend_id == target
                || !backend.in_use()
                || backend.is_waiting_result()
                || backend.have_session_commands()
            {
                continue;
            }
            if backend.idle_for() > keepalive {
                info!(
                    session_id = self.id,
                    backend = %backend.name(),
                    idle_secs = backend.idle_for().as_secs(),
                    "Pinging idle backend"
                );
                if let Err(e) = backend.ping().await {
                    warn!(
                        session_id = self.id,
                        backend = %backend.name(),
                        error = %e,
                        "Keepalive ping failed"
                    );
                    backend.close();
                    self.ps.forget_backend(backend_id);
                }
            }
        }
    }

    async fn send_error<C>(
        &self,
        client: &mut Framed<C, PacketCodec>,
        code: u16,
        sql_state: &str,
        message: &str,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let err = ErrPacket::new(code, sql_state, message);
        client
            .send(err.encode(1, self.state.capability_flags))
            .await?;
        Ok(())
    }
}

/// How resolving a target class ended
enum Resolved {
    Backend(BackendId),
    /// The client already got a reply (an error under a failure mode)
    AnsweredClient,
    NotFound,
}

enum ReplyOutcome {
    Forwarded,
    WaitGtidFailed,
}

/// Pack the GTID wait and the client query into one multi-statement, so a
/// wait timeout errors before the query runs and a round trip is saved:
///
///   SET @janus_secret_variable=(SELECT CASE WHEN MASTER_GTID_WAIT('0-1-1', 10) = 0
///   THEN 1 ELSE (SELECT 1 FROM INFORMATION_SCHEMA.ENGINES) END); <client query>
fn add_prefix_wait_gtid(
    packet: &Packet,
    gtid: &str,
    timeout_secs: u64,
    server_type: ServerType,
) -> Packet {
    let wait_func = match server_type {
        ServerType::MariaDb => "MASTER_GTID_WAIT",
        ServerType::MySql => "WAIT_FOR_EXECUTED_GTID_SET",
    };
    let prefix = format!(
        "SET @janus_secret_variable=(SELECT CASE WHEN {}('{}', {}) = 0 \
         THEN 1 ELSE (SELECT 1 FROM INFORMATION_SCHEMA.ENGINES) END); ",
        wait_func, gtid, timeout_secs
    );

    let mut buf = BytesMut::with_capacity(1 + prefix.len() + packet.payload.len() - 1);
    buf.put_u8(Command::Query as u8);
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(&packet.payload[1..]);
    Packet::new(packet.sequence_id, buf.freeze())
}

impl Classification {
    /// A minimal classification for contexts where only the command is known
    fn default_for(command: Command) -> Self {
        let packet = Packet::command(command, &[]);
        Classifier::new().classify(&packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_gtid_prefix_mariadb() {
        let packet = Packet::command(Command::Query, b"SELECT * FROM city");
        let prefixed = add_prefix_wait_gtid(&packet, "0-3000-14", 10, ServerType::MariaDb);

        assert_eq!(prefixed.payload[0], Command::Query as u8);
        let sql = String::from_utf8_lossy(&prefixed.payload[1..]);
        assert!(sql.starts_with("SET @janus_secret_variable="));
        assert!(sql.contains("MASTER_GTID_WAIT('0-3000-14', 10)"));
        assert!(sql.ends_with("SELECT * FROM city"));
    }

    #[test]
    fn test_wait_gtid_prefix_mysql() {
        let packet = Packet::command(Command::Query, b"SELECT 1");
        let prefixed = add_prefix_wait_gtid(
            &packet,
            "3E11FA47-71CA-11E1-9E33-C80AA9429562:23",
            5,
            ServerType::MySql,
        );
        let sql = String::from_utf8_lossy(&prefixed.payload[1..]);
        assert!(sql.contains("WAIT_FOR_EXECUTED_GTID_SET("));
        assert!(sql.contains(":23', 5)"));
    }
}
