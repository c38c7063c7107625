//! One router-to-server connection and its per-session state.
//!
//! A `Backend` owns the socket, tracks where the server is in answering the
//! last command, and carries the session-command replay queue that brings a
//! freshly opened connection up to the session's cumulative state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::BackendAuthConfig;
use crate::protocol::{
    capabilities, is_eof_packet, is_err_packet, is_ok_packet, packet_status_flags, status,
    Command, ErrPacket, HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};
use crate::sescmd::{SessionCommandLog, SharedSessionCommand};
use crate::topology::{Server, ServerType};

/// Index of a backend within its owning session
pub type BackendId = usize;

/// Where the backend is in answering the last command sent to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Not waiting for anything
    Idle,
    /// A command expecting a response was written; nothing read yet
    ExpectingStart,
    /// Inside a multi-packet response
    ExpectingMore,
    /// The response is complete but the owner has not consumed it yet
    Done,
}

/// Whether a write is followed by a server response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    NoResponse,
    ExpectResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Backend disconnected")]
    Disconnected,

    #[error("Backend is not connected")]
    NotConnected,

    #[error("Write while a response is outstanding")]
    NotIdle,

    #[error("Session command history is disabled; backend cannot be brought up to date")]
    HistoryDisabled,
}

/// Tracks the shape of one in-flight response
#[derive(Debug)]
struct ReplyTracker {
    command: Command,
    state: ReplyState,
    eofs_needed: u8,
    eofs_seen: u8,
}

impl ReplyTracker {
    fn new(command: Command) -> Self {
        Self {
            command,
            state: ReplyState::ExpectingStart,
            eofs_needed: 0,
            eofs_seen: 0,
        }
    }

    /// Observe one reply packet and advance the state machine.
    ///
    /// DEPRECATE_EOF is never negotiated, so inside a result set only EOF
    /// and ERR can terminate; a row payload may legitimately begin with
    /// 0x00 or 0xFE-as-length and is not mistaken for a terminator.
    fn track(&mut self, payload: &bytes::Bytes, caps: u32) -> ReplyState {
        match self.state {
            ReplyState::ExpectingStart => {
                if is_err_packet(payload) {
                    self.state = ReplyState::Done;
                } else if self.command == Command::StmtPrepare
                    && is_ok_packet(payload)
                    && payload.len() >= 12
                {
                    // COM_STMT_PREPARE_OK: an EOF follows each non-empty
                    // parameter and column definition block
                    let num_columns = u16::from_le_bytes([payload[5], payload[6]]);
                    let num_params = u16::from_le_bytes([payload[7], payload[8]]);
                    self.eofs_needed =
                        u8::from(num_params > 0) + u8::from(num_columns > 0);
                    self.state = if self.eofs_needed == 0 {
                        ReplyState::Done
                    } else {
                        ReplyState::ExpectingMore
                    };
                } else if is_ok_packet(payload) {
                    if has_more_results(payload, caps) {
                        // Next result of a multi-statement reply follows
                        self.state = ReplyState::ExpectingStart;
                    } else {
                        self.state = ReplyState::Done;
                    }
                } else if is_eof_packet(payload, caps) {
                    self.state = ReplyState::Done;
                } else {
                    // Result set header
                    self.eofs_needed = match self.command {
                        Command::FieldList | Command::StmtFetch => 1,
                        _ => 2,
                    };
                    self.eofs_seen = 0;
                    self.state = ReplyState::ExpectingMore;
                }
            }
            ReplyState::ExpectingMore => {
                if is_err_packet(payload) {
                    self.state = ReplyState::Done;
                } else if is_eof_packet(payload, caps) {
                    self.eofs_seen += 1;
                    if self.eofs_seen >= self.eofs_needed {
                        if has_more_results(payload, caps) {
                            self.state = ReplyState::ExpectingStart;
                        } else {
                            self.state = ReplyState::Done;
                        }
                    }
                }
            }
            ReplyState::Idle | ReplyState::Done => {}
        }
        self.state
    }
}

fn has_more_results(payload: &bytes::Bytes, caps: u32) -> bool {
    packet_status_flags(payload, caps)
        .map(|flags| flags & status::SERVER_MORE_RESULTS_EXISTS != 0)
        .unwrap_or(false)
}

/// An owned handle to one backend server
pub struct Backend {
    id: BackendId,
    server: Arc<Server>,
    framed: Option<Framed<TcpStream, PacketCodec>>,
    reply: Option<ReplyTracker>,
    sescmd_queue: VecDeque<SharedSessionCommand>,
    /// Position of the next session command to replay
    cursor: u64,
    /// Session command currently awaiting its reply
    pending_sescmd: Option<SharedSessionCommand>,
    pending_pings: usize,
    last_read: Instant,
    closed: bool,
    capabilities: u32,
}

impl Backend {
    pub fn new(id: BackendId, server: Arc<Server>) -> Self {
        Self {
            id,
            server,
            framed: None,
            reply: None,
            sescmd_queue: VecDeque::new(),
            cursor: 1,
            pending_sescmd: None,
            pending_pings: 0,
            last_read: Instant::now(),
            closed: false,
            capabilities: 0,
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn name(&self) -> &str {
        &self.server.name
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn in_use(&self) -> bool {
        self.framed.is_some() && !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True if a fresh connection to the server could succeed
    pub fn can_connect(&self) -> bool {
        !self.server.is_down()
    }

    pub fn reply_state(&self) -> ReplyState {
        self.reply
            .as_ref()
            .map(|r| r.state)
            .unwrap_or(ReplyState::Idle)
    }

    pub fn is_waiting_result(&self) -> bool {
        self.reply.is_some()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_read.elapsed()
    }

    /// Open the connection and enqueue the whole session command history for
    /// replay. Refused when the history has been dropped after commands
    /// already ran: the server could never reach a consistent state.
    pub async fn connect(
        &mut self,
        auth: &BackendAuthConfig,
        database: Option<&str>,
        log: &SessionCommandLog,
    ) -> Result<(), BackendError> {
        if log.is_disabled() && log.issued() > 0 {
            return Err(BackendError::HistoryDisabled);
        }

        let addr = self.server.addr();
        debug!(backend = %self.name(), addr = %addr, "Connecting to backend");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            warn!(backend = %self.name(), error = %e, "Failed to connect to backend");
            BackendError::Connect(e.to_string())
        })?;

        let mut framed = Framed::new(stream, PacketCodec);

        // Receive backend handshake
        let greeting = framed
            .next()
            .await
            .ok_or(BackendError::Disconnected)?
            .map_err(|e| BackendError::Io(e.to_string()))?;

        let handshake = InitialHandshake::parse(&greeting.payload)
            .ok_or_else(|| BackendError::Protocol("Invalid backend handshake".into()))?;

        self.server.set_server_type(if handshake.is_mariadb() {
            ServerType::MariaDb
        } else {
            ServerType::MySql
        });

        let auth_data = handshake.auth_plugin_data();
        let auth_response = crate::protocol::compute_auth_response(&auth.password, &auth_data);

        let database = database.map(str::to_string).or_else(|| auth.database.clone());
        let mut caps = capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;
        if database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21, // utf8_general_ci
            username: auth.user.clone(),
            auth_response,
            database,
            auth_plugin_name: handshake.auth_plugin_name.clone(),
        };

        framed
            .send(response.encode(1))
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;

        let reply = framed
            .next()
            .await
            .ok_or(BackendError::Disconnected)?
            .map_err(|e| BackendError::Io(e.to_string()))?;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            warn!(
                backend = %self.name(),
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(BackendError::Auth(err.error_message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(BackendError::Protocol(
                "Expected OK packet from backend".into(),
            ));
        }

        self.framed = Some(framed);
        self.capabilities = caps;
        self.reply = None;
        self.closed = false;
        self.pending_sescmd = None;
        self.pending_pings = 0;
        self.last_read = Instant::now();
        self.server.connection_opened();

        // Replay history: every retained command, oldest first
        self.sescmd_queue = log.retained().iter().cloned().collect();
        self.cursor = self
            .sescmd_queue
            .front()
            .map(|c| c.position())
            .unwrap_or_else(|| log.last_position() + 1);

        debug!(
            backend = %self.name(),
            replay = self.sescmd_queue.len(),
            "Backend connected"
        );
        Ok(())
    }

    /// Close the connection. Terminal until a reconnect succeeds.
    pub fn close(&mut self) {
        if self.framed.take().is_some() {
            self.server.connection_closed();
        }
        self.closed = true;
        self.reply = None;
        self.pending_sescmd = None;
        self.sescmd_queue.clear();
        self.pending_pings = 0;
    }

    /// Send one packet. With `ExpectResponse` the reply state moves
    /// Idle -> ExpectingStart; writing while a response is outstanding is a
    /// programming error.
    pub async fn write(
        &mut self,
        packet: &Packet,
        mode: ResponseMode,
    ) -> Result<(), BackendError> {
        let command = packet.command_byte().unwrap_or(Command::Unknown);
        self.write_tracked(packet, mode, command).await
    }

    /// Like `write`, but the caller names the command the reply belongs to.
    /// Needed for the final frame of a multi-packet query, whose payload no
    /// longer starts with a command byte.
    pub async fn write_tracked(
        &mut self,
        packet: &Packet,
        mode: ResponseMode,
        command: Command,
    ) -> Result<(), BackendError> {
        if self.pending_pings > 0 {
            self.drain_pings().await?;
        }

        if mode == ResponseMode::ExpectResponse {
            if self.reply.is_some() {
                return Err(BackendError::NotIdle);
            }
            self.reply = Some(ReplyTracker::new(command));
        }

        let framed = self.framed.as_mut().ok_or(BackendError::NotConnected)?;
        if let Err(e) = framed.send(packet.clone()).await {
            self.close();
            return Err(BackendError::Io(e.to_string()));
        }
        Ok(())
    }

    /// Read one reply packet and advance the reply state machine
    pub async fn read_reply_packet(&mut self) -> Result<(Packet, ReplyState), BackendError> {
        let packet = self.recv().await?;
        let caps = self.capabilities;
        let state = match self.reply.as_mut() {
            Some(tracker) => tracker.track(&packet.payload, caps),
            None => return Err(BackendError::Protocol("Unexpected reply packet".into())),
        };
        Ok((packet, state))
    }

    /// Acknowledge a completed reply: Done -> Idle
    pub fn finish_reply(&mut self) {
        debug_assert_eq!(self.reply_state(), ReplyState::Done);
        self.reply = None;
    }

    /// Read and discard a complete reply, returning its first packet's
    /// payload (the OK/ERR or response header).
    pub async fn consume_reply(&mut self) -> Result<bytes::Bytes, BackendError> {
        let mut first: Option<bytes::Bytes> = None;
        loop {
            let (packet, state) = self.read_reply_packet().await?;
            if first.is_none() {
                first = Some(packet.payload);
            }
            if state == ReplyState::Done {
                self.finish_reply();
                // first is always set by the time the reply completes
                return Ok(first.unwrap_or_default());
            }
        }
    }

    async fn recv(&mut self) -> Result<Packet, BackendError> {
        let framed = self.framed.as_mut().ok_or(BackendError::NotConnected)?;
        match framed.next().await {
            Some(Ok(packet)) => {
                self.last_read = Instant::now();
                Ok(packet)
            }
            Some(Err(e)) => {
                self.close();
                Err(BackendError::Io(e.to_string()))
            }
            None => {
                self.close();
                Err(BackendError::Disconnected)
            }
        }
    }

    // --- session command replay -------------------------------------------

    pub fn append_session_command(&mut self, cmd: SharedSessionCommand) {
        self.sescmd_queue.push_back(cmd);
    }

    /// True while replay commands are queued or one is awaiting its reply.
    /// Ordinary query writes must be gated behind this.
    pub fn have_session_commands(&self) -> bool {
        !self.sescmd_queue.is_empty() || self.pending_sescmd.is_some()
    }

    /// Position of the next unacknowledged session command, if any
    pub fn next_session_command_position(&self) -> Option<u64> {
        self.pending_sescmd
            .as_ref()
            .map(|c| c.position())
            .or_else(|| self.sescmd_queue.front().map(|c| c.position()))
    }

    /// Hand the in-flight session command to the owner, which will read the
    /// reply itself
    pub fn take_pending_sescmd(&mut self) -> Option<SharedSessionCommand> {
        self.pending_sescmd.take()
    }

    /// Write the queue head and advance the cursor. The reply (if any) must
    /// be collected with `take_session_command_reply` before the next write.
    pub async fn execute_session_command(&mut self) -> Result<Option<u64>, BackendError> {
        let Some(cmd) = self.sescmd_queue.pop_front() else {
            return Ok(None);
        };

        let mode = if cmd.expects_response() {
            ResponseMode::ExpectResponse
        } else {
            ResponseMode::NoResponse
        };

        self.cursor = cmd.position() + 1;
        let packet = cmd.packet().clone();
        self.write(&packet, mode).await?;

        let position = cmd.position();
        if cmd.expects_response() {
            self.pending_sescmd = Some(cmd);
        }
        Ok(Some(position))
    }

    /// Collect the reply to the in-flight session command
    pub async fn take_session_command_reply(
        &mut self,
    ) -> Result<Option<(SharedSessionCommand, bytes::Bytes)>, BackendError> {
        let Some(cmd) = self.pending_sescmd.take() else {
            return Ok(None);
        };
        let payload = self.consume_reply().await?;
        Ok(Some((cmd, payload)))
    }

    // --- keep-alive --------------------------------------------------------

    /// Fire an ignorable COM_PING; its OK is drained before the next write
    pub async fn ping(&mut self) -> Result<(), BackendError> {
        debug_assert!(!self.is_waiting_result());
        let packet = Packet::command(Command::Ping, &[]);
        let framed = self.framed.as_mut().ok_or(BackendError::NotConnected)?;
        if let Err(e) = framed.send(packet).await {
            self.close();
            return Err(BackendError::Io(e.to_string()));
        }
        self.pending_pings += 1;
        Ok(())
    }

    async fn drain_pings(&mut self) -> Result<(), BackendError> {
        while self.pending_pings > 0 {
            let packet = self.recv().await?;
            if !is_ok_packet(&packet.payload) && !is_err_packet(&packet.payload) {
                return Err(BackendError::Protocol(
                    "Unexpected packet while draining ping replies".into(),
                ));
            }
            self.pending_pings -= 1;
        }
        Ok(())
    }
}
