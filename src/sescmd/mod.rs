//! Session command history.
//!
//! Statements that mutate connection-scoped state (SET, USE, PREPARE, ...)
//! are recorded here and replayed on every backend the session ever uses, so
//! a read served by any replica observes the same cumulative session state.
//! Each backend keeps its own replay cursor; the log stores the first
//! response per position so replayed responses can be answered and compared.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::{Command, Packet};

/// One recorded session command. Immutable after creation; shared by every
/// backend that still has to execute or acknowledge it.
#[derive(Debug)]
pub struct SessionCommand {
    position: u64,
    packet: Packet,
    expects_response: bool,
}

pub type SharedSessionCommand = Arc<SessionCommand>;

impl SessionCommand {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn command(&self) -> Command {
        self.packet.command_byte().unwrap_or(Command::Unknown)
    }

    pub fn expects_response(&self) -> bool {
        self.expects_response
    }

    /// Two commands are equivalent when their wire payloads are identical
    fn equivalent(&self, other: &SessionCommand) -> bool {
        self.packet.payload == other.packet.payload
    }
}

/// How a backend's reply to a session command relates to the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMatch {
    /// First reply seen for this position; it was stored and should be
    /// forwarded to the client
    First,
    /// A later reply that agrees with the stored one; absorb it
    Duplicate,
    /// A later reply that disagrees; the backend is no longer consistent
    Divergent,
}

/// Outcome of appending a command to the history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Retained,
    /// The configured limit was crossed by this append: the history was
    /// dropped and the disable latch engaged
    HistoryDropped,
    /// History is disabled; the command was numbered but not retained
    NotRetained,
}

/// Ordered history of session commands with per-position responses
pub struct SessionCommandLog {
    commands: Vec<SharedSessionCommand>,
    responses: BTreeMap<u64, Bytes>,
    next_position: u64,
    max_history: usize,
    disabled: bool,
}

impl SessionCommandLog {
    pub fn new(max_history: usize, disabled: bool) -> Self {
        Self {
            commands: Vec::new(),
            responses: BTreeMap::new(),
            next_position: 1,
            max_history,
            disabled,
        }
    }

    /// Whether the history has been dropped; once true, no backend that
    /// missed earlier commands can ever be brought to a consistent state.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Number of session commands issued over the session's lifetime
    pub fn issued(&self) -> u64 {
        self.next_position - 1
    }

    pub fn retained(&self) -> &[SharedSessionCommand] {
        &self.commands
    }

    pub fn last_position(&self) -> u64 {
        self.next_position - 1
    }

    /// Record a new session command. Positions are strictly increasing for
    /// the whole session, even across a history drop.
    pub fn append(
        &mut self,
        packet: Packet,
        expects_response: bool,
    ) -> (SharedSessionCommand, AppendOutcome) {
        let command = Arc::new(SessionCommand {
            position: self.next_position,
            packet,
            expects_response,
        });
        self.next_position += 1;

        if self.disabled {
            return (command, AppendOutcome::NotRetained);
        }

        self.purge_duplicates(&command);
        self.commands.push(command.clone());

        if self.max_history > 0 && self.commands.len() > self.max_history {
            self.disabled = true;
            self.commands.clear();
            return (command, AppendOutcome::HistoryDropped);
        }

        (command, AppendOutcome::Retained)
    }

    /// Keep the first and last copy of a repeated command, dropping the one
    /// in between. Replay then still reproduces both the environment any
    /// intermediate command ran in and the final environment:
    ///
    ///   USE test;
    ///   SET @v = (SELECT COUNT(*) FROM t1);
    ///   USE test;
    ///
    /// COM_STMT_PREPARE is exempt: prepared handles map to explicit ids.
    fn purge_duplicates(&mut self, incoming: &SessionCommand) {
        if incoming.command() == Command::StmtPrepare {
            return;
        }

        let Some(first) = self.commands.iter().position(|c| c.equivalent(incoming)) else {
            return;
        };
        let Some(second) = self.commands[first + 1..]
            .iter()
            .position(|c| c.equivalent(incoming))
            .map(|i| first + 1 + i)
        else {
            return;
        };

        let removed = self.commands.remove(second);
        self.responses.remove(&removed.position());
    }

    /// Record one backend's reply for a position
    pub fn record_response(&mut self, position: u64, payload: &Bytes) -> ResponseMatch {
        match self.responses.get(&position) {
            None => {
                self.responses.insert(position, payload.clone());
                ResponseMatch::First
            }
            Some(stored) => {
                if responses_agree(stored, payload) {
                    ResponseMatch::Duplicate
                } else {
                    ResponseMatch::Divergent
                }
            }
        }
    }

    pub fn response(&self, position: u64) -> Option<&Bytes> {
        self.responses.get(&position)
    }

    /// With history disabled nothing will ever replay below the lowest
    /// in-flight cursor, so stored responses under it can go.
    pub fn prune_responses_below(&mut self, lowest_pending: u64) {
        self.responses = self.responses.split_off(&lowest_pending);
    }
}

/// Replies agree when both are OK, or both are errors with the same code
fn responses_agree(a: &Bytes, b: &Bytes) -> bool {
    match (a.first(), b.first()) {
        (Some(0xFF), Some(0xFF)) => a.get(1..3) == b.get(1..3),
        (Some(0xFF), _) | (_, Some(0xFF)) => false,
        _ => true,
    }
}
