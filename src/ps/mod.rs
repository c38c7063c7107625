//! Prepared statement bookkeeping.
//!
//! Every COM_STMT_PREPARE is broadcast, and each backend assigns its own
//! statement id. The client only ever sees the id from the reply that was
//! forwarded to it, so COM_STMT_EXECUTE / CLOSE / FETCH / RESET payloads are
//! rewritten per backend to carry the id that backend actually handed out.
//! A backend that never ran the PREPARE gets a replay driven before its
//! first EXECUTE.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use tracing::debug;

use crate::backend::BackendId;
use crate::protocol::Packet;

/// Process-wide cache of prepared statement texts. Sessions preparing the
/// same statement share one allocation; writes are rare after warmup.
pub struct PsTextCache {
    inner: RwLock<HashMap<String, Arc<str>>>,
}

impl PsTextCache {
    fn global() -> &'static PsTextCache {
        static CACHE: OnceLock<PsTextCache> = OnceLock::new();
        CACHE.get_or_init(|| PsTextCache {
            inner: RwLock::new(HashMap::new()),
        })
    }

    fn intern(text: &str) -> Arc<str> {
        let cache = Self::global();
        if let Some(interned) = cache.inner.read().get(text) {
            return interned.clone();
        }
        let mut map = cache.inner.write();
        map.entry(text.to_string())
            .or_insert_with(|| Arc::from(text))
            .clone()
    }
}

/// One prepared statement known to the session
#[derive(Debug)]
pub struct PreparedStatement {
    /// Id the client uses, taken from the first PREPARE reply it was shown
    external_id: u32,
    /// Router-internal id: the session command position of the PREPARE
    internal_id: u64,
    /// The original COM_STMT_PREPARE packet, for replays
    prepare_packet: Packet,
    /// Statement text, interned in the global cache
    sql: Arc<str>,
    /// Backends holding the handle, with the id each one assigned
    backend_ids: HashMap<BackendId, u32>,
}

impl PreparedStatement {
    pub fn external_id(&self) -> u32 {
        self.external_id
    }

    pub fn internal_id(&self) -> u64 {
        self.internal_id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn prepare_packet(&self) -> &Packet {
        &self.prepare_packet
    }

    pub fn is_prepared_on(&self, backend: BackendId) -> bool {
        self.backend_ids.contains_key(&backend)
    }

    pub fn backend_stmt_id(&self, backend: BackendId) -> Option<u32> {
        self.backend_ids.get(&backend).copied()
    }

    pub fn backends(&self) -> impl Iterator<Item = (BackendId, u32)> + '_ {
        self.backend_ids.iter().map(|(&b, &id)| (b, id))
    }
}

/// All prepared statements of one session, plus COM_STMT_FETCH affinity
pub struct PsManager {
    /// Statements pending their first reply, keyed by internal id
    pending: HashMap<u64, PreparedStatement>,
    /// Completed statements keyed by the client-visible id
    by_external: HashMap<u32, PreparedStatement>,
    /// external id -> backend that ran the last COM_STMT_EXECUTE
    exec_map: HashMap<u32, BackendId>,
}

impl PsManager {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            by_external: HashMap::new(),
            exec_map: HashMap::new(),
        }
    }

    /// Record a COM_STMT_PREPARE as it is broadcast. The internal id is the
    /// session command position of the PREPARE.
    pub fn store(&mut self, packet: &Packet, internal_id: u64) {
        let sql = String::from_utf8_lossy(&packet.payload[1..]);
        let ps = PreparedStatement {
            external_id: 0,
            internal_id,
            prepare_packet: packet.clone(),
            sql: PsTextCache::intern(&sql),
            backend_ids: HashMap::new(),
        };
        self.pending.insert(internal_id, ps);
    }

    /// The first forwarded PREPARE reply fixes the client-visible id
    pub fn complete(&mut self, internal_id: u64, external_id: u32) {
        if let Some(mut ps) = self.pending.remove(&internal_id) {
            ps.external_id = external_id;
            debug!(external_id, sql = %ps.sql, "Prepared statement registered");
            self.by_external.insert(external_id, ps);
        }
    }

    /// Record the id a backend assigned for a statement
    pub fn set_backend_id(&mut self, internal_id: u64, backend: BackendId, stmt_id: u32) {
        if let Some(ps) = self.pending.get_mut(&internal_id) {
            ps.backend_ids.insert(backend, stmt_id);
            return;
        }
        if let Some(ps) = self
            .by_external
            .values_mut()
            .find(|ps| ps.internal_id == internal_id)
        {
            ps.backend_ids.insert(backend, stmt_id);
        }
    }

    pub fn get(&self, external_id: u32) -> Option<&PreparedStatement> {
        self.by_external.get(&external_id)
    }

    /// Forget a statement on COM_STMT_CLOSE
    pub fn erase(&mut self, external_id: u32) -> Option<PreparedStatement> {
        self.exec_map.remove(&external_id);
        self.by_external.remove(&external_id)
    }

    /// A closed backend holds no handles and serves no fetches
    pub fn forget_backend(&mut self, backend: BackendId) {
        for ps in self.by_external.values_mut() {
            ps.backend_ids.remove(&backend);
        }
        for ps in self.pending.values_mut() {
            ps.backend_ids.remove(&backend);
        }
        self.exec_map.retain(|_, &mut b| b != backend);
    }

    pub fn record_execute(&mut self, external_id: u32, backend: BackendId) {
        self.exec_map.insert(external_id, backend);
    }

    /// Where a COM_STMT_FETCH for this statement must go
    pub fn fetch_target(&self, external_id: u32) -> Option<BackendId> {
        self.exec_map.get(&external_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_external.is_empty()
    }
}

impl Default for PsManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrite the statement id at the head of a COM_STMT_* payload
pub fn rewrite_stmt_id(packet: &Packet, stmt_id: u32) -> Packet {
    debug_assert!(packet.payload.len() >= 5);
    let mut buf = BytesMut::with_capacity(packet.payload.len());
    buf.put_u8(packet.payload[0]);
    buf.put_u32_le(stmt_id);
    buf.extend_from_slice(&packet.payload[5..]);
    Packet::new(packet.sequence_id, buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    fn prepare_packet(sql: &str) -> Packet {
        Packet::command(Command::StmtPrepare, sql.as_bytes())
    }

    fn execute_packet(stmt_id: u32) -> Packet {
        let mut data = stmt_id.to_le_bytes().to_vec();
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00]);
        Packet::command(Command::StmtExecute, &data)
    }

    #[test]
    fn test_store_complete_lookup() {
        let mut manager = PsManager::new();
        manager.store(&prepare_packet("SELECT ?"), 3);
        manager.set_backend_id(3, 0, 11);
        manager.complete(3, 11);
        manager.set_backend_id(3, 1, 42);

        let ps = manager.get(11).unwrap();
        assert_eq!(ps.internal_id(), 3);
        assert_eq!(ps.sql(), "SELECT ?");
        assert_eq!(ps.backend_stmt_id(0), Some(11));
        assert_eq!(ps.backend_stmt_id(1), Some(42));
        assert!(!ps.is_prepared_on(2));
    }

    #[test]
    fn test_rewrite_stmt_id() {
        let packet = execute_packet(11);
        let rewritten = rewrite_stmt_id(&packet, 42);
        assert_eq!(rewritten.payload[0], Command::StmtExecute as u8);
        assert_eq!(
            u32::from_le_bytes([
                rewritten.payload[1],
                rewritten.payload[2],
                rewritten.payload[3],
                rewritten.payload[4]
            ]),
            42
        );
        // Everything after the id is untouched
        assert_eq!(&rewritten.payload[5..], &packet.payload[5..]);
    }

    #[test]
    fn test_fetch_affinity() {
        let mut manager = PsManager::new();
        manager.store(&prepare_packet("SELECT ?"), 1);
        manager.set_backend_id(1, 2, 9);
        manager.complete(1, 9);

        assert_eq!(manager.fetch_target(9), None);
        manager.record_execute(9, 2);
        assert_eq!(manager.fetch_target(9), Some(2));
    }

    #[test]
    fn test_erase_on_close() {
        let mut manager = PsManager::new();
        manager.store(&prepare_packet("SELECT ?"), 1);
        manager.set_backend_id(1, 0, 5);
        manager.complete(1, 5);
        manager.record_execute(5, 0);

        let ps = manager.erase(5).unwrap();
        assert_eq!(ps.backend_stmt_id(0), Some(5));
        assert!(manager.get(5).is_none());
        assert_eq!(manager.fetch_target(5), None);
    }

    #[test]
    fn test_forget_backend() {
        let mut manager = PsManager::new();
        manager.store(&prepare_packet("SELECT ?"), 1);
        manager.set_backend_id(1, 0, 5);
        manager.set_backend_id(1, 1, 6);
        manager.complete(1, 5);
        manager.record_execute(5, 1);

        manager.forget_backend(1);
        let ps = manager.get(5).unwrap();
        assert!(!ps.is_prepared_on(1));
        assert!(ps.is_prepared_on(0));
        assert_eq!(manager.fetch_target(5), None);
    }

    #[test]
    fn test_text_cache_shares_allocations() {
        let a = PsTextCache::intern("SELECT 1");
        let b = PsTextCache::intern("SELECT 1");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
