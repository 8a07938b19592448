//! The per-tunnel connection pool (spec §4.2): selection among live
//! paths, buffer-credit accounting, and the trim task.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::collab::{ConnState, ConnectionLayer};
use crate::ids::ConnId;

/// The largest per-channel buffer CADET allows (spec §3); the pool's
/// logical credit pool is sized to this.
pub const CADET_MAX_CHANNEL_BUFFER: u32 = 64;

/// Target number of connections a tunnel tries to keep; the trim task
/// fires once `count > 2 * CONNECTIONS_PER_TUNNEL` (spec §4.2).
pub const CONNECTIONS_PER_TUNNEL: usize = 3;

/// One path through the overlay, bound to a tunnel (spec §3
/// "Connection").
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub created_order: u64,
    pub state: ConnState,
    pub is_direct: bool,
    /// Outstanding queue length on this connection; used by the
    /// smallest-queue selection policy.
    pub queue_len: u32,
    /// Send allowance granted by the tunnel's credit pool.
    pub allowance: u32,
}

impl Connection {
    pub fn new(id: ConnId, created_order: u64, is_direct: bool) -> Self {
        Connection {
            id,
            created_order,
            state: ConnState::New,
            is_direct,
            queue_len: 0,
            allowance: 0,
        }
    }
}

/// The set of live connections bound to one tunnel, plus the shared
/// send-credit pool they draw from.
pub struct ConnectionPool {
    connections: BTreeMap<ConnId, Connection>,
    next_created_order: u64,
    channel_buffer: u32,
}

impl ConnectionPool {
    pub fn new(channel_buffer: u32) -> Self {
        ConnectionPool {
            connections: BTreeMap::new(),
            next_created_order: 0,
            channel_buffer,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Add a newly discovered connection to the pool.
    pub fn add(&mut self, id: ConnId, is_direct: bool) {
        let order = self.next_created_order;
        self.next_created_order += 1;
        debug!(conn = %id, is_direct, "connection added to pool");
        self.connections.insert(id, Connection::new(id, order, is_direct));
    }

    /// Remove a connection (path loss, tunnel shutdown, or trim).
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            debug!(conn = %id, "connection removed from pool");
        }
        removed
    }

    /// Poll the connection layer for each connection's current state
    /// (spec §6: `ConnectionLayer::get_state`). A connection freshly
    /// observed READY has, per `ConnectionLayer::send`'s contract,
    /// delivered everything previously queued on it (the "actual
    /// delivery is reported later through the readiness callback"
    /// promise in `ConnectionLayer`'s own doc comment), so its queue
    /// length resets to zero.
    pub fn refresh_states(&mut self, connection_layer: &dyn ConnectionLayer) {
        for conn in self.connections.values_mut() {
            let state = connection_layer.get_state(conn.id);
            if state == ConnState::Ready {
                conn.queue_len = 0;
            }
            conn.state = state;
        }
    }

    /// True if at least one connection is READY.
    pub fn has_ready(&self) -> bool {
        self.connections.values().any(|c| c.state == ConnState::Ready)
    }

    /// Pick the READY connection, with spare send allowance, with the
    /// smallest outstanding queue length; ties are broken by iteration
    /// order (`BTreeMap` keys on `ConnId`, so this is deterministic).
    pub fn pick_for_send(&self) -> Option<ConnId> {
        self.connections
            .values()
            .filter(|c| c.state == ConnState::Ready && c.allowance > 0)
            .min_by_key(|c| c.queue_len)
            .map(|c| c.id)
    }

    /// Remaining logical buffer credits this tunnel has to hand out,
    /// i.e. the channel buffer size minus everything already allocated.
    pub fn buffer_credits(&self) -> u32 {
        let allocated: u32 = self.connections.values().map(|c| c.allowance).sum();
        self.channel_buffer.saturating_sub(allocated)
    }

    /// Grant `n` additional credits to `conn`. No-op if `conn` is
    /// already at or above the `64/3` watermark (spec §4.2).
    pub fn grant(&mut self, conn: ConnId, n: u32) {
        let watermark = CADET_MAX_CHANNEL_BUFFER / 3;
        if let Some(c) = self.connections.get_mut(&conn) {
            if c.allowance >= watermark {
                return;
            }
            c.allowance = c.allowance.saturating_add(n);
            trace!(conn = %conn, new_allowance = c.allowance, "granted send credits");
        }
    }

    /// When a connection becomes READY with headroom (used less than a
    /// third of its allowance), hand out more credit proportional to the
    /// remaining pool divided across the READY connections (spec §4.2).
    pub fn rebalance_credits(&mut self) {
        let ready_ids: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| c.state == ConnState::Ready)
            .map(|c| c.id)
            .collect();
        if ready_ids.is_empty() {
            return;
        }
        let n_ready = ready_ids.len() as u32;
        let remaining = self.buffer_credits();
        let share = remaining / n_ready;
        if share == 0 {
            return;
        }
        let watermark = CADET_MAX_CHANNEL_BUFFER / 3;
        for id in ready_ids {
            if let Some(c) = self.connections.get(&id) {
                if c.allowance < watermark / 3 {
                    self.grant(id, share);
                }
            }
        }
    }

    /// Destroy excess connections: if `count > 2 * CONNECTIONS_PER_TUNNEL`,
    /// destroy the newest non-direct connection. If every excess
    /// connection is direct, destroy none (spec §4.2, §8 scenario 6).
    pub fn trim(&mut self) -> Option<ConnId> {
        if self.connections.len() <= 2 * CONNECTIONS_PER_TUNNEL {
            return None;
        }
        let victim = self
            .connections
            .values()
            .filter(|c| !c.is_direct)
            .max_by_key(|c| c.created_order)
            .map(|c| c.id)?;
        debug!(conn = %victim, "trimming excess connection");
        self.remove(victim);
        Some(victim)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ready(pool: &mut ConnectionPool, id: u64, direct: bool) {
        pool.add(ConnId(id), direct);
        let c = pool.get_mut(ConnId(id)).unwrap();
        c.state = ConnState::Ready;
        c.allowance = 10;
    }

    #[test]
    fn picks_smallest_queue_among_ready() {
        let mut pool = ConnectionPool::new(64);
        ready(&mut pool, 1, true);
        ready(&mut pool, 2, true);
        pool.get_mut(ConnId(1)).unwrap().queue_len = 5;
        pool.get_mut(ConnId(2)).unwrap().queue_len = 1;
        assert_eq!(pool.pick_for_send(), Some(ConnId(2)));
    }

    #[test]
    fn non_ready_connections_never_picked() {
        let mut pool = ConnectionPool::new(64);
        pool.add(ConnId(1), true);
        assert_eq!(pool.pick_for_send(), None);
    }

    #[test]
    fn ready_connection_with_no_allowance_is_not_picked() {
        let mut pool = ConnectionPool::new(64);
        pool.add(ConnId(1), true);
        pool.get_mut(ConnId(1)).unwrap().state = ConnState::Ready;
        assert_eq!(pool.pick_for_send(), None);
    }

    struct FakeLayer(ConnState);
    impl ConnectionLayer for FakeLayer {
        fn send(&self, _conn: ConnId, _frame: Vec<u8>) -> crate::error::Result<Box<dyn crate::collab::QueueHandle>> {
            unimplemented!("not exercised by this test")
        }
        fn get_state(&self, _conn: ConnId) -> ConnState {
            self.0
        }
        fn is_direct(&self, _conn: ConnId) -> bool {
            true
        }
    }

    #[test]
    fn refresh_states_resets_queue_len_once_ready() {
        let mut pool = ConnectionPool::new(64);
        pool.add(ConnId(1), true);
        pool.get_mut(ConnId(1)).unwrap().queue_len = 7;

        pool.refresh_states(&FakeLayer(ConnState::Waiting));
        assert_eq!(pool.get(ConnId(1)).unwrap().state, ConnState::Waiting);
        assert_eq!(pool.get(ConnId(1)).unwrap().queue_len, 7, "not ready yet, backlog untouched");

        pool.refresh_states(&FakeLayer(ConnState::Ready));
        assert_eq!(pool.get(ConnId(1)).unwrap().state, ConnState::Ready);
        assert_eq!(pool.get(ConnId(1)).unwrap().queue_len, 0, "ready callback clears the backlog");
    }

    #[test]
    fn grant_refuses_above_watermark() {
        let mut pool = ConnectionPool::new(64);
        pool.add(ConnId(1), true);
        pool.get_mut(ConnId(1)).unwrap().allowance = 64 / 3;
        pool.grant(ConnId(1), 5);
        assert_eq!(pool.get(ConnId(1)).unwrap().allowance, 64 / 3);
    }

    #[test]
    fn trim_prefers_newest_non_direct() {
        let mut pool = ConnectionPool::new(64);
        for i in 0..(2 * CONNECTIONS_PER_TUNNEL + 1) {
            let direct = i == 0;
            pool.add(ConnId(i as u64), direct);
        }
        let victim = pool.trim();
        assert!(victim.is_some());
        let victim = victim.unwrap();
        assert_ne!(victim, ConnId(0), "direct connection must survive");
        assert_eq!(pool.len(), 2 * CONNECTIONS_PER_TUNNEL);
    }

    #[test]
    fn trim_destroys_nothing_when_all_excess_are_direct() {
        let mut pool = ConnectionPool::new(64);
        for i in 0..(2 * CONNECTIONS_PER_TUNNEL + 1) {
            pool.add(ConnId(i as u64), true);
        }
        assert_eq!(pool.trim(), None);
        assert_eq!(pool.len(), 2 * CONNECTIONS_PER_TUNNEL + 1);
    }
}
