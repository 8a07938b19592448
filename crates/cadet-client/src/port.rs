//! The port table (spec §4.5 `open_port`/`close_port`): a map from
//! port-hash to the handler invoked when a peer opens a channel on
//! that port.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{Channel, DataHandler};

/// Invoked once per inbound channel opened on a registered port; returns
/// the per-channel handler that will be called for every message
/// delivered on that channel afterwards.
pub type NewChannelHandler = Arc<dyn Fn(Channel) -> DataHandler + Send + Sync>;

/// Opaque handle returned by [`crate::Session::open_port`]; dropping it
/// does not close the port (call `close_port` explicitly, matching spec
/// §4.5's separate `close_port(port)` operation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortHandle(pub(crate) [u8; 32]);

/// Port-hash -> handler table. Keys are unique: a second `open_port` for
/// an already-open hash is rejected (spec §4.5 "ports map ... keys
/// unique").
#[derive(Default)]
pub struct PortTable {
    handlers: HashMap<[u8; 32], NewChannelHandler>,
}

impl PortTable {
    pub fn new() -> Self {
        PortTable::default()
    }

    pub fn open(&mut self, port_hash: [u8; 32], handler: NewChannelHandler) -> Result<PortHandle, crate::err::ClientError> {
        if self.handlers.contains_key(&port_hash) {
            return Err(crate::err::ClientError::PortAlreadyOpen);
        }
        self.handlers.insert(port_hash, handler);
        Ok(PortHandle(port_hash))
    }

    pub fn close(&mut self, handle: PortHandle) {
        self.handlers.remove(&handle.0);
    }

    pub fn handler_for(&self, port_hash: &[u8; 32]) -> Option<NewChannelHandler> {
        self.handlers.get(port_hash).cloned()
    }

    pub fn is_known(&self, port_hash: &[u8; 32]) -> bool {
        self.handlers.contains_key(port_hash)
    }

    /// All currently-open port hashes, used to re-announce every open
    /// port to the service after a reconnect.
    pub(crate) fn known_hashes(&self) -> Vec<[u8; 32]> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop_handler() -> NewChannelHandler {
        Arc::new(|_ch: Channel| -> DataHandler { Arc::new(|_ch, _payload| {}) })
    }

    #[test]
    fn duplicate_open_is_rejected() {
        let mut table = PortTable::new();
        let hash = [1u8; 32];
        table.open(hash, noop_handler()).unwrap();
        assert!(table.open(hash, noop_handler()).is_err());
    }

    #[test]
    fn close_frees_the_hash_for_reuse() {
        let mut table = PortTable::new();
        let hash = [2u8; 32];
        let handle = table.open(hash, noop_handler()).unwrap();
        table.close(handle);
        assert!(table.open(hash, noop_handler()).is_ok());
    }

    #[test]
    fn handler_is_registered() {
        let mut table = PortTable::new();
        let hash = [3u8; 32];
        table.open(hash, noop_handler()).unwrap();
        assert!(table.is_known(&hash));
        assert!(table.handler_for(&hash).is_some());
    }
}
