//! External-collaborator traits (spec §6): everything this crate needs
//! from the rest of a CADET node but does not implement itself. Real
//! deployments plug in implementations backed by the actual overlay,
//! DHT, and async runtime; tests plug in in-memory fakes, the same way
//! the teacher's `tor-chanmgr::mgr` tests run `AbstractChanMgr` against a
//! `FakeChannelFactory`.

use std::time::Duration;

use crate::ids::{ConnId, PeerId};
use crate::error::Result;

/// Lifecycle state of a single connection, as reported by the
/// connection layer (spec §3 "Connection").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    New,
    Searching,
    Waiting,
    Ready,
    Shutdown,
}

/// An opaque handle to an in-flight send, returned by
/// [`ConnectionLayer::send`]. Cancelling it must be O(1) and idempotent
/// (spec §9).
pub trait QueueHandle: Send {
    /// Cancel this queued send. A no-op if it already completed.
    fn cancel(&self);
}

/// The underlying peer-to-peer connection layer that carries wire frames
/// between adjacent peers (spec §1, §6). Out of scope for this crate;
/// consumed only through this contract.
///
/// `send` is synchronous and returns as soon as the frame is queued,
/// matching spec §6's `send(frame, conn) → queue-handle` contract
/// literally: actual delivery is reported later through the readiness
/// callback, not by blocking the caller.
pub trait ConnectionLayer: Send + Sync {
    /// Hand a fully encoded wire frame to `conn` for transmission.
    fn send(&self, conn: ConnId, frame: Vec<u8>) -> Result<Box<dyn QueueHandle>>;

    /// Current reported state of `conn`.
    fn get_state(&self, conn: ConnId) -> ConnState;

    /// Whether `conn` is a direct (no intermediate hop) path.
    fn is_direct(&self, conn: ConnId) -> bool;
}

/// A candidate path returned by path discovery (spec §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    /// Peers along the path, from the local peer (exclusive) to the
    /// destination (inclusive).
    pub peers: Vec<PeerId>,
}

impl Path {
    /// Number of hops in the path.
    pub fn length(&self) -> usize {
        self.peers.len()
    }
}

/// Path discovery / DHT lookup (spec §6). Out of scope for this crate.
pub trait PathDiscovery: Send + Sync {
    /// Start searching for paths to `peer`; discovered paths are
    /// delivered out-of-band to whatever owns the connection pool (the
    /// exact delivery channel is left to the implementation, matching
    /// spec.md's "callback delivers a Path" being one valid shape among
    /// several).
    fn request_paths(&self, peer: PeerId);

    /// Stop an outstanding search for `peer`.
    fn stop(&self, peer: PeerId);

    /// Whether two paths are considered equivalent (e.g. same peer
    /// sequence) for deduplication purposes.
    fn path_equivalent(&self, a: &Path, b: &Path) -> bool {
        a.peers == b.peers
    }
}

/// Local peer identity and long-term signing operations (spec §6).
pub trait IdentityProvider: Send + Sync {
    /// This node's own peer identity.
    fn local_peer_id(&self) -> PeerId;

    /// Sign `message` with the node's long-term signing key. Used to
    /// authenticate the ephemeral key in a `TUNNEL_KX` frame.
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Verify a signature made by `peer` over `message`.
    fn verify(&self, peer: &PeerId, message: &[u8], signature: &[u8]) -> bool;
}

/// An opaque handle to a scheduled task, cancellable once.
pub trait ScheduledTask: Send {
    /// Cancel this scheduled task. A no-op if it already fired.
    fn cancel(self: Box<Self>);
}

/// The cooperative-event-loop scheduler (spec §5, §6). Production code
/// backs this with a real async-runtime timer wheel; tests back it with
/// a deterministic fake that advances logical time on demand, the same
/// role `tor_rtcompat::Runtime`'s sleep/spawn surface plays in the
/// teacher, reduced to the subset this subsystem calls out.
pub trait Scheduler: Send + Sync {
    /// Run `task` on the next loop iteration.
    fn add_now(&self, task: Box<dyn FnOnce() + Send>) -> Box<dyn ScheduledTask>;

    /// Run `task` after `delay` has elapsed.
    fn add_delayed(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> Box<dyn ScheduledTask>;
}
