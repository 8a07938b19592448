//! The tunnel handle: a cheap, `Clone`-able reference to a reactor
//! running in the background (spec §4.3, §5).
//!
//! Mirrors the teacher's channel/reactor split: [`Tunnel`] is the
//! object client code holds and calls methods on; [`reactor::TunnelReactor`]
//! is the task that owns all the mutable state and actually runs the
//! state machines. Every public method here is a thin `mpsc` send plus
//! an `oneshot` reply, never a lock.

pub mod reactor;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::Stream;

use crate::collab::{ConnectionLayer, IdentityProvider, Scheduler};
use crate::error::{CadetError, Result};
use crate::ids::{ConnId, Ctn, PeerId};
use crate::wire::ChannelOptions;

use reactor::{TunnelCtrlMsg, TunnelEvent, TunnelReactor};

/// A handle to one tunnel's background reactor.
///
/// Cloning is cheap: it just clones the control-channel sender, the same
/// way the teacher's `tor_proto::Channel` is a thin handle around a
/// reactor task reached over `mpsc`.
#[derive(Clone)]
pub struct Tunnel {
    ctrl_tx: mpsc::UnboundedSender<TunnelCtrlMsg>,
    peer: PeerId,
}

/// Everything needed to spawn a tunnel's reactor: the handle returned to
/// the caller, plus the future that must be polled (spawned) on whatever
/// executor the embedder uses, and the event stream the embedder should
/// drain to learn about channel lifecycle and inbound data.
pub struct SpawnedTunnel {
    pub tunnel: Tunnel,
    pub run: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
    pub events: mpsc::UnboundedReceiver<TunnelEvent>,
}

impl Tunnel {
    /// Build a new tunnel reactor for `peer` and return its handle plus
    /// the future that drives it. The caller is responsible for spawning
    /// `run` onto an executor (this crate has no runtime dependency of
    /// its own, matching spec §5's "runtime-agnostic core").
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        local_peer: PeerId,
        peer: PeerId,
        connection_layer: Arc<dyn ConnectionLayer>,
        identity: Arc<dyn IdentityProvider>,
        scheduler: Arc<dyn Scheduler>,
        channel_buffer: u32,
        ratchet_messages: u32,
        ratchet_time: Duration,
    ) -> SpawnedTunnel {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded();
        let (events_tx, events) = mpsc::unbounded();
        let reactor = TunnelReactor::new(
            local_peer,
            peer,
            connection_layer,
            identity,
            scheduler,
            channel_buffer,
            ratchet_messages,
            ratchet_time,
            ctrl_tx.clone(),
            ctrl_rx,
            events_tx,
        );
        SpawnedTunnel {
            tunnel: Tunnel { ctrl_tx, peer },
            run: Box::pin(reactor.run()),
            events,
        }
    }

    /// The remote peer this tunnel connects to.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Open a new channel and wait for the reactor to allocate its id.
    /// Delivery of `CHANNEL_OPEN_ACK`/`NACK` arrives later as a
    /// [`TunnelEvent`] on the event stream, not through this call.
    pub async fn open_channel(&self, options: ChannelOptions) -> Result<Ctn> {
        let (reply, rx) = oneshot::channel();
        self.send_ctrl(TunnelCtrlMsg::OpenChannel { options, reply })?;
        rx.await.map_err(|_| CadetError::TunnelClosed)?
    }

    /// Submit application data for send on `ctn`. Resolves once the
    /// reactor has handed the frame to a connection (or failed to).
    pub async fn submit(&self, ctn: Ctn, payload: Vec<u8>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_ctrl(TunnelCtrlMsg::SubmitAppData { ctn, payload, reply })?;
        rx.await.map_err(|_| CadetError::TunnelClosed)?
    }

    /// Locally destroy a channel, emitting `CHANNEL_DESTROY`.
    pub fn destroy_channel(&self, ctn: Ctn) -> Result<()> {
        self.send_ctrl(TunnelCtrlMsg::DestroyChannel { ctn })
    }

    /// Tell the reactor about a newly discovered or established
    /// connection (spec §4.2). The connection layer is expected to drive
    /// this whenever its own path-discovery/connect machinery succeeds.
    pub fn add_connection(&self, id: ConnId, is_direct: bool) -> Result<()> {
        self.send_ctrl(TunnelCtrlMsg::AddConnection { id, is_direct })
    }

    /// Tell the reactor a connection is gone.
    pub fn remove_connection(&self, id: ConnId) -> Result<()> {
        self.send_ctrl(TunnelCtrlMsg::RemoveConnection { id })
    }

    /// Hand the reactor a raw frame received on `conn` for this tunnel.
    pub fn deliver_frame(&self, conn: ConnId, bytes: Vec<u8>) -> Result<()> {
        self.send_ctrl(TunnelCtrlMsg::InboundFrame { conn, bytes })
    }

    /// Ask the reactor to shut down. Already-running sends are dropped;
    /// the final [`TunnelEvent::TunnelShutdown`] still fires.
    pub fn shutdown(&self) -> Result<()> {
        self.send_ctrl(TunnelCtrlMsg::Shutdown)
    }

    fn send_ctrl(&self, msg: TunnelCtrlMsg) -> Result<()> {
        self.ctrl_tx.unbounded_send(msg).map_err(|_| CadetError::TunnelClosed)
    }
}

/// Adapt the raw event receiver into a `Stream` for callers that prefer
/// combinators over a bare `mpsc::UnboundedReceiver`.
pub fn event_stream(events: mpsc::UnboundedReceiver<TunnelEvent>) -> impl Stream<Item = TunnelEvent> {
    events
}
