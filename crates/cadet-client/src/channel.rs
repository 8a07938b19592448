//! The client-facing channel object (spec §4.5): a thin handle back to
//! the session reactor, the same shape [`cadet_proto::Tunnel`] takes
//! relative to its own reactor.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use cadet_proto::{ChannelOptions, PeerId};
use futures::channel::oneshot;
use tracing::error;

use crate::err::{ClientError, Result};
use crate::session::{SessionCtrlMsg, SessionHandle};

/// Invoked once per message delivered on a channel; the handler must
/// call [`Channel::receive_done`] to release the next queued message
/// (spec §4.5).
pub type DataHandler = Arc<dyn Fn(Channel, Bytes) + Send + Sync>;

/// A single multiplexed stream to a remote peer, opened either locally
/// via `Session::channel_create` or delivered to a port handler after an
/// inbound `CHANNEL_OPEN` (spec §4.5).
#[derive(Clone)]
pub struct Channel {
    pub(crate) local_id: u32,
    pub(crate) peer: PeerId,
    pub(crate) port_hash: [u8; 32],
    pub(crate) options: ChannelOptions,
    pub(crate) session: SessionHandle,
}

impl Channel {
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn options(&self) -> ChannelOptions {
        self.options
    }

    /// Request `size` bytes of send credit; `notify` is called once with
    /// a writable buffer of exactly `size` bytes and must fill and
    /// return exactly `size` (spec §4.5). At most one request may be
    /// in flight per channel; the reactor rejects a second one with
    /// [`ClientError::TransmitReadyPending`].
    pub async fn notify_transmit_ready(
        &self,
        size: usize,
        notify: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; size];
        let written = notify(&mut buf);
        if written != size {
            error!(
                local_id = self.local_id,
                size,
                written,
                "notify_transmit_ready callback returned a length that does not match the requested size"
            );
            return Err(ClientError::TransmitReadyPending);
        }
        let mut payload = BytesMut::with_capacity(size);
        payload.extend_from_slice(&buf);
        let (reply, rx) = oneshot::channel();
        self.session.send_ctrl(SessionCtrlMsg::SubmitData {
            local_id: self.local_id,
            payload: payload.freeze(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// The per-handler ACK that releases the next buffered inbound
    /// message on this channel (spec §4.5).
    pub async fn receive_done(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.session
            .send_ctrl(SessionCtrlMsg::ReceiveDone { local_id: self.local_id, reply })?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Emit `CHANNEL_DESTROY` and clear local state for this channel.
    pub fn destroy(&self) -> Result<()> {
        self.session.send_ctrl(SessionCtrlMsg::ChannelDestroy { local_id: self.local_id })
    }
}
