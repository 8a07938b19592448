//! Bootstrap/connectivity status reporting for a [`crate::Session`],
//! grounded on `arti-client`'s `BootstrapStatus`/`BootstrapEvents` pair
//! but reduced to the one thing CADET's local-service link actually has
//! to report: is it connected to the service or not, and is it in
//! backoff.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use educe::Educe;
use futures::{Stream, StreamExt};
use tracing::debug;

/// Connection state of a [`crate::Session`]'s local service link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
}

/// A snapshot of how ready a [`crate::Session`] is to carry traffic.
///
/// Like `arti_client::status::BootstrapStatus`, this does not change
/// monotonically: a session can become less ready after a framing error
/// forces a reconnect.
#[derive(Clone, Copy, Debug, Default)]
pub struct BootstrapStatus {
    state: LinkState,
    /// Number of reconnect attempts made since the last successful
    /// connect, for backoff/observability purposes.
    reconnect_attempts: u32,
}

impl BootstrapStatus {
    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn ready_for_traffic(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        if state == LinkState::Connecting {
            self.reconnect_attempts += 1;
        } else if state == LinkState::Ready {
            self.reconnect_attempts = 0;
        }
        self.state = state;
    }
}

impl fmt::Display for BootstrapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting (attempt {})", self.reconnect_attempts),
            LinkState::Ready => write!(f, "ready"),
        }
    }
}

/// Drive `sender` from state-change notifications coming off `states`.
pub(crate) async fn report_status(
    mut sender: postage::watch::Sender<BootstrapStatus>,
    mut states: impl Stream<Item = LinkState> + Send + Unpin,
) {
    while let Some(state) = states.next().await {
        let mut b = sender.borrow_mut();
        b.set_state(state);
        debug!("{}", *b);
    }
}

/// A [`Stream`] of [`BootstrapStatus`] snapshots.
///
/// Wraps `postage::watch::Receiver` the way `arti_client::BootstrapEvents`
/// does, so the backing channel type is not part of this crate's public
/// API.
#[derive(Clone, Educe)]
#[educe(Debug)]
pub struct BootstrapEvents {
    #[educe(Debug(ignore))]
    pub(crate) inner: postage::watch::Receiver<BootstrapStatus>,
}

impl Stream for BootstrapEvents {
    type Item = BootstrapStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
