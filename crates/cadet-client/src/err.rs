//! Error taxonomy for the client-session API. Reduced to the same three
//! buckets as [`cadet_proto::ErrorKind`] (spec §7).

use cadet_proto::{CadetError, ErrorKind, HasErrorKind};
use thiserror::Error;

/// The error type for all fallible operations in `cadet-client`.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The local service link is not connected (reconnect in progress).
    #[error("not connected to the local CADET service")]
    NotConnected,

    /// Framing error on the client-service wire: forces a reconnect
    /// (spec §4.5 "any framing error forces a reconnect").
    #[error("local service link framing error: {0}")]
    Framing(String),

    /// `open_port` called with a port hash already present in the table.
    #[error("port is already open")]
    PortAlreadyOpen,

    /// An operation referenced a port hash with no registered handler.
    #[error("no handler registered for this port")]
    UnknownPort,

    /// An operation referenced a channel that doesn't exist locally.
    #[error("channel {0} does not exist")]
    UnknownChannel(u32),

    /// The service answered a `ChannelCreate` with a NACK.
    #[error("channel {0} was rejected by the remote port")]
    ChannelRejected(u32),

    /// `notify_transmit_ready` called while one was already pending for
    /// this channel.
    #[error("a transmit-ready callback is already pending for this channel")]
    TransmitReadyPending,

    /// An info-monitoring request of this kind is already outstanding
    /// (spec §4.5).
    #[error("an info request of this kind is already outstanding")]
    InvalidInfoRequest,

    /// A protocol engine failure bubbled up from `cadet-proto`.
    #[error(transparent)]
    Proto(#[from] CadetError),

    /// The session has been shut down.
    #[error("session is shut down")]
    SessionClosed,
}

impl HasErrorKind for ClientError {
    fn kind(&self) -> ErrorKind {
        use ClientError::*;
        match self {
            NotConnected | Framing(_) => ErrorKind::Transient,
            PortAlreadyOpen | UnknownPort | UnknownChannel(_) | ChannelRejected(_) | TransmitReadyPending
            | InvalidInfoRequest => ErrorKind::Protocol,
            Proto(e) => e.kind(),
            SessionClosed => ErrorKind::Internal,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
