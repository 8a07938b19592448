//! Error taxonomy for the CADET protocol engine.
//!
//! Every fallible operation in this crate returns [`CadetError`]. The
//! variants line up with the error table in the design document (§7):
//! crypto failures, flow-control/overflow conditions, and the collaborator
//! failures that cross the [`crate::collab`] trait boundary.

use thiserror::Error;

/// How a caller should react to a [`CadetError`].
///
/// This is a reduced analogue of `tor_error::ErrorKind`: CADET's error
/// table only ever calls for one of three reactions, so we name those
/// three instead of carrying a large enum of fine-grained kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation can be retried or will resolve itself (e.g. a path
    /// was lost and new ones are being searched for).
    Transient,
    /// A protocol violation by the peer: drop the frame, keep the tunnel.
    Protocol,
    /// A local programming error; should never happen in a correct build.
    Internal,
}

/// Trait implemented by error types that can classify themselves.
pub trait HasErrorKind {
    /// Return the [`ErrorKind`] of `self`.
    fn kind(&self) -> ErrorKind;
}

/// The error type for all fallible operations in `cadet-proto`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CadetError {
    /// HMAC validation failed under both the current and next header key,
    /// and no skipped-key entry matched either. See spec §4.1, §7.
    #[error("frame failed authentication under HKr, NHKr, and the skipped-key store")]
    Unauthenticated,

    /// A valid but out-of-order frame arrived whose receive-index gap
    /// exceeds [`crate::crypto::axolotl::limits::MAX_KEY_GAP`].
    #[error("receive index gap of {gap} exceeds the maximum key gap")]
    GapTooLarge {
        /// The observed gap between `Nr` and the frame's `Ns`.
        gap: u32,
    },

    /// A frame arrived whose application payload could not be parsed as a
    /// sequence of length-prefixed inner messages (spec §4.3 receive path).
    #[error("truncated or oversize inner message while parsing decrypted frame")]
    MalformedFrame,

    /// The local side tried to act on a channel id that doesn't exist in
    /// this tunnel.
    #[error("channel {0} does not exist in this tunnel")]
    UnknownChannel(u32),

    /// The local side tried to allocate a channel id but the tunnel's
    /// channel-id space is exhausted.
    #[error("no free channel id available in this tunnel")]
    ChannelIdSpaceExhausted,

    /// A connection-layer failure reported by the external collaborator.
    #[error("path to peer was lost")]
    PathLost,

    /// The peer sent `CHANNEL_DESTROY` for a channel id we don't have; we
    /// reply in kind but surface this so callers can log it if they wish.
    #[error("peer sent CHANNEL_DESTROY for an unknown channel")]
    PeerDestroy,

    /// A second info-monitoring request of the same kind was submitted
    /// while one was already outstanding (spec §4.5, §7).
    #[error("an info request of this kind is already outstanding")]
    InvalidInfoRequest,

    /// A message was too large to ever fit in a CADET frame.
    #[error("message of {0} bytes exceeds MAX_CADET_MESSAGE_SIZE")]
    Oversize(usize),

    /// The tunnel (or its owning channel) has already been torn down.
    #[error("tunnel is shut down")]
    TunnelClosed,

    /// The channel has already been destroyed locally.
    #[error("channel is closed")]
    ChannelClosed,

    /// A send was cancelled by its caller before it reached the wire.
    #[error("send was cancelled")]
    Cancelled,

    /// An invariant that should be impossible to violate was violated;
    /// this always indicates a bug in this crate.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HasErrorKind for CadetError {
    fn kind(&self) -> ErrorKind {
        use CadetError::*;
        match self {
            PathLost | Cancelled => ErrorKind::Transient,
            Unauthenticated
            | GapTooLarge { .. }
            | MalformedFrame
            | UnknownChannel(_)
            | PeerDestroy
            | Oversize(_) => ErrorKind::Protocol,
            ChannelIdSpaceExhausted
            | InvalidInfoRequest
            | TunnelClosed
            | ChannelClosed
            | Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CadetError>;

/// Construct an [`CadetError::Internal`] from a `format!`-style message.
///
/// Mirrors the teacher's `internal!()` macro: a short, greppable marker
/// for "this should never happen".
#[macro_export]
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::error::CadetError::Internal(format!($($arg)*))
    };
}
