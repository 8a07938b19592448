//! Tunnel, channel, and Axolotl ratchet engine for the GNUnet CADET
//! subsystem.
//!
//! This crate implements the protocol logic only: the wire codec, the
//! per-tunnel connectivity/encryption state machines, the Axolotl
//! ratchet, the connection pool, and the channel multiplexer. It knows
//! nothing about sockets, the DHT, or an async runtime; those are
//! supplied by whoever embeds it through the traits in [`collab`].

pub mod channel;
pub mod collab;
pub mod crypto;
pub mod error;
pub mod ids;
pub mod pool;
pub mod tunnel;
pub mod wire;

pub use channel::{ChannelEvent, ChannelState, ChannelTable};
pub use collab::{ConnState, ConnectionLayer, IdentityProvider, Path, PathDiscovery, QueueHandle, ScheduledTask, Scheduler};
pub use crypto::{AxolotlState, EncryptedFrame};
pub use error::{CadetError, ErrorKind, HasErrorKind, Result};
pub use ids::{ConnId, Ctn, PeerId, TunnelId};
pub use pool::{Connection, ConnectionPool};
pub use tunnel::{event_stream, reactor::TunnelEvent, SpawnedTunnel, Tunnel};
pub use wire::{ChannelOptions, InnerMessage};
