//! Client-session API for talking to a local GNUnet CADET service
//! (spec §4.5): connect to the service's local socket, open ports,
//! create channels to remote peers, and exchange application data over
//! them. The actual tunnel/channel protocol engine lives in
//! `cadet-proto`; this crate only speaks the client-service wire.

mod channel;
mod config;
mod err;
mod port;
mod session;
mod status;
mod wire;

pub use channel::{Channel, DataHandler};
pub use config::{ServiceAddress, SessionConfig, SessionConfigBuilder};
pub use err::{ClientError, Result};
pub use port::{NewChannelHandler, PortHandle, PortTable};
pub use session::Session;
pub use status::{BootstrapEvents, BootstrapStatus, LinkState};
