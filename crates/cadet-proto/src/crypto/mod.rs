//! Cryptographic primitives for the CADET protocol engine: the Axolotl
//! ratchet state machine and the zeroizing key newtypes it is built from.

pub mod axolotl;
pub mod keys;

pub use axolotl::{AxolotlState, EncryptedFrame, RatchetHeader};
pub use keys::{ChainKey, HeaderKey, MessageKey, RootKey, SharedSecret};
