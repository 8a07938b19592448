//! Fixed-size symmetric key material, zeroized on drop.
//!
//! Every 32-byte secret the Axolotl state carries (§3 "all 32-byte
//! symmetric keys") gets its own newtype here instead of a bare
//! `[u8; 32]`, so the type system stops us from e.g. passing a chain key
//! where a header key is expected.

use zeroize::{Zeroize, ZeroizeOnDrop};

macro_rules! symmetric_key {
    ($name:ident) => {
        #[doc = concat!("A 32-byte ", stringify!($name), ", zeroized on drop.")]
        #[derive(Clone, Zeroize, ZeroizeOnDrop)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// All-zero key, used for "not yet established" slots.
            pub const fn zero() -> Self {
                Self([0u8; 32])
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Never print key material; only a short fingerprint, matching
                // the teacher's safelog-style hygiene around secrets.
                write!(
                    f,
                    concat!(stringify!($name), "({:02x}{:02x}..)"),
                    self.0[0], self.0[1]
                )
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(b: [u8; 32]) -> Self {
                Self(b)
            }
        }
    };
}

symmetric_key!(RootKey);
symmetric_key!(ChainKey);
symmetric_key!(HeaderKey);
symmetric_key!(MessageKey);

/// The result of an X25519 scalar-multiplication; fed straight into the
/// ratchet KDF and never retained afterwards.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; 32]);
