//! Identifiers: peer identities, tunnel-local channel numbers, and the
//! "who is Alice" tie-break used by the Axolotl handshake (spec §4.1).

use derive_more::{Display, From};
use std::cmp::Ordering;

/// A 32-byte peer identity (an EdDSA public key, opaquely, from CADET's
/// point of view: we only ever compare and serialise it).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Byte-wise lexicographic compare, as required by spec §4.1's
    /// "who is Alice" tie-break and §4.3's channel-id high-bit rule.
    pub fn cmp_bytes(&self, other: &PeerId) -> Ordering {
        self.0.cmp(&other.0)
    }

    /// True if `self` is lexicographically smaller than `other`, i.e.
    /// `self` plays the role of Alice in a tunnel between the two.
    pub fn is_alice_relative_to(&self, other: &PeerId) -> bool {
        self.cmp_bytes(other) == Ordering::Less
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({:02x}{:02x}..{:02x}{:02x})", self.0[0], self.0[1], self.0[30], self.0[31])
    }
}

/// The channel-tunnel-number: a 32-bit id addressing a channel within its
/// owning tunnel. Bit 30 (`0x4000_0000`) is the "initiator" bit set iff the
/// local peer has the larger identity under [`PeerId::cmp_bytes`] (spec
/// §3, §4.3).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From)]
pub struct Ctn(pub u32);

/// High bit used to distinguish which side allocated a given [`Ctn`].
pub const CTN_INITIATOR_BIT: u32 = 0x4000_0000;

/// Channel-id numbers live in `[0, 2^31)`; the allocator works modulo this.
pub const CTN_MODULUS: u32 = 1 << 31;

impl Ctn {
    /// Mask off the initiator bit, leaving the bare sequence number.
    pub fn sequence(self) -> u32 {
        self.0 & !CTN_INITIATOR_BIT
    }

    /// True if this id's initiator bit is set.
    pub fn initiator_bit_set(self) -> bool {
        self.0 & CTN_INITIATOR_BIT != 0
    }
}

/// A process-unique identifier for a [`crate::pool::Connection`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Debug)]
pub struct ConnId(pub u64);

/// A process-unique identifier for a [`crate::tunnel::Tunnel`], assigned by
/// whatever owns the (out of scope, §1) process-wide tunnels table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Debug)]
pub struct TunnelId(pub u64);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alice_tiebreak_is_antisymmetric() {
        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);
        assert!(a.is_alice_relative_to(&b));
        assert!(!b.is_alice_relative_to(&a));
    }

    #[test]
    fn ctn_masks_round_trip() {
        let ctn = Ctn(CTN_INITIATOR_BIT | 42);
        assert!(ctn.initiator_bit_set());
        assert_eq!(ctn.sequence(), 42);

        let ctn2 = Ctn(7);
        assert!(!ctn2.initiator_bit_set());
        assert_eq!(ctn2.sequence(), 7);
    }
}
