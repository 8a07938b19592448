//! The tunnel's two state machines (spec §4.3): connectivity (`cstate`)
//! and encryption (`estate`).

/// Connectivity state: tracks whether the tunnel currently has any
/// usable path to its destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Searching,
    Waiting,
    Ready,
    Shutdown,
}

/// Encryption state: tracks how far the Axolotl handshake has gotten.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncryptionState {
    Uninitialized,
    AxSent,
    AxAuthSent,
    Ok,
    Rekey,
}

impl ConnectivityState {
    /// Recompute cstate from the raw facts the pool can observe (spec
    /// §4.3: NEW on create; SEARCHING while no candidates; WAITING when
    /// connections exist but none READY; READY when any is READY).
    pub fn recompute(current: ConnectivityState, has_any_connection: bool, has_ready_connection: bool) -> ConnectivityState {
        if current == ConnectivityState::Shutdown {
            return ConnectivityState::Shutdown;
        }
        if has_ready_connection {
            ConnectivityState::Ready
        } else if has_any_connection {
            ConnectivityState::Waiting
        } else {
            ConnectivityState::Searching
        }
    }
}

impl EncryptionState {
    /// `is_ready` per spec §4.3/§8 invariant 6: estate must be one of
    /// these three for the delayed-send queue to drain.
    pub fn allows_send(self) -> bool {
        matches!(self, EncryptionState::Ok | EncryptionState::Rekey | EncryptionState::AxAuthSent)
    }
}

/// `is_ready(tunnel)`: cstate READY *and* estate allows sending (spec
/// §4.3, §8 invariant 6).
pub fn is_ready(cstate: ConnectivityState, estate: EncryptionState) -> bool {
    cstate == ConnectivityState::Ready && estate.allows_send()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn is_ready_requires_both_machines() {
        assert!(!is_ready(ConnectivityState::Waiting, EncryptionState::Ok));
        assert!(!is_ready(ConnectivityState::Ready, EncryptionState::AxSent));
        assert!(is_ready(ConnectivityState::Ready, EncryptionState::Ok));
        assert!(is_ready(ConnectivityState::Ready, EncryptionState::Rekey));
        assert!(is_ready(ConnectivityState::Ready, EncryptionState::AxAuthSent));
    }

    #[test]
    fn cstate_recompute_tracks_pool_facts() {
        assert_eq!(
            ConnectivityState::recompute(ConnectivityState::New, false, false),
            ConnectivityState::Searching
        );
        assert_eq!(
            ConnectivityState::recompute(ConnectivityState::Searching, true, false),
            ConnectivityState::Waiting
        );
        assert_eq!(
            ConnectivityState::recompute(ConnectivityState::Waiting, true, true),
            ConnectivityState::Ready
        );
        assert_eq!(
            ConnectivityState::recompute(ConnectivityState::Shutdown, true, true),
            ConnectivityState::Shutdown
        );
    }
}
