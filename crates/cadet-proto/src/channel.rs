//! The in-tunnel channel multiplexer (spec §4.4): per-channel state,
//! open/ack/nack/destroy handling, and flow-control unchoking.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::{CadetError, Result};
use crate::ids::Ctn;
use crate::pool::ConnectionPool;
use crate::wire::ChannelOptions;

/// Lower and upper bound on a channel's send buffer (spec §3).
pub const MIN_CHANNEL_BUFFER: u32 = 8;
pub const MAX_CHANNEL_BUFFER: u32 = 64;

/// Lifecycle state of one channel (spec §3 "Channel").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Destroyed,
}

/// A client-addressable stream multiplexed inside a tunnel.
pub struct Channel {
    pub ctn: Ctn,
    pub options: ChannelOptions,
    pub state: ChannelState,
    /// Number of messages currently buffered awaiting send.
    pub buffered_send_count: u32,
    /// Whether the peer has granted us permission to send (flipped by
    /// an incoming `CHANNEL_APP_DATA_ACK`).
    pub allow_send: bool,
    /// A payload held because `allow_send` was false when `submit` was
    /// called; released on the next incoming ack.
    held_payload: Option<Vec<u8>>,
}

impl Channel {
    fn new(ctn: Ctn, options: ChannelOptions) -> Self {
        Channel {
            ctn,
            options,
            state: ChannelState::Opening,
            buffered_send_count: 0,
            allow_send: true,
            held_payload: None,
        }
    }
}

/// Something the multiplexer wants the tunnel to do: emit a frame, or
/// hand a delivered payload up to the client.
pub enum ChannelEvent {
    EmitOpen { ctn: Ctn, options: ChannelOptions },
    EmitOpenAck { ctn: Ctn },
    EmitOpenNack { ctn: Ctn },
    EmitDestroy { ctn: Ctn },
    EmitAppData { ctn: Ctn, payload: Vec<u8> },
    EmitAppDataAck { ctn: Ctn },
    /// A channel finished opening and is now usable by the client.
    Opened { ctn: Ctn },
    /// The peer rejected our open, or we rejected theirs.
    OpenRejected { ctn: Ctn },
    /// A full application payload was delivered for the client handler.
    Delivered { ctn: Ctn, payload: Vec<u8> },
    /// The channel was destroyed, locally or by the peer.
    Destroyed { ctn: Ctn },
}

/// Per-tunnel table of channels, keyed by channel-tunnel-number.
pub struct ChannelTable {
    channels: BTreeMap<Ctn, Channel>,
    next_sequence: u32,
    initiator_bit: u32,
}

impl ChannelTable {
    /// `local_is_initiator` selects whether this side's allocated ids
    /// carry `CTN_INITIATOR_BIT` (spec §4.3 "OR'd with the bit
    /// `0x40000000` iff peer-id > local-id").
    pub fn new(local_is_initiator: bool) -> Self {
        ChannelTable {
            channels: BTreeMap::new(),
            next_sequence: 0,
            initiator_bit: if local_is_initiator { crate::ids::CTN_INITIATOR_BIT } else { 0 },
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, ctn: Ctn) -> Option<&Channel> {
        self.channels.get(&ctn)
    }

    /// All currently-known channel ids, used to cascade a tunnel-level
    /// shutdown down to every open channel.
    pub fn ctns(&self) -> Vec<Ctn> {
        self.channels.keys().copied().collect()
    }

    /// Allocate the next free channel id, skipping any already in use
    /// (spec §4.3 channel-id allocator).
    fn allocate_id(&mut self) -> Result<Ctn> {
        for _ in 0..crate::ids::CTN_MODULUS {
            let candidate = Ctn(self.initiator_bit | (self.next_sequence & !crate::ids::CTN_INITIATOR_BIT));
            self.next_sequence = self.next_sequence.wrapping_add(1) % crate::ids::CTN_MODULUS;
            if !self.channels.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(CadetError::ChannelIdSpaceExhausted)
    }

    /// Open a new local channel, emitting `CHANNEL_OPEN`.
    pub fn open(&mut self, options: ChannelOptions) -> Result<(Ctn, ChannelEvent)> {
        let ctn = self.allocate_id()?;
        self.channels.insert(ctn, Channel::new(ctn, options));
        debug!(ctn = %ctn, "channel opening");
        Ok((ctn, ChannelEvent::EmitOpen { ctn, options }))
    }

    /// Handle an inbound `CHANNEL_OPEN`. `port_known` tells us whether a
    /// local port handler exists for this channel's target port.
    pub fn on_open_incoming(&mut self, ctn: Ctn, options: ChannelOptions, port_known: bool) -> ChannelEvent {
        if self.channels.contains_key(&ctn) {
            // Spec §9 open question: treated as idempotent ignore.
            debug!(ctn = %ctn, "duplicate CHANNEL_OPEN treated as retransmission");
            return ChannelEvent::EmitOpenAck { ctn };
        }
        if !port_known {
            return ChannelEvent::EmitOpenNack { ctn };
        }
        let mut ch = Channel::new(ctn, options);
        ch.state = ChannelState::Open;
        self.channels.insert(ctn, ch);
        ChannelEvent::EmitOpenAck { ctn }
    }

    pub fn on_open_ack(&mut self, ctn: Ctn) -> Result<ChannelEvent> {
        let ch = self.channels.get_mut(&ctn).ok_or(CadetError::UnknownChannel(ctn.0))?;
        ch.state = ChannelState::Open;
        Ok(ChannelEvent::Opened { ctn })
    }

    pub fn on_open_nack(&mut self, ctn: Ctn) -> Result<ChannelEvent> {
        let ch = self.channels.remove(&ctn).ok_or(CadetError::UnknownChannel(ctn.0))?;
        let _ = ch;
        Ok(ChannelEvent::OpenRejected { ctn })
    }

    /// Submit a payload for send on `ctn`. Only one send may be
    /// in-flight per channel at a time (spec §4.4); if `allow_send` is
    /// false, the payload is held until an ack arrives.
    pub fn submit(&mut self, ctn: Ctn, payload: Vec<u8>) -> Result<Option<ChannelEvent>> {
        let ch = self.channels.get_mut(&ctn).ok_or(CadetError::UnknownChannel(ctn.0))?;
        if ch.state != ChannelState::Open {
            return Err(CadetError::ChannelClosed);
        }
        if !ch.allow_send {
            ch.held_payload = Some(payload);
            return Ok(None);
        }
        ch.buffered_send_count += 1;
        ch.allow_send = false;
        Ok(Some(ChannelEvent::EmitAppData { ctn, payload }))
    }

    /// Inbound application data: deliver it and emit the ack.
    pub fn on_data(&mut self, ctn: Ctn, payload: Vec<u8>) -> Result<Vec<ChannelEvent>> {
        if !self.channels.contains_key(&ctn) {
            return Ok(vec![ChannelEvent::EmitDestroy { ctn }]);
        }
        Ok(vec![
            ChannelEvent::Delivered { ctn, payload },
            ChannelEvent::EmitAppDataAck { ctn },
        ])
    }

    /// Inbound ack for data we sent: release the next held payload, if any.
    pub fn on_data_ack(&mut self, ctn: Ctn) -> Result<Option<ChannelEvent>> {
        let ch = self.channels.get_mut(&ctn).ok_or(CadetError::UnknownChannel(ctn.0))?;
        ch.buffered_send_count = ch.buffered_send_count.saturating_sub(1);
        ch.allow_send = true;
        if let Some(payload) = ch.held_payload.take() {
            ch.buffered_send_count += 1;
            ch.allow_send = false;
            return Ok(Some(ChannelEvent::EmitAppData { ctn, payload }));
        }
        Ok(None)
    }

    /// An explicit `LOCAL_ACK` from the client handler (spec §4.4): the
    /// same effect as `on_data_ack` but driven locally rather than by the
    /// wire.
    pub fn on_ack(&mut self, ctn: Ctn) -> Result<Option<ChannelEvent>> {
        self.on_data_ack(ctn)
    }

    /// Inbound `CHANNEL_DESTROY`. Unknown ids get a best-effort
    /// `CHANNEL_DESTROY` back to force the peer to clear stale state
    /// (spec §4.4, §7 `PeerDestroy`).
    pub fn on_destroy(&mut self, ctn: Ctn) -> ChannelEvent {
        if self.channels.remove(&ctn).is_some() {
            ChannelEvent::Destroyed { ctn }
        } else {
            warn!(ctn = %ctn, "CHANNEL_DESTROY for unknown channel; echoing destroy");
            ChannelEvent::EmitDestroy { ctn }
        }
    }

    /// Locally destroy a channel and emit `CHANNEL_DESTROY`.
    pub fn destroy_local(&mut self, ctn: Ctn) -> Option<ChannelEvent> {
        if self.channels.remove(&ctn).is_some() {
            Some(ChannelEvent::EmitDestroy { ctn })
        } else {
            None
        }
    }

    /// Periodic flow-control task (spec §4.4): for each channel with
    /// `allow_send = false`, grant one credit in a random order until
    /// the tunnel's buffer credits are exhausted. `pool.buffer_credits()`
    /// doesn't change as channels get unchoked, so the budget for this
    /// pass is snapshotted once up front and spent locally, rather than
    /// re-querying the same constant every iteration (which would never
    /// reach zero and so never bound the grant).
    pub fn unchoke_channels(&mut self, pool: &mut ConnectionPool) {
        let mut held: Vec<Ctn> = self
            .channels
            .values()
            .filter(|c| !c.allow_send)
            .map(|c| c.ctn)
            .collect();
        held.shuffle(&mut rand::thread_rng());

        let mut remaining = pool.buffer_credits();
        for ctn in held {
            if remaining == 0 {
                break;
            }
            if let Some(ch) = self.channels.get_mut(&ctn) {
                ch.allow_send = true;
                remaining -= 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocation_sets_initiator_bit_consistently() {
        let mut table = ChannelTable::new(true);
        let (ctn, _) = table.open(ChannelOptions::default()).unwrap();
        assert!(ctn.initiator_bit_set());

        let mut table2 = ChannelTable::new(false);
        let (ctn2, _) = table2.open(ChannelOptions::default()).unwrap();
        assert!(!ctn2.initiator_bit_set());
    }

    #[test]
    fn allocation_never_reuses_an_open_id() {
        let mut table = ChannelTable::new(true);
        let (a, _) = table.open(ChannelOptions::default()).unwrap();
        let (b, _) = table.open(ChannelOptions::default()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn duplicate_open_is_idempotent_ignore() {
        let mut table = ChannelTable::new(true);
        let ctn = Ctn(5);
        let _ = table.on_open_incoming(ctn, ChannelOptions::default(), true);
        let ev = table.on_open_incoming(ctn, ChannelOptions::default(), true);
        assert!(matches!(ev, ChannelEvent::EmitOpenAck { .. }));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unknown_channel_destroy_gets_echoed() {
        let mut table = ChannelTable::new(true);
        let ev = table.on_destroy(Ctn(99));
        assert!(matches!(ev, ChannelEvent::EmitDestroy { .. }));
    }

    #[test]
    fn held_payload_is_released_on_ack() {
        let mut table = ChannelTable::new(true);
        let ctn = Ctn(1);
        table.channels.insert(ctn, Channel::new(ctn, ChannelOptions::default()));
        table.channels.get_mut(&ctn).unwrap().state = ChannelState::Open;
        table.channels.get_mut(&ctn).unwrap().allow_send = false;

        let held = table.submit(ctn, b"a".to_vec()).unwrap();
        assert!(held.is_none());

        let released = table.on_data_ack(ctn).unwrap();
        assert!(matches!(released, Some(ChannelEvent::EmitAppData { .. })));
    }

    #[test]
    fn unchoke_respects_buffer_credit_bound() {
        let mut table = ChannelTable::new(true);
        let mut pool = ConnectionPool::new(2);
        for i in 0..3 {
            let ctn = Ctn(i);
            table.channels.insert(ctn, Channel::new(ctn, ChannelOptions::default()));
            let ch = table.channels.get_mut(&ctn).unwrap();
            ch.state = ChannelState::Open;
            ch.allow_send = false;
        }

        table.unchoke_channels(&mut pool);

        let unchoked = table.channels.values().filter(|c| c.allow_send).count();
        assert_eq!(unchoked, 2, "only as many channels as buffer credits allow may be unchoked");
    }
}
