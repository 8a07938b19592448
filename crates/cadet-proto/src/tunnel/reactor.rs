//! The tunnel's reactor: the single task that owns all mutable tunnel
//! state and drives the connectivity/encryption state machines, the
//! Axolotl ratchet, the connection pool, and the channel table (spec
//! §4.3, §5 "single-threaded cooperative").

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::collab::{ConnectionLayer, IdentityProvider, ScheduledTask, Scheduler};
use crate::crypto::axolotl::AxolotlState;
use crate::crypto::keys::SharedSecret;
use crate::channel::{ChannelEvent, ChannelTable};
use crate::error::{CadetError, Result};
use crate::ids::{ConnId, Ctn, PeerId};
use crate::pool::ConnectionPool;
use crate::tunnel::state::{is_ready, ConnectivityState, EncryptionState};
use crate::wire::{self, ChannelOptions, InnerMessage, KxFrame, OuterFrame};

/// Default deferred-destroy delay for an empty tunnel (spec §5).
pub const DESTROY_EMPTY_DELAY: Duration = Duration::from_secs(60);
/// KX retransmit interval while not yet `AX_AUTH_SENT` (spec §4.3, §5).
pub const KX_RESEND_INTERVAL: Duration = Duration::from_secs(1);
/// Period of the reactor's own housekeeping tick (unchoke/trim checks).
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// A queued outbound send waiting for the tunnel to become ready (spec
/// §3 "delayed-send queue").
struct DelayedSend {
    payload: Vec<u8>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    reply: Option<oneshot::Sender<Result<()>>>,
}

/// Control-plane messages a [`super::Tunnel`] handle sends to its
/// reactor.
pub enum TunnelCtrlMsg {
    OpenChannel {
        options: ChannelOptions,
        reply: oneshot::Sender<Result<Ctn>>,
    },
    SubmitAppData {
        ctn: Ctn,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    DestroyChannel {
        ctn: Ctn,
    },
    AddConnection {
        id: ConnId,
        is_direct: bool,
    },
    RemoveConnection {
        id: ConnId,
    },
    InboundFrame {
        conn: ConnId,
        bytes: Vec<u8>,
    },
    Tick,
    Shutdown,
}

/// Application-level events the reactor hands back up to whatever owns
/// the client-facing channel objects (the `cadet-client` crate, in
/// production; a test harness in this crate's integration tests).
#[derive(Debug)]
pub enum TunnelEvent {
    ChannelOpened { ctn: Ctn },
    ChannelRejected { ctn: Ctn },
    ChannelDestroyed { ctn: Ctn },
    DataReceived { ctn: Ctn, payload: Vec<u8> },
    TunnelShutdown,
}

/// Owns every piece of mutable state for one tunnel and runs as the
/// single cooperative task spec §5 requires.
pub struct TunnelReactor {
    peer: PeerId,
    is_alice: bool,

    cstate: ConnectivityState,
    estate: EncryptionState,
    axolotl: Option<AxolotlState>,
    seen_first_ack: bool,

    kx_0: StaticSecret,
    local_dhrs_initial: Option<StaticSecret>,
    pending_kx_sent_at: Option<Instant>,

    pool: ConnectionPool,
    channels: ChannelTable,
    delayed_queue: VecDeque<DelayedSend>,

    connection_layer: Arc<dyn ConnectionLayer>,
    identity: Arc<dyn IdentityProvider>,
    scheduler: Arc<dyn Scheduler>,
    self_ctrl_tx: mpsc::UnboundedSender<TunnelCtrlMsg>,
    #[allow(dead_code)]
    tick_task: Option<Box<dyn ScheduledTask>>,

    ratchet_messages: u32,
    ratchet_time: Duration,

    ctrl_rx: mpsc::UnboundedReceiver<TunnelCtrlMsg>,
    events_tx: mpsc::UnboundedSender<TunnelEvent>,

    destroy_empty_deadline: Option<Instant>,
}

impl TunnelReactor {
    /// Construct a fresh reactor. `is_alice` is computed from
    /// [`PeerId::is_alice_relative_to`] and also decides the channel-id
    /// initiator bit, since spec §4.1 and §4.3 both key off the same
    /// peer-id comparison.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        peer: PeerId,
        connection_layer: Arc<dyn ConnectionLayer>,
        identity: Arc<dyn IdentityProvider>,
        scheduler: Arc<dyn Scheduler>,
        channel_buffer: u32,
        ratchet_messages: u32,
        ratchet_time: Duration,
        self_ctrl_tx: mpsc::UnboundedSender<TunnelCtrlMsg>,
        ctrl_rx: mpsc::UnboundedReceiver<TunnelCtrlMsg>,
        events_tx: mpsc::UnboundedSender<TunnelEvent>,
    ) -> Self {
        let is_alice = local_peer.is_alice_relative_to(&peer);
        let local_is_initiator = !is_alice; // peer-id > local-id sets the bit (spec §4.3)
        TunnelReactor {
            peer,
            is_alice,
            cstate: ConnectivityState::New,
            estate: EncryptionState::Uninitialized,
            axolotl: None,
            seen_first_ack: false,
            kx_0: StaticSecret::random_from_rng(rand::rngs::OsRng),
            local_dhrs_initial: None,
            pending_kx_sent_at: None,
            pool: ConnectionPool::new(channel_buffer),
            channels: ChannelTable::new(local_is_initiator),
            delayed_queue: VecDeque::new(),
            connection_layer,
            identity,
            scheduler,
            self_ctrl_tx,
            tick_task: None,
            ratchet_messages,
            ratchet_time,
            ctrl_rx,
            events_tx,
            destroy_empty_deadline: None,
        }
    }

    /// True iff the tunnel can hand frames straight to a connection
    /// (spec §4.3, §8 invariant 6).
    fn is_ready(&self) -> bool {
        is_ready(self.cstate, self.estate)
    }

    /// Drive the reactor until it shuts down. Intended to be spawned
    /// onto whatever executor the embedder uses.
    pub async fn run(mut self) {
        self.send_kx(false);
        self.arm_tick();
        loop {
            match self.ctrl_rx.next().await {
                Some(msg) => {
                    if !self.handle_ctrl(msg) {
                        break;
                    }
                }
                None => break,
            }
        }
        self.destroy();
    }

    /// Schedule the next housekeeping tick via the injected [`Scheduler`]
    /// (spec §5 "scheduled timers"). Self-rearms every time it fires, so
    /// production code only needs to call this once, at startup.
    fn arm_tick(&mut self) {
        let tx = self.self_ctrl_tx.clone();
        self.tick_task = Some(self.scheduler.add_delayed(
            TICK_INTERVAL,
            Box::new(move || {
                let _ = tx.unbounded_send(TunnelCtrlMsg::Tick);
            }),
        ));
    }

    fn handle_ctrl(&mut self, msg: TunnelCtrlMsg) -> bool {
        match msg {
            TunnelCtrlMsg::OpenChannel { options, reply } => {
                let result = self.channels.open(options).map(|(ctn, ev)| {
                    self.cancel_destroy_empty();
                    self.emit(ev);
                    ctn
                });
                let _ = reply.send(result);
            }
            TunnelCtrlMsg::SubmitAppData { ctn, payload, reply } => {
                let result = self.submit(ctn, payload);
                let _ = reply.send(result);
            }
            TunnelCtrlMsg::DestroyChannel { ctn } => {
                if let Some(ev) = self.channels.destroy_local(ctn) {
                    self.emit(ev);
                }
                self.maybe_schedule_destroy_empty();
            }
            TunnelCtrlMsg::AddConnection { id, is_direct } => {
                self.pool.add(id, is_direct);
                self.recompute_cstate();
                self.send_kx(false);
                self.drain_queue_sync();
            }
            TunnelCtrlMsg::RemoveConnection { id } => {
                self.pool.remove(id);
                self.recompute_cstate();
            }
            TunnelCtrlMsg::InboundFrame { conn, bytes } => {
                self.on_inbound_frame(conn, bytes);
            }
            TunnelCtrlMsg::Tick => {
                self.on_tick();
                self.arm_tick();
            }
            TunnelCtrlMsg::Shutdown => {
                return false;
            }
        }
        true
    }

    /// Poll the connection layer for each connection's live state (spec
    /// §6 `get_state`) and recompute connectivity from it. Without this,
    /// every connection stays stuck at the `New` state it was added
    /// with, `has_ready()` is never true, and the tunnel can never put a
    /// frame on the wire.
    fn recompute_cstate(&mut self) {
        self.pool.refresh_states(self.connection_layer.as_ref());
        self.cstate = ConnectivityState::recompute(self.cstate, !self.pool.is_empty(), self.pool.has_ready());
        if self.cstate == ConnectivityState::Ready {
            self.pool.rebalance_credits();
        }
    }

    fn emit(&mut self, ev: ChannelEvent) {
        match ev {
            ChannelEvent::EmitOpen { ctn, options } => {
                let msg = InnerMessage::Open { channel: ctn.0, options };
                self.queue_inner(msg);
            }
            ChannelEvent::EmitOpenAck { ctn } => self.queue_inner(InnerMessage::OpenAck { channel: ctn.0 }),
            ChannelEvent::EmitOpenNack { ctn } => self.queue_inner(InnerMessage::OpenNack { channel: ctn.0 }),
            ChannelEvent::EmitDestroy { ctn } => self.queue_inner(InnerMessage::Destroy { channel: ctn.0 }),
            ChannelEvent::EmitAppData { ctn, payload } => {
                self.queue_inner(InnerMessage::AppData {
                    channel: ctn.0,
                    payload: Bytes::from(payload),
                });
            }
            ChannelEvent::EmitAppDataAck { ctn } => self.queue_inner(InnerMessage::AppDataAck { channel: ctn.0 }),
            ChannelEvent::Opened { ctn } => self.notify(TunnelEvent::ChannelOpened { ctn }),
            ChannelEvent::OpenRejected { ctn } => self.notify(TunnelEvent::ChannelRejected { ctn }),
            ChannelEvent::Delivered { ctn, payload } => self.notify(TunnelEvent::DataReceived { ctn, payload }),
            ChannelEvent::Destroyed { ctn } => {
                self.notify(TunnelEvent::ChannelDestroyed { ctn });
                self.maybe_schedule_destroy_empty();
            }
        }
    }

    fn notify(&mut self, ev: TunnelEvent) {
        let _ = self.events_tx.unbounded_send(ev);
    }

    /// Queue one inner message for send; for now each inner message goes
    /// out as its own tunnel frame (a batching scheme could coalesce
    /// several per `TUNNEL_ENCRYPTED` frame, but nothing in spec §4.3
    /// requires it).
    fn queue_inner(&mut self, msg: InnerMessage) {
        let encoded = match msg.encode() {
            Ok(b) => b.to_vec(),
            Err(e) => {
                warn!(error = ?e, "dropping inner message that failed to encode");
                return;
            }
        };
        self.delayed_queue.push_back(DelayedSend {
            payload: encoded,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            reply: None,
        });
        if self.is_ready() {
            self.drain_queue_sync();
        }
    }

    fn submit(&mut self, ctn: Ctn, payload: Vec<u8>) -> Result<()> {
        if payload.len() > wire::MAX_CADET_MESSAGE_SIZE {
            return Err(CadetError::Oversize(payload.len()));
        }
        if let Some(ev) = self.channels.submit(ctn, payload)? {
            self.emit(ev);
        }
        Ok(())
    }

    /// Drain the delayed queue while the tunnel is ready, encrypting
    /// each payload and handing it to the connection pool (spec §4.3
    /// "delayed queue drains monotonically"). `ConnectionLayer::send` is
    /// synchronous (spec §6: "returns a queue-handle"), so draining never
    /// suspends the reactor.
    fn drain_queue_sync(&mut self) {
        while self.is_ready() {
            let Some(entry) = self.delayed_queue.pop_front() else { break };
            if entry.cancelled.load(std::sync::atomic::Ordering::Relaxed) {
                if let Some(reply) = entry.reply {
                    let _ = reply.send(Err(CadetError::Cancelled));
                }
                continue;
            }
            let Some(axolotl) = self.axolotl.as_mut() else {
                self.delayed_queue.push_front(entry);
                break;
            };
            let frame = match axolotl.encrypt(&entry.payload) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = ?e, "failed to encrypt queued send");
                    if let Some(reply) = entry.reply {
                        let _ = reply.send(Err(e));
                    }
                    continue;
                }
            };
            let Some(conn) = self.pool.pick_for_send() else {
                self.delayed_queue.push_front(entry);
                break;
            };
            let encoded = match wire::encode_encrypted(&frame) {
                Ok(b) => b.to_vec(),
                Err(e) => {
                    warn!(error = ?e, "failed to encode encrypted frame");
                    continue;
                }
            };
            if let Some(c) = self.pool.get_mut(conn) {
                c.queue_len += 1;
                c.allowance = c.allowance.saturating_sub(1);
            }
            match self.connection_layer.send(conn, encoded) {
                Ok(_handle) => {
                    if let Some(reply) = entry.reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(e) => {
                    debug!(error = ?e, conn = %conn, "connection layer rejected send");
                    if let Some(reply) = entry.reply {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    fn on_inbound_frame(&mut self, conn: ConnId, bytes: Vec<u8>) {
        let parsed = match wire::decode_outer(Bytes::from(bytes)) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = ?e, conn = %conn, "dropping malformed outer frame");
                return;
            }
        };
        match parsed {
            OuterFrame::Kx(kx) => self.on_kx_frame(kx),
            OuterFrame::Encrypted(frame) => self.on_encrypted_frame(frame),
        }
    }

    fn on_kx_frame(&mut self, kx: KxFrame) {
        if !self.identity.verify(&self.peer, &kx.ephemeral, &kx.signature) {
            warn!(peer = ?self.peer, "dropping TUNNEL_KX with invalid signature");
            return;
        }
        let peer_ratchet = PublicKey::from(kx.ratchet);

        if self.axolotl.is_none() {
            if let Some(local_dhrs) = self.local_dhrs_initial.take() {
                let shared = SharedSecret(self.kx_0.diffie_hellman(&PublicKey::from(kx.ephemeral)).to_bytes());
                self.axolotl = Some(AxolotlState::derive_initial(
                    self.is_alice,
                    &shared,
                    local_dhrs,
                    Some(peer_ratchet),
                    self.ratchet_messages,
                    self.ratchet_time,
                ));
                info!(peer = ?self.peer, "Axolotl state established");
            }
        } else if let Some(axolotl) = self.axolotl.as_mut() {
            axolotl.set_peer_ratchet_hint(peer_ratchet);
        }

        let was_uninitialized = self.estate == EncryptionState::Uninitialized;
        if kx.force_reply() || was_uninitialized {
            self.send_kx(false);
        }
        if was_uninitialized {
            self.estate = EncryptionState::AxSent;
        }
        self.recompute_cstate();
        self.drain_queue_sync();
    }

    fn on_encrypted_frame(&mut self, frame: crate::crypto::EncryptedFrame) {
        let Some(axolotl) = self.axolotl.as_mut() else {
            debug!("dropping TUNNEL_ENCRYPTED received before Axolotl state is established");
            return;
        };
        let plaintext = match axolotl.decrypt(&frame) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = ?e, "dropping frame that failed to decrypt");
                return;
            }
        };
        if self.estate == EncryptionState::AxSent {
            self.estate = EncryptionState::AxAuthSent;
            info!(peer = ?self.peer, "peer proved possession of session keys");
        }

        let inners = match wire::decode_inner_messages(&plaintext) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = ?e, "aborting parse of malformed decrypted frame");
                return;
            }
        };
        for inner in inners {
            self.dispatch_inner(inner);
        }
        self.drain_queue_sync();
    }

    fn dispatch_inner(&mut self, msg: InnerMessage) {
        let ctn = Ctn(msg.channel());
        let events: Vec<ChannelEvent> = match msg {
            InnerMessage::Open { channel: _, options } => {
                vec![self.channels.on_open_incoming(ctn, options, true)]
            }
            InnerMessage::OpenAck { .. } => self.channels.on_open_ack(ctn).into_iter().collect(),
            InnerMessage::OpenNack { .. } => self.channels.on_open_nack(ctn).into_iter().collect(),
            InnerMessage::Keepalive { .. } => Vec::new(),
            InnerMessage::Destroy { .. } => vec![self.channels.on_destroy(ctn)],
            InnerMessage::AppData { payload, .. } => self
                .channels
                .on_data(ctn, payload.to_vec())
                .unwrap_or_else(|_| vec![ChannelEvent::EmitDestroy { ctn }]),
            InnerMessage::AppDataAck { .. } => {
                if !self.seen_first_ack {
                    self.seen_first_ack = true;
                    if self.estate == EncryptionState::AxAuthSent {
                        self.estate = EncryptionState::Ok;
                    }
                }
                self.channels.on_data_ack(ctn).ok().flatten().into_iter().collect()
            }
        };
        for ev in events {
            self.emit(ev);
        }
    }

    /// Build and queue a `TUNNEL_KX` frame (spec §4.3 `send_kx`). A
    /// second call while one is already in flight is dropped unless
    /// `force_reply` asks the peer to answer regardless (spec §5
    /// "idempotent under the single-in-flight rule").
    fn send_kx(&mut self, force_reply: bool) {
        if self.pending_kx_sent_at.is_some() && !force_reply {
            return;
        }
        if self.local_dhrs_initial.is_none() {
            self.local_dhrs_initial = Some(StaticSecret::random_from_rng(rand::rngs::OsRng));
        }
        let ephemeral = PublicKey::from(&self.kx_0).to_bytes();
        let ratchet = PublicKey::from(self.local_dhrs_initial.as_ref().unwrap()).to_bytes();
        let signature = self.identity.sign(&ephemeral);
        let flags = if force_reply { wire::KX_FORCE_REPLY } else { 0 };
        let kx = KxFrame {
            flags,
            ephemeral,
            ratchet,
            signature,
        };
        let Ok(encoded) = wire::encode_kx(&kx) else {
            warn!("failed to encode TUNNEL_KX frame");
            return;
        };
        if self.estate == EncryptionState::Uninitialized {
            self.estate = EncryptionState::AxSent;
        }
        // Only treat the KX as in flight once a connection actually took
        // it; otherwise `pending_kx_sent_at` would start the 1s resend
        // clock on a frame that never left the reactor, delaying the
        // real first send once a connection does appear. `AddConnection`
        // calls `send_kx` again directly, so no Tick needs to elapse.
        let Some(conn) = self.pool.pick_for_send() else {
            return;
        };
        match self.connection_layer.send(conn, encoded.to_vec()) {
            Ok(_handle) => self.pending_kx_sent_at = Some(Instant::now()),
            Err(e) => debug!(error = ?e, "failed to hand TUNNEL_KX to connection layer"),
        }
    }

    fn on_tick(&mut self) {
        self.recompute_cstate();
        self.channels.unchoke_channels(&mut self.pool);
        if let Some(victim) = self.pool.trim() {
            debug!(conn = %victim, "trimmed connection on tick");
        }
        if let Some(sent_at) = self.pending_kx_sent_at {
            if self.estate != EncryptionState::AxAuthSent
                && self.estate != EncryptionState::Ok
                && Instant::now().duration_since(sent_at) >= KX_RESEND_INTERVAL
            {
                self.send_kx(false);
            }
        }
        if let Some(axolotl) = self.axolotl.as_ref() {
            if axolotl.ratchet_deadline_elapsed(Instant::now()) {
                // Spec §9 open question, resolved conservatively: also
                // nudge the peer with a forced KX reply.
                self.send_kx(true);
            }
        }
        if let Some(deadline) = self.destroy_empty_deadline {
            if Instant::now() >= deadline && self.channels.is_empty() {
                self.destroy();
            }
        }
        self.drain_queue_sync();
    }

    fn maybe_schedule_destroy_empty(&mut self) {
        if self.channels.is_empty() {
            self.destroy_empty_deadline = Some(Instant::now() + DESTROY_EMPTY_DELAY);
        }
    }

    fn cancel_destroy_empty(&mut self) {
        self.destroy_empty_deadline = None;
    }

    /// Immediate, cascading destroy (spec §4.3 "Destroy lifecycle").
    fn destroy(&mut self) {
        if self.cstate == ConnectivityState::Shutdown {
            return;
        }
        info!(peer = ?self.peer, "tunnel destroy cascade starting");
        for ctn in self.channels.ctns() {
            self.channels.destroy_local(ctn);
            self.notify(TunnelEvent::ChannelDestroyed { ctn });
        }
        let conn_ids: Vec<ConnId> = self.pool.iter().map(|c| c.id).collect();
        for id in conn_ids {
            self.pool.remove(id);
        }
        if !self.delayed_queue.is_empty() {
            warn!(
                remaining = self.delayed_queue.len(),
                "CHANNEL_DESTROY or other frames still queued at shutdown"
            );
        }
        self.delayed_queue.clear();
        self.axolotl = None; // zeroizing Drop impls on the key newtypes scrub the bytes
        self.cstate = ConnectivityState::Shutdown;
        self.notify(TunnelEvent::TunnelShutdown);
        info!(peer = ?self.peer, "tunnel destroy cascade complete");
    }
}
