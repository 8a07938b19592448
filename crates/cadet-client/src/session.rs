//! The client session (spec §4.5): the local-service link, its
//! reconnect loop, and the public API surface client code calls.
//!
//! Follows the same handle/reactor split as `cadet_proto::Tunnel`:
//! [`Session`]/[`SessionHandle`] are cheap `Clone` handles; [`SessionReactor`]
//! owns the actual link, the port table, and the local channel table, and
//! runs as a single task (spec §5).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use asynchronous_codec::Framed;
use bytes::Bytes;
use cadet_proto::{ChannelOptions, Ctn, PeerId, TunnelId};
use futures::channel::{mpsc, oneshot};
use futures::{AsyncRead, AsyncWrite, SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpStream, UnixStream};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, warn};

use crate::channel::{Channel, DataHandler};
use crate::config::{ServiceAddress, SessionConfig};
use crate::err::{ClientError, Result};
use crate::port::{NewChannelHandler, PortHandle, PortTable};
use crate::status::{report_status, BootstrapEvents, LinkState};
use crate::wire::{InfoKind, LocalCodec, LocalMessage};

/// Blanket trait object bound for either half of the local service
/// link, regardless of whether it is a Unix socket or a TCP stream.
trait LinkIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIo for T {}

type LinkFramed = Framed<Box<dyn LinkIo>, LocalCodec>;

/// Control-plane messages a [`Session`]/[`Channel`] handle sends to its
/// reactor.
pub(crate) enum SessionCtrlMsg {
    OpenPort {
        port_hash: [u8; 32],
        handler: NewChannelHandler,
        reply: oneshot::Sender<Result<PortHandle>>,
    },
    ClosePort {
        handle: PortHandle,
    },
    ChannelCreate {
        peer: PeerId,
        port_hash: [u8; 32],
        options: ChannelOptions,
        on_data: DataHandler,
        reply: oneshot::Sender<Result<Channel>>,
    },
    ChannelDestroy {
        local_id: u32,
    },
    SubmitData {
        local_id: u32,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    ReceiveDone {
        local_id: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    InfoRequest {
        kind: InfoKind,
        rows: mpsc::UnboundedSender<Option<Bytes>>,
    },
    Shutdown,
}

/// A cheap, `Clone`-able reference to a session's background reactor.
#[derive(Clone)]
pub struct SessionHandle {
    ctrl_tx: mpsc::UnboundedSender<SessionCtrlMsg>,
}

impl SessionHandle {
    pub(crate) fn send_ctrl(&self, msg: SessionCtrlMsg) -> Result<()> {
        self.ctrl_tx.unbounded_send(msg).map_err(|_| ClientError::SessionClosed)
    }
}

/// The client's connection to a local CADET service (spec §4.5
/// `connect(cfg) -> session`).
#[derive(Clone)]
pub struct Session {
    handle: SessionHandle,
    status: BootstrapEvents,
}

impl Session {
    /// Establish the local service link and begin the reconnect loop on
    /// error (spec §4.5). The reactor runs on a spawned `tokio` task;
    /// this call returns as soon as the reactor has started, not once it
    /// is connected — observe [`Session::bootstrap_events`] for that.
    pub fn connect(config: SessionConfig) -> Session {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded();
        let (status_tx, status_rx) = postage::watch::channel();
        let (state_tx, state_rx) = mpsc::unbounded();

        let handle = SessionHandle { ctrl_tx };
        let reactor = SessionReactor::new(config, handle.clone(), ctrl_rx, state_tx);
        tokio::spawn(reactor.run());
        tokio::spawn(report_status(status_tx, state_rx));

        Session {
            handle,
            status: BootstrapEvents { inner: status_rx },
        }
    }

    /// Observe connection-state transitions without polling (spec §4.5
    /// ambient addition, grounded on `arti-client`'s `BootstrapEvents`).
    pub fn bootstrap_events(&self) -> BootstrapEvents {
        self.status.clone()
    }

    /// Register a handler for inbound channels opened on `port_hash`
    /// (spec §4.5 `open_port`).
    pub async fn open_port(&self, port_hash: [u8; 32], handler: NewChannelHandler) -> Result<PortHandle> {
        let (reply, rx) = oneshot::channel();
        self.handle.send_ctrl(SessionCtrlMsg::OpenPort { port_hash, handler, reply })?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Unregister a port (spec §4.5 `close_port`).
    pub fn close_port(&self, handle: PortHandle) -> Result<()> {
        self.handle.send_ctrl(SessionCtrlMsg::ClosePort { handle })
    }

    /// Open a channel to `peer` on `port_hash` (spec §4.5
    /// `channel_create`).
    pub async fn channel_create(
        &self,
        peer: PeerId,
        port_hash: [u8; 32],
        options: ChannelOptions,
        on_data: DataHandler,
    ) -> Result<Channel> {
        let (reply, rx) = oneshot::channel();
        self.handle.send_ctrl(SessionCtrlMsg::ChannelCreate {
            peer,
            port_hash,
            options,
            on_data,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Destroy a channel (spec §4.5 `channel_destroy`).
    pub fn channel_destroy(&self, channel: &Channel) -> Result<()> {
        channel.destroy()
    }

    /// List known peers, terminated by end-of-stream (spec §4.5
    /// `get_peers`, the `NULL`-sentinel monitoring reply modelled as a
    /// `Stream`).
    pub fn get_peers(&self) -> impl futures::Stream<Item = Bytes> {
        self.info_stream(InfoKind::Peers)
    }

    /// Query one peer's state.
    pub fn get_peer(&self, peer: PeerId) -> impl futures::Stream<Item = Bytes> {
        self.info_stream(InfoKind::Peer(peer))
    }

    /// List known tunnels.
    pub fn get_tunnels(&self) -> impl futures::Stream<Item = Bytes> {
        self.info_stream(InfoKind::Tunnels)
    }

    /// Query one tunnel's state.
    pub fn get_tunnel(&self, tunnel: TunnelId) -> impl futures::Stream<Item = Bytes> {
        self.info_stream(InfoKind::Tunnel(tunnel))
    }

    /// Query one channel's state.
    pub fn get_channel(&self, tunnel: TunnelId, ctn: Ctn) -> impl futures::Stream<Item = Bytes> {
        self.info_stream(InfoKind::Channel(tunnel, ctn))
    }

    fn info_stream(&self, kind: InfoKind) -> impl futures::Stream<Item = Bytes> {
        let (rows_tx, rows_rx) = mpsc::unbounded();
        if self.handle.send_ctrl(SessionCtrlMsg::InfoRequest { kind, rows: rows_tx.clone() }).is_err() {
            let _ = rows_tx.unbounded_send(None);
        }
        rows_rx.take_while(|row| futures::future::ready(row.is_some())).filter_map(futures::future::ready)
    }

    /// Tear the session down.
    pub fn shutdown(&self) -> Result<()> {
        self.handle.send_ctrl(SessionCtrlMsg::Shutdown)
    }
}

/// One client-local channel's bookkeeping (distinct from
/// `cadet_proto`'s `Ctn`-keyed wire-level channel state, which lives on
/// the service side of the link).
struct ChannelEntry {
    peer: PeerId,
    port_hash: [u8; 32],
    options: ChannelOptions,
    on_data: DataHandler,
    /// A `SubmitData` is outstanding for this channel; a second one is
    /// rejected (spec §4.5).
    pending_submit: bool,
    /// A message has been handed to `on_data` and is awaiting
    /// `receive_done` before the next queued one goes out.
    delivered_unacked: bool,
    backlog: VecDeque<Bytes>,
}

/// One outstanding monitoring request (spec §4.5: "at most one info
/// request of each kind active at once").
struct InfoQuery {
    rows: mpsc::UnboundedSender<Option<Bytes>>,
}

fn info_kind_key(kind: &InfoKind) -> u8 {
    match kind {
        InfoKind::Peers => 0,
        InfoKind::Peer(_) => 1,
        InfoKind::Tunnels => 2,
        InfoKind::Tunnel(_) => 3,
        InfoKind::Channel(..) => 4,
    }
}

/// What woke the reactor's main loop up.
enum Event {
    Ctrl(Option<SessionCtrlMsg>),
    Frame(Option<std::result::Result<LocalMessage, std::io::Error>>),
}

/// Owns the local-service link and every piece of client-local state
/// (spec §5 "single-threaded cooperative").
struct SessionReactor {
    config: SessionConfig,
    handle: SessionHandle,
    link: Option<LinkFramed>,
    ports: PortTable,
    channels: HashMap<u32, ChannelEntry>,
    next_local_id: u32,
    pending_channel_create: HashMap<u32, oneshot::Sender<Result<Channel>>>,
    pending_submit: HashMap<u32, oneshot::Sender<Result<()>>>,
    info_queries: HashMap<u8, InfoQuery>,
    ctrl_rx: mpsc::UnboundedReceiver<SessionCtrlMsg>,
    state_tx: mpsc::UnboundedSender<LinkState>,
    reconnect_attempt: u32,
}

impl SessionReactor {
    fn new(
        config: SessionConfig,
        handle: SessionHandle,
        ctrl_rx: mpsc::UnboundedReceiver<SessionCtrlMsg>,
        state_tx: mpsc::UnboundedSender<LinkState>,
    ) -> Self {
        SessionReactor {
            config,
            handle,
            link: None,
            ports: PortTable::new(),
            channels: HashMap::new(),
            next_local_id: 0,
            pending_channel_create: HashMap::new(),
            pending_submit: HashMap::new(),
            info_queries: HashMap::new(),
            ctrl_rx,
            state_tx,
            reconnect_attempt: 0,
        }
    }

    async fn connect_link(addr: &ServiceAddress) -> std::io::Result<LinkFramed> {
        let io: Box<dyn LinkIo> = match addr {
            ServiceAddress::Unix(path) => Box::new(UnixStream::connect(path).await?.compat()),
            ServiceAddress::Tcp(sock) => Box::new(TcpStream::connect(sock).await?.compat()),
        };
        Ok(Framed::new(io, LocalCodec))
    }

    /// Delay before the next reconnect attempt, growing exponentially
    /// from `reconnect_min` up to `reconnect_max` with a little jitter
    /// so a fleet of clients doesn't retry in lockstep.
    fn backoff_delay(&mut self) -> Duration {
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let shift = self.reconnect_attempt.min(16);
        let grown = self.config.reconnect_min.saturating_mul(1u32 << shift);
        let capped = grown.min(self.config.reconnect_max);
        let jitter_bound = (capped.as_millis() as u64 / 4).max(1);
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_bound))
    }

    async fn send_frame(&mut self, msg: LocalMessage) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(e) = link.send(msg).await {
            warn!("local service link write error, reconnecting: {e}");
            self.link = None;
            let _ = self.state_tx.unbounded_send(LinkState::Disconnected);
        }
    }

    /// Re-announce standing state to a freshly (re)connected service.
    /// Outstanding channels do not survive a reconnect: the service has
    /// no memory of them either, so every pending operation fails with
    /// [`ClientError::NotConnected`] and callers must recreate the
    /// channel.
    async fn resync_after_reconnect(&mut self) {
        for port_hash in self.ports.known_hashes() {
            self.send_frame(LocalMessage::PortOpen { port_hash }).await;
        }
        for (_, query) in self.info_queries.drain() {
            let _ = query.rows.unbounded_send(None);
        }
        let stale: Vec<u32> = self.channels.keys().copied().collect();
        for local_id in stale {
            self.channels.remove(&local_id);
            if let Some(reply) = self.pending_channel_create.remove(&local_id) {
                let _ = reply.send(Err(ClientError::NotConnected));
            }
            if let Some(reply) = self.pending_submit.remove(&local_id) {
                let _ = reply.send(Err(ClientError::NotConnected));
            }
        }
    }

    async fn handle_ctrl(&mut self, msg: SessionCtrlMsg) -> bool {
        match msg {
            SessionCtrlMsg::OpenPort { port_hash, handler, reply } => {
                let result = self.ports.open(port_hash, handler).map_err(Into::into);
                if result.is_ok() {
                    self.send_frame(LocalMessage::PortOpen { port_hash }).await;
                }
                let _ = reply.send(result);
            }
            SessionCtrlMsg::ClosePort { handle } => {
                self.ports.close(handle);
                self.send_frame(LocalMessage::PortClose { port_hash: handle.0 }).await;
            }
            SessionCtrlMsg::ChannelCreate { peer, port_hash, options, on_data, reply } => {
                let local_id = self.next_local_id;
                self.next_local_id = self.next_local_id.wrapping_add(1);
                self.channels.insert(
                    local_id,
                    ChannelEntry {
                        peer,
                        port_hash,
                        options,
                        on_data,
                        pending_submit: false,
                        delivered_unacked: false,
                        backlog: VecDeque::new(),
                    },
                );
                self.pending_channel_create.insert(local_id, reply);
                self.send_frame(LocalMessage::ChannelCreate { local_id, peer, port_hash, options }).await;
            }
            SessionCtrlMsg::ChannelDestroy { local_id } => {
                self.channels.remove(&local_id);
                self.send_frame(LocalMessage::ChannelDestroy { local_id }).await;
            }
            SessionCtrlMsg::SubmitData { local_id, payload, reply } => match self.channels.get_mut(&local_id) {
                None => {
                    let _ = reply.send(Err(ClientError::UnknownChannel(local_id)));
                }
                Some(entry) if entry.pending_submit => {
                    let _ = reply.send(Err(ClientError::TransmitReadyPending));
                }
                Some(entry) => {
                    entry.pending_submit = true;
                    self.pending_submit.insert(local_id, reply);
                    self.send_frame(LocalMessage::LocalData { local_id, payload }).await;
                }
            },
            SessionCtrlMsg::ReceiveDone { local_id, reply } => match self.channels.get_mut(&local_id) {
                None => {
                    let _ = reply.send(Err(ClientError::UnknownChannel(local_id)));
                }
                Some(entry) => {
                    entry.delivered_unacked = false;
                    if let Some(payload) = entry.backlog.pop_front() {
                        deliver_next(entry, local_id, &self.handle, payload);
                    }
                    let _ = reply.send(Ok(()));
                }
            },
            SessionCtrlMsg::InfoRequest { kind, rows } => {
                let key = info_kind_key(&kind);
                if self.info_queries.contains_key(&key) {
                    let _ = rows.unbounded_send(None);
                } else {
                    self.info_queries.insert(key, InfoQuery { rows });
                    self.send_frame(LocalMessage::InfoRequest { kind }).await;
                }
            }
            SessionCtrlMsg::Shutdown => return false,
        }
        true
    }

    async fn handle_inbound(&mut self, msg: LocalMessage) {
        match msg {
            LocalMessage::ChannelCreateAck { local_id } => {
                if let Some(reply) = self.pending_channel_create.remove(&local_id) {
                    if let Some(entry) = self.channels.get(&local_id) {
                        let channel = Channel {
                            local_id,
                            peer: entry.peer,
                            port_hash: entry.port_hash,
                            options: entry.options,
                            session: self.handle.clone(),
                        };
                        let _ = reply.send(Ok(channel));
                    }
                }
            }
            LocalMessage::ChannelCreateNack { local_id } => {
                self.channels.remove(&local_id);
                if let Some(reply) = self.pending_channel_create.remove(&local_id) {
                    let _ = reply.send(Err(ClientError::ChannelRejected(local_id)));
                }
            }
            LocalMessage::ChannelIncoming { local_id, peer, port_hash, options } => {
                match self.ports.handler_for(&port_hash) {
                    Some(new_channel_handler) => {
                        let channel = Channel {
                            local_id,
                            peer,
                            port_hash,
                            options,
                            session: self.handle.clone(),
                        };
                        let on_data = new_channel_handler(channel);
                        self.channels.insert(
                            local_id,
                            ChannelEntry {
                                peer,
                                port_hash,
                                options,
                                on_data,
                                pending_submit: false,
                                delivered_unacked: false,
                                backlog: VecDeque::new(),
                            },
                        );
                        self.send_frame(LocalMessage::ChannelCreateAck { local_id }).await;
                    }
                    None => {
                        self.send_frame(LocalMessage::ChannelCreateNack { local_id }).await;
                    }
                }
            }
            LocalMessage::LocalData { local_id, payload } => {
                if let Some(entry) = self.channels.get_mut(&local_id) {
                    if entry.delivered_unacked {
                        entry.backlog.push_back(payload);
                    } else {
                        entry.delivered_unacked = true;
                        deliver_next(entry, local_id, &self.handle, payload);
                    }
                }
            }
            LocalMessage::LocalAck { local_id } => {
                if let Some(entry) = self.channels.get_mut(&local_id) {
                    entry.pending_submit = false;
                }
                if let Some(reply) = self.pending_submit.remove(&local_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            LocalMessage::ChannelDestroy { local_id } => {
                self.channels.remove(&local_id);
            }
            LocalMessage::InfoReply { kind, payload } => {
                let key = info_kind_key(&kind);
                if let Some(query) = self.info_queries.get(&key) {
                    let _ = query.rows.unbounded_send(Some(payload));
                }
            }
            LocalMessage::InfoReplyEnd { kind } => {
                let key = info_kind_key(&kind);
                if let Some(query) = self.info_queries.remove(&key) {
                    let _ = query.rows.unbounded_send(None);
                }
            }
            other @ (LocalMessage::PortOpen { .. }
            | LocalMessage::PortClose { .. }
            | LocalMessage::ChannelCreate { .. }
            | LocalMessage::InfoRequest { .. }) => {
                warn!("local CADET service sent a client-only message: {other:?}");
            }
        }
    }

    pub async fn run(mut self) {
        loop {
            if self.link.is_none() {
                let _ = self.state_tx.unbounded_send(LinkState::Connecting);
                match Self::connect_link(&self.config.service_address).await {
                    Ok(link) => {
                        self.link = Some(link);
                        self.reconnect_attempt = 0;
                        let _ = self.state_tx.unbounded_send(LinkState::Ready);
                        self.resync_after_reconnect().await;
                    }
                    Err(e) => {
                        debug!("failed to connect to local CADET service: {e}");
                        let _ = self.state_tx.unbounded_send(LinkState::Disconnected);
                        tokio::time::sleep(self.backoff_delay()).await;
                        continue;
                    }
                }
            }

            let next = futures::select_biased! {
                msg = self.ctrl_rx.next() => Event::Ctrl(msg),
                frame = self.link.as_mut().expect("connected above").next() => Event::Frame(frame),
            };

            match next {
                Event::Ctrl(Some(msg)) => {
                    if !self.handle_ctrl(msg).await {
                        return;
                    }
                }
                Event::Ctrl(None) => return,
                Event::Frame(Some(Ok(msg))) => self.handle_inbound(msg).await,
                Event::Frame(Some(Err(e))) => {
                    warn!("local service link framing error, reconnecting: {e}");
                    self.link = None;
                    let _ = self.state_tx.unbounded_send(LinkState::Disconnected);
                }
                Event::Frame(None) => {
                    warn!("local service link closed, reconnecting");
                    self.link = None;
                    let _ = self.state_tx.unbounded_send(LinkState::Disconnected);
                }
            }
        }
    }
}

/// Clone the handler out of `entry` and invoke it with a fresh
/// [`Channel`] handle; kept as a free function since it only needs a
/// mutable borrow of one `ChannelEntry`, not the whole reactor.
fn deliver_next(entry: &mut ChannelEntry, local_id: u32, session: &SessionHandle, payload: Bytes) {
    let channel = Channel {
        local_id,
        peer: entry.peer,
        port_hash: entry.port_hash,
        options: entry.options,
        session: session.clone(),
    };
    (entry.on_data)(channel, payload);
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use cadet_proto::PeerId;

    use super::*;

    fn new_reactor() -> SessionReactor {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded();
        let (state_tx, _state_rx) = mpsc::unbounded();
        let handle = SessionHandle { ctrl_tx };
        SessionReactor::new(SessionConfig::default(), handle, ctrl_rx, state_tx)
    }

    fn peer(b: u8) -> PeerId {
        PeerId([b; 32])
    }

    /// `send_frame` is a no-op with no live link, so `handle_ctrl`/
    /// `handle_inbound` bookkeeping can be exercised without a real
    /// socket (spec §5's reactor owns all mutable state; the wire write
    /// is a side effect, not a dependency of the bookkeeping itself).
    #[tokio::test]
    async fn second_info_request_of_same_kind_is_rejected() {
        let mut reactor = new_reactor();
        let (rows_a, mut rx_a) = mpsc::unbounded();
        let (rows_b, mut rx_b) = mpsc::unbounded();

        reactor
            .handle_ctrl(SessionCtrlMsg::InfoRequest { kind: InfoKind::Tunnels, rows: rows_a })
            .await;
        reactor
            .handle_ctrl(SessionCtrlMsg::InfoRequest { kind: InfoKind::Tunnels, rows: rows_b })
            .await;

        assert_eq!(reactor.info_queries.len(), 1);
        assert_eq!(rx_b.next().await, Some(None));
        assert!(rx_a.try_next().is_err(), "first query must stay open, not be replied to");
    }

    #[tokio::test]
    async fn second_submit_while_one_is_pending_is_rejected() {
        let mut reactor = new_reactor();
        reactor.channels.insert(
            0,
            ChannelEntry {
                peer: peer(1),
                port_hash: [0u8; 32],
                options: ChannelOptions::default(),
                on_data: Arc::new(|_, _| {}),
                pending_submit: false,
                delivered_unacked: false,
                backlog: VecDeque::new(),
            },
        );

        let (reply_a, mut rx_a) = oneshot::channel();
        reactor
            .handle_ctrl(SessionCtrlMsg::SubmitData { local_id: 0, payload: Bytes::from_static(b"a"), reply: reply_a })
            .await;
        assert!(matches!(rx_a.try_recv(), Ok(None)), "first submit should still be pending");

        let (reply_b, rx_b) = oneshot::channel();
        reactor
            .handle_ctrl(SessionCtrlMsg::SubmitData { local_id: 0, payload: Bytes::from_static(b"b"), reply: reply_b })
            .await;
        match rx_b.await.unwrap() {
            Err(ClientError::TransmitReadyPending) => {}
            other => panic!("expected TransmitReadyPending, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backlogged_data_is_released_one_at_a_time_on_receive_done() {
        let mut reactor = new_reactor();
        let delivered: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered_for_handler = delivered.clone();
        reactor.channels.insert(
            0,
            ChannelEntry {
                peer: peer(1),
                port_hash: [0u8; 32],
                options: ChannelOptions::default(),
                on_data: Arc::new(move |_, payload| delivered_for_handler.lock().unwrap().push(payload)),
                pending_submit: false,
                delivered_unacked: false,
                backlog: VecDeque::new(),
            },
        );

        reactor
            .handle_inbound(LocalMessage::LocalData { local_id: 0, payload: Bytes::from_static(b"first") })
            .await;
        reactor
            .handle_inbound(LocalMessage::LocalData { local_id: 0, payload: Bytes::from_static(b"second") })
            .await;

        assert_eq!(delivered.lock().unwrap().as_slice(), [Bytes::from_static(b"first")]);
        assert_eq!(reactor.channels.get(&0).unwrap().backlog.len(), 1);

        let (reply, rx) = oneshot::channel();
        reactor.handle_ctrl(SessionCtrlMsg::ReceiveDone { local_id: 0, reply }).await;
        rx.await.unwrap().unwrap();

        assert_eq!(
            delivered.lock().unwrap().as_slice(),
            [Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
        assert!(reactor.channels.get(&0).unwrap().backlog.is_empty());
    }

    #[tokio::test]
    async fn channel_create_nack_rejects_pending_reply_and_drops_entry() {
        let mut reactor = new_reactor();
        let (reply, rx) = oneshot::channel();
        reactor
            .handle_ctrl(SessionCtrlMsg::ChannelCreate {
                peer: peer(2),
                port_hash: [0u8; 32],
                options: ChannelOptions::default(),
                on_data: Arc::new(|_, _| {}),
                reply,
            })
            .await;
        assert!(reactor.channels.contains_key(&0));

        reactor.handle_inbound(LocalMessage::ChannelCreateNack { local_id: 0 }).await;

        assert!(!reactor.channels.contains_key(&0));
        match rx.await.unwrap() {
            Err(ClientError::ChannelRejected(0)) => {}
            other => panic!("expected ChannelRejected(0), got {other:?}"),
        }
    }

    /// Spec §8 scenario 5 ("Reconnect"): a dropped link fails every
    /// outstanding channel operation with `NotConnected` rather than
    /// trying to resume the channel, because the service has no memory
    /// of it either.
    #[tokio::test]
    async fn resync_after_reconnect_fails_pending_work_as_not_connected() {
        let mut reactor = new_reactor();
        reactor.channels.insert(
            0,
            ChannelEntry {
                peer: peer(3),
                port_hash: [0u8; 32],
                options: ChannelOptions::default(),
                on_data: Arc::new(|_, _| {}),
                pending_submit: true,
                delivered_unacked: false,
                backlog: VecDeque::new(),
            },
        );
        let (create_reply, create_rx) = oneshot::channel();
        reactor.pending_channel_create.insert(0, create_reply);
        let (submit_reply, submit_rx) = oneshot::channel();
        reactor.pending_submit.insert(0, submit_reply);
        let (rows_tx, mut rows_rx) = mpsc::unbounded();
        reactor.info_queries.insert(2, InfoQuery { rows: rows_tx });

        reactor.resync_after_reconnect().await;

        assert!(reactor.channels.is_empty());
        assert!(reactor.info_queries.is_empty());
        assert_eq!(rows_rx.next().await, Some(None));
        match create_rx.await.unwrap() {
            Err(ClientError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
        match submit_rx.await.unwrap() {
            Err(ClientError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
    }

    #[test]
    fn backoff_delay_grows_and_is_capped_at_reconnect_max() {
        let mut reactor = new_reactor();
        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = reactor.backoff_delay();
            assert!(delay >= previous || delay <= reactor.config.reconnect_max + reactor.config.reconnect_max / 4);
            previous = delay.min(reactor.config.reconnect_max);
        }
        let capped = reactor.backoff_delay();
        assert!(capped <= reactor.config.reconnect_max + reactor.config.reconnect_max / 4);
    }
}
