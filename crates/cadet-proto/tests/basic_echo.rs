//! End-to-end scenario 1 from spec §8 ("Basic echo"): two tunnels,
//! each backed by an in-memory fake connection layer wired directly to
//! the other, exchange a KX handshake, open a channel, ping-pong one
//! message each way, then destroy the channel.
//!
//! The fakes here play the role `tor_chanmgr`'s `FakeChannelFactory`
//! plays in the teacher's own manager tests: a minimal stand-in for the
//! collaborator traits (`ConnectionLayer`, `IdentityProvider`,
//! `Scheduler`) that lets the reactor run for real without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadet_proto::{
    ChannelOptions, ConnId, ConnState, IdentityProvider, PeerId, QueueHandle, Scheduler,
};
use cadet_proto::{ConnectionLayer, ScheduledTask, Tunnel, TunnelEvent};
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct FakeQueueHandle;
impl QueueHandle for FakeQueueHandle {
    fn cancel(&self) {}
}

/// Hands every frame straight to an outbound channel; a pump task reads
/// the other side and calls `Tunnel::deliver_frame` on it.
struct FakeConnectionLayer {
    out: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnectionLayer for FakeConnectionLayer {
    fn send(&self, _conn: ConnId, frame: Vec<u8>) -> cadet_proto::Result<Box<dyn QueueHandle>> {
        let _ = self.out.unbounded_send(frame);
        Ok(Box::new(FakeQueueHandle))
    }

    fn get_state(&self, _conn: ConnId) -> ConnState {
        ConnState::Ready
    }

    fn is_direct(&self, _conn: ConnId) -> bool {
        true
    }
}

/// Identity scheme where "signing" is the identity function; valid only
/// between two fakes using the same scheme, which is all a test needs.
struct FakeIdentity {
    local: PeerId,
}

impl IdentityProvider for FakeIdentity {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        message.to_vec()
    }

    fn verify(&self, _peer: &PeerId, message: &[u8], signature: &[u8]) -> bool {
        message == signature
    }
}

struct FakeScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask for FakeScheduledTask {
    fn cancel(self: Box<Self>) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Backs timers with real `tokio` tasks; fine for a test binary even
/// though `cadet-proto` itself never depends on a runtime.
struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn add_now(&self, task: Box<dyn FnOnce() + Send>) -> Box<dyn ScheduledTask> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        tokio::spawn(async move {
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });
        Box::new(FakeScheduledTask { cancelled })
    }

    fn add_delayed(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> Box<dyn ScheduledTask> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });
        Box::new(FakeScheduledTask { cancelled })
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TunnelEvent>) -> TunnelEvent {
    timeout(TEST_TIMEOUT, events.next())
        .await
        .expect("timed out waiting for tunnel event")
        .expect("event stream closed unexpectedly")
}

#[tokio::test]
async fn basic_echo_round_trip_and_destroy() {
    let alice_id = PeerId([1u8; 32]);
    let bob_id = PeerId([2u8; 32]);

    let (a_to_b, mut a_to_b_rx) = mpsc::unbounded::<Vec<u8>>();
    let (b_to_a, mut b_to_a_rx) = mpsc::unbounded::<Vec<u8>>();

    let alice_spawned = Tunnel::spawn(
        alice_id,
        bob_id,
        Arc::new(FakeConnectionLayer { out: a_to_b }),
        Arc::new(FakeIdentity { local: alice_id }),
        Arc::new(TokioScheduler),
        32,
        cadet_proto::crypto::axolotl::limits::DEFAULT_RATCHET_MESSAGES,
        cadet_proto::crypto::axolotl::limits::DEFAULT_RATCHET_TIME,
    );
    let bob_spawned = Tunnel::spawn(
        bob_id,
        alice_id,
        Arc::new(FakeConnectionLayer { out: b_to_a }),
        Arc::new(FakeIdentity { local: bob_id }),
        Arc::new(TokioScheduler),
        32,
        cadet_proto::crypto::axolotl::limits::DEFAULT_RATCHET_MESSAGES,
        cadet_proto::crypto::axolotl::limits::DEFAULT_RATCHET_TIME,
    );

    let alice = alice_spawned.tunnel;
    let bob = bob_spawned.tunnel;
    let mut alice_events = alice_spawned.events;
    let mut bob_events = bob_spawned.events;

    tokio::spawn(alice_spawned.run);
    tokio::spawn(bob_spawned.run);

    let conn = ConnId(1);
    alice.add_connection(conn, true).unwrap();
    bob.add_connection(conn, true).unwrap();

    // Pump raw frames between the two fakes' wires.
    let bob_for_pump = bob.clone();
    tokio::spawn(async move {
        while let Some(frame) = a_to_b_rx.next().await {
            let _ = bob_for_pump.deliver_frame(conn, frame);
        }
    });
    let alice_for_pump = alice.clone();
    tokio::spawn(async move {
        while let Some(frame) = b_to_a_rx.next().await {
            let _ = alice_for_pump.deliver_frame(conn, frame);
        }
    });

    let opened_ctn = timeout(TEST_TIMEOUT, alice.open_channel(ChannelOptions::default()))
        .await
        .expect("open_channel timed out")
        .expect("open_channel failed");

    match next_event(&mut alice_events).await {
        TunnelEvent::ChannelOpened { ctn } => assert_eq!(ctn, opened_ctn),
        other => panic!("expected ChannelOpened, got {other:?}"),
    }

    alice.submit(opened_ctn, b"hello".to_vec()).await.unwrap();

    let bob_ctn = match next_event(&mut bob_events).await {
        TunnelEvent::DataReceived { ctn, payload } => {
            assert_eq!(payload, b"hello");
            ctn
        }
        other => panic!("expected DataReceived, got {other:?}"),
    };
    assert_eq!(bob_ctn, opened_ctn);

    bob.submit(bob_ctn, b"world".to_vec()).await.unwrap();

    match next_event(&mut alice_events).await {
        TunnelEvent::DataReceived { ctn, payload } => {
            assert_eq!(ctn, opened_ctn);
            assert_eq!(payload, b"world");
        }
        other => panic!("expected DataReceived, got {other:?}"),
    }

    alice.destroy_channel(opened_ctn).unwrap();

    match next_event(&mut bob_events).await {
        TunnelEvent::ChannelDestroyed { ctn } => assert_eq!(ctn, opened_ctn),
        other => panic!("expected ChannelDestroyed, got {other:?}"),
    }
}
