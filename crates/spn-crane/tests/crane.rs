//! End-to-end crane tests over in-memory ships.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use spn_core::counter::{CounterOp, CounterOpts};
use spn_core::msg::{make_msg, MsgType};
use spn_core::terminal::CraneTerminal;
use spn_core::{Container, Error};
use spn_crane::controller::{push_hub_info, CapacityOp, LatencyOp};
use spn_crane::{Crane, CraneMetrics, CraneOpts};
use spn_hub::{import_and_verify_hub_info, Identity, LabeledHash};
use spn_transport::{Ship, TestShip};

const TEST_DATA: &[u8] = b"The quick brown fox jumps over the lazy dog.";

fn crane_opts(load_size: usize) -> CraneOpts {
    CraneOpts {
        optimal_min_load_size: Some(load_size * 2),
        ..CraneOpts::default()
    }
}

/// Build and start a crane pair, returning both once operational.
async fn start_crane_pair(
    secure: bool,
    load_size: usize,
    identity: Option<Arc<Identity>>,
    opts_b: CraneOpts,
) -> (Arc<Crane>, Arc<Crane>) {
    let (ship_a, ship_b) = TestShip::pair(secure, load_size);
    let metrics = Arc::new(CraneMetrics::default());

    let connected_hub = identity.as_ref().map(|identity| identity.hub());
    let crane_a = Crane::new(
        Arc::new(ship_a),
        connected_hub,
        None,
        crane_opts(load_size),
        metrics.clone(),
    );
    let crane_b = Crane::new(Arc::new(ship_b), None, identity, opts_b, metrics);

    let acceptor = {
        let crane_b = crane_b.clone();
        tokio::spawn(async move { crane_b.start().await })
    };
    crane_a.start().await.expect("initiating crane failed");
    acceptor
        .await
        .expect("acceptor panicked")
        .expect("accepting crane failed");

    (crane_a, crane_b)
}

async fn run_counter(crane_a: &Arc<Crane>, count_to: u64) {
    let controller = crane_a.controller().expect("controller missing");
    let op = CounterOp::attach(
        controller,
        CounterOpts {
            client_count_to: count_to,
            server_count_to: count_to,
        },
    )
    .await
    .expect("failed to start counter");

    let err = tokio::time::timeout(Duration::from_secs(10), op.wait())
        .await
        .expect("counter timed out");
    assert_eq!(err, None, "counter failed");
    assert_eq!(op.received(), count_to);
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_counter() {
    let (crane_a, crane_b) =
        start_crane_pair(true, 100, None, crane_opts(100)).await;
    assert!(crane_b.controller().is_some());
    run_counter(&crane_a, 10_000).await;
    assert!(!crane_a.is_stopped());
    assert!(!crane_b.is_stopped());
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_counter() {
    let identity = Arc::new(Identity::create("main"));
    let (crane_a, crane_b) =
        start_crane_pair(false, 1000, Some(identity.clone()), crane_opts(1000)).await;

    // The handshake refreshed and verified the hub documents.
    let hub = crane_a.connected_hub().expect("hub missing after handshake");
    assert_eq!(hub.id, identity.id());

    run_counter(&crane_a, 10_000).await;
    assert!(!crane_b.is_stopped());
}

struct StreamingTerminal {
    id: u32,
    recv: mpsc::Sender<Container>,
}

impl CraneTerminal for StreamingTerminal {
    fn id(&self) -> u32 {
        self.id
    }

    fn fmt_id(&self) -> String {
        format!("stream#{}", self.id)
    }

    fn deliver(&self, c: Container) -> Result<(), Error> {
        self.recv.try_send(c).map_err(|_| Error::QueueOverflow)
    }

    fn abandon(&self, err: Error) {
        panic!("streaming terminal abandoned: {err}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_in_order() {
    let (crane_a, crane_b) = start_crane_pair(true, 100, None, crane_opts(100)).await;

    let (recv_tx, mut recv_rx) = mpsc::channel(2000);
    crane_b.add_terminal(Arc::new(StreamingTerminal {
        id: 8,
        recv: recv_tx,
    }));

    let count = 1000;
    let submit = crane_a.submit_channel();
    let sender = tokio::spawn(async move {
        for _ in 0..count {
            let mut c = Container::from_data(TEST_DATA.to_vec());
            make_msg(&mut c, 8, MsgType::Data);
            submit.send(c).await.expect("crane gone");
        }
    });

    for i in 0..count {
        let msg = tokio::time::timeout(Duration::from_secs(10), recv_rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for message {i}"))
            .expect("stream closed");
        assert_eq!(msg.compile_data(), TEST_DATA, "message {i} mismatched");
    }
    sender.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn small_queue_flow_control() {
    // Tiny controller queues force the credit loop to cycle many times.
    let mut opts_b = crane_opts(100);
    opts_b.controller.queue_size = 4;
    let mut opts_a = crane_opts(100);
    opts_a.controller.queue_size = 4;

    let (ship_a, ship_b) = TestShip::pair(true, 100);
    let metrics = Arc::new(CraneMetrics::default());
    let crane_a = Crane::new(Arc::new(ship_a), None, None, opts_a, metrics.clone());
    let crane_b = Crane::new(Arc::new(ship_b), None, None, opts_b, metrics);

    let acceptor = {
        let crane_b = crane_b.clone();
        tokio::spawn(async move { crane_b.start().await })
    };
    crane_a.start().await.unwrap();
    acceptor.await.unwrap().unwrap();

    // 100 messages each way through queues of 4: no overflow, no loss.
    run_counter(&crane_a, 100).await;
    assert!(!crane_a.is_stopped());
    assert!(!crane_b.is_stopped());
}

#[tokio::test(flavor = "multi_thread")]
async fn controller_latency_and_capacity() {
    let (crane_a, _crane_b) = start_crane_pair(true, 256, None, crane_opts(256)).await;
    let controller = crane_a.controller().unwrap();

    let latency = LatencyOp::attach(controller, 3).await.unwrap();
    let rtt = tokio::time::timeout(Duration::from_secs(10), latency.wait())
        .await
        .expect("latency timed out")
        .expect("latency failed");
    assert!(rtt > Duration::ZERO);

    let capacity = CapacityOp::attach(controller, 50, 256).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), capacity.wait())
        .await
        .expect("capacity timed out")
        .expect("capacity failed");
    assert_eq!(report.bytes, 50 * 256);
}

#[tokio::test(flavor = "multi_thread")]
async fn hub_info_push_reaches_callback() {
    let identity = Arc::new(Identity::create("main"));
    let (hub_tx, mut hub_rx) = mpsc::channel(1);
    let mut opts_b = crane_opts(512);
    opts_b.on_hub_info = Some(Arc::new(move |hub| {
        let _ = hub_tx.try_send(hub);
    }));

    let (crane_a, _crane_b) = start_crane_pair(true, 512, None, opts_b).await;

    push_hub_info(crane_a.controller().unwrap(), &identity)
        .await
        .unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(10), hub_rx.recv())
        .await
        .expect("push timed out")
        .expect("callback dropped");
    assert_eq!(pushed.id, identity.id());
}

// === Accept-side init protocol, driven frame by frame ===

async fn send_init_frame(ship: &TestShip, msg_type: u8, payload: &[u8]) {
    let mut frame = Container::from_data(payload.to_vec());
    frame.prepend_number(u64::from(msg_type));
    frame.prepend_length();
    ship.load(&frame.compile_data()).await.unwrap();
}

async fn read_reply_block(ship: &TestShip) -> Container {
    // Replies fit one load in these tests.
    let chunk = tokio::time::timeout(Duration::from_secs(5), ship.unload())
        .await
        .expect("reply timed out")
        .expect("ship closed");
    let mut c = Container::from_data(chunk);
    c.get_next_block().expect("malformed reply")
}

#[tokio::test(flavor = "multi_thread")]
async fn accept_loop_serves_info_and_hub_info() {
    let identity = Arc::new(Identity::create("main"));
    let (ship_a, ship_b) = TestShip::pair(false, 1024);
    let crane_b = Crane::new(
        Arc::new(ship_b),
        None,
        Some(identity.clone()),
        crane_opts(1024),
        Arc::new(CraneMetrics::default()),
    );
    let acceptor = {
        let crane_b = crane_b.clone();
        tokio::spawn(async move { crane_b.start().await })
    };

    // Info: a CBOR document comes back.
    send_init_frame(&ship_a, 1, &[]).await;
    let info = read_reply_block(&ship_a).await;
    let value: ciborium::Value = ciborium::de::from_reader(info.as_slice()).unwrap();
    assert!(value.is_map());

    // RequestHubInfo: two verifiable signed blocks.
    send_init_frame(&ship_a, 2, &[]).await;
    let mut reply = read_reply_block(&ship_a).await;
    let announcement = reply.get_next_block().unwrap();
    let status = reply.get_next_block().unwrap();
    let hub = import_and_verify_hub_info(
        Some(identity.id()),
        announcement.as_slice(),
        status.as_slice(),
        "main",
    )
    .unwrap();
    assert_eq!(hub.id, identity.id());

    // Verify: the identity signs our challenge.
    let challenge = b"crane verification challenge";
    let mut payload = Container::new();
    payload.append_as_block(challenge);
    send_init_frame(&ship_a, 3, &payload.compile_data()).await;
    let mut reply = read_reply_block(&ship_a).await;
    let key = reply.get_next_block().unwrap().compile_data();
    let signature = reply.get_next_block().unwrap().compile_data();
    assert_eq!(LabeledHash::sha256(&key).to_base58(), identity.id());
    let verifying =
        ed25519_dalek::VerifyingKey::from_bytes(&key.try_into().unwrap()).unwrap();
    let signature = ed25519_dalek::Signature::from_bytes(&signature.try_into().unwrap());
    ed25519_dalek::Verifier::verify(&verifying, challenge, &signature).unwrap();

    // End: the accept loop returns with a stopping error.
    send_init_frame(&ship_a, 0, &[]).await;
    let result = acceptor.await.unwrap();
    assert!(matches!(result, Err(Error::Stopping)));
    assert!(crane_b.is_stopped());
}

#[tokio::test(flavor = "multi_thread")]
async fn accept_loop_times_out_without_traffic() {
    let (_ship_a, ship_b) = TestShip::pair(false, 1024);
    let crane_b = Crane::new(
        Arc::new(ship_b),
        None,
        Some(Arc::new(Identity::create("main"))),
        crane_opts(1024),
        Arc::new(CraneMetrics::default()),
    );

    let result = crane_b.start().await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(matches!(crane_b.stop_reason(), Some(Error::Timeout(_))));
}
