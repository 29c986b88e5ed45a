//! End-to-end protocol scenarios: handshake, sealed traffic, replay
//! rejection, and the manager stack over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use sotto::config::CoreConfig;
use sotto::identity::Identity;
use sotto::manager::ConnectionManager;
use sotto::protocol::{Handshake, HandshakeStage, MessageType};
use sotto::session::Session;
use sotto::transport::{TcpAcceptor, TcpConnector};
use sotto::{CoreError, Event};

/// Run the two-message key exchange between two fresh identities.
fn establish_pair() -> (Session, Session) {
    let alice = Arc::new(Identity::create().unwrap());
    let bob = Arc::new(Identity::create().unwrap());

    let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));
    let mut responder = Handshake::new(bob, None);

    let first = initiator.initiate().unwrap();
    let reply = responder.receive_peer_key(&first).unwrap().unwrap();
    assert!(initiator.receive_peer_key(&reply).unwrap().is_none());

    (
        initiator.into_session().unwrap(),
        responder.into_session().unwrap(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[test]
fn handshake_then_hello_at_sequence_zero() {
    let (mut alice, mut bob) = establish_pair();

    let wire = alice.seal_outbound(MessageType::Text, b"hello").unwrap();
    assert_eq!(wire.sequence, 0);
    assert_eq!(bob.open_inbound(&wire).unwrap(), b"hello");
}

#[test]
fn long_conversation_keeps_sequences_monotonic() {
    let (mut alice, mut bob) = establish_pair();

    for expected_seq in 0..256u64 {
        let body = format!("message {}", expected_seq);
        let wire = alice
            .seal_outbound(MessageType::Text, body.as_bytes())
            .unwrap();
        assert_eq!(wire.sequence, expected_seq);
        assert_eq!(bob.open_inbound(&wire).unwrap(), body.as_bytes());
    }

    assert_eq!(bob.highest_received(), Some(255));
}

#[test]
fn replay_rejected_regardless_of_interleaving() {
    let (mut alice, mut bob) = establish_pair();

    let w0 = alice.seal_outbound(MessageType::Text, b"zero").unwrap();
    let w1 = alice.seal_outbound(MessageType::Text, b"one").unwrap();
    let w2 = alice.seal_outbound(MessageType::Text, b"two").unwrap();

    assert!(bob.open_inbound(&w0).is_ok());
    assert!(bob.open_inbound(&w2).is_ok()); // out of order, still fresh
    assert!(matches!(
        bob.open_inbound(&w0),
        Err(CoreError::ReplayRejected { sequence: 0 })
    ));
    assert!(bob.open_inbound(&w1).is_ok()); // gap filled late
    assert!(matches!(
        bob.open_inbound(&w1),
        Err(CoreError::ReplayRejected { sequence: 1 })
    ));
}

#[test]
fn sessions_from_different_handshakes_do_not_interoperate() {
    let (mut alice_one, _bob_one) = establish_pair();
    let (_alice_two, mut bob_two) = establish_pair();

    let wire = alice_one
        .seal_outbound(MessageType::Text, b"captured")
        .unwrap();
    assert!(bob_two.open_inbound(&wire).is_err());
}

#[test]
fn identity_backup_roundtrip() {
    let original = Identity::create().unwrap();
    let blob = original.export("abc").unwrap();

    assert!(matches!(
        Identity::import(&blob, "xyz"),
        Err(CoreError::WrongPassword)
    ));

    let restored = Identity::import(&blob, "abc").unwrap();
    assert_eq!(restored.address(), original.address());
    assert_eq!(restored.public_key_base64(), original.public_key_base64());
    assert_eq!(restored.created_at(), original.created_at());
}

#[test]
fn abandoned_handshake_is_terminal() {
    let alice = Arc::new(Identity::create().unwrap());
    let bob = Arc::new(Identity::create().unwrap());

    let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));
    initiator.initiate().unwrap();
    initiator.abort();

    assert_eq!(initiator.stage(), HandshakeStage::Failed);
    assert!(initiator.into_session().is_err());
}

#[tokio::test]
async fn managers_exchange_text_over_loopback() {
    init_tracing();

    let alice_identity = Arc::new(Identity::create().unwrap());
    let bob_identity = Arc::new(Identity::create().unwrap());

    let alice_connector = Arc::new(TcpConnector::new());
    let bob_connector = Arc::new(TcpConnector::new());

    let (alice, mut alice_events) = ConnectionManager::new(
        alice_identity,
        CoreConfig::default(),
        alice_connector.clone(),
    );
    let (bob, mut bob_events) =
        ConnectionManager::new(bob_identity, CoreConfig::default(), bob_connector);

    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
    let bob_socket = acceptor.local_addr().unwrap();
    bob.start_accept_loop(Box::new(acceptor));

    alice_connector.add_route(bob.local_address(), &bob_socket.to_string());

    let bob_address = bob.local_address().to_string();
    alice.connect(&bob_address).unwrap();

    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::HandshakeCompleted { .. }
    ));
    assert!(matches!(
        next_event(&mut bob_events).await,
        Event::HandshakeCompleted { .. }
    ));

    let id = alice
        .send_text(&bob_address, "hello over tcp")
        .await
        .unwrap();

    match next_event(&mut bob_events).await {
        Event::MessageReceived {
            address,
            plaintext,
            meta,
        } => {
            assert_eq!(address, alice.local_address());
            assert_eq!(plaintext, b"hello over tcp");
            assert_eq!(meta.id, id);
            assert_eq!(meta.sequence, 0);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Graceful teardown reaches the peer as a sealed disconnect.
    alice.shutdown().await;
    assert!(matches!(
        next_event(&mut bob_events).await,
        Event::ConnectionLost { .. }
    ));
}
