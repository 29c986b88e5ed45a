//! The per-peer handshake state machine.
//!
//! Both sides run the same machine; they differ only in who sends the
//! first key-exchange frame:
//!
//! 1. The initiator generates an ephemeral key pair and sends its signed
//!    public key (`Idle → KeyExchangeSent`).
//! 2. The responder, on receiving that key while idle, generates its own
//!    pair and replies (`Idle → KeyExchangeReceived`).
//! 3. Once both ephemeral keys are known, each side computes the shared
//!    secret, derives directional session keys, and the machine is
//!    consumed into a [`Session`]. The ephemeral private key does not
//!    survive this step, so a later compromise of either long-term key
//!    cannot decrypt recorded traffic.
//!
//! Long-term identity keys never encrypt anything. They sign the
//! ephemeral key, and the receiver re-derives the sender's network
//! address from the identity key — the address is a cryptographic
//! commitment to it — to authenticate who is on the other end.
//!
//! Any malformed payload, signature failure, address mismatch, or timeout
//! moves the machine to `Failed`, which is terminal for the attempt; a
//! retry starts a fresh machine from `Idle`.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::Verifier;
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::crypto::kdf::derive_session_keys;
use crate::crypto::keys::EphemeralKeyPair;
use crate::error::CoreError;
use crate::identity::{derive_address, Identity};
use crate::protocol::message::{HandshakePayload, PROTOCOL_VERSION};
use crate::session::{Role, Session};

/// Where a handshake attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Nothing sent or received yet.
    Idle,
    /// We sent our ephemeral key and are waiting for the peer's.
    KeyExchangeSent,
    /// We received the peer's key while idle and replied with ours.
    KeyExchangeReceived,
    /// Session keys were derived; the machine has been consumed.
    Established,
    /// The attempt failed. Terminal; start a new machine to retry.
    Failed,
}

/// Why a handshake attempt failed, as reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailReason {
    /// No completion within the configured window.
    Timeout,
    /// A payload was structurally or cryptographically invalid.
    Malformed,
    /// The key exchange produced unusable material.
    KeyExchange,
    /// The underlying transport failed mid-handshake.
    Transport,
}

impl HandshakeFailReason {
    /// Classify a core error for the `HandshakeFailed` event.
    pub fn from_error(error: &CoreError) -> Self {
        match error {
            CoreError::HandshakeTimeout => Self::Timeout,
            CoreError::HandshakeMalformed(_) | CoreError::SerializationFailed(_) => Self::Malformed,
            CoreError::KeyExchangeFailed | CoreError::EntropyFailure => Self::KeyExchange,
            _ => Self::Transport,
        }
    }
}

impl fmt::Display for HandshakeFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Malformed => "malformed",
            Self::KeyExchange => "key exchange",
            Self::Transport => "transport",
        };
        f.write_str(label)
    }
}

/// One handshake attempt with one peer.
pub struct Handshake {
    identity: Arc<Identity>,
    /// The address we dialed, if we are the outbound side. The peer must
    /// prove it owns this address.
    expected_peer: Option<String>,
    /// The peer address authenticated from the received identity key.
    peer_address: Option<String>,
    peer_ephemeral: Option<PublicKey>,
    ephemeral: Option<EphemeralKeyPair>,
    role: Option<Role>,
    stage: HandshakeStage,
}

impl Handshake {
    /// Start a new attempt. `expected_peer` is the dialed address for
    /// outbound connections, `None` when accepting an unknown inbound peer.
    pub fn new(identity: Arc<Identity>, expected_peer: Option<String>) -> Self {
        Self {
            identity,
            expected_peer,
            peer_address: None,
            peer_ephemeral: None,
            ephemeral: None,
            role: None,
            stage: HandshakeStage::Idle,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// The authenticated peer address, once a valid payload was received.
    pub fn peer_address(&self) -> Option<&str> {
        self.peer_address.as_deref()
    }

    /// Whether both ephemeral keys are known and the machine can be
    /// consumed into a session.
    pub fn is_ready(&self) -> bool {
        self.ephemeral.is_some() && self.peer_ephemeral.is_some()
    }

    /// Take the initiator role: generate an ephemeral key pair and produce
    /// the first key-exchange payload. `Idle → KeyExchangeSent`.
    pub fn initiate(&mut self) -> Result<HandshakePayload, CoreError> {
        if self.stage != HandshakeStage::Idle {
            self.abort();
            return Err(CoreError::HandshakeMalformed(
                "key exchange already started".into(),
            ));
        }

        let ephemeral = match EphemeralKeyPair::generate() {
            Ok(pair) => pair,
            Err(e) => {
                self.abort();
                return Err(e);
            }
        };

        let payload = self.signed_payload(&ephemeral);
        self.ephemeral = Some(ephemeral);
        self.role = Some(Role::Initiator);
        self.stage = HandshakeStage::KeyExchangeSent;
        Ok(payload)
    }

    /// Process the peer's key-exchange payload.
    ///
    /// Returns our own payload to send back when the peer initiated
    /// (`Idle → KeyExchangeReceived`), or `None` when this completes our
    /// own initiation (`KeyExchangeSent`, now ready).
    pub fn receive_peer_key(
        &mut self,
        payload: &HandshakePayload,
    ) -> Result<Option<HandshakePayload>, CoreError> {
        match self.process_peer_key(payload) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn process_peer_key(
        &mut self,
        payload: &HandshakePayload,
    ) -> Result<Option<HandshakePayload>, CoreError> {
        if payload.version != PROTOCOL_VERSION {
            return Err(CoreError::HandshakeMalformed(format!(
                "unsupported protocol version {}",
                payload.version
            )));
        }

        let peer_identity = payload.identity_verifying_key()?;
        let peer_ephemeral = payload.ephemeral_public_key()?;
        let signature = payload.decoded_signature()?;

        let signed = HandshakePayload::signed_data(
            payload.version,
            peer_identity.as_bytes(),
            peer_ephemeral.as_bytes(),
        );
        peer_identity
            .verify(&signed, &signature)
            .map_err(|_| CoreError::HandshakeMalformed("signature verification failed".into()))?;

        // The address is a commitment to the identity key: re-derive it and
        // hold the peer to the address we dialed.
        let derived = derive_address(&peer_identity);
        if let Some(expected) = &self.expected_peer {
            if *expected != derived {
                return Err(CoreError::HandshakeMalformed(format!(
                    "peer identity resolves to {}, expected {}",
                    derived, expected
                )));
            }
        }
        if derived == self.identity.address() {
            return Err(CoreError::HandshakeMalformed(
                "peer presented our own identity".into(),
            ));
        }

        match self.stage {
            HandshakeStage::Idle => {
                let ephemeral = EphemeralKeyPair::generate()?;
                let reply = self.signed_payload(&ephemeral);
                self.ephemeral = Some(ephemeral);
                self.peer_ephemeral = Some(peer_ephemeral);
                self.peer_address = Some(derived);
                self.role = Some(Role::Responder);
                self.stage = HandshakeStage::KeyExchangeReceived;
                Ok(Some(reply))
            }
            HandshakeStage::KeyExchangeSent => {
                if self.peer_ephemeral.is_some() {
                    return Err(CoreError::HandshakeMalformed(
                        "duplicate key exchange payload".into(),
                    ));
                }
                self.peer_ephemeral = Some(peer_ephemeral);
                self.peer_address = Some(derived);
                Ok(None)
            }
            _ => Err(CoreError::HandshakeMalformed(
                "key exchange payload in terminal stage".into(),
            )),
        }
    }

    /// Derive the session and consume the machine.
    ///
    /// Computes the ephemeral shared secret, derives the directional
    /// session keys, and discards the ephemeral private key in the same
    /// step.
    pub fn into_session(mut self) -> Result<Session, CoreError> {
        let role = self.role.ok_or_else(|| {
            CoreError::HandshakeMalformed("key exchange never started".into())
        })?;
        let ephemeral = self.ephemeral.take().ok_or_else(|| {
            CoreError::HandshakeMalformed("ephemeral key already consumed".into())
        })?;
        let peer_ephemeral = self.peer_ephemeral.ok_or_else(|| {
            CoreError::HandshakeMalformed("peer key not received".into())
        })?;
        let peer_address = self.peer_address.clone().ok_or_else(|| {
            CoreError::HandshakeMalformed("peer not authenticated".into())
        })?;

        let own_public = *ephemeral.public();
        let shared = ephemeral.diffie_hellman(&peer_ephemeral)?;

        let (initiator_public, responder_public) = match role {
            Role::Initiator => (own_public, peer_ephemeral),
            Role::Responder => (peer_ephemeral, own_public),
        };
        let material = derive_session_keys(
            shared.as_bytes(),
            initiator_public.as_bytes(),
            responder_public.as_bytes(),
        );

        self.stage = HandshakeStage::Established;
        debug!(peer = %peer_address, ?role, "session keys derived");

        Session::new(
            role,
            material,
            self.identity.address().to_string(),
            peer_address,
        )
    }

    /// Move to the terminal `Failed` stage, discarding key material.
    pub fn abort(&mut self) {
        self.stage = HandshakeStage::Failed;
        self.ephemeral = None;
        self.peer_ephemeral = None;
    }

    fn signed_payload(&self, ephemeral: &EphemeralKeyPair) -> HandshakePayload {
        let identity_public = self.identity.verifying_key();
        let signed = HandshakePayload::signed_data(
            PROTOCOL_VERSION,
            identity_public.as_bytes(),
            ephemeral.public().as_bytes(),
        );
        let signature = self.identity.sign(&signed);

        HandshakePayload {
            version: PROTOCOL_VERSION,
            identity_key: BASE64.encode(identity_public.as_bytes()),
            ephemeral_key: BASE64.encode(ephemeral.public().as_bytes()),
            signature: BASE64.encode(signature.to_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::MessageType;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn identity_pair() -> (Arc<Identity>, Arc<Identity>) {
        (
            Arc::new(Identity::create().unwrap()),
            Arc::new(Identity::create().unwrap()),
        )
    }

    /// Run a complete handshake between two fresh identities.
    fn establish() -> (Session, Session) {
        let (alice, bob) = identity_pair();

        let mut initiator = Handshake::new(alice.clone(), Some(bob.address().to_string()));
        let mut responder = Handshake::new(bob, None);

        let first = initiator.initiate().unwrap();
        assert_eq!(initiator.stage(), HandshakeStage::KeyExchangeSent);

        let reply = responder.receive_peer_key(&first).unwrap().unwrap();
        assert_eq!(responder.stage(), HandshakeStage::KeyExchangeReceived);
        assert_eq!(responder.peer_address(), Some(alice.address()));

        assert!(initiator.receive_peer_key(&reply).unwrap().is_none());
        assert!(initiator.is_ready());
        assert!(responder.is_ready());

        (
            initiator.into_session().unwrap(),
            responder.into_session().unwrap(),
        )
    }

    #[test]
    fn test_two_party_scenario() {
        let (mut alice, mut bob) = establish();

        // First message flows at sequence zero and round-trips exactly.
        let wire = alice.seal_outbound(MessageType::Text, b"hello").unwrap();
        assert_eq!(wire.sequence, 0);

        let plaintext = bob.open_inbound(&wire).unwrap();
        assert_eq!(plaintext, b"hello");

        // And the reverse direction works with its own sequence space.
        let wire = bob.seal_outbound(MessageType::Text, b"hi alice").unwrap();
        assert_eq!(wire.sequence, 0);
        assert_eq!(alice.open_inbound(&wire).unwrap(), b"hi alice");
    }

    #[test]
    fn test_fresh_handshakes_derive_unrelated_sessions() {
        let (mut alice1, mut bob1) = establish();
        let (_alice2, mut bob2) = establish();

        // A frame sealed in one session cannot be opened by another, even
        // between the same code paths: every attempt uses fresh ephemerals.
        let wire = alice1.seal_outbound(MessageType::Text, b"hello").unwrap();
        assert!(bob2.open_inbound(&wire).is_err());
        assert_eq!(bob1.open_inbound(&wire).unwrap(), b"hello");
    }

    #[test]
    fn test_version_mismatch_is_malformed() {
        let (alice, bob) = identity_pair();
        let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));
        let mut responder = Handshake::new(bob, None);

        let mut first = initiator.initiate().unwrap();
        first.version = 99;

        let result = responder.receive_peer_key(&first);
        assert!(matches!(result, Err(CoreError::HandshakeMalformed(_))));
        assert_eq!(responder.stage(), HandshakeStage::Failed);
    }

    #[test]
    fn test_tampered_ephemeral_key_fails_signature() {
        let (alice, bob) = identity_pair();
        let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));
        let mut responder = Handshake::new(bob, None);

        let mut first = initiator.initiate().unwrap();
        first.ephemeral_key = BASE64.encode([7u8; 32]);

        let result = responder.receive_peer_key(&first);
        assert!(matches!(result, Err(CoreError::HandshakeMalformed(_))));
    }

    #[test]
    fn test_address_mismatch_rejected() {
        let (alice, bob) = identity_pair();
        let stranger = Arc::new(Identity::create().unwrap());

        // Alice dialed Bob, but a different identity answers.
        let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));
        let mut imposter = Handshake::new(stranger, None);

        let first = initiator.initiate().unwrap();
        let reply = imposter.receive_peer_key(&first).unwrap().unwrap();

        let result = initiator.receive_peer_key(&reply);
        assert!(matches!(result, Err(CoreError::HandshakeMalformed(_))));
        assert_eq!(initiator.stage(), HandshakeStage::Failed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let (alice, bob) = identity_pair();
        let mut responder = Handshake::new(bob.clone(), None);
        responder.abort();

        let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));
        let first = initiator.initiate().unwrap();

        let result = responder.receive_peer_key(&first);
        assert!(matches!(result, Err(CoreError::HandshakeMalformed(_))));
        assert_eq!(responder.stage(), HandshakeStage::Failed);
    }

    #[test]
    fn test_into_session_requires_peer_key() {
        let (alice, bob) = identity_pair();
        let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));
        initiator.initiate().unwrap();

        assert!(!initiator.is_ready());
        assert!(initiator.into_session().is_err());
    }

    #[test]
    fn test_double_initiate_rejected() {
        let (alice, bob) = identity_pair();
        let mut initiator = Handshake::new(alice, Some(bob.address().to_string()));

        initiator.initiate().unwrap();
        assert!(initiator.initiate().is_err());
        assert_eq!(initiator.stage(), HandshakeStage::Failed);
    }

    #[test]
    fn test_self_connection_rejected() {
        let alice = Arc::new(Identity::create().unwrap());

        let mut initiator = Handshake::new(alice.clone(), None);
        let mut responder = Handshake::new(alice, None);

        let first = initiator.initiate().unwrap();
        let result = responder.receive_peer_key(&first);
        assert!(matches!(result, Err(CoreError::HandshakeMalformed(_))));
    }
}
