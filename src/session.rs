//! The session crypto context.
//!
//! A [`Session`] is the product of a completed handshake: one symmetric
//! key per direction, an outbound sequence counter, and an inbound replay
//! window. It lives only in memory and its key material is wiped on drop.
//!
//! Sealing derives the nonce deterministically from
//! (session id, direction, sequence), so no nonce travels on the wire,
//! and binds the frame's clear envelope fields (type, sequence, sender)
//! into the AEAD associated data. Opening checks the replay window before
//! touching the ciphertext and only advances it after authentication
//! succeeds, so forged frames cannot move the window.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;
use zeroize::Zeroize;

use crate::crypto::aead::{message_nonce, open, seal};
use crate::crypto::kdf::SessionKeyMaterial;
use crate::error::CoreError;
use crate::protocol::message::{generate_message_id, MessageType, WireMessage};
use crate::replay::ReplayWindow;

/// Which end of the handshake this session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the first key-exchange frame.
    Initiator,
    /// Replied to it.
    Responder,
}

/// Direction byte for initiator → responder traffic.
const DIRECTION_I2R: u8 = 0;
/// Direction byte for responder → initiator traffic.
const DIRECTION_R2I: u8 = 1;

impl Role {
    fn send_direction(self) -> u8 {
        match self {
            Role::Initiator => DIRECTION_I2R,
            Role::Responder => DIRECTION_R2I,
        }
    }

    fn recv_direction(self) -> u8 {
        match self {
            Role::Initiator => DIRECTION_R2I,
            Role::Responder => DIRECTION_I2R,
        }
    }
}

/// Live cryptographic state for one established peer connection.
pub struct Session {
    role: Role,
    session_id: [u8; 16],
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_seq: u64,
    recv_window: ReplayWindow,
    local_address: String,
    peer_address: String,
    established_at: i64,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
        self.session_id.zeroize();
    }
}

impl Session {
    /// Build a session from derived key material, orienting the
    /// directional keys by role.
    pub(crate) fn new(
        role: Role,
        material: SessionKeyMaterial,
        local_address: String,
        peer_address: String,
    ) -> Result<Self, CoreError> {
        let (send_key, recv_key) = match role {
            Role::Initiator => (
                material.initiator_to_responder,
                material.responder_to_initiator,
            ),
            Role::Responder => (
                material.responder_to_initiator,
                material.initiator_to_responder,
            ),
        };

        // A session whose directions share a key must never exist.
        if send_key == recv_key {
            return Err(CoreError::KeyExchangeFailed);
        }

        Ok(Self {
            role,
            session_id: material.session_id,
            send_key,
            recv_key,
            send_seq: 0,
            recv_window: ReplayWindow::new(),
            local_address,
            peer_address,
            established_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Our role in this session.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The authenticated peer address.
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Our own address, stamped as the sender of outbound frames.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// When the session was established, Unix seconds.
    pub fn established_at(&self) -> i64 {
        self.established_at
    }

    /// The sequence number the next outbound frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.send_seq
    }

    /// Highest inbound sequence accepted so far.
    pub fn highest_received(&self) -> Option<u64> {
        self.recv_window.highest()
    }

    /// Seal a plaintext into a wire frame.
    ///
    /// Sequence numbers are assigned in call order, strictly increasing,
    /// never reused. Keep-alive and disconnect frames go through this
    /// same path; there are no plaintext frames after the handshake.
    pub fn seal_outbound(
        &mut self,
        kind: MessageType,
        plaintext: &[u8],
    ) -> Result<WireMessage, CoreError> {
        if kind == MessageType::Handshake {
            return Err(CoreError::HandshakeMalformed(
                "handshake frames do not use the sealed path".into(),
            ));
        }

        let sequence = self.send_seq;
        let nonce = message_nonce(&self.session_id, self.role.send_direction(), sequence);
        let aad = frame_aad(kind, sequence, &self.local_address);
        let ciphertext = seal(&self.send_key, &nonce, &aad, plaintext)?;
        self.send_seq += 1;

        Ok(WireMessage::sealed(
            generate_message_id(),
            kind,
            self.local_address.clone(),
            BASE64.encode(ciphertext),
            sequence,
        ))
    }

    /// Open an inbound wire frame.
    ///
    /// Frames with a stale or already-seen sequence are rejected before
    /// any cryptography runs. An authentication failure leaves the replay
    /// window untouched, so an attacker cannot use forged frames to move
    /// it.
    pub fn open_inbound(&mut self, wire: &WireMessage) -> Result<Vec<u8>, CoreError> {
        if wire.kind == MessageType::Handshake {
            return Err(CoreError::SessionUnknown(wire.sender.clone()));
        }
        if wire.sender != self.peer_address {
            return Err(CoreError::SessionUnknown(wire.sender.clone()));
        }

        if !self.recv_window.is_fresh(wire.sequence) {
            debug!(
                peer = %self.peer_address,
                sequence = wire.sequence,
                "dropping replayed or stale frame"
            );
            return Err(CoreError::ReplayRejected {
                sequence: wire.sequence,
            });
        }

        let ciphertext = BASE64
            .decode(&wire.content)
            .map_err(|_| CoreError::AuthFailure)?;
        let nonce = message_nonce(&self.session_id, self.role.recv_direction(), wire.sequence);
        let aad = frame_aad(wire.kind, wire.sequence, &wire.sender);
        let plaintext = open(&self.recv_key, &nonce, &aad, &ciphertext)?;

        self.recv_window.record(wire.sequence);
        Ok(plaintext)
    }
}

/// Associated data binding a sealed frame to its clear envelope fields.
fn frame_aad(kind: MessageType, sequence: u64, sender: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + 8 + sender.len());
    aad.push(kind.wire_code());
    aad.extend_from_slice(&sequence.to_be_bytes());
    aad.extend_from_slice(sender.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::derive_session_keys;
    use crate::crypto::keys::EphemeralKeyPair;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn session_pair() -> (Session, Session) {
        let initiator_eph = EphemeralKeyPair::generate().unwrap();
        let responder_eph = EphemeralKeyPair::generate().unwrap();

        let initiator_pub = *initiator_eph.public();
        let responder_pub = *responder_eph.public();

        let shared_initiator = initiator_eph.diffie_hellman(&responder_pub).unwrap();
        let shared_responder = responder_eph.diffie_hellman(&initiator_pub).unwrap();

        let material_initiator = derive_session_keys(
            shared_initiator.as_bytes(),
            initiator_pub.as_bytes(),
            responder_pub.as_bytes(),
        );
        let material_responder = derive_session_keys(
            shared_responder.as_bytes(),
            initiator_pub.as_bytes(),
            responder_pub.as_bytes(),
        );

        let alice = Session::new(
            Role::Initiator,
            material_initiator,
            "alice.onion".into(),
            "bob.onion".into(),
        )
        .unwrap();
        let bob = Session::new(
            Role::Responder,
            material_responder,
            "bob.onion".into(),
            "alice.onion".into(),
        )
        .unwrap();

        (alice, bob)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut alice, mut bob) = session_pair();

        let wire = alice.seal_outbound(MessageType::Text, b"hello").unwrap();
        assert_eq!(wire.sequence, 0);
        assert_eq!(wire.sender, "alice.onion");

        let plaintext = bob.open_inbound(&wire).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let (mut alice, _bob) = session_pair();

        let w0 = alice.seal_outbound(MessageType::Text, b"a").unwrap();
        let w1 = alice.seal_outbound(MessageType::Keepalive, b"").unwrap();
        let w2 = alice.seal_outbound(MessageType::Text, b"b").unwrap();

        assert_eq!((w0.sequence, w1.sequence, w2.sequence), (0, 1, 2));
        assert_eq!(alice.next_sequence(), 3);
    }

    #[test]
    fn test_replayed_frame_rejected() {
        let (mut alice, mut bob) = session_pair();

        let wire = alice.seal_outbound(MessageType::Text, b"once").unwrap();
        assert!(bob.open_inbound(&wire).is_ok());

        // Exact replays are rejected however often they arrive.
        for _ in 0..3 {
            let result = bob.open_inbound(&wire);
            assert!(matches!(result, Err(CoreError::ReplayRejected { sequence: 0 })));
        }
    }

    #[test]
    fn test_auth_failure_does_not_advance_window() {
        let (mut alice, mut bob) = session_pair();

        let genuine = alice.seal_outbound(MessageType::Text, b"real").unwrap();

        let mut forged = genuine.clone();
        forged.content = BASE64.encode(b"garbage ciphertext");
        assert!(matches!(
            bob.open_inbound(&forged),
            Err(CoreError::AuthFailure)
        ));

        // The forgery must not have consumed sequence 0.
        assert_eq!(bob.open_inbound(&genuine).unwrap(), b"real");
    }

    #[test]
    fn test_out_of_order_delivery_within_window() {
        let (mut alice, mut bob) = session_pair();

        let w0 = alice.seal_outbound(MessageType::Text, b"first").unwrap();
        let w1 = alice.seal_outbound(MessageType::Text, b"second").unwrap();

        assert_eq!(bob.open_inbound(&w1).unwrap(), b"second");
        assert_eq!(bob.open_inbound(&w0).unwrap(), b"first");
        assert!(bob.open_inbound(&w0).is_err());
    }

    #[test]
    fn test_keepalive_shares_sequence_space() {
        let (mut alice, mut bob) = session_pair();

        let keepalive = alice.seal_outbound(MessageType::Keepalive, b"").unwrap();
        let text = alice.seal_outbound(MessageType::Text, b"after").unwrap();

        assert_eq!(keepalive.sequence, 0);
        assert_eq!(text.sequence, 1);
        assert!(bob.open_inbound(&keepalive).unwrap().is_empty());
        assert_eq!(bob.open_inbound(&text).unwrap(), b"after");
    }

    #[test]
    fn test_envelope_tampering_detected() {
        let (mut alice, mut bob) = session_pair();

        // Flipping the clear type field must break authentication.
        let mut wire = alice.seal_outbound(MessageType::Text, b"hi").unwrap();
        wire.kind = MessageType::Disconnect;
        assert!(matches!(
            bob.open_inbound(&wire),
            Err(CoreError::AuthFailure)
        ));
    }

    #[test]
    fn test_unknown_sender_rejected() {
        let (mut alice, mut bob) = session_pair();

        let mut wire = alice.seal_outbound(MessageType::Text, b"hi").unwrap();
        wire.sender = "mallory.onion".into();
        assert!(matches!(
            bob.open_inbound(&wire),
            Err(CoreError::SessionUnknown(_))
        ));
    }

    #[test]
    fn test_handshake_frames_not_sealed() {
        let (mut alice, _bob) = session_pair();
        assert!(alice.seal_outbound(MessageType::Handshake, b"x").is_err());
    }

    #[test]
    fn test_equal_direction_keys_rejected() {
        let material = SessionKeyMaterial {
            initiator_to_responder: [5u8; 32],
            responder_to_initiator: [5u8; 32],
            session_id: [1u8; 16],
        };
        let result = Session::new(Role::Initiator, material, "a".into(), "b".into());
        assert!(matches!(result, Err(CoreError::KeyExchangeFailed)));
    }
}
