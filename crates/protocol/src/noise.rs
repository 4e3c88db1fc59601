//! Noise protocol handshake and transport encryption.
//!
//! Both ends of the attach link hold the same pre-shared [`AttachKey`],
//! provisioned into the guest before first contact. The `NNpsk0` pattern
//! mixes that key into the very first message, so a party without the key
//! cannot complete (or even produce a decryptable first message for) the
//! handshake. Ephemeral keys on both sides give forward secrecy.
//!
//! ## Noise NNpsk0 Pattern
//! ```text
//! -> psk, e
//! <- e, ee
//! ```

use snow::{Builder, HandshakeState, TransportState};

use crate::error::{ProtocolError, Result};
use crate::key::AttachKey;

/// The Noise protocol pattern used for handshakes.
///
/// Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s:
/// - NNpsk0: no static keys, pre-shared key mixed in before the first message
/// - 25519: Curve25519 for DH key exchange
/// - ChaChaPoly: ChaCha20-Poly1305 for AEAD
/// - BLAKE2s: BLAKE2s for hashing
const NOISE_PATTERN: &str = "Noise_NNpsk0_25519_ChaChaPoly_BLAKE2s";

/// Maximum size for a Noise protocol message.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// Overhead added by Noise encryption (Poly1305 tag).
pub const NOISE_OVERHEAD: usize = 16;

/// State of the Noise handshake process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Initiator: Ready to send first message (-> psk, e)
    InitiatorStart,
    /// Initiator: Waiting for response (<- e, ee)
    InitiatorWaitingForResponse,
    /// Responder: Waiting for first message (-> psk, e)
    ResponderStart,
    /// Responder: Ready to send response (<- e, ee)
    ResponderSendResponse,
    /// Handshake complete, ready for transport
    Complete,
}

/// Role in the Noise handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (host-side client)
    Initiator,
    /// Responds to the handshake (guest-side server)
    Responder,
}

/// A Noise protocol session for secure communication.
///
/// ## Usage
///
/// ```ignore
/// let mut initiator = NoiseSession::new_initiator(&key)?;
/// let msg1 = initiator.write_handshake_message(&[])?;
/// // Send msg1 to responder, receive msg2...
/// initiator.read_handshake_message(&msg2)?;
/// initiator.into_transport()?;
/// ```
pub struct NoiseSession {
    handshake: Option<HandshakeState>,
    transport: Option<TransportState>,
    phase: HandshakePhase,
    role: Role,
    buffer: Vec<u8>,
}

impl NoiseSession {
    /// Creates a new Noise session as the initiator (client).
    pub fn new_initiator(key: &AttachKey) -> Result<Self> {
        let handshake = Self::builder(key)?
            .build_initiator()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("failed to build initiator: {}", e)))?;

        Ok(Self {
            handshake: Some(handshake),
            transport: None,
            phase: HandshakePhase::InitiatorStart,
            role: Role::Initiator,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        })
    }

    /// Creates a new Noise session as the responder (server).
    pub fn new_responder(key: &AttachKey) -> Result<Self> {
        let handshake = Self::builder(key)?
            .build_responder()
            .map_err(|e| ProtocolError::HandshakeFailed(format!("failed to build responder: {}", e)))?;

        Ok(Self {
            handshake: Some(handshake),
            transport: None,
            phase: HandshakePhase::ResponderStart,
            role: Role::Responder,
            buffer: vec![0u8; MAX_NOISE_MESSAGE_SIZE],
        })
    }

    fn builder(key: &AttachKey) -> Result<Builder<'_>> {
        let params = NOISE_PATTERN.parse().map_err(|e| {
            ProtocolError::HandshakeFailed(format!("invalid noise pattern: {}", e))
        })?;
        Ok(Builder::new(params).psk(0, key.as_bytes()))
    }

    /// Returns the current handshake phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns the role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns whether the handshake is complete.
    pub fn is_handshake_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Writes the next handshake message.
    pub fn write_handshake_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let handshake = self.handshake.as_mut().ok_or(ProtocolError::HandshakeIncomplete)?;

        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorStart) => {
                HandshakePhase::InitiatorWaitingForResponse
            }
            (Role::Responder, HandshakePhase::ResponderSendResponse) => HandshakePhase::Complete,
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot write in current phase: {:?}",
                    self.phase
                )));
            }
        };

        let len = handshake.write_message(payload, &mut self.buffer)?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Reads a handshake message from the peer.
    ///
    /// A decryption failure here means the peer holds a different key.
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let handshake = self.handshake.as_mut().ok_or(ProtocolError::HandshakeIncomplete)?;

        let next = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::InitiatorWaitingForResponse) => {
                HandshakePhase::Complete
            }
            (Role::Responder, HandshakePhase::ResponderStart) => {
                HandshakePhase::ResponderSendResponse
            }
            _ => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "cannot read in current phase: {:?}",
                    self.phase
                )));
            }
        };

        let len = handshake.read_message(message, &mut self.buffer).map_err(|e| match e {
            snow::Error::Decrypt => {
                ProtocolError::AuthenticationFailed("peer does not hold the attach key".into())
            }
            other => other.into(),
        })?;
        self.phase = next;
        Ok(self.buffer[..len].to_vec())
    }

    /// Transitions from handshake to transport mode.
    pub fn into_transport(&mut self) -> Result<()> {
        if self.phase != HandshakePhase::Complete {
            return Err(ProtocolError::HandshakeIncomplete);
        }

        let handshake = self.handshake.take().ok_or(ProtocolError::HandshakeIncomplete)?;
        self.transport = Some(handshake.into_transport_mode()?);
        Ok(())
    }

    /// Encrypts a plaintext message for transport.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let transport = self.transport.as_mut().ok_or(ProtocolError::HandshakeIncomplete)?;

        if plaintext.len() > MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD {
            return Err(ProtocolError::Encryption(format!(
                "plaintext too large: {} bytes exceeds maximum of {} bytes",
                plaintext.len(),
                MAX_NOISE_MESSAGE_SIZE - NOISE_OVERHEAD
            )));
        }

        let len = transport.write_message(plaintext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }

    /// Decrypts a ciphertext message from transport.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let transport = self.transport.as_mut().ok_or(ProtocolError::HandshakeIncomplete)?;

        if ciphertext.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext too large: {} bytes exceeds maximum of {} bytes",
                ciphertext.len(),
                MAX_NOISE_MESSAGE_SIZE
            )));
        }

        let len = transport.read_message(ciphertext, &mut self.buffer)?;
        Ok(self.buffer[..len].to_vec())
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("is_transport", &self.transport.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_pair(client_key: &AttachKey, server_key: &AttachKey) -> (NoiseSession, NoiseSession) {
        let mut initiator = NoiseSession::new_initiator(client_key).unwrap();
        let mut responder = NoiseSession::new_responder(server_key).unwrap();

        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        responder.read_handshake_message(&msg1).unwrap();
        let msg2 = responder.write_handshake_message(&[]).unwrap();
        initiator.read_handshake_message(&msg2).unwrap();

        initiator.into_transport().unwrap();
        responder.into_transport().unwrap();
        (initiator, responder)
    }

    #[test]
    fn test_initiator_creation() {
        let session = NoiseSession::new_initiator(&AttachKey::generate()).unwrap();
        assert_eq!(session.role(), Role::Initiator);
        assert_eq!(session.phase(), HandshakePhase::InitiatorStart);
        assert!(!session.is_handshake_complete());
    }

    #[test]
    fn test_full_handshake_phases() {
        let key = AttachKey::generate();
        let mut initiator = NoiseSession::new_initiator(&key).unwrap();
        let mut responder = NoiseSession::new_responder(&key).unwrap();

        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        assert_eq!(initiator.phase(), HandshakePhase::InitiatorWaitingForResponse);

        responder.read_handshake_message(&msg1).unwrap();
        assert_eq!(responder.phase(), HandshakePhase::ResponderSendResponse);

        let msg2 = responder.write_handshake_message(&[]).unwrap();
        assert!(responder.is_handshake_complete());

        initiator.read_handshake_message(&msg2).unwrap();
        assert!(initiator.is_handshake_complete());
    }

    #[test]
    fn test_transport_roundtrip_both_directions() {
        let key = AttachKey::generate();
        let (mut client, mut server) = handshake_pair(&key, &key);

        let ct = client.encrypt(b"ls").unwrap();
        assert_eq!(server.decrypt(&ct).unwrap(), b"ls");

        let ct = server.encrypt(b"tee1 tee2 tee3").unwrap();
        assert_eq!(client.decrypt(&ct).unwrap(), b"tee1 tee2 tee3");
    }

    #[test]
    fn test_wrong_key_is_authentication_failure() {
        let mut initiator = NoiseSession::new_initiator(&AttachKey::generate()).unwrap();
        let mut responder = NoiseSession::new_responder(&AttachKey::generate()).unwrap();

        let msg1 = initiator.write_handshake_message(&[]).unwrap();
        let err = responder.read_handshake_message(&msg1).unwrap_err();
        assert!(matches!(err, ProtocolError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_cannot_encrypt_before_transport() {
        let mut session = NoiseSession::new_initiator(&AttachKey::generate()).unwrap();
        assert!(matches!(
            session.encrypt(b"x"),
            Err(ProtocolError::HandshakeIncomplete)
        ));
    }

    #[test]
    fn test_cannot_write_out_of_turn() {
        let mut responder = NoiseSession::new_responder(&AttachKey::generate()).unwrap();
        assert!(matches!(
            responder.write_handshake_message(&[]),
            Err(ProtocolError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn test_modified_ciphertext_fails_decryption() {
        let key = AttachKey::generate();
        let (mut client, mut server) = handshake_pair(&key, &key);

        let mut ct = client.encrypt(b"payload").unwrap();
        ct[0] ^= 0xFF;
        assert!(matches!(
            server.decrypt(&ct),
            Err(ProtocolError::Decryption(_))
        ));
    }

    #[test]
    fn test_oversized_plaintext_rejected() {
        let key = AttachKey::generate();
        let (mut client, _server) = handshake_pair(&key, &key);
        let big = vec![0u8; MAX_NOISE_MESSAGE_SIZE];
        assert!(matches!(
            client.encrypt(&big),
            Err(ProtocolError::Encryption(_))
        ));
    }
}
