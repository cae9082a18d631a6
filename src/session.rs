//! Per-peer session management
//!
//! Orchestrates the handshake and ratchet into one session object per peer,
//! plus the in-flight file streams belonging to that peer. Sessions share no
//! state with each other; a single session must not be driven from two
//! threads at once, while independent sessions parallelize freely.

use std::collections::HashMap;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::files::{EncryptedChunk, FileChunk, FileError, FileStream};
use crate::keys::{DeviceIdentity, PreKeyBundle};
use crate::ratchet::{DoubleRatchet, EncryptedMessage, RatchetError};
use crate::x3dh::{X3dh, X3dhError};

/// First message of a session, sent alongside (or before) the first
/// ciphertext so the responder can run its side of the handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator's identity key
    #[serde(with = "crate::serde_b64::x25519")]
    pub identity_key: X25519PublicKey,
    /// Ephemeral key from X3DH
    #[serde(with = "crate::serde_b64::x25519")]
    pub ephemeral_key: X25519PublicKey,
    /// Initiator's first ratchet public key
    #[serde(with = "crate::serde_b64::x25519")]
    pub ratchet_key: X25519PublicKey,
    /// Which one-time prekey the bundle carried, if any
    pub used_one_time_prekey_id: Option<u32>,
}

impl InitialMessage {
    /// Serialize to bytes: three 32-byte keys, then a presence byte and an
    /// optional u32 LE prekey id.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(101);
        bytes.extend_from_slice(self.identity_key.as_bytes());
        bytes.extend_from_slice(self.ephemeral_key.as_bytes());
        bytes.extend_from_slice(self.ratchet_key.as_bytes());
        match self.used_one_time_prekey_id {
            Some(id) => {
                bytes.push(1);
                bytes.extend_from_slice(&id.to_le_bytes());
            }
            None => bytes.push(0),
        }
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        let parse_key = |range: std::ops::Range<usize>| -> Result<X25519PublicKey, SessionError> {
            let array: [u8; 32] = bytes
                .get(range)
                .and_then(|s| s.try_into().ok())
                .ok_or(SessionError::DeserializationFailed)?;
            Ok(X25519PublicKey::from(array))
        };

        let identity_key = parse_key(0..32)?;
        let ephemeral_key = parse_key(32..64)?;
        let ratchet_key = parse_key(64..96)?;

        let used_one_time_prekey_id = match bytes.get(96) {
            Some(0) if bytes.len() == 97 => None,
            Some(1) if bytes.len() == 101 => {
                let id: [u8; 4] = bytes[97..101]
                    .try_into()
                    .map_err(|_| SessionError::DeserializationFailed)?;
                Some(u32::from_le_bytes(id))
            }
            _ => return Err(SessionError::DeserializationFailed),
        };

        Ok(Self {
            identity_key,
            ephemeral_key,
            ratchet_key,
            used_one_time_prekey_id,
        })
    }
}

/// A secure messaging session with one peer
pub struct Session {
    /// Ratchet state; None until a handshake completes
    ratchet: Option<DoubleRatchet>,
    /// Peer's identity public key, once known
    remote_identity: Option<X25519PublicKey>,
    /// In-flight file transfers by file ID
    file_streams: HashMap<String, FileStream>,
}

impl Session {
    /// Create an uninitialized session. Message calls fail with
    /// [`SessionError::NotEstablished`] until a handshake runs.
    pub fn new() -> Self {
        Self {
            ratchet: None,
            remote_identity: None,
            file_streams: HashMap::new(),
        }
    }

    /// Initiate a session from the peer's published bundle.
    ///
    /// Runs the X3DH sender flow with a fresh ephemeral key and seeds the
    /// ratchet against the bundle's signed prekey. The returned
    /// [`InitialMessage`] must reach the peer so it can run
    /// [`accept`](Self::accept).
    pub fn initiate(
        &mut self,
        identity: &DeviceIdentity,
        their_bundle: &PreKeyBundle,
    ) -> Result<InitialMessage, SessionError> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let keys = X3dh::initiate(identity.identity_keys(), &ephemeral, their_bundle)?;

        let ratchet = DoubleRatchet::init_initiator(keys.root_key(), &their_bundle.signed_prekey);
        let initial = InitialMessage {
            identity_key: identity.identity_keys().public_key(),
            ephemeral_key: X25519PublicKey::from(&ephemeral),
            ratchet_key: ratchet.public_key(),
            used_one_time_prekey_id: their_bundle.one_time_prekey.map(|(id, _)| id),
        };

        self.ratchet = Some(ratchet);
        self.remote_identity = Some(their_bundle.identity_key);
        tracing::info!(peer = %their_bundle.device_id, "session initiated");

        Ok(initial)
    }

    /// Accept a session from an initiator's [`InitialMessage`].
    ///
    /// Consumes the referenced pending one-time prekey from the identity
    /// store; a second handshake naming the same prekey id is rejected.
    pub fn accept(
        &mut self,
        identity: &mut DeviceIdentity,
        initial: &InitialMessage,
    ) -> Result<(), SessionError> {
        let one_time_prekey = match initial.used_one_time_prekey_id {
            Some(id) => Some(
                identity
                    .take_pending_prekey(id)
                    .ok_or(SessionError::UnknownPreKey(id))?,
            ),
            None => None,
        };

        let keys = X3dh::respond(
            identity.identity_keys(),
            identity.signed_prekey(),
            one_time_prekey.as_ref(),
            &initial.identity_key,
            &initial.ephemeral_key,
        )?;

        self.ratchet = Some(DoubleRatchet::init_responder(
            keys.root_key(),
            identity.signed_prekey().private_key().clone(),
        ));
        self.remote_identity = Some(initial.identity_key);
        tracing::info!("session accepted");

        Ok(())
    }

    /// Whether a handshake has completed
    pub fn is_established(&self) -> bool {
        self.ratchet.is_some()
    }

    /// The peer's identity key, once a handshake ran
    pub fn remote_identity(&self) -> Option<&X25519PublicKey> {
        self.remote_identity.as_ref()
    }

    /// Encrypt a message on the ratchet
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, SessionError> {
        let ratchet = self.ratchet.as_ref().ok_or(SessionError::NotEstablished)?;
        let (message, next) = ratchet.encrypt(plaintext)?;
        self.ratchet = Some(next);
        Ok(message)
    }

    /// Decrypt a message on the ratchet. A failed decrypt leaves the
    /// session state exactly as it was.
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, SessionError> {
        let ratchet = self.ratchet.as_ref().ok_or(SessionError::NotEstablished)?;
        let (plaintext, next) = ratchet.decrypt(message)?;
        self.ratchet = Some(next);
        Ok(plaintext)
    }

    /// Begin sending a file of `size` bytes. Returns the chunk count the
    /// receiver should expect. The per-file key is available from
    /// [`file_key`](Self::file_key) for out-of-band delivery.
    pub fn start_file_encryption(&mut self, file_id: &str, size: u64) -> u32 {
        let stream = FileStream::for_encryption(file_id, size);
        let total = stream.total_chunks();
        self.file_streams.insert(file_id.to_string(), stream);
        total
    }

    /// Begin receiving a file whose key and chunk count arrived out of band
    pub fn start_file_decryption(&mut self, file_id: &str, key: [u8; 32], total_chunks: u32) {
        self.file_streams
            .insert(file_id.to_string(), FileStream::for_decryption(file_id, key, total_chunks));
    }

    /// The per-file key of an in-flight stream
    pub fn file_key(&self, file_id: &str) -> Result<&[u8; 32], SessionError> {
        Ok(self.stream(file_id)?.key())
    }

    /// Encrypt one chunk of an in-flight outgoing file
    pub fn encrypt_file_chunk(
        &self,
        file_id: &str,
        chunk: &FileChunk,
    ) -> Result<EncryptedChunk, SessionError> {
        Ok(self.stream(file_id)?.encrypt_chunk(chunk)?)
    }

    /// Verify and store one received chunk, in any arrival order
    pub fn decrypt_file_chunk(
        &mut self,
        file_id: &str,
        chunk: &EncryptedChunk,
    ) -> Result<(), SessionError> {
        let stream = self
            .file_streams
            .get_mut(file_id)
            .ok_or(SessionError::File(FileError::UnknownStream))?;
        Ok(stream.decrypt_chunk(chunk)?)
    }

    /// Assemble a completed file and drop its stream state. Incomplete
    /// streams stay alive and report how many chunks are still missing.
    pub fn assemble_file(&mut self, file_id: &str) -> Result<Vec<u8>, SessionError> {
        let file = self.stream(file_id)?.assemble()?;
        self.file_streams.remove(file_id);
        Ok(file)
    }

    /// Drop all in-flight file streams and the ratchet state
    pub fn cleanup(&mut self) {
        self.file_streams.clear();
        self.ratchet = None;
        self.remote_identity = None;
    }

    fn stream(&self, file_id: &str) -> Result<&FileStream, SessionError> {
        self.file_streams
            .get(file_id)
            .ok_or(SessionError::File(FileError::UnknownStream))
    }

    #[cfg(test)]
    pub(crate) fn ratchet(&self) -> Option<&DoubleRatchet> {
        self.ratchet.as_ref()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Session errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("X3DH error: {0}")]
    X3dh(#[from] X3dhError),
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
    #[error("File error: {0}")]
    File(#[from] FileError),
    #[error("Session not established")]
    NotEstablished,
    #[error("Unknown one-time prekey id {0}")]
    UnknownPreKey(u32),
    #[error("Deserialization failed")]
    DeserializationFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (Session, Session) {
        let alice = DeviceIdentity::generate("alice", 2);
        let mut bob = DeviceIdentity::generate("bob", 2);

        let bundle = bob.create_prekey_bundle();

        let mut alice_session = Session::new();
        let initial = alice_session.initiate(&alice, &bundle).unwrap();

        let mut bob_session = Session::new();
        bob_session.accept(&mut bob, &initial).unwrap();

        (alice_session, bob_session)
    }

    #[test]
    fn test_session_establishment() {
        let (alice, bob) = session_pair();
        assert!(alice.is_established());
        assert!(bob.is_established());
        assert_eq!(
            alice.remote_identity().is_some(),
            bob.remote_identity().is_some()
        );
    }

    #[test]
    fn test_uninitialized_session_rejects_messages() {
        let mut session = Session::new();
        assert!(matches!(
            session.encrypt(b"too soon"),
            Err(SessionError::NotEstablished)
        ));

        let (mut alice, _) = session_pair();
        let message = alice.encrypt(b"hello").unwrap();
        let mut fresh = Session::new();
        assert!(matches!(
            fresh.decrypt(&message),
            Err(SessionError::NotEstablished)
        ));
    }

    #[test]
    fn test_bidirectional_messaging() {
        let (mut alice, mut bob) = session_pair();

        for i in 0..10 {
            let text = format!("Alice says: {}", i);
            let encrypted = alice.encrypt(text.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&encrypted).unwrap(), text.as_bytes());

            let reply = format!("Bob replies: {}", i);
            let encrypted = bob.encrypt(reply.as_bytes()).unwrap();
            assert_eq!(alice.decrypt(&encrypted).unwrap(), reply.as_bytes());
        }
    }

    #[test]
    fn test_accept_consumes_pending_prekey_once() {
        let alice = DeviceIdentity::generate("alice", 1);
        let mut bob = DeviceIdentity::generate("bob", 1);
        let bundle = bob.create_prekey_bundle();

        let mut alice_session = Session::new();
        let initial = alice_session.initiate(&alice, &bundle).unwrap();

        let mut bob_session = Session::new();
        bob_session.accept(&mut bob, &initial).unwrap();

        // Replayed handshake referencing the same prekey id is rejected
        let mut replayed = Session::new();
        let id = initial.used_one_time_prekey_id.unwrap();
        assert!(matches!(
            replayed.accept(&mut bob, &initial),
            Err(SessionError::UnknownPreKey(got)) if got == id
        ));
    }

    #[test]
    fn test_failed_decrypt_keeps_session_alive() {
        let (mut alice, mut bob) = session_pair();

        let message = alice.encrypt(b"intact").unwrap();
        let mut tampered = message.clone();
        tampered.ciphertext[0] ^= 0xFF;

        assert!(bob.decrypt(&tampered).is_err());
        assert_eq!(bob.decrypt(&message).unwrap(), b"intact");
    }

    #[test]
    fn test_cleanup_drops_state() {
        let (mut alice, _) = session_pair();
        alice.start_file_encryption("file-1", 1000);

        alice.cleanup();

        assert!(!alice.is_established());
        assert!(matches!(
            alice.file_key("file-1"),
            Err(SessionError::File(FileError::UnknownStream))
        ));
        assert!(matches!(
            alice.encrypt(b"gone"),
            Err(SessionError::NotEstablished)
        ));
    }

    #[test]
    fn test_file_stream_requires_start() {
        let (mut alice, _) = session_pair();
        let chunk = FileChunk {
            index: 0,
            data: vec![1, 2, 3],
            is_last: true,
        };
        assert!(matches!(
            alice.encrypt_file_chunk("nope", &chunk),
            Err(SessionError::File(FileError::UnknownStream))
        ));
        assert!(matches!(
            alice.assemble_file("nope"),
            Err(SessionError::File(FileError::UnknownStream))
        ));
    }

    #[test]
    fn test_file_transfer_between_sessions() {
        let (mut alice, mut bob) = session_pair();
        let data: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();

        let total = alice.start_file_encryption("photo", data.len() as u64);
        let key = *alice.file_key("photo").unwrap();
        bob.start_file_decryption("photo", key, total);

        // Deliver chunks in reverse order
        let chunks = crate::files::split_into_chunks(&data);
        for chunk in chunks.iter().rev() {
            let encrypted = alice.encrypt_file_chunk("photo", chunk).unwrap();
            bob.decrypt_file_chunk("photo", &encrypted).unwrap();
        }

        assert_eq!(bob.assemble_file("photo").unwrap(), data);

        // Stream state is single-use
        assert!(matches!(
            bob.assemble_file("photo"),
            Err(SessionError::File(FileError::UnknownStream))
        ));
    }

    #[test]
    fn test_initial_message_round_trip() {
        let alice = DeviceIdentity::generate("alice", 1);
        let mut bob = DeviceIdentity::generate("bob", 1);
        let bundle = bob.create_prekey_bundle();

        let mut session = Session::new();
        let initial = session.initiate(&alice, &bundle).unwrap();

        let bytes = initial.to_bytes();
        assert_eq!(bytes.len(), 101);
        let restored = InitialMessage::from_bytes(&bytes).unwrap();
        assert_eq!(restored.identity_key.as_bytes(), initial.identity_key.as_bytes());
        assert_eq!(restored.ephemeral_key.as_bytes(), initial.ephemeral_key.as_bytes());
        assert_eq!(restored.ratchet_key.as_bytes(), initial.ratchet_key.as_bytes());
        assert_eq!(restored.used_one_time_prekey_id, initial.used_one_time_prekey_id);

        // Without a one-time prekey the presence byte ends the message
        let bare = InitialMessage {
            used_one_time_prekey_id: None,
            ..initial
        };
        let bytes = bare.to_bytes();
        assert_eq!(bytes.len(), 97);
        assert!(InitialMessage::from_bytes(&bytes).unwrap().used_one_time_prekey_id.is_none());

        assert!(InitialMessage::from_bytes(&bytes[..50]).is_err());

        let json = serde_json::to_string(&bare).unwrap();
        let from_json: InitialMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json.ratchet_key.as_bytes(), bare.ratchet_key.as_bytes());
    }
}
