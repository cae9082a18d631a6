//! Double Ratchet message encryption
//!
//! Layers a per-message symmetric ratchet over a slower Diffie-Hellman
//! ratchet for forward secrecy and post-compromise security, with a
//! skipped-key cache so messages may arrive in any order.
//!
//! Every operation borrows the previous state and returns a fresh state
//! value. The input state is never touched, so callers can snapshot states
//! for persistence, and a failed decrypt leaves the session usable.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Info string for the root KDF
const ROOT_INFO: &[u8] = b"WhisperLink_Ratchet";

/// Wire size of a message header: 32-byte ratchet key, two u32 LE counters
pub const HEADER_LEN: usize = 40;

const NONCE_LEN: usize = 12;

/// Upper bound on cached skipped-message keys per session
const MAX_SKIP: usize = 1000;

/// Chain key for the symmetric ratchet
#[derive(Clone)]
struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    /// Derive message key and advance chain
    fn next(&mut self) -> [u8; 32] {
        let message_key = self.derive_key(0x01);
        self.key = self.derive_key(0x02);
        self.index += 1;
        message_key
    }

    // 0x01 labels the message key, 0x02 the next chain key. The labels must
    // stay distinct; sharing one would let a message key roll the chain.
    fn derive_key(&self, label: u8) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(&[label]);
        let result = mac.finalize().into_bytes();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        output
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Message header, sent in the clear but authenticated as AEAD associated
/// data.
///
/// Wire layout: 32-byte ratchet public key, u32 LE previous counter,
/// u32 LE message number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: X25519PublicKey,
    /// Messages sent in the sender's previous sending chain
    pub previous_counter: u32,
    /// Message number in the current chain
    pub message_number: u32,
}

impl RatchetHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..32].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_counter.to_le_bytes());
        bytes[36..40].copy_from_slice(&self.message_number.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        if bytes.len() != HEADER_LEN {
            return Err(RatchetError::InvalidHeader);
        }
        let key: [u8; 32] = bytes[..32].try_into().map_err(|_| RatchetError::InvalidHeader)?;
        let previous_counter =
            u32::from_le_bytes(bytes[32..36].try_into().map_err(|_| RatchetError::InvalidHeader)?);
        let message_number =
            u32::from_le_bytes(bytes[36..40].try_into().map_err(|_| RatchetError::InvalidHeader)?);
        Ok(Self {
            ratchet_key: X25519PublicKey::from(key),
            previous_counter,
            message_number,
        })
    }
}

impl Serialize for RatchetHeader {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        crate::serde_b64::serialize(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for RatchetHeader {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = crate::serde_b64::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// An encrypted message: clear-but-authenticated header plus
/// nonce-prefixed AEAD ciphertext.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub header: RatchetHeader,
    #[serde(with = "crate::serde_b64")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    /// Serialize for transport
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize from transport bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        serde_json::from_slice(bytes).map_err(|_| RatchetError::InvalidHeader)
    }
}

/// Double Ratchet session state
#[derive(Clone)]
pub struct DoubleRatchet {
    /// Root key, advanced by every DH ratchet step
    root_key: [u8; 32],
    /// Our current ratchet key pair
    dh_private: StaticSecret,
    dh_public: X25519PublicKey,
    /// Peer's last seen ratchet public key
    remote_public: Option<X25519PublicKey>,
    /// Sending chain; None between a DH ratchet step and the next encrypt
    sending_chain: Option<ChainKey>,
    /// Receiving chain for the current remote ratchet key
    receiving_chain: Option<ChainKey>,
    /// Length of the previous sending chain, echoed in headers
    prev_send_count: u32,
    /// Message keys derived for not-yet-seen messages, consumed exactly once
    skipped: HashMap<([u8; 32], u32), [u8; 32]>,
}

impl DoubleRatchet {
    /// Initialize as the session initiator.
    ///
    /// The peer's signed prekey acts as their first ratchet key, so the
    /// sending chain can be seeded immediately with one DH ratchet step.
    pub fn init_initiator(root_key: &[u8; 32], their_ratchet_key: &X25519PublicKey) -> Self {
        let dh_private = StaticSecret::random_from_rng(OsRng);
        let dh_public = X25519PublicKey::from(&dh_private);

        let dh_output = dh_private.diffie_hellman(their_ratchet_key);
        let (root_key, chain_key) = kdf_root(root_key, dh_output.as_bytes());

        Self {
            root_key,
            dh_private,
            dh_public,
            remote_public: Some(*their_ratchet_key),
            sending_chain: Some(ChainKey::new(chain_key)),
            receiving_chain: None,
            prev_send_count: 0,
            skipped: HashMap::new(),
        }
    }

    /// Initialize as the responder.
    ///
    /// The signed prekey pair that the initiator ratcheted against serves as
    /// our initial ratchet key; chains are established when the first
    /// message arrives.
    pub fn init_responder(root_key: &[u8; 32], ratchet_key: StaticSecret) -> Self {
        let dh_public = X25519PublicKey::from(&ratchet_key);

        Self {
            root_key: *root_key,
            dh_private: ratchet_key,
            dh_public,
            remote_public: None,
            sending_chain: None,
            receiving_chain: None,
            prev_send_count: 0,
            skipped: HashMap::new(),
        }
    }

    /// Our current ratchet public key
    pub fn public_key(&self) -> X25519PublicKey {
        self.dh_public
    }

    #[cfg(test)]
    pub(crate) fn root_key_bytes(&self) -> &[u8; 32] {
        &self.root_key
    }

    #[cfg(test)]
    pub(crate) fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt a message, returning the successor state.
    ///
    /// If the last DH ratchet step deferred the sending chain, it is derived
    /// here first (this is the sending half of the ratchet step).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(EncryptedMessage, Self), RatchetError> {
        let mut next = self.clone();

        if next.sending_chain.is_none() {
            let remote = next.remote_public.ok_or(RatchetError::NotInitialized)?;
            let dh_output = next.dh_private.diffie_hellman(&remote);
            let (root_key, chain_key) = kdf_root(&next.root_key, dh_output.as_bytes());
            next.root_key = root_key;
            next.sending_chain = Some(ChainKey::new(chain_key));
        }

        let (message_key, message_number) = match next.sending_chain.as_mut() {
            Some(chain) => {
                let key = chain.next();
                (key, chain.index - 1)
            }
            None => return Err(RatchetError::NotInitialized),
        };

        let header = RatchetHeader {
            ratchet_key: next.dh_public,
            previous_counter: next.prev_send_count,
            message_number,
        };
        let ciphertext = aead_encrypt(&message_key, &header.to_bytes(), plaintext)?;

        Ok((EncryptedMessage { header, ciphertext }, next))
    }

    /// Decrypt a message, returning the successor state.
    ///
    /// Resolves the message key from the skipped-key cache or by walking the
    /// receiving chain forward, caching every intermediate key on the way.
    /// A header carrying an unknown ratchet key triggers a DH ratchet step
    /// first. Authentication failure leaves no partial plaintext and no
    /// state change (the input state is untouched either way).
    pub fn decrypt(&self, message: &EncryptedMessage) -> Result<(Vec<u8>, Self), RatchetError> {
        let mut next = self.clone();
        let header = &message.header;
        let header_bytes = header.to_bytes();

        // Out-of-order fast path: a key derived earlier, consumed exactly once
        let cache_id = (header.ratchet_key.to_bytes(), header.message_number);
        if let Some(message_key) = next.skipped.remove(&cache_id) {
            let plaintext = aead_decrypt(&message_key, &header_bytes, &message.ciphertext)?;
            return Ok((plaintext, next));
        }

        let known = next
            .remote_public
            .map(|pk| pk == header.ratchet_key)
            .unwrap_or(false);
        if !known {
            // Close out the old receiving chain before stepping past it
            next.skip_receiving_keys(header.previous_counter)?;
            next.dh_ratchet(&header.ratchet_key);
        }

        next.skip_receiving_keys(header.message_number)?;

        let message_key = match next.receiving_chain.as_mut() {
            Some(chain) if chain.index == header.message_number => chain.next(),
            Some(_) => return Err(RatchetError::DuplicateMessage),
            None => return Err(RatchetError::NotInitialized),
        };

        let plaintext = aead_decrypt(&message_key, &header_bytes, &message.ciphertext)?;
        Ok((plaintext, next))
    }

    /// Receiving half of a DH ratchet step: archive the sending chain
    /// length, advance the root key with the peer's new ratchet key, and
    /// generate a fresh pair. The sending half runs lazily on the next
    /// encrypt, which keeps both parties' root keys equal after a one-way
    /// exchange.
    fn dh_ratchet(&mut self, their_key: &X25519PublicKey) {
        self.prev_send_count = self.sending_chain.as_ref().map(|c| c.index).unwrap_or(0);

        let dh_output = self.dh_private.diffie_hellman(their_key);
        let (root_key, chain_key) = kdf_root(&self.root_key, dh_output.as_bytes());
        self.root_key = root_key;
        self.receiving_chain = Some(ChainKey::new(chain_key));
        self.remote_public = Some(*their_key);

        self.dh_private = StaticSecret::random_from_rng(OsRng);
        self.dh_public = X25519PublicKey::from(&self.dh_private);
        self.sending_chain = None;

        tracing::debug!("DH ratchet step");
    }

    /// Walk the receiving chain up to (not including) `until`, caching every
    /// intermediate message key for out-of-order delivery.
    fn skip_receiving_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        let remote = match self.remote_public {
            Some(remote) => remote.to_bytes(),
            None => return Ok(()),
        };
        let chain = match self.receiving_chain.as_mut() {
            Some(chain) => chain,
            None => return Ok(()),
        };

        if until > chain.index {
            let gap = (until - chain.index) as usize;
            if gap + self.skipped.len() > MAX_SKIP {
                return Err(RatchetError::TooManySkipped);
            }
            tracing::debug!(skipped = gap, "caching skipped message keys");
        }
        while chain.index < until {
            let index = chain.index;
            let message_key = chain.next();
            self.skipped.insert((remote, index), message_key);
        }
        Ok(())
    }

    /// Export the full state for caller-side persistence
    pub fn to_state(&self) -> RatchetStateData {
        RatchetStateData {
            root_key: self.root_key,
            dh_private: self.dh_private.to_bytes(),
            remote_public: self.remote_public,
            sending_chain: self.sending_chain.as_ref().map(ChainStateData::from),
            receiving_chain: self.receiving_chain.as_ref().map(ChainStateData::from),
            prev_send_count: self.prev_send_count,
            skipped: self
                .skipped
                .iter()
                .map(|((ratchet_key, message_number), message_key)| SkippedKeyData {
                    ratchet_key: *ratchet_key,
                    message_number: *message_number,
                    message_key: *message_key,
                })
                .collect(),
        }
    }

    /// Restore a state previously exported with [`to_state`](Self::to_state)
    pub fn from_state(state: RatchetStateData) -> Self {
        let dh_private = StaticSecret::from(state.dh_private);
        let dh_public = X25519PublicKey::from(&dh_private);
        let restore = |data: &ChainStateData| ChainKey {
            key: data.key,
            index: data.index,
        };

        Self {
            root_key: state.root_key,
            dh_private,
            dh_public,
            remote_public: state.remote_public,
            sending_chain: state.sending_chain.as_ref().map(restore),
            receiving_chain: state.receiving_chain.as_ref().map(restore),
            prev_send_count: state.prev_send_count,
            skipped: state
                .skipped
                .iter()
                .map(|s| ((s.ratchet_key, s.message_number), s.message_key))
                .collect(),
        }
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

/// Serializable ratchet state for persistence between calls
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetStateData {
    #[serde(with = "crate::serde_b64::key32")]
    root_key: [u8; 32],
    #[serde(with = "crate::serde_b64::key32")]
    dh_private: [u8; 32],
    #[serde(with = "crate::serde_b64::x25519_opt", default)]
    remote_public: Option<X25519PublicKey>,
    sending_chain: Option<ChainStateData>,
    receiving_chain: Option<ChainStateData>,
    prev_send_count: u32,
    skipped: Vec<SkippedKeyData>,
}

#[derive(Clone, Serialize, Deserialize)]
struct ChainStateData {
    #[serde(with = "crate::serde_b64::key32")]
    key: [u8; 32],
    index: u32,
}

impl From<&ChainKey> for ChainStateData {
    fn from(chain: &ChainKey) -> Self {
        Self {
            key: chain.key,
            index: chain.index,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKeyData {
    #[serde(with = "crate::serde_b64::key32")]
    ratchet_key: [u8; 32],
    message_number: u32,
    #[serde(with = "crate::serde_b64::key32")]
    message_key: [u8; 32],
}

/// Root key derivation: HKDF-SHA256 keyed by the old root over the DH output
fn kdf_root(root_key: &[u8; 32], dh_output: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut output = [0u8; 64];
    hk.expand(ROOT_INFO, &mut output)
        .expect("64 bytes is a valid HKDF-SHA256 output length");

    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);

    output.zeroize();
    (new_root, chain_key)
}

/// AES-256-GCM with a random nonce prepended to the ciphertext
fn aead_encrypt(key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, RatchetError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| RatchetError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend(ciphertext);

    Ok(result)
}

fn aead_decrypt(key: &[u8; 32], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, RatchetError> {
    if ciphertext.len() < NONCE_LEN {
        return Err(RatchetError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| RatchetError::DecryptionFailed)?;
    let nonce = Nonce::from_slice(&ciphertext[..NONCE_LEN]);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext[NONCE_LEN..],
                aad,
            },
        )
        .map_err(|_| RatchetError::DecryptionFailed)
}

/// Ratchet errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RatchetError {
    #[error("Ratchet not initialized")]
    NotInitialized,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid message header")]
    InvalidHeader,
    #[error("Too many skipped messages")]
    TooManySkipped,
    #[error("Message key already consumed")]
    DuplicateMessage,
}
