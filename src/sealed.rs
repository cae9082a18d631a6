//! Hybrid single-shot encryption
//!
//! Stateless ECDH-then-AEAD for one-off payloads where no ratchet session
//! exists yet, such as wrapping a file key alongside a handshake. A fresh
//! ephemeral key is burned per message; there is no forward secrecy beyond
//! that single use, so ongoing conversations belong on the ratchet.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Info string for the symmetric key derivation
const SEALED_INFO: &[u8] = b"WhisperLink_Sealed";

const NONCE_LEN: usize = 12;

/// A single-shot encrypted payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Sender's one-use ephemeral public key
    #[serde(with = "crate::serde_b64::x25519")]
    pub ephemeral_key: X25519PublicKey,
    /// Nonce-prefixed AEAD output
    #[serde(with = "crate::serde_b64")]
    pub ciphertext: Vec<u8>,
}

/// Errors from the single-shot primitive
#[derive(Debug, Clone, thiserror::Error)]
pub enum SealedError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Encrypt a payload to a recipient's long-term public key
pub fn seal(recipient: &X25519PublicKey, plaintext: &[u8]) -> Result<SealedMessage, SealedError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_key = X25519PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    let mut key = derive_key(shared.as_bytes()).map_err(|_| SealedError::EncryptionFailed)?;

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SealedError::EncryptionFailed)?;
    key.zeroize();
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SealedError::EncryptionFailed)?;

    let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
    ciphertext.extend_from_slice(&nonce_bytes);
    ciphertext.extend(sealed);

    Ok(SealedMessage {
        ephemeral_key,
        ciphertext,
    })
}

/// Decrypt a payload with the recipient's long-term private key
pub fn open(recipient: &StaticSecret, message: &SealedMessage) -> Result<Vec<u8>, SealedError> {
    if message.ciphertext.len() < NONCE_LEN {
        return Err(SealedError::DecryptionFailed);
    }

    let shared = recipient.diffie_hellman(&message.ephemeral_key);
    let mut key = derive_key(shared.as_bytes()).map_err(|_| SealedError::DecryptionFailed)?;

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SealedError::DecryptionFailed)?;
    key.zeroize();
    let nonce = Nonce::from_slice(&message.ciphertext[..NONCE_LEN]);

    cipher
        .decrypt(nonce, &message.ciphertext[NONCE_LEN..])
        .map_err(|_| SealedError::DecryptionFailed)
}

/// HKDF-SHA256 the raw shared secret into the AEAD key
fn derive_key(shared_secret: &[u8]) -> Result<[u8; 32], hkdf::InvalidLength> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(SEALED_INFO, &mut key)?;
    Ok(key)
}
