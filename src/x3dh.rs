//! X3DH (Extended Triple Diffie-Hellman) key agreement
//!
//! One-shot handshake deriving a shared root key and initial chain key from
//! a published prekey bundle, without the bundle's owner being online.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};

/// Info string for HKDF
const X3DH_INFO: &[u8] = b"WhisperLink_X3DH";

/// Handshake output: root key and initial chain key, consumed immediately to
/// seed a ratchet and then dropped.
pub struct X3dhKeys {
    root_key: [u8; 32],
    chain_key: [u8; 32],
}

impl X3dhKeys {
    pub fn root_key(&self) -> &[u8; 32] {
        &self.root_key
    }

    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }
}

impl Drop for X3dhKeys {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.chain_key.zeroize();
    }
}

/// X3DH errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum X3dhError {
    #[error("Invalid prekey bundle signature")]
    InvalidSignature,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// X3DH key agreement
pub struct X3dh;

impl X3dh {
    /// Initiator side: derive session keys from the responder's bundle.
    ///
    /// The bundle signature is checked before any DH computation; a bad
    /// signature aborts the handshake with no key material derived.
    pub fn initiate(
        identity: &IdentityKeyPair,
        ephemeral: &StaticSecret,
        their_bundle: &PreKeyBundle,
    ) -> Result<X3dhKeys, X3dhError> {
        if !their_bundle.verify() {
            return Err(X3dhError::InvalidSignature);
        }

        // DH1 = DH(IK_A, SPK_B)
        let dh1 = identity.private_key().diffie_hellman(&their_bundle.signed_prekey);

        // DH2 = DH(EK_A, IK_B)
        let dh2 = ephemeral.diffie_hellman(&their_bundle.identity_key);

        // DH3 = DH(EK_A, SPK_B)
        let dh3 = ephemeral.diffie_hellman(&their_bundle.signed_prekey);

        // DH4 = DH(EK_A, OPK_B) if a one-time prekey is present
        let dh4 = their_bundle
            .one_time_prekey
            .as_ref()
            .map(|(_, opk)| ephemeral.diffie_hellman(opk));

        let mut dh_concat = Vec::with_capacity(128);
        dh_concat.extend_from_slice(dh1.as_bytes());
        dh_concat.extend_from_slice(dh2.as_bytes());
        dh_concat.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_concat.extend_from_slice(dh4.as_bytes());
        }

        let keys = Self::kdf(&dh_concat)?;
        dh_concat.zeroize();

        Ok(keys)
    }

    /// Responder side: the mirror image of [`initiate`](Self::initiate).
    ///
    /// Each DH term pairs the same two keys as on the initiator side, with
    /// the roles of private and public halves swapped.
    pub fn respond(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&OneTimePreKey>,
        their_identity_key: &X25519PublicKey,
        their_ephemeral_key: &X25519PublicKey,
    ) -> Result<X3dhKeys, X3dhError> {
        // DH1 = DH(SPK_B, IK_A)
        let dh1 = signed_prekey.private_key().diffie_hellman(their_identity_key);

        // DH2 = DH(IK_B, EK_A)
        let dh2 = identity.private_key().diffie_hellman(their_ephemeral_key);

        // DH3 = DH(SPK_B, EK_A)
        let dh3 = signed_prekey.private_key().diffie_hellman(their_ephemeral_key);

        // DH4 = DH(OPK_B, EK_A) if a one-time prekey was used
        let dh4 = one_time_prekey.map(|opk| opk.private_key().diffie_hellman(their_ephemeral_key));

        let mut dh_concat = Vec::with_capacity(128);
        dh_concat.extend_from_slice(dh1.as_bytes());
        dh_concat.extend_from_slice(dh2.as_bytes());
        dh_concat.extend_from_slice(dh3.as_bytes());
        if let Some(ref dh4) = dh4 {
            dh_concat.extend_from_slice(dh4.as_bytes());
        }

        let keys = Self::kdf(&dh_concat)?;
        dh_concat.zeroize();

        Ok(keys)
    }

    /// HKDF-SHA256 over 0xFF*32 || DH1 || DH2 || DH3 [|| DH4], expanded to
    /// 64 bytes: first half root key, second half chain key.
    fn kdf(input: &[u8]) -> Result<X3dhKeys, X3dhError> {
        let mut ikm = vec![0xFFu8; 32];
        ikm.extend_from_slice(input);

        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut output = [0u8; 64];
        hk.expand(X3DH_INFO, &mut output)
            .map_err(|_| X3dhError::KeyDerivationFailed)?;
        ikm.zeroize();

        let mut root_key = [0u8; 32];
        let mut chain_key = [0u8; 32];
        root_key.copy_from_slice(&output[..32]);
        chain_key.copy_from_slice(&output[32..]);
        output.zeroize();

        Ok(X3dhKeys { root_key, chain_key })
    }
}
