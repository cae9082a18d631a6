//! Cryptographic identity and prekey management
//!
//! Owns a device's long-term identity key pair, its rotating signed prekey,
//! and the pool of one-time prekeys, and produces the public prekey bundles
//! peers consume to establish sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Pool size below which callers should schedule prekey replenishment
pub const PREKEY_LOW_WATER: usize = 5;

/// Identity key pair (Ed25519 for signing, X25519 for key exchange)
#[derive(Clone)]
pub struct IdentityKeyPair {
    /// Ed25519 signing key
    signing_key: SigningKey,
    /// X25519 private key (derived from signing key)
    x25519_private: StaticSecret,
    /// X25519 public key
    x25519_public: X25519PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);

        // Derive X25519 key from Ed25519 private key bytes
        let private_bytes = signing_key.to_bytes();
        let x25519_private = StaticSecret::from(private_bytes);
        let x25519_public = X25519PublicKey::from(&x25519_private);

        Self {
            signing_key,
            x25519_private,
            x25519_public,
        }
    }

    /// Get the Ed25519 public key for verification
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the X25519 public key for key exchange
    pub fn public_key(&self) -> X25519PublicKey {
        self.x25519_public
    }

    /// Get the X25519 private key (for internal use)
    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.x25519_private
    }

    /// Sign data with Ed25519
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Get public key as bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.x25519_public.to_bytes()
    }

    /// Serialize to bytes (for storage)
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let x25519_private = StaticSecret::from(signing_key.to_bytes());
        let x25519_public = X25519PublicKey::from(&x25519_private);

        Self {
            signing_key,
            x25519_private,
            x25519_public,
        }
    }
}

/// Signed prekey (medium-term, signed by identity key)
#[derive(Clone)]
pub struct SignedPreKey {
    /// Key ID
    pub id: u32,
    /// X25519 key pair
    private_key: StaticSecret,
    public_key: X25519PublicKey,
    /// Signature from identity key
    signature: Signature,
}

impl SignedPreKey {
    /// Generate a new signed prekey
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);

        // Sign the public key with identity
        let signature = identity.sign(public_key.as_bytes());

        Self {
            id,
            private_key,
            public_key,
            signature,
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }

    /// Verify signature against identity public key
    pub fn verify(&self, identity_public: &VerifyingKey) -> bool {
        identity_public
            .verify(self.public_key.as_bytes(), &self.signature)
            .is_ok()
    }
}

/// One-time prekey (ephemeral, used once)
#[derive(Clone)]
pub struct OneTimePreKey {
    /// Key ID
    pub id: u32,
    /// X25519 key pair
    private_key: StaticSecret,
    public_key: X25519PublicKey,
}

impl OneTimePreKey {
    /// Generate a new one-time prekey
    pub fn generate(id: u32) -> Self {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = X25519PublicKey::from(&private_key);

        Self {
            id,
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.public_key
    }

    pub(crate) fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }
}

/// Bundle of public keys shared with peers
///
/// A public-only snapshot, safe to hand to untrusted transports. Version 1
/// wire format; all key fields are base64 in the serialized form.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Wire format version
    pub version: u8,
    /// Issuing device
    pub device_id: String,
    /// Identity public key (X25519)
    #[serde(with = "crate::serde_b64::x25519")]
    pub identity_key: X25519PublicKey,
    /// Identity verifying key (Ed25519)
    #[serde(with = "crate::serde_b64::verifying_key")]
    pub identity_verifying_key: VerifyingKey,
    /// Signed prekey
    #[serde(with = "crate::serde_b64::x25519")]
    pub signed_prekey: X25519PublicKey,
    pub signed_prekey_id: u32,
    #[serde(with = "crate::serde_b64::signature")]
    pub signed_prekey_signature: Signature,
    /// Optional one-time prekey
    #[serde(with = "crate::serde_b64::otpk", default)]
    pub one_time_prekey: Option<(u32, X25519PublicKey)>,
}

impl PreKeyBundle {
    /// Verify the signed prekey signature
    pub fn verify(&self) -> bool {
        self.identity_verifying_key
            .verify(self.signed_prekey.as_bytes(), &self.signed_prekey_signature)
            .is_ok()
    }
}

/// A device's complete key material: identity, signed prekey, and the
/// one-time prekey pool.
///
/// One-time prekeys leave the available pool the moment they are placed into
/// a published bundle and are parked in a pending map until the matching
/// handshake message consumes them. A pending key is handed out exactly once.
pub struct DeviceIdentity {
    device_id: String,
    identity: IdentityKeyPair,
    signed_prekey: SignedPreKey,
    /// Available pool, in insertion order. Bundles take the first entry;
    /// callers needing uniform randomness must shuffle upstream.
    one_time_prekeys: Vec<OneTimePreKey>,
    /// Published but not yet consumed by a handshake
    pending_one_time_prekeys: HashMap<u32, OneTimePreKey>,
    next_signed_prekey_id: u32,
    created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Generate a fresh device identity with `one_time_key_count` one-time
    /// prekeys. No I/O; all randomness from the OS RNG.
    pub fn generate(device_id: &str, one_time_key_count: usize) -> Self {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity);

        let mut device = Self {
            device_id: device_id.to_string(),
            identity,
            signed_prekey,
            one_time_prekeys: Vec::with_capacity(one_time_key_count),
            pending_one_time_prekeys: HashMap::new(),
            next_signed_prekey_id: 2,
            created_at: Utc::now(),
        };
        for _ in 0..one_time_key_count {
            let id = device.unused_prekey_id();
            device.one_time_prekeys.push(OneTimePreKey::generate(id));
        }
        device
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn identity_keys(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn signed_prekey(&self) -> &SignedPreKey {
        &self.signed_prekey
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of one-time prekeys still available for bundles
    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// True once the pool has dropped below the low-water mark
    pub fn needs_replenishment(&self) -> bool {
        self.one_time_prekeys.len() < PREKEY_LOW_WATER
    }

    /// Build a bundle for publication.
    ///
    /// Takes the first available one-time prekey out of the pool and parks it
    /// until [`take_pending_prekey`](Self::take_pending_prekey) consumes it.
    /// An empty pool degrades to a bundle without a one-time prekey.
    pub fn create_prekey_bundle(&mut self) -> PreKeyBundle {
        let one_time_prekey = if self.one_time_prekeys.is_empty() {
            tracing::warn!(device_id = %self.device_id, "one-time prekey pool empty, issuing 3-DH bundle");
            None
        } else {
            let prekey = self.one_time_prekeys.remove(0);
            let public = (prekey.id, prekey.public_key());
            self.pending_one_time_prekeys.insert(prekey.id, prekey);
            Some(public)
        };

        PreKeyBundle {
            version: 1,
            device_id: self.device_id.clone(),
            identity_key: self.identity.public_key(),
            identity_verifying_key: self.identity.verifying_key(),
            signed_prekey: self.signed_prekey.public_key(),
            signed_prekey_id: self.signed_prekey.id,
            signed_prekey_signature: self.signed_prekey.signature(),
            one_time_prekey,
        }
    }

    /// Consume a published one-time prekey, exactly once
    pub fn take_pending_prekey(&mut self, id: u32) -> Option<OneTimePreKey> {
        self.pending_one_time_prekeys.remove(&id)
    }

    /// Top the pool back up to `target_count`. Generates only the deficit;
    /// a no-op when the pool is already at or above target.
    pub fn replenish_one_time_prekeys(&mut self, target_count: usize) {
        while self.one_time_prekeys.len() < target_count {
            let id = self.unused_prekey_id();
            self.one_time_prekeys.push(OneTimePreKey::generate(id));
        }
    }

    /// Replace the signed prekey pair and its signature. The old signed
    /// prekey is discarded; peers holding stale bundles will fail signature
    /// verification once the new bundle propagates.
    pub fn rotate_signed_prekey(&mut self) {
        let id = self.next_signed_prekey_id;
        self.next_signed_prekey_id += 1;
        self.signed_prekey = SignedPreKey::generate(id, &self.identity);
        tracing::debug!(device_id = %self.device_id, signed_prekey_id = id, "rotated signed prekey");
    }

    fn unused_prekey_id(&self) -> u32 {
        loop {
            let id: u32 = OsRng.gen();
            let taken = self.one_time_prekeys.iter().any(|k| k.id == id)
                || self.pending_one_time_prekeys.contains_key(&id);
            if !taken {
                return id;
            }
        }
    }

    /// Storage form with all key material base64-encoded
    pub fn to_stored(&self) -> DeviceIdentityData {
        DeviceIdentityData {
            device_id: self.device_id.clone(),
            identity_key: self.identity.to_bytes(),
            signed_prekey_id: self.signed_prekey.id,
            signed_prekey: self.signed_prekey.private_key.to_bytes(),
            signed_prekey_signature: self.signed_prekey.signature,
            one_time_prekeys: self
                .one_time_prekeys
                .iter()
                .map(|k| StoredPreKey {
                    id: k.id,
                    private_key: k.private_key.to_bytes(),
                })
                .collect(),
            pending_one_time_prekeys: self
                .pending_one_time_prekeys
                .values()
                .map(|k| StoredPreKey {
                    id: k.id,
                    private_key: k.private_key.to_bytes(),
                })
                .collect(),
            next_signed_prekey_id: self.next_signed_prekey_id,
            created_at: self.created_at,
        }
    }

    /// Rebuild from the storage form
    pub fn from_stored(data: DeviceIdentityData) -> Self {
        let identity = IdentityKeyPair::from_bytes(&data.identity_key);
        let private_key = StaticSecret::from(data.signed_prekey);
        let signed_prekey = SignedPreKey {
            id: data.signed_prekey_id,
            public_key: X25519PublicKey::from(&private_key),
            private_key,
            signature: data.signed_prekey_signature,
        };

        let restore = |stored: &StoredPreKey| {
            let private_key = StaticSecret::from(stored.private_key);
            OneTimePreKey {
                id: stored.id,
                public_key: X25519PublicKey::from(&private_key),
                private_key,
            }
        };

        Self {
            device_id: data.device_id,
            identity,
            signed_prekey,
            one_time_prekeys: data.one_time_prekeys.iter().map(restore).collect(),
            pending_one_time_prekeys: data
                .pending_one_time_prekeys
                .iter()
                .map(|stored| (stored.id, restore(stored)))
                .collect(),
            next_signed_prekey_id: data.next_signed_prekey_id,
            created_at: data.created_at,
        }
    }

    /// Serialize to JSON for the storage collaborator
    pub fn to_json(&self) -> Result<String, KeyError> {
        serde_json::to_string(&self.to_stored()).map_err(|_| KeyError::InvalidFormat)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, KeyError> {
        let data: DeviceIdentityData =
            serde_json::from_str(json).map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self::from_stored(data))
    }
}

/// Serializable form of [`DeviceIdentity`]. `created_at` round-trips as an
/// RFC 3339 timestamp.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceIdentityData {
    device_id: String,
    #[serde(with = "crate::serde_b64::key32")]
    identity_key: [u8; 32],
    signed_prekey_id: u32,
    #[serde(with = "crate::serde_b64::key32")]
    signed_prekey: [u8; 32],
    #[serde(with = "crate::serde_b64::signature")]
    signed_prekey_signature: Signature,
    one_time_prekeys: Vec<StoredPreKey>,
    #[serde(default)]
    pending_one_time_prekeys: Vec<StoredPreKey>,
    next_signed_prekey_id: u32,
    created_at: DateTime<Utc>,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredPreKey {
    id: u32,
    #[serde(with = "crate::serde_b64::key32")]
    private_key: [u8; 32],
}

/// Human-readable fingerprint of a public key, for out-of-band verification.
///
/// Deterministic 160-bit SHA-256 prefix, uppercase hex in 4-character groups:
/// `A1B2-C3D4-...` (10 groups).
pub fn fingerprint(public_key: &X25519PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_bytes());
    let hash = hasher.finalize();

    let hex_str = hex::encode(&hash[..20]).to_uppercase();
    let chunks: Vec<&str> = hex_str
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect();

    chunks.join("-")
}

/// Key-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key format")]
    InvalidFormat,
    #[error("Signature verification failed")]
    SignatureInvalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_generation() {
        let identity = IdentityKeyPair::generate();
        assert_eq!(identity.public_key_bytes().len(), 32);
    }

    #[test]
    fn test_identity_key_serialization() {
        let identity = IdentityKeyPair::generate();
        let bytes = identity.to_bytes();
        let restored = IdentityKeyPair::from_bytes(&bytes);
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_signed_prekey_verifies() {
        let identity = IdentityKeyPair::generate();
        let signed_prekey = SignedPreKey::generate(1, &identity);
        assert!(signed_prekey.verify(&identity.verifying_key()));

        let other = IdentityKeyPair::generate();
        assert!(!signed_prekey.verify(&other.verifying_key()));
    }

    #[test]
    fn test_device_identity_generation() {
        let device = DeviceIdentity::generate("device-1", 20);
        assert_eq!(device.device_id(), "device-1");
        assert_eq!(device.one_time_prekey_count(), 20);
        assert!(device
            .signed_prekey()
            .verify(&device.identity_keys().verifying_key()));
    }

    #[test]
    fn test_one_time_prekey_ids_unique() {
        let device = DeviceIdentity::generate("device-1", 50);
        let mut ids: Vec<u32> = device.one_time_prekeys.iter().map(|k| k.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn test_bundle_consumes_one_time_prekey() {
        let mut device = DeviceIdentity::generate("device-1", 3);
        let first_id = device.one_time_prekeys[0].id;

        let bundle = device.create_prekey_bundle();
        assert!(bundle.verify());
        assert_eq!(bundle.one_time_prekey.map(|(id, _)| id), Some(first_id));
        assert_eq!(device.one_time_prekey_count(), 2);

        // Consumed key is parked until a handshake takes it, exactly once
        assert!(device.take_pending_prekey(first_id).is_some());
        assert!(device.take_pending_prekey(first_id).is_none());
    }

    #[test]
    fn test_bundle_without_prekeys_degrades() {
        let mut device = DeviceIdentity::generate("device-1", 0);
        let bundle = device.create_prekey_bundle();
        assert!(bundle.verify());
        assert!(bundle.one_time_prekey.is_none());
    }

    #[test]
    fn test_replenish_only_deficit() {
        let mut device = DeviceIdentity::generate("device-1", 3);
        device.create_prekey_bundle();
        assert_eq!(device.one_time_prekey_count(), 2);

        device.replenish_one_time_prekeys(5);
        assert_eq!(device.one_time_prekey_count(), 5);

        // Already at target: idempotent
        device.replenish_one_time_prekeys(5);
        assert_eq!(device.one_time_prekey_count(), 5);
        device.replenish_one_time_prekeys(3);
        assert_eq!(device.one_time_prekey_count(), 5);
    }

    #[test]
    fn test_needs_replenishment() {
        let mut device = DeviceIdentity::generate("device-1", PREKEY_LOW_WATER);
        assert!(!device.needs_replenishment());
        device.create_prekey_bundle();
        assert!(device.needs_replenishment());
    }

    #[test]
    fn test_rotate_signed_prekey() {
        let mut device = DeviceIdentity::generate("device-1", 0);
        let old_public = device.signed_prekey().public_key();
        let old_id = device.signed_prekey().id;

        device.rotate_signed_prekey();

        assert_ne!(device.signed_prekey().public_key().as_bytes(), old_public.as_bytes());
        assert_ne!(device.signed_prekey().id, old_id);
        assert!(device
            .signed_prekey()
            .verify(&device.identity_keys().verifying_key()));
    }

    #[test]
    fn test_device_identity_round_trip() {
        let mut device = DeviceIdentity::generate("device-1", 7);
        device.create_prekey_bundle();

        let json = device.to_json().unwrap();
        let restored = DeviceIdentity::from_json(&json).unwrap();

        assert_eq!(restored.device_id(), device.device_id());
        assert_eq!(
            restored.identity_keys().public_key_bytes(),
            device.identity_keys().public_key_bytes()
        );
        assert_eq!(
            restored.signed_prekey().public_key().as_bytes(),
            device.signed_prekey().public_key().as_bytes()
        );
        assert_eq!(restored.one_time_prekey_count(), device.one_time_prekey_count());
        assert_eq!(
            restored.pending_one_time_prekeys.len(),
            device.pending_one_time_prekeys.len()
        );
        assert_eq!(restored.created_at(), device.created_at());

        let ids: Vec<u32> = device.one_time_prekeys.iter().map(|k| k.id).collect();
        let restored_ids: Vec<u32> = restored.one_time_prekeys.iter().map(|k| k.id).collect();
        assert_eq!(ids, restored_ids);
    }

    #[test]
    fn test_prekey_bundle_serialization() {
        let mut device = DeviceIdentity::generate("device-1", 1);
        let bundle = device.create_prekey_bundle();

        let json = serde_json::to_string(&bundle).unwrap();
        let restored: PreKeyBundle = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.version, 1);
        assert_eq!(restored.device_id, bundle.device_id);
        assert_eq!(restored.identity_key.as_bytes(), bundle.identity_key.as_bytes());
        assert_eq!(restored.one_time_prekey, bundle.one_time_prekey);
        assert!(restored.verify());
    }

    #[test]
    fn test_fingerprint_format() {
        let identity = IdentityKeyPair::generate();
        let fp = fingerprint(&identity.public_key());

        // 160 bits = 40 hex chars in 10 groups of 4 with 9 separators
        assert_eq!(fp.len(), 49);
        assert_eq!(fp.split('-').count(), 10);
        assert!(fp.split('-').all(|g| g.len() == 4));

        // Deterministic
        assert_eq!(fp, fingerprint(&identity.public_key()));

        let other = IdentityKeyPair::generate();
        assert_ne!(fp, fingerprint(&other.public_key()));
    }
}
