//! WhisperLink Core Protocol
//!
//! End-to-end encrypted session layer: device identities and prekeys, X3DH
//! key agreement, Double Ratchet message encryption, single-shot hybrid
//! encryption, and chunked encrypted file streaming.
//!
//! This crate is a pure library. It performs no network or disk I/O and
//! exposes no async surface; every call is a synchronous computation or an
//! in-memory state transition. Transport and persistence of the opaque
//! bundles, ciphertexts, and serialized states it produces belong to the
//! surrounding application.
//!
//! A [`Session`] must be driven by one thread at a time; independent
//! sessions share nothing and run fully in parallel.

pub mod files;
pub mod keys;
pub mod ratchet;
pub mod sealed;
pub mod serde_b64;
pub mod session;
pub mod x3dh;

pub use files::{
    chunk_count, split_into_chunks, EncryptedChunk, FileChunk, FileError, FileStream, CHUNK_SIZE,
};
pub use keys::{
    fingerprint, DeviceIdentity, DeviceIdentityData, IdentityKeyPair, KeyError, OneTimePreKey,
    PreKeyBundle, SignedPreKey, PREKEY_LOW_WATER,
};
pub use ratchet::{
    DoubleRatchet, EncryptedMessage, RatchetError, RatchetHeader, RatchetStateData, HEADER_LEN,
};
pub use sealed::{open, seal, SealedError, SealedMessage};
pub use session::{InitialMessage, Session, SessionError};
pub use x3dh::{X3dh, X3dhError, X3dhKeys};
