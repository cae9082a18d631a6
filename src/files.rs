//! Encrypted file streaming
//!
//! Large files travel as independently encrypted fixed-size chunks under a
//! random per-file key. Each chunk binds its index as AEAD associated data,
//! so a transport cannot reorder or substitute chunks undetected, and the
//! receiver reassembles from any arrival order.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Fixed chunk size: 64 KiB
pub const CHUNK_SIZE: usize = 64 * 1024;

const NONCE_LEN: usize = 12;

/// A plaintext chunk of a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChunk {
    /// Position in the file, starting at 0
    pub index: u32,
    pub data: Vec<u8>,
    /// Set on the final (possibly short) chunk
    pub is_last: bool,
}

/// An encrypted chunk, safe to deliver in any order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedChunk {
    pub chunk_id: u32,
    #[serde(with = "crate::serde_b64")]
    pub encrypted_data: Vec<u8>,
    #[serde(with = "crate::serde_b64::nonce")]
    pub nonce: [u8; 12],
    pub is_last: bool,
}

/// Split a byte buffer into ordered chunks of [`CHUNK_SIZE`], the final one
/// short and flagged `is_last`. An empty buffer yields no chunks.
pub fn split_into_chunks(data: &[u8]) -> Vec<FileChunk> {
    let count = data.chunks(CHUNK_SIZE).count();
    data.chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| FileChunk {
            index: i as u32,
            data: chunk.to_vec(),
            is_last: i + 1 == count,
        })
        .collect()
}

/// Number of chunks a file of `size` bytes will produce
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// State of one in-flight file transfer, sender or receiver side
pub struct FileStream {
    file_id: String,
    total_chunks: u32,
    /// Decrypted chunks keyed by index; arrival order is unconstrained
    received: HashMap<u32, Vec<u8>>,
    /// Per-file symmetric key, delivered to the peer out of band
    key: [u8; 32],
}

impl FileStream {
    /// Sender side: fresh random key, chunk count derived from the size
    pub fn for_encryption(file_id: &str, size: u64) -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        Self {
            file_id: file_id.to_string(),
            total_chunks: chunk_count(size),
            received: HashMap::new(),
            key,
        }
    }

    /// Receiver side: key and expected chunk count arrive out of band
    pub fn for_decryption(file_id: &str, key: [u8; 32], total_chunks: u32) -> Self {
        Self {
            file_id: file_id.to_string(),
            total_chunks,
            received: HashMap::new(),
            key,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }

    /// The per-file key, for out-of-band delivery to the receiver
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Encrypt one chunk under the per-file key. Stateless per call; chunks
    /// may be encrypted concurrently.
    pub fn encrypt_chunk(&self, chunk: &FileChunk) -> Result<EncryptedChunk, FileError> {
        if chunk.index >= self.total_chunks {
            return Err(FileError::InvalidChunkIndex(chunk.index));
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| FileError::EncryptionFailed)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // The index as associated data pins the ciphertext to its position
        let aad = chunk.index.to_le_bytes();
        let encrypted_data = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &chunk.data,
                    aad: &aad,
                },
            )
            .map_err(|_| FileError::EncryptionFailed)?;

        Ok(EncryptedChunk {
            chunk_id: chunk.index,
            encrypted_data,
            nonce: nonce_bytes,
            is_last: chunk.is_last,
        })
    }

    /// Verify and store one received chunk, keyed by index
    pub fn decrypt_chunk(&mut self, chunk: &EncryptedChunk) -> Result<(), FileError> {
        if chunk.chunk_id >= self.total_chunks {
            return Err(FileError::InvalidChunkIndex(chunk.chunk_id));
        }

        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| FileError::AuthenticationFailed)?;
        let nonce = Nonce::from_slice(&chunk.nonce);
        let aad = chunk.chunk_id.to_le_bytes();

        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &chunk.encrypted_data,
                    aad: &aad,
                },
            )
            .map_err(|_| FileError::AuthenticationFailed)?;

        self.received.insert(chunk.chunk_id, plaintext);
        Ok(())
    }

    /// Concatenate all chunks in index order.
    ///
    /// Fails with [`FileError::Incomplete`] until every index has arrived;
    /// the stream stays alive so later chunks can still land.
    pub fn assemble(&self) -> Result<Vec<u8>, FileError> {
        if !self.is_complete() {
            return Err(FileError::Incomplete {
                received: self.received.len(),
                expected: self.total_chunks,
            });
        }

        let mut file = Vec::new();
        for index in 0..self.total_chunks {
            match self.received.get(&index) {
                Some(data) => file.extend_from_slice(data),
                None => {
                    return Err(FileError::Incomplete {
                        received: self.received.len(),
                        expected: self.total_chunks,
                    })
                }
            }
        }
        tracing::debug!(file_id = %self.file_id, chunks = self.total_chunks, "file assembled");
        Ok(file)
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// File streaming errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum FileError {
    #[error("Unknown file stream")]
    UnknownStream,
    #[error("Chunk index {0} out of range")]
    InvalidChunkIndex(u32),
    #[error("Chunk authentication failed")]
    AuthenticationFailed,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Incomplete file: received {received} of {expected} chunks")]
    Incomplete { received: usize, expected: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_split_sizes_and_flags() {
        let data = sample_file(CHUNK_SIZE * 2 + 100);
        let chunks = split_into_chunks(&data);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), CHUNK_SIZE);
        assert_eq!(chunks[1].data.len(), CHUNK_SIZE);
        assert_eq!(chunks[2].data.len(), 100);
        assert!(chunks[2].is_last);
        assert!(chunks[..2].iter().all(|c| !c.is_last));
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[test]
    fn test_split_exact_multiple() {
        let data = sample_file(CHUNK_SIZE);
        let chunks = split_into_chunks(&data);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
    }

    #[test]
    fn test_split_empty() {
        assert!(split_into_chunks(&[]).is_empty());
        assert_eq!(chunk_count(0), 0);
    }

    #[test]
    fn test_chunk_count_matches_split() {
        for len in [1usize, 100, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, CHUNK_SIZE * 3] {
            assert_eq!(
                chunk_count(len as u64) as usize,
                split_into_chunks(&sample_file(len)).len(),
                "mismatch at len {len}"
            );
        }
    }

    #[test]
    fn test_round_trip_in_order() {
        let data = sample_file(CHUNK_SIZE + 17);
        let sender = FileStream::for_encryption("file-1", data.len() as u64);
        let mut receiver = FileStream::for_decryption("file-1", *sender.key(), sender.total_chunks());

        for chunk in split_into_chunks(&data) {
            let encrypted = sender.encrypt_chunk(&chunk).unwrap();
            receiver.decrypt_chunk(&encrypted).unwrap();
        }

        assert_eq!(receiver.assemble().unwrap(), data);
    }

    #[test]
    fn test_round_trip_any_permutation() {
        let data = sample_file(CHUNK_SIZE * 3 + 5);
        let sender = FileStream::for_encryption("file-1", data.len() as u64);

        let encrypted: Vec<_> = split_into_chunks(&data)
            .iter()
            .map(|c| sender.encrypt_chunk(c).unwrap())
            .collect();

        for order in [[3usize, 1, 0, 2], [2, 3, 1, 0], [0, 1, 2, 3]] {
            let mut receiver =
                FileStream::for_decryption("file-1", *sender.key(), sender.total_chunks());
            for i in order {
                receiver.decrypt_chunk(&encrypted[i]).unwrap();
            }
            assert_eq!(receiver.assemble().unwrap(), data);
        }
    }

    #[test]
    fn test_incomplete_assembly_rejected() {
        let data = sample_file(CHUNK_SIZE * 2 + 1);
        let sender = FileStream::for_encryption("file-1", data.len() as u64);
        let mut receiver = FileStream::for_decryption("file-1", *sender.key(), sender.total_chunks());

        let chunks = split_into_chunks(&data);
        receiver
            .decrypt_chunk(&sender.encrypt_chunk(&chunks[0]).unwrap())
            .unwrap();
        receiver
            .decrypt_chunk(&sender.encrypt_chunk(&chunks[2]).unwrap())
            .unwrap();

        match receiver.assemble() {
            Err(FileError::Incomplete { received, expected }) => {
                assert_eq!(received, 2);
                assert_eq!(expected, 3);
            }
            other => panic!("expected incomplete error, got {:?}", other.map(|v| v.len())),
        }

        // The missing chunk can still arrive afterwards
        receiver
            .decrypt_chunk(&sender.encrypt_chunk(&chunks[1]).unwrap())
            .unwrap();
        assert_eq!(receiver.assemble().unwrap(), data);
    }

    #[test]
    fn test_tampered_chunk_rejected() {
        let data = sample_file(100);
        let sender = FileStream::for_encryption("file-1", data.len() as u64);
        let mut receiver = FileStream::for_decryption("file-1", *sender.key(), sender.total_chunks());

        let mut encrypted = sender.encrypt_chunk(&split_into_chunks(&data)[0]).unwrap();
        encrypted.encrypted_data[0] ^= 0x01;

        assert!(matches!(
            receiver.decrypt_chunk(&encrypted),
            Err(FileError::AuthenticationFailed)
        ));
        assert_eq!(receiver.received_count(), 0);
    }

    #[test]
    fn test_reindexed_chunk_rejected() {
        // A chunk moved to a different position must fail its index binding
        let data = sample_file(CHUNK_SIZE + 10);
        let sender = FileStream::for_encryption("file-1", data.len() as u64);
        let mut receiver = FileStream::for_decryption("file-1", *sender.key(), sender.total_chunks());

        let mut encrypted = sender.encrypt_chunk(&split_into_chunks(&data)[0]).unwrap();
        encrypted.chunk_id = 1;

        assert!(matches!(
            receiver.decrypt_chunk(&encrypted),
            Err(FileError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_out_of_range_chunk_rejected() {
        let sender = FileStream::for_encryption("file-1", 10);
        let chunk = FileChunk {
            index: 5,
            data: vec![1, 2, 3],
            is_last: false,
        };
        assert!(matches!(
            sender.encrypt_chunk(&chunk),
            Err(FileError::InvalidChunkIndex(5))
        ));
    }

    #[test]
    fn test_encrypted_chunk_serialization() {
        let data = sample_file(64);
        let sender = FileStream::for_encryption("file-1", data.len() as u64);
        let encrypted = sender.encrypt_chunk(&split_into_chunks(&data)[0]).unwrap();

        let json = serde_json::to_string(&encrypted).unwrap();
        let restored: EncryptedChunk = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.chunk_id, encrypted.chunk_id);
        assert_eq!(restored.encrypted_data, encrypted.encrypted_data);
        assert_eq!(restored.nonce, encrypted.nonce);
        assert_eq!(restored.is_last, encrypted.is_last);
    }
}
