//! Per-packet AEAD.
//!
//! AES-256-GCM with a 12-byte IV and a 16-byte tag appended to the
//! ciphertext, no associated data.  The IV is never sent: both sides derive
//! it from the base IV (from key derivation) plus the full 64-bit packet
//! number, so a captured packet cannot be replayed under a different
//! sequence number.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;

use crate::kdf::SessionKeys;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed")]
    Encrypt,
    /// Tag verification failed; the packet is garbage, tampered, or
    /// encrypted under different keys.
    #[error("decryption failed")]
    Decrypt,
}

/// Directional AEAD contexts for one connection.
pub struct PacketCipher {
    send: Aes256Gcm,
    recv: Aes256Gcm,
    iv_send: [u8; 12],
    iv_recv: [u8; 12],
}

impl PacketCipher {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            send: Aes256Gcm::new((&keys.key_send).into()),
            recv: Aes256Gcm::new((&keys.key_recv).into()),
            iv_send: keys.iv_send,
            iv_recv: keys.iv_recv,
        }
    }

    /// Encrypt a chunk under the given full packet number.
    ///
    /// Output is ciphertext with the 16-byte tag appended.
    pub fn encrypt(&self, full_seq: i64, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let iv = packet_iv(&self.iv_send, full_seq);
        self.send
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CipherError::Encrypt)
    }

    /// Decrypt a chunk received under the given full packet number.
    pub fn decrypt(&self, full_seq: i64, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let iv = packet_iv(&self.iv_recv, full_seq);
        self.recv
            .decrypt(Nonce::from_slice(&iv), ciphertext)
            .map_err(|_| CipherError::Decrypt)
    }
}

/// Per-packet IV: the first 8 bytes of the base IV, read little-endian,
/// plus the packet number (wrapping); the last 4 bytes pass through.
fn packet_iv(base: &[u8; 12], full_seq: i64) -> [u8; 12] {
    let mut iv = *base;
    let counter =
        u64::from_le_bytes(iv[..8].try_into().expect("8 bytes")).wrapping_add(full_seq as u64);
    iv[..8].copy_from_slice(&counter.to_le_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_ciphers() -> (PacketCipher, PacketCipher) {
        let a = SessionKeys {
            key_send: [1u8; 32],
            key_recv: [2u8; 32],
            iv_send: [3u8; 12],
            iv_recv: [4u8; 12],
        };
        let b = SessionKeys {
            key_send: [2u8; 32],
            key_recv: [1u8; 32],
            iv_send: [4u8; 12],
            iv_recv: [3u8; 12],
        };
        (PacketCipher::new(&a), PacketCipher::new(&b))
    }

    #[test]
    fn test_roundtrip() {
        let (a, b) = paired_ciphers();
        let ct = a.encrypt(1, b"payload bytes").unwrap();
        assert_eq!(ct.len(), b"payload bytes".len() + 16);
        assert_eq!(b.decrypt(1, &ct).unwrap(), b"payload bytes");
    }

    #[test]
    fn test_tamper_detected() {
        let (a, b) = paired_ciphers();
        let mut ct = a.encrypt(1, b"payload bytes").unwrap();
        for i in 0..ct.len() {
            ct[i] ^= 0x80;
            assert_eq!(b.decrypt(1, &ct), Err(CipherError::Decrypt));
            ct[i] ^= 0x80;
        }
        // Untouched it still decrypts.
        assert!(b.decrypt(1, &ct).is_ok());
    }

    #[test]
    fn test_wrong_sequence_number_fails() {
        let (a, b) = paired_ciphers();
        let ct = a.encrypt(7, b"payload").unwrap();
        assert_eq!(b.decrypt(8, &ct), Err(CipherError::Decrypt));
        assert!(b.decrypt(7, &ct).is_ok());
    }

    #[test]
    fn test_iv_counter_wraps() {
        let base = [0xFFu8; 12];
        let iv = packet_iv(&base, 1);
        // Low 8 bytes wrapped to zero, trailing bytes untouched.
        assert_eq!(&iv[..8], &[0u8; 8]);
        assert_eq!(&iv[8..], &[0xFF; 4]);
    }

    #[test]
    fn test_distinct_ivs_give_distinct_ciphertext() {
        let (a, _) = paired_ciphers();
        let c1 = a.encrypt(1, b"same").unwrap();
        let c2 = a.encrypt(2, b"same").unwrap();
        assert_ne!(c1, c2);
    }
}
