//! Identity and key-exchange keypairs.
//!
//! Certificates carry Ed25519 identity keys; the session handshake uses
//! ephemeral X25519 keys.  Private halves are zeroized on drop.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("not an ssh-ed25519 key")]
    NotSshEd25519,
    #[error("invalid base64 encoding")]
    InvalidBase64,
}

/// Ed25519 keypair used to sign certificates and session-crypt info.
pub struct SigningKeypair {
    signing_key: SigningKey,
}

impl SigningKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from raw signing key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Get the private key bytes.
    ///
    /// # Security
    /// Handle with care!  These bytes can recreate the identity.
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a message with this keypair.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// The key id of the public half (see [`calculate_public_key_id`]).
    pub fn public_key_id(&self) -> u64 {
        calculate_public_key_id(&self.public_key_bytes())
    }

    /// Render the public half as an OpenSSH `authorized_keys` line.
    pub fn public_key_openssh(&self, comment: &str) -> String {
        openssh_encode(&self.public_key_bytes(), comment)
    }
}

impl Drop for SigningKeypair {
    fn drop(&mut self) {
        // SigningKey zeroizes its own scalar on drop; nothing extra held here.
    }
}

/// Verify an Ed25519 signature against raw public key bytes.
///
/// Returns false for malformed keys or signatures rather than erroring;
/// callers treat all failures identically.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <&[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(key_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

/// Key id: first 8 bytes (little-endian u64) of SHA-256 over the raw
/// public key.  Used to locate CA keys in the trusted table.
pub fn calculate_public_key_id(public_key: &[u8; 32]) -> u64 {
    let digest = Sha256::digest(public_key);
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Ephemeral X25519 keypair for the session key exchange.
///
/// The private half is wiped when the keypair is dropped, and the handshake
/// drops it immediately after deriving the premaster secret.
pub struct KeyExchangeKeypair {
    secret: x25519_dalek::StaticSecret,
    public: [u8; 32],
}

impl KeyExchangeKeypair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let secret = x25519_dalek::StaticSecret::from(seed);
        seed.zeroize();
        let public = *x25519_dalek::PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    /// Diffie-Hellman against the peer's public key, producing the
    /// 32-byte premaster secret.
    ///
    /// Fails on malformed keys and on non-contributory results (low-order
    /// peer points).
    pub fn key_exchange(&self, peer_public: &[u8]) -> Result<[u8; 32], KeyError> {
        let bytes: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| KeyError::InvalidLength {
                expected: 32,
                got: peer_public.len(),
            })?;
        let shared = self
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(KeyError::InvalidPublicKey);
        }
        Ok(*shared.as_bytes())
    }
}

/// Encode an Ed25519 public key as an OpenSSH `authorized_keys` line.
pub fn openssh_encode(public_key: &[u8; 32], comment: &str) -> String {
    // Blob: string "ssh-ed25519" || string key
    let mut blob = Vec::with_capacity(4 + 11 + 4 + 32);
    blob.extend_from_slice(&11u32.to_be_bytes());
    blob.extend_from_slice(b"ssh-ed25519");
    blob.extend_from_slice(&32u32.to_be_bytes());
    blob.extend_from_slice(public_key);
    if comment.is_empty() {
        format!("ssh-ed25519 {}", BASE64.encode(&blob))
    } else {
        format!("ssh-ed25519 {} {}", BASE64.encode(&blob), comment)
    }
}

/// Parse an OpenSSH `authorized_keys` line back to raw key bytes.
pub fn openssh_decode(line: &str) -> Result<[u8; 32], KeyError> {
    let mut parts = line.split_whitespace();
    let kind = parts.next().ok_or(KeyError::NotSshEd25519)?;
    if kind != "ssh-ed25519" {
        return Err(KeyError::NotSshEd25519);
    }
    let blob_b64 = parts.next().ok_or(KeyError::NotSshEd25519)?;
    let blob = BASE64
        .decode(blob_b64)
        .map_err(|_| KeyError::InvalidBase64)?;
    // string "ssh-ed25519" || string key
    if blob.len() != 4 + 11 + 4 + 32
        || blob[..4] != 11u32.to_be_bytes()
        || &blob[4..15] != b"ssh-ed25519"
        || blob[15..19] != 32u32.to_be_bytes()
    {
        return Err(KeyError::NotSshEd25519);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&blob[19..]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let pair = SigningKeypair::generate();
        let msg = b"handshake bytes";
        let sig = pair.sign(msg);
        assert!(verify_signature(&pair.public_key_bytes(), msg, &sig));
        assert!(!verify_signature(&pair.public_key_bytes(), b"other", &sig));

        let mut bad = sig;
        bad[0] ^= 1;
        assert!(!verify_signature(&pair.public_key_bytes(), msg, &bad));
    }

    #[test]
    fn test_keypair_bytes_roundtrip() {
        let pair = SigningKeypair::generate();
        let restored = SigningKeypair::from_bytes(&pair.private_key_bytes());
        assert_eq!(restored.public_key_bytes(), pair.public_key_bytes());
    }

    #[test]
    fn test_key_exchange_agrees() {
        let a = KeyExchangeKeypair::generate();
        let b = KeyExchangeKeypair::generate();
        let ab = a.key_exchange(b.public_key_bytes()).unwrap();
        let ba = b.key_exchange(a.public_key_bytes()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_key_exchange_rejects_bad_keys() {
        let a = KeyExchangeKeypair::generate();
        assert!(a.key_exchange(&[0u8; 31]).is_err());
        // All-zero point is low order.
        assert!(a.key_exchange(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_openssh_roundtrip() {
        let pair = SigningKeypair::generate();
        let line = pair.public_key_openssh("480-ID12345");
        let decoded = openssh_decode(&line).unwrap();
        assert_eq!(decoded, pair.public_key_bytes());
    }

    #[test]
    fn test_openssh_rejects_other_types() {
        assert!(openssh_decode("ssh-rsa AAAA comment").is_err());
        assert!(openssh_decode("").is_err());
    }

    #[test]
    fn test_key_id_stable() {
        let key = [0x42u8; 32];
        assert_eq!(calculate_public_key_id(&key), calculate_public_key_id(&key));
        let other = [0x43u8; 32];
        assert_ne!(calculate_public_key_id(&key), calculate_public_key_id(&other));
    }
}
