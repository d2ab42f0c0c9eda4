//! Keel cryptography.
//!
//! Everything key-shaped lives here:
//! - Ed25519 identity keypairs and X25519 key-exchange keypairs
//! - Certificate issuance and verification (self-signed and CA-signed)
//! - HKDF-style session key derivation with role disambiguation
//! - The per-packet AEAD cipher (AES-256-GCM, sequence-derived IVs)
//! - 16-bit wire sequence expansion with duplicate rejection
//!
//! Private keys and derived secrets are wiped (`zeroize`) as soon as they
//! are no longer needed.

#![forbid(unsafe_code)]

pub mod armor;
pub mod cert;
pub mod cipher;
pub mod kdf;
pub mod keys;
pub mod seq;

pub use cert::{
    verify_signed_cert, CertVerifyError, CertVerifyOptions, TrustedCaKey, UnsignedCertPolicy,
    VerifiedCert, TRUSTED_CA_KEYS,
};
pub use cipher::{CipherError, PacketCipher};
pub use kdf::{derive_session_keys, SessionKdfInput, SessionKeys};
pub use keys::{calculate_public_key_id, KeyExchangeKeypair, SigningKeypair};
pub use seq::SequenceTracker;
