//! Core Keel wire types and protocol constants.
//!
//! This crate provides:
//! - The endpoint identity model
//! - Certificate and session-crypt wire envelopes (protobuf messages)
//! - End-reason code ranges shared between peers
//! - Protocol version constants

#![forbid(unsafe_code)]

pub mod end_reason;
pub mod identity;
pub mod messages;

pub use identity::Identity;
pub use messages::{
    decode_msg, encode_msg, CertKeyType, Certificate, CryptKeyType, SessionCryptInfo,
    SignedCertificate, SignedSessionCryptInfo,
};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION_CURRENT: u32 = 4;

/// Oldest peer protocol version we will talk to.
pub const PROTOCOL_VERSION_MIN: u32 = 4;

/// Largest message the API will accept for send.
pub const MAX_MESSAGE_SIZE_SEND: usize = 512 * 1024;

/// AEAD auth tag appended to every encrypted chunk.
pub const ENCRYPTION_TAG_SIZE: usize = 16;

/// A packet-number jump beyond this is treated as fatal desynchronization.
pub const MAX_PACKET_NUMBER_GAP: i64 = 0x4000;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid identity string: {0}")]
    InvalidIdentity(String),
}
