//! Certificate and session-crypt wire envelopes.
//!
//! These are protobuf messages; the outer envelopes carry the serialized
//! inner message as opaque bytes so that signatures are computed over the
//! exact encoded form, independent of field ordering on re-encode.

use prost::Message;

use crate::ProtoError;

/// Identity-key algorithm carried in a certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CertKeyType {
    Invalid = 0,
    Ed25519 = 1,
}

/// Key-exchange algorithm carried in session crypt info.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CryptKeyType {
    Invalid = 0,
    Curve25519 = 1,
}

/// Unsigned certificate payload.
///
/// Binding rules: a CA-signed cert with a non-empty
/// `gameserver_datacenter_ids` list is only valid for anonymous-gameserver
/// identities; every other CA-signed cert must bind an `app_id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Certificate {
    #[prost(enumeration = "CertKeyType", tag = "1")]
    pub key_type: i32,
    /// Raw Ed25519 public key (32 bytes).
    #[prost(bytes = "vec", tag = "2")]
    pub key_data: Vec<u8>,
    /// Steam account id, set when the identity is a Steam id.
    #[prost(fixed64, optional, tag = "4")]
    pub legacy_steam_id: Option<u64>,
    /// Rendered identity string (see `Identity::render`).
    #[prost(string, optional, tag = "11")]
    pub identity: Option<String>,
    #[prost(uint32, repeated, tag = "5")]
    pub gameserver_datacenter_ids: Vec<u32>,
    #[prost(fixed32, optional, tag = "8")]
    pub time_created: Option<u32>,
    #[prost(fixed32, optional, tag = "9")]
    pub time_expiry: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub app_id: Option<u32>,
}

/// Outer certificate envelope.  The unsigned form has no `ca_signature`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedCertificate {
    /// Serialized [`Certificate`].
    #[prost(bytes = "vec", tag = "4")]
    pub cert: Vec<u8>,
    #[prost(fixed64, optional, tag = "5")]
    pub ca_key_id: Option<u64>,
    /// Ed25519 signature (64 bytes) by the CA key over `cert`.
    #[prost(bytes = "vec", optional, tag = "6")]
    pub ca_signature: Option<Vec<u8>>,
}

impl SignedCertificate {
    pub fn has_ca_signature(&self) -> bool {
        self.ca_signature.is_some()
    }
}

/// Ephemeral session key-exchange parameters.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionCryptInfo {
    #[prost(enumeration = "CryptKeyType", tag = "1")]
    pub key_type: i32,
    /// Raw X25519 public key (32 bytes).
    #[prost(bytes = "vec", tag = "2")]
    pub key_data: Vec<u8>,
    /// Random 64 bits mixed into the key-derivation salt.
    #[prost(fixed64, tag = "3")]
    pub nonce: u64,
    #[prost(uint32, tag = "4")]
    pub protocol_version: u32,
}

/// Outer session-crypt envelope, signed by the sender's cert private key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedSessionCryptInfo {
    /// Serialized [`SessionCryptInfo`].
    #[prost(bytes = "vec", tag = "1")]
    pub info: Vec<u8>,
    /// Ed25519 signature (64 bytes) over `info`.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

pub fn encode_msg<M: Message>(msg: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)
        .expect("Vec<u8> encode cannot fail");
    buf
}

pub fn decode_msg<M: Message + Default>(bytes: &[u8]) -> Result<M, ProtoError> {
    M::decode(bytes).map_err(ProtoError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cert() -> Certificate {
        Certificate {
            key_type: CertKeyType::Ed25519 as i32,
            key_data: vec![7u8; 32],
            legacy_steam_id: None,
            identity: Some("str:peer-b".to_string()),
            gameserver_datacenter_ids: vec![],
            time_created: Some(1_700_000_000),
            time_expiry: Some(1_700_000_000 + 730 * 24 * 3600),
            app_id: Some(480),
        }
    }

    #[test]
    fn certificate_roundtrip() {
        let cert = sample_cert();
        let bytes = encode_msg(&cert);
        let decoded: Certificate = decode_msg(&bytes).unwrap();
        assert_eq!(decoded, cert);
    }

    #[test]
    fn signed_envelope_roundtrip() {
        let signed = SignedCertificate {
            cert: encode_msg(&sample_cert()),
            ca_key_id: Some(0x0123_4567_89ab_cdef),
            ca_signature: Some(vec![0xAA; 64]),
        };
        let bytes = encode_msg(&signed);
        let decoded: SignedCertificate = decode_msg(&bytes).unwrap();
        assert_eq!(decoded, signed);
        assert!(decoded.has_ca_signature());
    }

    #[test]
    fn crypt_info_roundtrip() {
        let info = SessionCryptInfo {
            key_type: CryptKeyType::Curve25519 as i32,
            key_data: vec![9u8; 32],
            nonce: 0xdead_beef_cafe_f00d,
            protocol_version: crate::PROTOCOL_VERSION_CURRENT,
        };
        let bytes = encode_msg(&info);
        let decoded: SessionCryptInfo = decode_msg(&bytes).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn garbage_rejected() {
        assert!(decode_msg::<Certificate>(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
