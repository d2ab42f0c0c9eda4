//! Certificate issuance and verification.
//!
//! Two kinds of cert exist: CA-signed certs issued out of band by the
//! certtool, and unsigned self-signed certs generated on the fly for
//! anonymous endpoints.  Verification enforces the binding rules between a
//! cert, the identity it was issued to, and the local app.

use keel_proto::{
    decode_msg, encode_msg, CertKeyType, Certificate, Identity, SignedCertificate,
};
use thiserror::Error;
use tracing::warn;

use crate::keys::{verify_signature, SigningKeypair};

/// A CA public key we are willing to trust.
#[derive(Clone, Copy, Debug)]
pub struct TrustedCaKey {
    pub id: u64,
    pub public_key: [u8; 32],
}

/// Compiled-in trusted CA keys.
///
/// It's important that these are burned into the source, *not* loaded from a
/// file.  The threat model for tampering includes the local user; everything
/// outside this process is untrusted.
pub const TRUSTED_CA_KEYS: &[TrustedCaKey] = &[TrustedCaKey {
    id: 9717034061224079667,
    public_key: [
        0x5b, 0x9e, 0x21, 0xd3, 0x0f, 0x74, 0xc8, 0x91, 0x3a, 0x6d, 0xe2, 0x44, 0x8b, 0x01,
        0xaf, 0x5e, 0xc7, 0x39, 0xd0, 0x12, 0x68, 0xfa, 0x93, 0x4c, 0x0b, 0x77, 0x25, 0xe8,
        0x96, 0x41, 0x1d, 0xaa,
    ],
}];

/// How to treat a peer that presents a cert without a CA signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UnsignedCertPolicy {
    /// Accept silently (loopback pipes: it's definitely us).
    Allow,
    /// Accept, but log that the connection is not authenticated.
    #[default]
    AllowWarn,
    /// Reject.
    Deny,
}

/// Verification failure, partitioned the way end reasons are.
#[derive(Debug, Error)]
pub enum CertVerifyError {
    /// The cert itself is unacceptable (signature, binding, identity).
    #[error("{0}")]
    BadCert(String),
    /// The envelope is malformed or uses an unsupported algorithm.
    #[error("{0}")]
    BadCrypt(String),
}

/// Inputs that scope a verification to one connection.
pub struct CertVerifyOptions<'a> {
    /// Who we believe the peer is.
    pub expected_identity: &'a Identity,
    /// Our app; a cert bound to an app must be bound to this one.
    pub local_app_id: u32,
    pub unsigned_policy: UnsignedCertPolicy,
    /// Reject (rather than warn about) expired CA-signed certs.
    pub enforce_expiry: bool,
    /// Wall-clock seconds since the epoch.
    pub now_unix: u32,
}

/// A successfully verified peer certificate.
#[derive(Debug)]
pub struct VerifiedCert {
    pub cert: Certificate,
    /// Raw Ed25519 public key from the cert.
    pub public_key: [u8; 32],
    /// Identity the cert binds, if any.
    pub identity: Option<Identity>,
    pub ca_signed: bool,
}

/// Verify a peer's signed certificate envelope.
///
/// Checks, in order: inner decode and key sanity, CA signature against the
/// trusted table (or the unsigned-cert policy), datacenter/app binding
/// rules, the identity cross-check (with the anonymous self-signed special
/// case), and expiry.
pub fn verify_signed_cert(
    signed: &SignedCertificate,
    trusted: &[TrustedCaKey],
    opts: &CertVerifyOptions<'_>,
) -> Result<VerifiedCert, CertVerifyError> {
    let cert: Certificate = decode_msg(&signed.cert)
        .map_err(|_| CertVerifyError::BadCrypt("Cert failed protobuf decode".into()))?;

    if cert.key_type != CertKeyType::Ed25519 as i32 {
        return Err(CertVerifyError::BadCrypt(
            "Unsupported identity key type".into(),
        ));
    }
    let public_key: [u8; 32] = cert
        .key_data
        .as_slice()
        .try_into()
        .map_err(|_| CertVerifyError::BadCrypt("Cert has invalid identity key".into()))?;

    let ca_signed = signed.has_ca_signature();
    if let Some(signature) = &signed.ca_signature {
        let ca_key_id = signed.ca_key_id.unwrap_or(0);
        let key = trusted.iter().find(|k| k.id == ca_key_id).ok_or_else(|| {
            CertVerifyError::BadCert(format!(
                "Cert signed with key {ca_key_id}; not in trusted list"
            ))
        })?;
        if signature.len() != 64
            || !verify_signature(&key.public_key, &signed.cert, signature)
        {
            return Err(CertVerifyError::BadCert("Invalid cert signature".into()));
        }
    } else {
        match opts.unsigned_policy {
            UnsignedCertPolicy::Allow => {}
            UnsignedCertPolicy::AllowWarn => {
                warn!(
                    identity = %opts.expected_identity,
                    "remote host is using an unsigned cert; allowing connection, but it's not secure"
                );
            }
            UnsignedCertPolicy::Deny => {
                return Err(CertVerifyError::BadCert(
                    "Unsigned certs are not allowed".into(),
                ));
            }
        }
    }

    let cert_identity = cert_identity(&cert)
        .map_err(|e| CertVerifyError::BadCert(format!("Bad cert identity.  {e}")))?;

    if ca_signed && !cert.gameserver_datacenter_ids.is_empty() {
        // Datacenter-restricted certs name no identity; they are only
        // honored for anonymous gameserver logons.
        if !opts.expected_identity.is_anonymous_game_server() {
            return Err(CertVerifyError::BadCert(format!(
                "Certs restricted to data centers are for anon gameservers only.  Not {}",
                opts.expected_identity
            )));
        }
    } else {
        if ca_signed && cert.app_id.is_none() {
            return Err(CertVerifyError::BadCert(
                "Cert must be bound to an AppID.".into(),
            ));
        }
        match &cert_identity {
            None => {
                if ca_signed {
                    return Err(CertVerifyError::BadCert(
                        "Bad cert identity.  Cert names no identity".into(),
                    ));
                }
            }
            Some(id) if id == opts.expected_identity => {}
            Some(id) if id.is_localhost() && !ca_signed => {
                // Unsigned anonymous logon; the caller has already remapped
                // the peer to its observed address.
            }
            Some(id) => {
                return Err(CertVerifyError::BadCert(format!(
                    "Cert was issued to {id}, not {}",
                    opts.expected_identity
                )));
            }
        }
    }

    if let Some(app_id) = cert.app_id {
        if app_id != opts.local_app_id {
            return Err(CertVerifyError::BadCert(format!(
                "Cert is for AppID {app_id} instead of {}",
                opts.local_app_id
            )));
        }
    }

    if ca_signed {
        let expiry = cert.time_expiry.unwrap_or(0);
        if opts.now_unix > expiry {
            if opts.enforce_expiry {
                return Err(CertVerifyError::BadCert(format!(
                    "Cert expired {} secs ago at {expiry}",
                    opts.now_unix - expiry
                )));
            }
            warn!(
                ago_secs = opts.now_unix - expiry,
                expiry, "cert failure: cert expired; accepting anyway"
            );
        }
    }

    Ok(VerifiedCert {
        public_key,
        identity: cert_identity,
        ca_signed,
        cert,
    })
}

/// Extract the identity a cert binds, if it binds one.
fn cert_identity(cert: &Certificate) -> Result<Option<Identity>, keel_proto::ProtoError> {
    if let Some(s) = &cert.identity {
        return Identity::parse(s).map(Some);
    }
    if let Some(id) = cert.legacy_steam_id {
        return Ok(Some(Identity::SteamId(id)));
    }
    Ok(None)
}

/// Build an unsigned self-signed cert for `identity`.
///
/// Self-signed certs carry no timestamps: they have no tamper protection,
/// so an expiry would be meaningless.
pub fn self_signed_cert(
    public_key: &[u8; 32],
    identity: &Identity,
    app_id: u32,
) -> SignedCertificate {
    let steam_id = match identity {
        Identity::SteamId(id) => Some(*id),
        _ => None,
    };
    let cert = Certificate {
        key_type: CertKeyType::Ed25519 as i32,
        key_data: public_key.to_vec(),
        legacy_steam_id: steam_id,
        identity: Some(identity.render()),
        gameserver_datacenter_ids: vec![],
        time_created: None,
        time_expiry: None,
        app_id: Some(app_id),
    };
    SignedCertificate {
        cert: encode_msg(&cert),
        ca_key_id: None,
        ca_signature: None,
    }
}

/// Sign a cert payload with a CA key, producing the full envelope.
pub fn ca_signed_cert(ca: &SigningKeypair, cert: &Certificate) -> SignedCertificate {
    let cert_bytes = encode_msg(cert);
    let signature = ca.sign(&cert_bytes);
    SignedCertificate {
        cert: cert_bytes,
        ca_key_id: Some(ca.public_key_id()),
        ca_signature: Some(signature.to_vec()),
    }
}
