//! PEM-style text armor.
//!
//! Certificates and private keys travel through config files and terminals
//! as base64 between BEGIN/END markers, wrapped at 64 columns.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

/// Marker label for signed certificate envelopes.
pub const CERT_PEM_LABEL: &str = "STEAMDATAGRAM CERT";

/// Marker label for Ed25519 private keys.
pub const PRIVATE_KEY_PEM_LABEL: &str = "KEEL ED25519 PRIVATE KEY";

#[derive(Debug, Error)]
pub enum ArmorError {
    #[error("missing '-----BEGIN {0}-----' marker")]
    MissingBegin(String),
    #[error("missing '-----END {0}-----' marker")]
    MissingEnd(String),
    #[error("invalid base64 body")]
    InvalidBase64,
}

/// Wrap `data` in BEGIN/END markers for `label`.
pub fn armor(label: &str, data: &[u8]) -> String {
    let b64 = BASE64.encode(data);
    let mut out = String::with_capacity(b64.len() + label.len() * 2 + 40);
    out.push_str("-----BEGIN ");
    out.push_str(label);
    out.push_str("-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        // chunks of an ASCII string are ASCII
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str("-----END ");
    out.push_str(label);
    out.push_str("-----\n");
    out
}

/// Extract the payload between the markers for `label`.
///
/// Whitespace inside the body is ignored, so both wrapped files and
/// single-line forms parse.
pub fn dearmor(label: &str, text: &str) -> Result<Vec<u8>, ArmorError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = text
        .find(&begin)
        .ok_or_else(|| ArmorError::MissingBegin(label.to_string()))?
        + begin.len();
    let stop = text[start..]
        .find(&end)
        .ok_or_else(|| ArmorError::MissingEnd(label.to_string()))?
        + start;
    let body: String = text[start..stop].split_whitespace().collect();
    BASE64.decode(body).map_err(|_| ArmorError::InvalidBase64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data: Vec<u8> = (0u8..=255).collect();
        let text = armor(CERT_PEM_LABEL, &data);
        assert!(text.starts_with("-----BEGIN STEAMDATAGRAM CERT-----"));
        assert_eq!(dearmor(CERT_PEM_LABEL, &text).unwrap(), data);
    }

    #[test]
    fn single_line_form_parses() {
        let data = b"hello armor";
        let text = armor(PRIVATE_KEY_PEM_LABEL, data).replace('\n', " ");
        assert_eq!(dearmor(PRIVATE_KEY_PEM_LABEL, &text).unwrap(), data);
    }

    #[test]
    fn wrong_label_rejected() {
        let text = armor(CERT_PEM_LABEL, b"x");
        assert!(matches!(
            dearmor(PRIVATE_KEY_PEM_LABEL, &text),
            Err(ArmorError::MissingBegin(_))
        ));
    }
}
