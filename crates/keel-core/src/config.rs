//! Scoped connection configuration.
//!
//! Every value is optional at every scope; a connection resolves a value by
//! checking its own overrides, then the scope it inherited from (listen
//! socket or runtime), then the compiled-in default.  Inheritance is
//! applied when the connection is created.

use keel_crypto::UnsignedCertPolicy;

pub const DEFAULT_TIMEOUT_INITIAL_MS: i32 = 10_000;
pub const DEFAULT_TIMEOUT_CONNECTED_MS: i32 = 10_000;
pub const DEFAULT_SEND_RATE_MIN: i32 = 128 * 1024;
pub const DEFAULT_SEND_RATE_MAX: i32 = 1024 * 1024;

/// Per-scope configuration overrides.
#[derive(Clone, Debug, Default)]
pub struct ConnectionConfig {
    /// Timeout before a connection must be established (ms).
    pub timeout_initial_ms: Option<i32>,
    /// Timeout without receiving anything once connected (ms).
    pub timeout_connected_ms: Option<i32>,
    /// May this endpoint fall back to a self-signed cert?
    pub allow_unsigned_local: Option<bool>,
    /// How to treat peers presenting unsigned certs.
    pub unsigned_remote_policy: Option<UnsignedCertPolicy>,
    /// Reject expired CA-signed certs instead of warning.
    pub enforce_cert_expiry: Option<bool>,
    pub send_rate_min: Option<i32>,
    pub send_rate_max: Option<i32>,
}

impl ConnectionConfig {
    /// Fill unset values from the parent scope.
    pub fn inherit(&mut self, parent: &ConnectionConfig) {
        macro_rules! take {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = parent.$field;
                }
            };
        }
        take!(timeout_initial_ms);
        take!(timeout_connected_ms);
        take!(allow_unsigned_local);
        take!(unsigned_remote_policy);
        take!(enforce_cert_expiry);
        take!(send_rate_min);
        take!(send_rate_max);
    }

    pub fn timeout_initial_ms(&self) -> i32 {
        self.timeout_initial_ms.unwrap_or(DEFAULT_TIMEOUT_INITIAL_MS)
    }

    pub fn timeout_connected_ms(&self) -> i32 {
        self.timeout_connected_ms
            .unwrap_or(DEFAULT_TIMEOUT_CONNECTED_MS)
    }

    pub fn allow_unsigned_local(&self) -> bool {
        self.allow_unsigned_local.unwrap_or(true)
    }

    pub fn unsigned_remote_policy(&self) -> UnsignedCertPolicy {
        self.unsigned_remote_policy.unwrap_or_default()
    }

    pub fn enforce_cert_expiry(&self) -> bool {
        self.enforce_cert_expiry.unwrap_or(false)
    }

    pub fn send_rate_min(&self) -> i32 {
        self.send_rate_min.unwrap_or(DEFAULT_SEND_RATE_MIN)
    }

    pub fn send_rate_max(&self) -> i32 {
        self.send_rate_max.unwrap_or(DEFAULT_SEND_RATE_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.timeout_initial_ms(), DEFAULT_TIMEOUT_INITIAL_MS);
        assert!(cfg.allow_unsigned_local());
        assert_eq!(cfg.unsigned_remote_policy(), UnsignedCertPolicy::AllowWarn);
        assert!(!cfg.enforce_cert_expiry());
    }

    #[test]
    fn inherit_fills_only_unset() {
        let parent = ConnectionConfig {
            timeout_initial_ms: Some(2_000),
            enforce_cert_expiry: Some(true),
            ..Default::default()
        };
        let mut child = ConnectionConfig {
            timeout_initial_ms: Some(500),
            ..Default::default()
        };
        child.inherit(&parent);
        assert_eq!(child.timeout_initial_ms(), 500);
        assert!(child.enforce_cert_expiry());
        assert_eq!(child.timeout_connected_ms(), DEFAULT_TIMEOUT_CONNECTED_MS);
    }
}
