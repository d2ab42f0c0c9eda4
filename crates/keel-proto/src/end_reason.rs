//! End-reason code ranges.
//!
//! A connection that closes carries a numeric reason partitioned into
//! application, local, remote, and misc ranges, plus a short debug string.
//! The codes travel on the wire, so the values are protocol surface.

/// No reason recorded yet.
pub const INVALID: i32 = 0;

// Application range: normal application close codes.
pub const APP_MIN: i32 = 1000;
pub const APP_GENERIC: i32 = APP_MIN;
pub const APP_MAX: i32 = 1999;

// Application exception range: the app closed in an unusual way.
pub const APP_EXCEPTION_MIN: i32 = 2000;
pub const APP_EXCEPTION_GENERIC: i32 = APP_EXCEPTION_MIN;
pub const APP_EXCEPTION_MAX: i32 = 2999;

// Local range: problems on our side of the wire.
pub const LOCAL_MIN: i32 = 3000;
pub const LOCAL_MAX: i32 = 3999;

// Remote range: the peer did something we could not accept.
pub const REMOTE_MIN: i32 = 4000;
pub const REMOTE_TIMEOUT: i32 = 4001;
pub const REMOTE_BAD_CRYPT: i32 = 4002;
pub const REMOTE_BAD_CERT: i32 = 4003;
pub const REMOTE_BAD_PROTOCOL_VERSION: i32 = 4006;
pub const REMOTE_MAX: i32 = 4999;

// Misc range: everything else.
pub const MISC_MIN: i32 = 5000;
pub const MISC_GENERIC: i32 = 5001;
pub const MISC_INTERNAL_ERROR: i32 = 5002;
pub const MISC_TIMEOUT: i32 = 5003;
pub const MISC_MAX: i32 = 5999;

/// True if `reason` is in either application range.
pub fn is_app_reason(reason: i32) -> bool {
    (APP_MIN..=APP_EXCEPTION_MAX).contains(&reason)
}

/// Clamp an application-supplied close reason into the app ranges.
///
/// Zero maps to the generic app code.  Anything outside the app ranges maps
/// to `APP_MAX` so the misuse is visible in analytics; the returned debug
/// string override is `Some` in that case.
pub fn validate_app_reason(reason: i32) -> (i32, Option<&'static str>) {
    if reason == 0 {
        (APP_GENERIC, None)
    } else if is_app_reason(reason) {
        (reason, None)
    } else {
        (APP_MAX, Some("Invalid numeric reason code"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_maps_to_generic() {
        assert_eq!(validate_app_reason(0), (APP_GENERIC, None));
    }

    #[test]
    fn in_range_passes_through() {
        assert_eq!(validate_app_reason(1234), (1234, None));
        assert_eq!(validate_app_reason(APP_EXCEPTION_MIN), (APP_EXCEPTION_MIN, None));
    }

    #[test]
    fn out_of_range_clamps() {
        let (code, debug) = validate_app_reason(5001);
        assert_eq!(code, APP_MAX);
        assert_eq!(debug, Some("Invalid numeric reason code"));
        let (code, _) = validate_app_reason(-7);
        assert_eq!(code, APP_MAX);
    }
}
