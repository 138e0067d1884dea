//! OAuth wire vocabulary: the exact parameter names, JSON response fields,
//! error codes, and HTTP status associations the four grant flows use.
//!
//! The engine has no wire format of its own; rules read captured parameters
//! under these names and nothing else. Keeping the vocabulary in one place
//! means a renamed parameter is a compile error in every rule that reads it.

use std::collections::BTreeSet;

/// Query-string / POST-body parameter names and JSON response field names.
pub mod param {
    pub const RESPONSE_TYPE: &str = "response_type";
    pub const CLIENT_ID: &str = "client_id";
    pub const CLIENT_SECRET: &str = "client_secret";
    pub const CLIENT_ASSERTION: &str = "client_assertion";
    pub const CLIENT_ASSERTION_TYPE: &str = "client_assertion_type";
    pub const REDIRECT_URI: &str = "redirect_uri";
    pub const SCOPE: &str = "scope";
    pub const STATE: &str = "state";
    pub const CODE: &str = "code";
    pub const CODE_CHALLENGE: &str = "code_challenge";
    pub const CODE_CHALLENGE_METHOD: &str = "code_challenge_method";
    pub const CODE_VERIFIER: &str = "code_verifier";
    pub const GRANT_TYPE: &str = "grant_type";
    pub const DEVICE_CODE: &str = "device_code";
    pub const USER_CODE: &str = "user_code";
    pub const INTERVAL: &str = "interval";
    pub const VERIFICATION_URI: &str = "verification_uri";
    pub const VERIFICATION_URI_COMPLETE: &str = "verification_uri_complete";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const TOKEN_TYPE: &str = "token_type";
    pub const EXPIRES_IN: &str = "expires_in";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const ERROR: &str = "error";
    pub const ERROR_DESCRIPTION: &str = "error_description";
    pub const ERROR_URI: &str = "error_uri";

    /// Reserved capture-layer key: the observed HTTP status code of the
    /// exchange, as decimal digits. Not an OAuth parameter; rules that read
    /// it are NotApplicable when it is absent.
    pub const STATUS: &str = "status";
}

/// `grant_type` value for device-flow token polling (RFC 8628 section 3.4).
pub const DEVICE_GRANT_TYPE_URN: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// `grant_type` value for the authorization-code exchange.
pub const AUTHORIZATION_CODE_GRANT_TYPE: &str = "authorization_code";

/// `grant_type` value for the client-credentials round trip.
pub const CLIENT_CREDENTIALS_GRANT_TYPE: &str = "client_credentials";

/// `client_assertion_type` value for JWT client authentication (RFC 7523).
pub const JWT_BEARER_ASSERTION_TYPE: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// HTTP status of a front-channel authorization redirect.
pub const REDIRECT_STATUS: u16 = 302;

// ---------------------------------------------------------------------------
// Error-code families
// ---------------------------------------------------------------------------

pub const ERROR_INVALID_REQUEST: &str = "invalid_request";
pub const ERROR_INVALID_CLIENT: &str = "invalid_client";
pub const ERROR_INVALID_GRANT: &str = "invalid_grant";
pub const ERROR_UNAUTHORIZED_CLIENT: &str = "unauthorized_client";
pub const ERROR_UNSUPPORTED_GRANT_TYPE: &str = "unsupported_grant_type";
pub const ERROR_UNSUPPORTED_RESPONSE_TYPE: &str = "unsupported_response_type";
pub const ERROR_INVALID_SCOPE: &str = "invalid_scope";
pub const ERROR_ACCESS_DENIED: &str = "access_denied";
pub const ERROR_SERVER_ERROR: &str = "server_error";
pub const ERROR_TEMPORARILY_UNAVAILABLE: &str = "temporarily_unavailable";
pub const ERROR_AUTHORIZATION_PENDING: &str = "authorization_pending";
pub const ERROR_SLOW_DOWN: &str = "slow_down";
pub const ERROR_EXPIRED_TOKEN: &str = "expired_token";

/// Registered OAuth error codes across the four flows
/// (RFC 6749 sections 4.1.2.1 and 5.2, RFC 8628 section 3.5).
pub const REGISTERED_ERROR_CODES: [&str; 13] = [
    ERROR_INVALID_REQUEST,
    ERROR_INVALID_CLIENT,
    ERROR_INVALID_GRANT,
    ERROR_UNAUTHORIZED_CLIENT,
    ERROR_UNSUPPORTED_GRANT_TYPE,
    ERROR_UNSUPPORTED_RESPONSE_TYPE,
    ERROR_INVALID_SCOPE,
    ERROR_ACCESS_DENIED,
    ERROR_SERVER_ERROR,
    ERROR_TEMPORARILY_UNAVAILABLE,
    ERROR_AUTHORIZATION_PENDING,
    ERROR_SLOW_DOWN,
    ERROR_EXPIRED_TOKEN,
];

/// Whether `code` is a registered OAuth error code.
pub fn is_registered_error(code: &str) -> bool {
    REGISTERED_ERROR_CODES.contains(&code)
}

/// HTTP status a token-endpoint error response is required to carry:
/// 401 for `invalid_client` (with a `WWW-Authenticate` challenge), 400 for
/// every other registered code (RFC 6749 section 5.2).
pub fn expected_error_status(error: &str) -> u16 {
    if error == ERROR_INVALID_CLIENT {
        401
    } else {
        400
    }
}

// ---------------------------------------------------------------------------
// Small value parsers shared by rules
// ---------------------------------------------------------------------------

/// Parse a non-negative duration-in-seconds value (`expires_in`,
/// `interval`). Rejects signs, whitespace, and non-digit input outright:
/// captured traffic is validated, not repaired.
pub fn parse_seconds(value: &str) -> Option<i64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<i64>().ok()
}

/// Split a space-delimited `scope` value into its member scopes
/// (RFC 6749 section 3.3). Empty members from repeated spaces are dropped.
pub fn split_scope(value: &str) -> BTreeSet<&str> {
    value.split(' ').filter(|s| !s.is_empty()).collect()
}

/// Parse a captured `status` param into an HTTP status code. Digits only.
pub fn parse_status(value: &str) -> Option<u16> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<u16>().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
