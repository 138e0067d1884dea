//! PKCE challenge computation and verification (RFC 7636).
//!
//! The engine recomputes challenges from captured verifiers rather than
//! trusting any party's claim. `S256` is
//! `base64url-no-pad(SHA-256(ascii(verifier)))`; comparisons run in
//! constant time so the checker itself is not an oracle.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// RFC 7636 section 4.1 verifier length bounds.
pub const VERIFIER_MIN_LEN: usize = 43;
pub const VERIFIER_MAX_LEN: usize = 128;

// ---------------------------------------------------------------------------
// CodeChallengeMethod
// ---------------------------------------------------------------------------

/// `code_challenge_method` values. Wire strings are case-sensitive
/// (RFC 7636 section 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "S256")]
    S256,
}

impl CodeChallengeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::S256 => "S256",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plain" => Some(Self::Plain),
            "S256" => Some(Self::S256),
            _ => None,
        }
    }
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Challenge computation
// ---------------------------------------------------------------------------

/// Compute the challenge a conforming client derives from `verifier`.
pub fn compute_challenge(verifier: &str, method: CodeChallengeMethod) -> String {
    match method {
        CodeChallengeMethod::Plain => verifier.to_string(),
        CodeChallengeMethod::S256 => {
            let digest = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(digest)
        }
    }
}

/// Whether `challenge` is exactly the challenge derived from `verifier`.
/// Constant-time over the challenge bytes.
pub fn challenge_matches(verifier: &str, method: CodeChallengeMethod, challenge: &str) -> bool {
    let computed = compute_challenge(verifier, method);
    bool::from(computed.as_bytes().ct_eq(challenge.as_bytes()))
}

// ---------------------------------------------------------------------------
// Verifier format
// ---------------------------------------------------------------------------

/// RFC 7636 section 4.1 grammar violation of a `code_verifier`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifierFormatError {
    #[error("verifier is {len} chars, below the RFC 7636 minimum of {VERIFIER_MIN_LEN}")]
    TooShort { len: usize },
    #[error("verifier is {len} chars, above the RFC 7636 maximum of {VERIFIER_MAX_LEN}")]
    TooLong { len: usize },
    #[error("verifier byte `{}` at index {index} is outside [A-Za-z0-9._~-]", *byte as char)]
    InvalidByte { byte: u8, index: usize },
}

/// Unreserved charset the verifier grammar allows.
fn is_verifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// First grammar violation in `verifier`, or `None` if it is well formed.
pub fn verifier_format_error(verifier: &str) -> Option<VerifierFormatError> {
    let len = verifier.len();
    if len < VERIFIER_MIN_LEN {
        return Some(VerifierFormatError::TooShort { len });
    }
    if len > VERIFIER_MAX_LEN {
        return Some(VerifierFormatError::TooLong { len });
    }
    verifier
        .bytes()
        .position(|b| !is_verifier_byte(b))
        .map(|index| VerifierFormatError::InvalidByte {
            byte: verifier.as_bytes()[index],
            index,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 appendix B reference pair.
    const RFC_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const RFC_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn s256_matches_the_rfc_reference_vector() {
        assert_eq!(
            compute_challenge(RFC_VERIFIER, CodeChallengeMethod::S256),
            RFC_CHALLENGE
        );
        assert!(challenge_matches(
            RFC_VERIFIER,
            CodeChallengeMethod::S256,
            RFC_CHALLENGE
        ));
    }

    #[test]
    fn s256_rejects_a_foreign_challenge() {
        assert!(!challenge_matches(
            RFC_VERIFIER,
            CodeChallengeMethod::S256,
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cX"
        ));
        // Length mismatch compares unequal, not panics.
        assert!(!challenge_matches(
            RFC_VERIFIER,
            CodeChallengeMethod::S256,
            "short"
        ));
    }

    #[test]
    fn plain_method_passes_the_verifier_through() {
        assert_eq!(
            compute_challenge(RFC_VERIFIER, CodeChallengeMethod::Plain),
            RFC_VERIFIER
        );
        assert!(challenge_matches(
            RFC_VERIFIER,
            CodeChallengeMethod::Plain,
            RFC_VERIFIER
        ));
    }

    #[test]
    fn method_wire_strings_are_case_sensitive() {
        assert_eq!(
            CodeChallengeMethod::parse("S256"),
            Some(CodeChallengeMethod::S256)
        );
        assert_eq!(
            CodeChallengeMethod::parse("plain"),
            Some(CodeChallengeMethod::Plain)
        );
        assert_eq!(CodeChallengeMethod::parse("s256"), None);
        assert_eq!(CodeChallengeMethod::parse("PLAIN"), None);
    }

    #[test]
    fn verifier_grammar_bounds() {
        assert_eq!(verifier_format_error(RFC_VERIFIER), None);

        let short = "a".repeat(VERIFIER_MIN_LEN - 1);
        assert!(matches!(
            verifier_format_error(&short),
            Some(VerifierFormatError::TooShort { len: 42 })
        ));

        let long = "a".repeat(VERIFIER_MAX_LEN + 1);
        assert!(matches!(
            verifier_format_error(&long),
            Some(VerifierFormatError::TooLong { len: 129 })
        ));

        let bad = format!("{}+{}", "a".repeat(21), "b".repeat(21));
        assert!(matches!(
            verifier_format_error(&bad),
            Some(VerifierFormatError::InvalidByte { byte: b'+', index: 21 })
        ));
    }
}
