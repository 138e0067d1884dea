#![no_main]

use grantcheck_engine::entropy::ByteEntropy;
use grantcheck_engine::pkce::{
    challenge_matches, compute_challenge, verifier_format_error, CodeChallengeMethod,
};
use grantcheck_engine::wire;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let mid = data.len() / 2;
    let verifier = String::from_utf8_lossy(&data[..mid]).into_owned();
    let foreign = String::from_utf8_lossy(&data[mid..]).into_owned();

    let _ = verifier_format_error(&verifier);
    let _ = CodeChallengeMethod::parse(&foreign);

    for method in [CodeChallengeMethod::Plain, CodeChallengeMethod::S256] {
        let challenge = compute_challenge(&verifier, method);
        // Recomputation is total and self-consistent on any input.
        assert!(challenge_matches(&verifier, method, &challenge));
        let _ = challenge_matches(&verifier, method, &foreign);
    }

    // base64url-no-pad over a 32-byte digest: always 43 chars, always
    // inside the verifier charset.
    let s256 = compute_challenge(&verifier, CodeChallengeMethod::S256);
    assert_eq!(s256.len(), 43);
    assert!(verifier_format_error(&s256).is_none());

    // Entropy estimates stay inside [0, 8] bits per observed byte.
    let estimate = ByteEntropy::of(&verifier);
    let per_byte = estimate.per_byte_millibits();
    assert!((0..=8_000_000).contains(&per_byte), "per_byte = {per_byte}");
    assert!(estimate.total_millibits() >= 0);
    assert!(estimate.distinct_bytes() as u64 <= estimate.total_bytes().max(1));

    let _ = wire::parse_seconds(&foreign);
    let _ = wire::parse_status(&foreign);
    let _ = wire::split_scope(&foreign);
    let _ = wire::is_registered_error(&foreign);
});
