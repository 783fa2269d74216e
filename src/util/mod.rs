//! Key generation, hashing, semver normalization, and the rollout predicate
//! (C9). These are the small deterministic primitives everything else in the
//! core is built from.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random 32-hex-char suffix from a cryptographic RNG, optionally prefixed.
/// Mirrors `clawd::ipc::auth::get_or_create_token`'s random-hex-token
/// generation, but draws raw bytes instead of stripping dashes from a UUID
/// so the output is exactly 32 hex chars regardless of UUID formatting.
pub fn generate_key(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{prefix}{}", hex::encode(bytes))
}

pub fn generate_deployment_key() -> String {
    generate_key("dk_")
}

pub fn generate_access_key() -> String {
    generate_key("ck_")
}

/// Hex SHA-256 digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Normalize a client-presented `appVersion` string per spec.md §4.6 step 3:
/// `"N"` -> `"N.0.0"`, `"N.M"` or `"N.M±tag"` -> `"N.M.0±tag"`, else unchanged.
pub fn normalize_version(raw: &str) -> String {
    // Split off a leading build/pre-release tag introduced by '-' or '+' so we
    // only count dots in the numeric core.
    let tag_start = raw.find(['-', '+']);
    let (core, tag) = match tag_start {
        Some(idx) => (&raw[..idx], &raw[idx..]),
        None => (raw, ""),
    };

    let dot_count = core.chars().filter(|c| *c == '.').count();
    match dot_count {
        0 => {
            if core.chars().all(|c| c.is_ascii_digit()) && !core.is_empty() {
                format!("{core}.0.0{tag}")
            } else {
                raw.to_string()
            }
        }
        1 => {
            let valid = core.split('.').all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
            if valid {
                format!("{core}.0{tag}")
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}

/// Parse a normalized version string into a `semver::Version`, tolerating a
/// leading 'v' and treating anything after '+'/'-' the way `semver` already
/// does. Returns `None` if the string cannot be parsed even after
/// normalization — callers treat that as "does not satisfy anything".
pub fn parse_semver(raw: &str) -> Option<semver::Version> {
    let normalized = normalize_version(raw);
    let trimmed = normalized.trim_start_matches('v');
    semver::Version::parse(trimmed).ok()
}

/// Does `version` contain a pre-release tag (a literal '-')? Per spec.md
/// §4.6 step 4, pre-release clients are admitted into `latestSatisfying`
/// even when the range check would otherwise exclude them.
pub fn is_prerelease_string(version: &str) -> bool {
    version.contains('-')
}

/// Does `candidate` satisfy the `range` string associated with a release's
/// `appVersion` field? `range` may be an exact semver, a semver with a
/// pre-release/build tag, or a `semver::VersionReq` range expression.
/// Exact-equality and mutual-range semantics both apply per spec.md P3/§4.3.
pub fn satisfies_range(candidate: &semver::Version, range: &str) -> bool {
    let normalized = normalize_version(range);
    let trimmed = normalized.trim_start_matches('v');

    if let Ok(exact) = semver::Version::parse(trimmed) {
        return candidate.major == exact.major
            && candidate.minor == exact.minor
            && candidate.patch == exact.patch;
    }
    if let Ok(req) = semver::VersionReq::parse(trimmed) {
        // semver::VersionReq ignores pre-release tags on the candidate by
        // default rules; build a pre-release-stripped comparator version so
        // '^1.0.0' matches '1.2.0' regardless of candidate's build tag.
        let bare = semver::Version::new(candidate.major, candidate.minor, candidate.patch);
        return req.matches(&bare);
    }
    false
}

/// Two `appVersion` strings are "the same release target" per P3/promote
/// semantics: exact equality, or mutual semver-range satisfaction.
pub fn versions_equivalent(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (parse_semver(a), parse_semver(b)) {
        (Some(va), Some(vb)) => satisfies_range(&va, b) && satisfies_range(&vb, a),
        _ => false,
    }
}

/// The rollout predicate (spec.md §4.9): given `client_id`, `package_hash`,
/// and a percentage `p` in `[0,100]`, decide deterministic per-device
/// inclusion using the Java `String.hashCode()` recurrence so behavior is
/// bit-exact across server implementations.
pub fn is_in_rollout(client_id: &str, package_hash: &str, percentage: u8) -> bool {
    if percentage >= 100 {
        return true;
    }
    if percentage == 0 {
        return false;
    }
    let s = format!("{client_id}{package_hash}");
    let h = java_string_hash(&s);
    let bucket = (h as i64).unsigned_abs() % 100;
    bucket < percentage as u64
}

/// `h = 0; for each char c: h = ((h << 5) - h) + codepoint(c)`, wrapping as
/// signed 32-bit arithmetic, matching Java's `String.hashCode()`.
fn java_string_hash(s: &str) -> i32 {
    let mut h: i32 = 0;
    for c in s.chars() {
        h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_key_has_expected_shape() {
        let k = generate_key("dk_");
        assert!(k.starts_with("dk_"));
        assert_eq!(k.len(), 3 + 32);
        assert!(k[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_key_is_random() {
        assert_ne!(generate_deployment_key(), generate_deployment_key());
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex(b"hello"), sha256_hex(b"hello"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
    }

    #[test]
    fn normalize_version_boundary_cases() {
        assert_eq!(normalize_version("1"), "1.0.0");
        assert_eq!(normalize_version("1.0"), "1.0.0");
        assert_eq!(normalize_version("1.0+build"), "1.0.0+build");
        assert_eq!(normalize_version("1.2.3"), "1.2.3");
        assert_eq!(normalize_version("1.2.3-beta"), "1.2.3-beta");
    }

    #[test]
    fn is_prerelease_string_detects_dash() {
        assert!(is_prerelease_string("1.2.3-beta.1"));
        assert!(!is_prerelease_string("1.2.3+build"));
        assert!(!is_prerelease_string("1.2.3"));
    }

    #[test]
    fn satisfies_range_exact_and_caret() {
        let v = parse_semver("1.2.0").unwrap();
        assert!(satisfies_range(&v, "1.2.0"));
        assert!(!satisfies_range(&v, "1.3.0"));
        assert!(satisfies_range(&v, "^1.0.0"));
        assert!(!satisfies_range(&v, "^2.0.0"));
    }

    #[test]
    fn versions_equivalent_exact_and_mutual_range() {
        assert!(versions_equivalent("1.0.0", "1.0.0"));
        assert!(versions_equivalent("1.0.0", "1.0"));
        assert!(!versions_equivalent("1.0.0", "2.0.0"));
    }

    #[test]
    fn rollout_boundaries() {
        assert!(!is_in_rollout("client-a", "hash-1", 0));
        assert!(is_in_rollout("client-a", "hash-1", 100));
    }

    #[test]
    fn rollout_is_deterministic() {
        let a = is_in_rollout("client-a", "hash-1", 50);
        let b = is_in_rollout("client-a", "hash-1", 50);
        assert_eq!(a, b);
    }

    #[test]
    fn java_string_hash_known_value() {
        // "a".hashCode() == 97 in Java (codepoint of 'a').
        assert_eq!(java_string_hash("a"), 97);
        // "".hashCode() == 0.
        assert_eq!(java_string_hash(""), 0);
    }
}
