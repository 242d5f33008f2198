//! PBKDF2 credential hashing and verification.
//!
//! Stored credentials are `base64(salt || derived_key)` with a 32-byte
//! random salt and a 64-byte PBKDF2-HMAC-SHA256 key. Values that do not
//! decode to that shape are treated as legacy plaintext by the caller.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

pub const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const KEY_LEN: usize = 64;

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt);
    let mut blob = Vec::with_capacity(SALT_LEN + KEY_LEN);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&key);
    B64.encode(blob)
}

/// Check `password` against a stored credential. Returns `None` when the
/// stored value is not a hash blob at all (legacy plaintext), letting the
/// caller fall back to direct comparison and upgrade on success.
pub fn verify_password(password: &str, stored: &str) -> Option<bool> {
    let blob = B64.decode(stored).ok()?;
    if blob.len() != SALT_LEN + KEY_LEN {
        return None;
    }
    let (salt, expected) = blob.split_at(SALT_LEN);
    let key = derive_key(password, salt);
    Some(constant_time_eq(&key, expected))
}

/// Minimum strength rule: at least eight characters with at least one
/// letter and one digit.
pub fn validate_password_strength(password: &str) -> bool {
    password.chars().count() >= 8
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Compare without short-circuiting so the timing does not leak how far
/// the match got.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_password("Correct-Horse-1");
        assert_eq!(verify_password("Correct-Horse-1", &hash), Some(true));
        assert_eq!(verify_password("Correct-Horse-2", &hash), Some(false));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = hash_password("same-password-9");
        let b = hash_password("same-password-9");
        assert_ne!(a, b);
        assert_eq!(verify_password("same-password-9", &a), Some(true));
        assert_eq!(verify_password("same-password-9", &b), Some(true));
    }

    #[test]
    fn plaintext_is_not_mistaken_for_a_hash() {
        assert_eq!(verify_password("whatever", "hunter2"), None);
        // Valid base64, wrong length.
        let short = B64.encode([7u8; 16]);
        assert_eq!(verify_password("whatever", &short), None);
    }

    #[test]
    fn blob_has_expected_layout() {
        let hash = hash_password("Layout-Check-3");
        let blob = B64.decode(&hash).unwrap();
        assert_eq!(blob.len(), SALT_LEN + KEY_LEN);
    }

    #[test]
    fn strength_rule_requires_length_letter_and_digit() {
        assert!(validate_password_strength("abcdef12"));
        assert!(validate_password_strength("Str0ng-enough"));
        assert!(!validate_password_strength("short1"));
        assert!(!validate_password_strength("lettersonly"));
        assert!(!validate_password_strength("12345678"));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
