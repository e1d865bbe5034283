//! Access secrets for ptykeep sessions.
//!
//! Session passwords, one-time codes and attach tokens are handed to the
//! caller exactly once in plaintext; only their SHA-256 digests are kept.
//! Digests are scoped (salted) with the owning session id or purpose so the
//! same plaintext never produces the same digest in two places.

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Alphabet for generated passwords: no look-alike characters.
const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";

/// Generated passwords are never shorter than this.
pub const MIN_PASSWORD_LEN: usize = 12;

/// Number of digits in a one-time code.
pub const OTP_DIGITS: usize = 6;

/// Fill `len` bytes from the system CSPRNG.
///
/// Running out of entropy is the one failure this crate treats as fatal.
fn random_bytes(len: usize) -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).expect("RNG failure");
    bytes
}

/// Generate an opaque identifier (16 random bytes, 32 hex chars).
pub fn generate_id() -> String {
    hex::encode(random_bytes(16))
}

/// Generate a high-entropy bearer token (32 random bytes, 64 hex chars).
pub fn generate_token() -> String {
    hex::encode(random_bytes(32))
}

/// Generate a human-typable password of at least [`MIN_PASSWORD_LEN`] chars.
pub fn generate_password(len: usize) -> String {
    let len = len.max(MIN_PASSWORD_LEN);
    let mut rng = rand::rngs::OsRng;
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..PASSWORD_ALPHABET.len());
            PASSWORD_ALPHABET[idx] as char
        })
        .collect()
}

/// Generate a zero-padded numeric one-time code.
pub fn generate_otp() -> String {
    let mut rng = rand::rngs::OsRng;
    let code: u32 = rng.gen_range(0..10u32.pow(OTP_DIGITS as u32));
    format!("{code:0width$}", width = OTP_DIGITS)
}

/// Hex SHA-256 digest of `secret`, scoped by `scope`.
pub fn hash_secret(scope: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0u8]);
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of two digests.
pub fn secrets_match(expected: &str, candidate: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(candidate.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_and_tokens_are_hex_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let token = generate_token();
        assert_eq!(token.len(), 64);
    }

    #[test]
    fn password_respects_minimum_length() {
        assert_eq!(generate_password(4).len(), MIN_PASSWORD_LEN);
        let pw = generate_password(20);
        assert_eq!(pw.len(), 20);
        assert!(pw.bytes().all(|b| PASSWORD_ALPHABET.contains(&b)));
    }

    #[test]
    fn otp_is_six_digits() {
        for _ in 0..50 {
            let code = generate_otp();
            assert_eq!(code.len(), OTP_DIGITS);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn hash_is_scoped() {
        let h1 = hash_secret("session-1", "hunter2hunter2");
        let h2 = hash_secret("session-2", "hunter2hunter2");
        assert_ne!(h1, h2);
        assert_eq!(h1, hash_secret("session-1", "hunter2hunter2"));
        assert!(!h1.contains("hunter2"));
    }

    #[test]
    fn secrets_match_is_exact() {
        let h = hash_secret("s", "pw");
        assert!(secrets_match(&h, &hash_secret("s", "pw")));
        assert!(!secrets_match(&h, &hash_secret("s", "pW")));
        assert!(!secrets_match(&h, ""));
    }
}
