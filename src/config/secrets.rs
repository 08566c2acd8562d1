//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides a comparison helper for access
//! tokens presented by executors.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Compare a presented token against the configured one without
/// short-circuiting on the first differing byte.
pub fn token_matches(expected: &SecretString, presented: &str) -> bool {
    let expected = expected.expose_secret().as_bytes();
    let presented = presented.as_bytes();
    if expected.is_empty() || expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_matches_only_exact_value() {
        let secret = SecretString::from("hunter2");
        assert!(token_matches(&secret, "hunter2"));
        assert!(!token_matches(&secret, "hunter3"));
        assert!(!token_matches(&secret, "hunter"));
        assert!(!token_matches(&SecretString::from(""), ""));
    }
}
