use serde::{Deserialize, Serialize};
use std::fmt;

/// Wrapper for secret strings (registry passwords, the API key) that prints a
/// "<REDACTED, length {length of the secret}>" string for Debug/Display
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        SecretString(s)
    }

    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compares with `candidate` without returning early on the first differing byte.
    pub fn matches(&self, candidate: &str) -> bool {
        let (secret, candidate) = (self.0.as_bytes(), candidate.as_bytes());
        secret.len() == candidate.len()
            && secret
                .iter()
                .zip(candidate)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_output() {
        let secret = SecretString::new("hunter2".to_string());
        assert_eq!(format!("{}", secret), "<REDACTED, length 7>");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 7>");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_matches() {
        let secret = SecretString::new("hunter2".to_string());
        assert!(secret.matches("hunter2"));
        assert!(!secret.matches("hunter3"));
        assert!(!secret.matches("hunter"));
        assert!(!secret.matches(""));
        assert!(SecretString::new(String::new()).matches(""));
    }
}
