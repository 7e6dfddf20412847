//! PKCE (RFC 7636) for the client side of the authorization code flow.
//!
//! Only the S256 method is produced. The verifier is kept in the session and
//! sent with the code exchange; the challenge goes on the authorization URL.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

/// Challenge method sent as `code_challenge_method`.
pub const CHALLENGE_METHOD_S256: &str = "S256";

/// Errors raised when restoring a stored verifier.
#[derive(Debug, thiserror::Error)]
pub enum PkceError {
    /// Verifier length is outside the valid range (43-128 characters).
    #[error("Invalid verifier length: must be 43-128 characters, got {0}")]
    InvalidVerifierLength(usize),

    /// Verifier contains invalid characters.
    #[error("Invalid verifier characters: must be URL-safe ([A-Za-z0-9-._~])")]
    InvalidVerifierCharacters,
}

/// PKCE code verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Restores a verifier from its string form.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is not 43-128 or the string contains
    /// characters other than `[A-Za-z0-9-._~]`.
    pub fn new(verifier: String) -> Result<Self, PkceError> {
        let len = verifier.len();
        if !(43..=128).contains(&len) {
            return Err(PkceError::InvalidVerifierLength(len));
        }
        if !verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
        {
            return Err(PkceError::InvalidVerifierCharacters);
        }
        Ok(Self(verifier))
    }

    /// Generates 32 random bytes encoded as base64url (43 characters).
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 32] = rand::thread_rng().r#gen();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Computes `BASE64URL(SHA256(verifier))`.
    #[must_use]
    pub fn challenge(&self) -> String {
        let hash = Sha256::digest(self.0.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PkceVerifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_verifier_is_valid() {
        let verifier = PkceVerifier::generate();
        assert_eq!(verifier.as_str().len(), 43);
        assert!(PkceVerifier::new(verifier.as_str().to_string()).is_ok());
        assert_ne!(verifier, PkceVerifier::generate());
    }

    #[test]
    fn test_rfc7636_appendix_b() {
        let verifier =
            PkceVerifier::new("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk".to_string()).unwrap();
        assert_eq!(
            verifier.challenge(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_restore_rejects_bad_input() {
        assert!(matches!(
            PkceVerifier::new("short".to_string()),
            Err(PkceError::InvalidVerifierLength(5))
        ));
        assert!(matches!(
            PkceVerifier::new(format!("{}!", "a".repeat(43))),
            Err(PkceError::InvalidVerifierCharacters)
        ));
    }
}
