//! Key storage for ID token verification and client authentication.
//!
//! Verification keys are kept per issuer, as imported from the OP's JWKS.
//! Signing keys belong to an owner: the RP itself uses the empty owner, and
//! keys for a specific OP can be stored under that OP's issuer.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p384::SecretKey as EcSecretKey;
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::pkcs8::{EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;

use crate::RpResult;
use crate::error::RpError;

/// Owner name under which the RP's own signing keys are stored.
pub const RP_KEY_OWNER: &str = "";

/// A private key used to sign client assertions.
#[derive(Clone)]
pub struct SigningKey {
    /// Key ID placed in the JWT header.
    pub kid: String,

    /// Signing algorithm.
    pub algorithm: Algorithm,

    /// Key material for `jsonwebtoken::encode`.
    pub encoding_key: EncodingKey,

    /// Public half as a JWK, for publishing or importing elsewhere.
    pub public_jwk: Option<Jwk>,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Generates an ES384 (P-384) signing key with a random key ID.
///
/// # Errors
///
/// Returns a configuration error if the key cannot be encoded.
pub fn generate_ec_signing_key() -> RpResult<SigningKey> {
    let secret_key = EcSecretKey::random(&mut OsRng);
    let point = secret_key.public_key().to_encoded_point(false);
    let x = point
        .x()
        .ok_or_else(|| RpError::configuration("EC key is missing the x coordinate"))?;
    let y = point
        .y()
        .ok_or_else(|| RpError::configuration("EC key is missing the y coordinate"))?;

    let private_pem = secret_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| RpError::configuration(format!("Failed to encode EC key: {}", e)))?;
    let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes())
        .map_err(|e| RpError::configuration(format!("Failed to load EC key: {}", e)))?;

    let kid = uuid::Uuid::new_v4().to_string();
    let public_jwk: Jwk = serde_json::from_value(serde_json::json!({
        "kty": "EC",
        "crv": "P-384",
        "x": URL_SAFE_NO_PAD.encode(x.as_slice()),
        "y": URL_SAFE_NO_PAD.encode(y.as_slice()),
        "kid": kid,
        "alg": "ES384",
        "use": "sig",
    }))
    .map_err(|e| RpError::configuration(format!("Failed to build JWK: {}", e)))?;

    Ok(SigningKey {
        kid,
        algorithm: Algorithm::ES384,
        encoding_key,
        public_jwk: Some(public_jwk),
    })
}

/// Storage for verification and signing keys.
pub trait KeyStore: Send + Sync {
    /// Replaces the verification keys of `issuer` with the keys of `jwks`.
    /// Returns the number of keys imported.
    fn import_keys(&self, issuer: &str, jwks: &JwkSet) -> usize;

    /// Returns a signing key of `owner` for `alg`, if one exists.
    fn signing_key(&self, owner: &str, alg: Algorithm) -> Option<SigningKey>;

    /// Returns the verification keys known for `issuer`.
    fn verification_keys(&self, issuer: &str) -> Vec<Jwk>;

    /// Adds a signing key for `owner`.
    fn add_signing_key(&self, owner: &str, key: SigningKey);

    /// Returns every issuer or owner that has keys.
    fn owners(&self) -> Vec<String>;
}

/// [`KeyStore`] kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    verification: DashMap<String, Vec<Jwk>>,
    signing: DashMap<String, Vec<SigningKey>>,
}

impl InMemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the public JWKS of `owner`'s signing keys.
    #[must_use]
    pub fn public_jwks(&self, owner: &str) -> JwkSet {
        let keys = self
            .signing
            .get(owner)
            .map(|keys| keys.iter().filter_map(|k| k.public_jwk.clone()).collect())
            .unwrap_or_default();
        JwkSet { keys }
    }
}

impl KeyStore for InMemoryKeyStore {
    fn import_keys(&self, issuer: &str, jwks: &JwkSet) -> usize {
        let keys: Vec<Jwk> = jwks
            .keys
            .iter()
            .filter(|k| !matches!(k.common.public_key_use, Some(PublicKeyUse::Encryption)))
            .cloned()
            .collect();
        let count = keys.len();
        self.verification.insert(issuer.to_string(), keys);
        tracing::debug!(issuer = %issuer, keys = count, "Imported provider keys");
        count
    }

    fn signing_key(&self, owner: &str, alg: Algorithm) -> Option<SigningKey> {
        self.signing
            .get(owner)
            .and_then(|keys| keys.iter().find(|k| k.algorithm == alg).cloned())
    }

    fn verification_keys(&self, issuer: &str) -> Vec<Jwk> {
        self.verification
            .get(issuer)
            .map(|keys| keys.value().clone())
            .unwrap_or_default()
    }

    fn add_signing_key(&self, owner: &str, key: SigningKey) {
        self.signing.entry(owner.to_string()).or_default().push(key);
    }

    fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self
            .verification
            .iter()
            .map(|e| e.key().clone())
            .chain(self.signing.iter().map(|e| e.key().clone()))
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }
}

/// Finds candidate decoding keys for a token.
///
/// With a `kid`, only the matching key is returned. Without one, every key
/// whose declared algorithm (if any) equals `alg` is a candidate.
pub(crate) fn decoding_keys_for(
    keys: &[Jwk],
    kid: Option<&str>,
    alg: Algorithm,
) -> Vec<DecodingKey> {
    keys.iter()
        .filter(|jwk| match kid {
            Some(kid) => jwk.common.key_id.as_deref() == Some(kid),
            None => jwk_algorithm(jwk).is_none_or(|a| a == alg),
        })
        .filter_map(|jwk| DecodingKey::from_jwk(jwk).ok())
        .collect()
}

/// Returns `true` if a key with `kid` is present.
pub(crate) fn has_kid(keys: &[Jwk], kid: &str) -> bool {
    keys.iter().any(|k| k.common.key_id.as_deref() == Some(kid))
}

/// Extracts the algorithm from a JWK.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}

/// Shared key store handle.
pub type SharedKeyStore = Arc<dyn KeyStore>;
