//! Client authentication at the token endpoint.
//!
//! Supported methods (OpenID Connect Core Section 9):
//!
//! - `client_secret_basic` - HTTP Basic Auth with client_id:client_secret
//! - `client_secret_post` - credentials in the request body
//! - `client_secret_jwt` - assertion signed with the client secret (HS256)
//! - `private_key_jwt` - assertion signed with an RP signing key
//! - no authentication (`none` or the empty string), only `client_id` is sent

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use time::OffsetDateTime;

use super::ServiceContext;
use crate::RpResult;
use crate::error::RpError;
use crate::keys::RP_KEY_OWNER;

const ASSERTION_TYPE_JWT_BEARER: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Client assertions are valid for five minutes.
const ASSERTION_LIFETIME_SECS: i64 = 300;

/// Token endpoint authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientAuthMethod {
    /// No client authentication (public clients).
    None,
    ClientSecretBasic,
    ClientSecretPost,
    ClientSecretJwt,
    PrivateKeyJwt,
}

impl ClientAuthMethod {
    /// Parses a method name. The empty string means no authentication.
    #[must_use]
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "" | "none" => Some(Self::None),
            "client_secret_basic" => Some(Self::ClientSecretBasic),
            "client_secret_post" => Some(Self::ClientSecretPost),
            "client_secret_jwt" => Some(Self::ClientSecretJwt),
            "private_key_jwt" => Some(Self::PrivateKeyJwt),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
            Self::ClientSecretJwt => "client_secret_jwt",
            Self::PrivateKeyJwt => "private_key_jwt",
        }
    }

    /// Adds credentials to a token request.
    ///
    /// `audience` is the token endpoint URL, used as the assertion audience.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the context lacks the client ID, the
    /// secret, or a signing key the method requires.
    pub fn apply(
        &self,
        context: &ServiceContext,
        audience: &str,
        params: &mut Vec<(String, String)>,
        headers: &mut Vec<(String, String)>,
    ) -> RpResult<()> {
        let client_id = context.require_client_id()?;
        match self {
            Self::None => {
                params.push(("client_id".to_string(), client_id.to_string()));
            }
            Self::ClientSecretBasic => {
                let secret = require_secret(context, *self)?;
                let credentials = format!(
                    "{}:{}",
                    form_encode(client_id),
                    form_encode(secret)
                );
                headers.push((
                    "Authorization".to_string(),
                    format!("Basic {}", STANDARD.encode(credentials)),
                ));
            }
            Self::ClientSecretPost => {
                let secret = require_secret(context, *self)?;
                params.push(("client_id".to_string(), client_id.to_string()));
                params.push(("client_secret".to_string(), secret.to_string()));
            }
            Self::ClientSecretJwt => {
                let secret = require_secret(context, *self)?;
                let key = EncodingKey::from_secret(secret.as_bytes());
                let assertion =
                    sign_assertion(client_id, audience, Header::new(Algorithm::HS256), &key)?;
                push_assertion(params, client_id, assertion);
            }
            Self::PrivateKeyJwt => {
                let signing_key = [Algorithm::ES384, Algorithm::ES256, Algorithm::RS256]
                    .into_iter()
                    .find_map(|alg| context.keys.signing_key(RP_KEY_OWNER, alg))
                    .ok_or_else(|| {
                        RpError::configuration("private_key_jwt requires an RP signing key")
                    })?;
                let mut header = Header::new(signing_key.algorithm);
                header.kid = Some(signing_key.kid.clone());
                let assertion =
                    sign_assertion(client_id, audience, header, &signing_key.encoding_key)?;
                push_assertion(params, client_id, assertion);
            }
        }
        Ok(())
    }
}

impl fmt::Display for ClientAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the authentication method name for a token request.
///
/// Precedence: the behaviour's `token_endpoint_auth_method`, then the
/// service's configured default, then the method granted at registration,
/// then `client_secret_basic`.
#[must_use]
pub fn resolve_authn_method(context: &ServiceContext, service_default: Option<&str>) -> String {
    context
        .behaviour
        .token_endpoint_auth_method
        .as_deref()
        .or(service_default)
        .or_else(|| {
            context
                .registration
                .as_ref()
                .and_then(|r| r.token_endpoint_auth_method.as_deref())
        })
        .unwrap_or("client_secret_basic")
        .to_string()
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    jti: String,
    iat: i64,
    exp: i64,
}

fn sign_assertion(
    client_id: &str,
    audience: &str,
    header: Header,
    key: &EncodingKey,
) -> RpResult<String> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = AssertionClaims {
        iss: client_id,
        sub: client_id,
        aud: audience,
        jti: uuid::Uuid::new_v4().to_string(),
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };
    jsonwebtoken::encode(&header, &claims, key)
        .map_err(|e| RpError::configuration(format!("failed to sign client assertion: {}", e)))
}

fn push_assertion(params: &mut Vec<(String, String)>, client_id: &str, assertion: String) {
    params.push(("client_id".to_string(), client_id.to_string()));
    params.push((
        "client_assertion_type".to_string(),
        ASSERTION_TYPE_JWT_BEARER.to_string(),
    ));
    params.push(("client_assertion".to_string(), assertion));
}

fn require_secret(context: &ServiceContext, method: ClientAuthMethod) -> RpResult<&str> {
    context.client_secret.as_deref().ok_or_else(|| {
        RpError::configuration(format!("{} requires a client_secret", method))
    })
}

/// RFC 6749 Section 2.3.1 form-encodes the Basic credentials.
fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jsonwebtoken::{DecodingKey, Validation};

    use super::*;
    use crate::config::Behaviour;
    use crate::keys::{InMemoryKeyStore, KeyStore, generate_ec_signing_key};

    fn context(keys: Arc<InMemoryKeyStore>) -> ServiceContext {
        let mut ctx = ServiceContext::for_tests("https://op.example.com");
        ctx.client_id = Some("client 1".to_string());
        ctx.client_secret = Some("s3cr:t".to_string());
        ctx.behaviour = Behaviour::default();
        ctx.keys = keys;
        ctx
    }

    #[test]
    fn test_parse_methods() {
        assert_eq!(ClientAuthMethod::parse(""), Some(ClientAuthMethod::None));
        assert_eq!(
            ClientAuthMethod::parse("client_secret_post"),
            Some(ClientAuthMethod::ClientSecretPost)
        );
        assert_eq!(ClientAuthMethod::parse("tls_client_auth"), None);
    }

    #[test]
    fn test_basic_auth_header() {
        let ctx = context(Arc::new(InMemoryKeyStore::new()));
        let (mut params, mut headers) = (Vec::new(), Vec::new());
        ClientAuthMethod::ClientSecretBasic
            .apply(&ctx, "https://op.example.com/token", &mut params, &mut headers)
            .unwrap();

        assert!(params.is_empty());
        let expected = format!("Basic {}", STANDARD.encode("client+1:s3cr%3At"));
        assert_eq!(headers, vec![("Authorization".to_string(), expected)]);
    }

    #[test]
    fn test_post_and_none() {
        let ctx = context(Arc::new(InMemoryKeyStore::new()));
        let (mut params, mut headers) = (Vec::new(), Vec::new());
        ClientAuthMethod::ClientSecretPost
            .apply(&ctx, "aud", &mut params, &mut headers)
            .unwrap();
        assert!(params.contains(&("client_secret".to_string(), "s3cr:t".to_string())));

        let (mut params, mut headers) = (Vec::new(), Vec::new());
        ClientAuthMethod::None
            .apply(&ctx, "aud", &mut params, &mut headers)
            .unwrap();
        assert_eq!(params, vec![("client_id".to_string(), "client 1".to_string())]);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_client_secret_jwt() {
        let ctx = context(Arc::new(InMemoryKeyStore::new()));
        let (mut params, mut headers) = (Vec::new(), Vec::new());
        ClientAuthMethod::ClientSecretJwt
            .apply(&ctx, "https://op.example.com/token", &mut params, &mut headers)
            .unwrap();

        let assertion = params
            .iter()
            .find(|(k, _)| k == "client_assertion")
            .map(|(_, v)| v.clone())
            .unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&["https://op.example.com/token"]);
        let data = jsonwebtoken::decode::<serde_json::Value>(
            &assertion,
            &DecodingKey::from_secret(b"s3cr:t"),
            &validation,
        )
        .unwrap();
        assert_eq!(data.claims["iss"], "client 1");
        assert_eq!(data.claims["sub"], "client 1");
    }

    #[test]
    fn test_private_key_jwt_requires_key() {
        let keys = Arc::new(InMemoryKeyStore::new());
        let ctx = context(keys.clone());
        let (mut params, mut headers) = (Vec::new(), Vec::new());
        let err = ClientAuthMethod::PrivateKeyJwt
            .apply(&ctx, "aud", &mut params, &mut headers)
            .unwrap_err();
        assert!(matches!(err, RpError::Configuration { .. }));

        keys.add_signing_key(RP_KEY_OWNER, generate_ec_signing_key().unwrap());
        ClientAuthMethod::PrivateKeyJwt
            .apply(&ctx, "aud", &mut params, &mut headers)
            .unwrap();
        let assertion = &params.iter().find(|(k, _)| k == "client_assertion").unwrap().1;
        let header = jsonwebtoken::decode_header(assertion).unwrap();
        assert_eq!(header.alg, Algorithm::ES384);
        assert!(header.kid.is_some());
    }

    #[test]
    fn test_resolve_authn_method_precedence() {
        let mut ctx = context(Arc::new(InMemoryKeyStore::new()));
        assert_eq!(resolve_authn_method(&ctx, None), "client_secret_basic");
        assert_eq!(
            resolve_authn_method(&ctx, Some("client_secret_post")),
            "client_secret_post"
        );

        ctx.behaviour = Behaviour::default().with_token_endpoint_auth_method("");
        assert_eq!(resolve_authn_method(&ctx, Some("client_secret_post")), "");
    }
}
