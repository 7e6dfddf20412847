//! OpenID Connect protocol messages.
//!
//! Provider metadata, authorization and token responses, ID token claims,
//! WebFinger JRD documents and registration responses. Fields that the
//! orchestrator does not interpret are kept in `extra` maps so nothing an OP
//! returns is lost.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Free-form claim set, as returned to callers.
pub type Claims = Map<String, Value>;

/// WebFinger relation identifying an OpenID Connect issuer.
pub const OIDC_ISSUER_REL: &str = "http://openid.net/specs/connect/1.0/issuer";

/// Claims that describe the token itself rather than the end-user.
pub const PROTOCOL_CLAIMS: &[&str] = &[
    "iss", "aud", "exp", "iat", "nbf", "nonce", "auth_time", "at_hash", "c_hash", "acr", "amr",
    "azp", "jti", "sid", "s_hash",
];

// =============================================================================
// Provider Metadata
// =============================================================================

/// OpenID Provider metadata.
///
/// Every field is optional because the same type holds both discovered
/// documents and partial static `provider_info` from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// URL that the OP asserts as its Issuer Identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_types_supported: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token_signing_alg_values_supported: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Whether the OP sends the RFC 9207 `iss` authorization response parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_response_iss_parameter_supported: Option<bool>,

    /// Metadata not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderMetadata {
    /// Builds metadata from a static `provider_info` map.
    ///
    /// # Errors
    ///
    /// Returns the serde error if a known field has the wrong type.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map.clone()))
    }

    /// Returns the URL stored under a metadata field name.
    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<&str> {
        match name {
            "authorization_endpoint" => self.authorization_endpoint.as_deref(),
            "token_endpoint" => self.token_endpoint.as_deref(),
            "userinfo_endpoint" => self.userinfo_endpoint.as_deref(),
            "jwks_uri" => self.jwks_uri.as_deref(),
            "registration_endpoint" => self.registration_endpoint.as_deref(),
            "end_session_endpoint" => self.end_session_endpoint.as_deref(),
            other => self.extra.get(other).and_then(Value::as_str),
        }
    }

    /// Overlays `other` on top of `self`. Fields present in `other` win.
    #[must_use]
    pub fn merged_with(&self, other: &ProviderMetadata) -> ProviderMetadata {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        ProviderMetadata {
            issuer: other.issuer.clone().or_else(|| self.issuer.clone()),
            authorization_endpoint: other
                .authorization_endpoint
                .clone()
                .or_else(|| self.authorization_endpoint.clone()),
            token_endpoint: other
                .token_endpoint
                .clone()
                .or_else(|| self.token_endpoint.clone()),
            userinfo_endpoint: other
                .userinfo_endpoint
                .clone()
                .or_else(|| self.userinfo_endpoint.clone()),
            jwks_uri: other.jwks_uri.clone().or_else(|| self.jwks_uri.clone()),
            registration_endpoint: other
                .registration_endpoint
                .clone()
                .or_else(|| self.registration_endpoint.clone()),
            end_session_endpoint: other
                .end_session_endpoint
                .clone()
                .or_else(|| self.end_session_endpoint.clone()),
            scopes_supported: other
                .scopes_supported
                .clone()
                .or_else(|| self.scopes_supported.clone()),
            response_types_supported: other
                .response_types_supported
                .clone()
                .or_else(|| self.response_types_supported.clone()),
            token_endpoint_auth_methods_supported: other
                .token_endpoint_auth_methods_supported
                .clone()
                .or_else(|| self.token_endpoint_auth_methods_supported.clone()),
            id_token_signing_alg_values_supported: other
                .id_token_signing_alg_values_supported
                .clone()
                .or_else(|| self.id_token_signing_alg_values_supported.clone()),
            code_challenge_methods_supported: other
                .code_challenge_methods_supported
                .clone()
                .or_else(|| self.code_challenge_methods_supported.clone()),
            authorization_response_iss_parameter_supported: other
                .authorization_response_iss_parameter_supported
                .or(self.authorization_response_iss_parameter_supported),
            extra,
        }
    }

    /// Returns `true` if the OP supports the given token endpoint auth method.
    /// Absent metadata means `client_secret_basic` only.
    #[must_use]
    pub fn supports_token_auth_method(&self, method: &str) -> bool {
        match &self.token_endpoint_auth_methods_supported {
            Some(methods) => methods.iter().any(|m| m == method),
            None => method == "client_secret_basic",
        }
    }
}

// =============================================================================
// Authorization Response
// =============================================================================

/// Parameters the OP sent back to a callback URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// RFC 9207 issuer identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl AuthorizationResponse {
    /// Builds a response from raw callback query or form parameters.
    /// Unknown parameters are dropped.
    #[must_use]
    pub fn from_params(params: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            state: get("state"),
            code: get("code"),
            id_token: get("id_token"),
            access_token: get("access_token"),
            token_type: get("token_type"),
            expires_in: get("expires_in").and_then(|v| v.parse().ok()),
            scope: get("scope"),
            iss: get("iss"),
            session_state: get("session_state"),
            error: get("error"),
            error_description: get("error_description"),
        }
    }

    /// Returns this response as a claim map with absent fields omitted.
    #[must_use]
    pub fn to_claims(&self) -> Claims {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Claims::new(),
        }
    }
}

// =============================================================================
// Token Response
// =============================================================================

/// Token endpoint response, or tokens taken from an implicit flow callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_lenient_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_in: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Raw ID token (JWT).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Absolute expiry as a Unix timestamp, computed on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenSet {
    /// Computes `expires_at` from `expires_in` relative to `now`.
    /// Out of range lifetimes saturate.
    #[must_use]
    pub fn with_expiry_from(mut self, now: i64) -> Self {
        if let Some(expires_in) = self.expires_in {
            self.expires_at = Some(now.saturating_add(expires_in));
        }
        self
    }

    /// Returns `true` if the access token is past `expires_at`.
    /// Tokens without an expiry never expire.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Applies a refresh response. The refresh token is kept unless the OP
    /// rotated it, as is the ID token unless a new one was issued.
    #[must_use]
    pub fn refreshed_with(&self, fresh: TokenSet) -> TokenSet {
        TokenSet {
            refresh_token: fresh.refresh_token.or_else(|| self.refresh_token.clone()),
            id_token: fresh.id_token.or_else(|| self.id_token.clone()),
            scope: fresh.scope.or_else(|| self.scope.clone()),
            ..fresh
        }
    }
}

// =============================================================================
// ID Token Claims
// =============================================================================

/// ID token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer identifier.
    pub iss: String,

    /// Subject identifier.
    pub sub: String,

    /// Audience (string or array on the wire).
    #[serde(deserialize_with = "deserialize_audience")]
    pub aud: Vec<String>,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issued at time (Unix timestamp).
    pub iat: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amr: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,

    /// End-user claims and anything else not defined above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdTokenClaims {
    /// Returns every claim as a map.
    #[must_use]
    pub fn to_claims(&self) -> Claims {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Claims::new(),
        }
    }

    /// Returns the end-user claims: `sub` plus everything that is not a
    /// protocol claim.
    #[must_use]
    pub fn user_claims(&self) -> Claims {
        let mut claims = Claims::new();
        claims.insert("sub".to_string(), Value::String(self.sub.clone()));
        for (name, value) in &self.extra {
            if !PROTOCOL_CLAIMS.contains(&name.as_str()) {
                claims.insert(name.clone(), value.clone());
            }
        }
        claims
    }
}

// =============================================================================
// WebFinger
// =============================================================================

/// JSON Resource Descriptor returned by WebFinger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Jrd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default)]
    pub links: Vec<Link>,
}

/// A JRD link record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl Jrd {
    /// Returns the OpenID Connect issuer link, if any.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == OIDC_ISSUER_REL)
            .and_then(|l| l.href.as_deref())
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Dynamic client registration response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_access_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_client_uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uris: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_logout_redirect_uris: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,

    /// Metadata echoed back by the OP.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// OAuth 2.0 error response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl OAuthErrorResponse {
    /// Formats the error as `error: description`.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.error_description {
            Some(description) => format!("{}: {}", self.error, description),
            None => self.error.clone(),
        }
    }
}

/// Audience can be a single string or an array.
fn deserialize_audience<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(vec![s]),
        OneOrMany::Many(v) => Ok(v),
    }
}

/// Form-encoded token responses carry numbers as strings.
fn deserialize_lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
