//! Provider strategies.
//!
//! A strategy captures how one provider deviates from the standard request
//! and response shapes. Services call into their strategy when they finish a
//! request and when they decode a response.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::ServiceKind;
use crate::RpResult;
use crate::error::RpError;
use crate::message::Claims;
use crate::transport::{HttpRequest, HttpResponse};

/// Provider-specific request and response handling.
pub trait ProviderStrategy: Send + Sync {
    /// Strategy name as used in configuration.
    fn name(&self) -> &'static str;

    /// Adjusts a request before it is sent.
    fn prepare_request(&self, _kind: ServiceKind, request: HttpRequest) -> HttpRequest {
        request
    }

    /// Decodes a successful response body.
    ///
    /// The default accepts JSON objects and, for form-encoded content types,
    /// `application/x-www-form-urlencoded` bodies.
    ///
    /// # Errors
    ///
    /// Returns the step-specific error of `kind` for undecodable bodies.
    fn decode_response(&self, kind: ServiceKind, response: &HttpResponse) -> RpResult<Claims> {
        decode_body(kind, response)
    }
}

/// Standard OpenID Connect behaviour.
#[derive(Debug, Default)]
pub struct StandardStrategy;

impl ProviderStrategy for StandardStrategy {
    fn name(&self) -> &'static str {
        "standard"
    }
}

/// GitHub OAuth apps.
///
/// The token endpoint answers form-encoded unless JSON is requested, and the
/// user API identifies users by a numeric `id` instead of `sub`.
#[derive(Debug, Default)]
pub struct GitHubStrategy;

impl ProviderStrategy for GitHubStrategy {
    fn name(&self) -> &'static str {
        "github"
    }

    fn prepare_request(&self, kind: ServiceKind, request: HttpRequest) -> HttpRequest {
        match kind {
            ServiceKind::AccessToken | ServiceKind::RefreshAccessToken => {
                request.with_header("Accept", "application/json")
            }
            ServiceKind::UserInfo => request.with_header("Accept", "application/vnd.github+json"),
            _ => request,
        }
    }

    fn decode_response(&self, kind: ServiceKind, response: &HttpResponse) -> RpResult<Claims> {
        let mut claims = decode_body(kind, response)?;
        if kind == ServiceKind::UserInfo && !claims.contains_key("sub") {
            let sub = match claims.get("id") {
                Some(Value::String(id)) => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            };
            if let Some(sub) = sub {
                claims.insert("sub".to_string(), Value::String(sub));
            }
        }
        Ok(claims)
    }
}

/// LinkedIn.
///
/// Token responses omit `token_type`; the token is a bearer token.
#[derive(Debug, Default)]
pub struct LinkedInStrategy;

impl ProviderStrategy for LinkedInStrategy {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    fn decode_response(&self, kind: ServiceKind, response: &HttpResponse) -> RpResult<Claims> {
        let mut claims = decode_body(kind, response)?;
        if matches!(kind, ServiceKind::AccessToken | ServiceKind::RefreshAccessToken) {
            claims
                .entry("token_type")
                .or_insert_with(|| Value::String("Bearer".to_string()));
        }
        Ok(claims)
    }
}

/// Constructor of a strategy.
pub type StrategyConstructor = fn() -> Arc<dyn ProviderStrategy>;

/// Name to constructor mapping for strategies.
#[derive(Clone)]
pub struct StrategyRegistry {
    constructors: BTreeMap<String, StrategyConstructor>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl StrategyRegistry {
    /// Creates a registry with the `standard`, `github` and `linkedin`
    /// strategies.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut constructors: BTreeMap<String, StrategyConstructor> = BTreeMap::new();
        constructors.insert("standard".to_string(), || Arc::new(StandardStrategy));
        constructors.insert("github".to_string(), || Arc::new(GitHubStrategy));
        constructors.insert("linkedin".to_string(), || Arc::new(LinkedInStrategy));
        Self { constructors }
    }

    /// Registers a strategy under `name`.
    #[must_use]
    pub fn with_strategy(
        mut self,
        name: impl Into<String>,
        constructor: StrategyConstructor,
    ) -> Self {
        self.constructors.insert(name.into(), constructor);
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Instantiates the named strategy.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderStrategy>> {
        self.constructors.get(name).map(|constructor| constructor())
    }

    /// Picks a strategy from the issuer host when none is configured.
    #[must_use]
    pub fn for_issuer(&self, issuer: &str) -> Arc<dyn ProviderStrategy> {
        let host = url::Url::parse(issuer)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        let name = if host == "github.com" || host.ends_with(".github.com") {
            "github"
        } else if host == "linkedin.com" || host.ends_with(".linkedin.com") {
            "linkedin"
        } else {
            "standard"
        };
        self.get(name).unwrap_or_else(|| Arc::new(StandardStrategy))
    }
}

/// Decodes a JSON or form-encoded body into claims.
pub(crate) fn decode_body(kind: ServiceKind, response: &HttpResponse) -> RpResult<Claims> {
    let form_encoded = response
        .content_type()
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if form_encoded {
        return Ok(url::form_urlencoded::parse(response.body.as_bytes())
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect());
    }

    response.json_body::<Claims>().map_err(|e| {
        RpError::for_step(
            kind.flow_step(),
            format!("invalid {} response: {}", kind, e),
        )
    })
}
