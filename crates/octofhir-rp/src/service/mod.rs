//! Protocol services.
//!
//! Each OpenID Connect service (WebFinger, discovery, registration,
//! authorization, token, refresh, userinfo) is a [`Service`] that turns the
//! client's [`ServiceContext`] plus call arguments into an [`HttpRequest`],
//! and a provider response back into claims.
//!
//! Services are created by name through the [`ServiceRegistry`] when a client
//! is constructed. Provider quirks live in [`ProviderStrategy`] objects that
//! the services delegate to, chosen per service from configuration or from
//! the issuer.

mod authorization;
mod client_auth;
mod context;
mod discovery;
mod registration;
mod strategy;
mod token;
mod userinfo;
mod webfinger;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use authorization::AuthorizationService;
pub use client_auth::{ClientAuthMethod, resolve_authn_method};
pub use context::ServiceContext;
pub use discovery::ProviderInfoService;
pub use registration::RegistrationService;
pub use strategy::{
    GitHubStrategy, LinkedInStrategy, ProviderStrategy, StandardStrategy, StrategyRegistry,
};
pub use token::{AccessTokenService, RefreshAccessTokenService};
pub use userinfo::UserInfoService;
pub use webfinger::WebFingerService;

use crate::RpResult;
use crate::config::ServiceSpec;
use crate::error::{FlowStep, RpError};
use crate::message::{Claims, OAuthErrorResponse};
use crate::transport::{HttpRequest, HttpResponse};

/// Arguments of one service call.
pub type RequestArgs = BTreeMap<String, String>;

/// The OpenID Connect services a client can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceKind {
    WebFinger,
    ProviderInfo,
    Registration,
    Authorization,
    AccessToken,
    RefreshAccessToken,
    UserInfo,
}

impl ServiceKind {
    /// Every service kind.
    pub const ALL: [ServiceKind; 7] = [
        Self::WebFinger,
        Self::ProviderInfo,
        Self::Registration,
        Self::Authorization,
        Self::AccessToken,
        Self::RefreshAccessToken,
        Self::UserInfo,
    ];

    /// Parses a configured service name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "webfinger" => Some(Self::WebFinger),
            "discovery" | "provider_info" => Some(Self::ProviderInfo),
            "registration" => Some(Self::Registration),
            "authorization" => Some(Self::Authorization),
            "access_token" => Some(Self::AccessToken),
            "refresh_access_token" | "refresh_token" => Some(Self::RefreshAccessToken),
            "userinfo" => Some(Self::UserInfo),
            _ => None,
        }
    }

    /// Returns the canonical service name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::WebFinger => "webfinger",
            Self::ProviderInfo => "discovery",
            Self::Registration => "registration",
            Self::Authorization => "authorization",
            Self::AccessToken => "access_token",
            Self::RefreshAccessToken => "refresh_access_token",
            Self::UserInfo => "userinfo",
        }
    }

    /// Provider metadata field holding this service's URL.
    ///
    /// WebFinger and discovery are located from the user identifier and the
    /// issuer respectively, so they have none.
    #[must_use]
    pub fn endpoint_name(&self) -> Option<&'static str> {
        match self {
            Self::WebFinger | Self::ProviderInfo => None,
            Self::Registration => Some("registration_endpoint"),
            Self::Authorization => Some("authorization_endpoint"),
            Self::AccessToken | Self::RefreshAccessToken => Some("token_endpoint"),
            Self::UserInfo => Some("userinfo_endpoint"),
        }
    }

    /// The flow step reported when a call of this service fails.
    #[must_use]
    pub fn flow_step(&self) -> FlowStep {
        match self {
            Self::WebFinger => FlowStep::WebFinger,
            Self::ProviderInfo => FlowStep::Discovery,
            Self::Authorization => FlowStep::Authorization,
            Self::Registration => FlowStep::Registration,
            Self::AccessToken => FlowStep::TokenExchange,
            Self::RefreshAccessToken => FlowStep::Refresh,
            Self::UserInfo => FlowStep::UserInfo,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One OpenID Connect service bound to a client.
pub trait Service: Send + Sync {
    /// The kind of this service.
    fn kind(&self) -> ServiceKind;

    /// Provider metadata field supplying this service's URL.
    fn endpoint_name(&self) -> Option<&'static str> {
        self.kind().endpoint_name()
    }

    /// Client authentication method configured for this service, if any.
    fn default_authn_method(&self) -> Option<&str> {
        None
    }

    /// Builds the request for one call.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the context lacks what the
    /// request needs (endpoint, credentials).
    fn build_request(&self, context: &ServiceContext, args: &RequestArgs) -> RpResult<HttpRequest>;

    /// Parses a provider response into claims.
    ///
    /// # Errors
    ///
    /// Returns the step-specific error for non-success responses and
    /// undecodable bodies.
    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims>;
}

/// Constructor of a service from its spec and the chosen strategy.
pub type ServiceConstructor = fn(&ServiceSpec, Arc<dyn ProviderStrategy>) -> Arc<dyn Service>;

/// Name to constructor mapping for services.
#[derive(Clone)]
pub struct ServiceRegistry {
    constructors: BTreeMap<ServiceKind, ServiceConstructor>,
    strategies: StrategyRegistry,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ServiceRegistry {
    /// Creates a registry with every built-in service and strategy.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut constructors: BTreeMap<ServiceKind, ServiceConstructor> = BTreeMap::new();
        constructors.insert(ServiceKind::WebFinger, |_, strategy| {
            Arc::new(WebFingerService::new(strategy))
        });
        constructors.insert(ServiceKind::ProviderInfo, |_, strategy| {
            Arc::new(ProviderInfoService::new(strategy))
        });
        constructors.insert(ServiceKind::Registration, |_, strategy| {
            Arc::new(RegistrationService::new(strategy))
        });
        constructors.insert(ServiceKind::Authorization, |_, strategy| {
            Arc::new(AuthorizationService::new(strategy))
        });
        constructors.insert(ServiceKind::AccessToken, |spec, strategy| {
            Arc::new(AccessTokenService::new(strategy, spec.default_authn_method.clone()))
        });
        constructors.insert(ServiceKind::RefreshAccessToken, |spec, strategy| {
            Arc::new(RefreshAccessTokenService::new(
                strategy,
                spec.default_authn_method.clone(),
            ))
        });
        constructors.insert(ServiceKind::UserInfo, |spec, strategy| {
            Arc::new(UserInfoService::new(strategy, spec.request_method.as_deref()))
        });

        Self {
            constructors,
            strategies: StrategyRegistry::with_builtin(),
        }
    }

    /// Replaces the constructor of a service kind.
    #[must_use]
    pub fn with_constructor(mut self, kind: ServiceKind, constructor: ServiceConstructor) -> Self {
        self.constructors.insert(kind, constructor);
        self
    }

    /// Returns the strategy registry.
    #[must_use]
    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    /// Instantiates the named services for a client of `issuer`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown service or strategy names.
    pub fn build(
        &self,
        issuer: &str,
        specs: &BTreeMap<String, ServiceSpec>,
    ) -> RpResult<BTreeMap<ServiceKind, Arc<dyn Service>>> {
        let mut services = BTreeMap::new();
        for (name, spec) in specs {
            let kind = ServiceKind::from_name(name)
                .ok_or_else(|| RpError::configuration(format!("unknown service '{}'", name)))?;
            let constructor = self.constructors.get(&kind).ok_or_else(|| {
                RpError::configuration(format!("no constructor registered for '{}'", name))
            })?;
            let strategy = match &spec.strategy {
                Some(strategy) => self.strategies.get(strategy).ok_or_else(|| {
                    RpError::configuration(format!(
                        "unknown strategy '{}' for service '{}'",
                        strategy, name
                    ))
                })?,
                None => self.strategies.for_issuer(issuer),
            };
            tracing::debug!(
                issuer = %issuer,
                service = %kind,
                strategy = strategy.name(),
                "Configured service"
            );
            services.insert(kind, constructor(spec, strategy));
        }
        Ok(services)
    }
}

/// Maps a non-success response to the error of `kind`'s flow step, using
/// the OAuth error body when there is one.
pub(crate) fn error_from_response(kind: ServiceKind, response: &HttpResponse) -> RpError {
    let detail = match response.json_body::<OAuthErrorResponse>() {
        Ok(oauth_error) => oauth_error.describe(),
        Err(_) => format!("HTTP {}", response.status),
    };
    RpError::for_step(
        kind.flow_step(),
        format!("{} request failed: {}", kind, detail),
    )
}

/// Checks the status of a response and decodes it through `strategy`.
pub(crate) fn decode_response(
    kind: ServiceKind,
    strategy: &dyn ProviderStrategy,
    response: &HttpResponse,
) -> RpResult<Claims> {
    if !response.is_success() {
        return Err(error_from_response(kind, response));
    }
    strategy.decode_response(kind, response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names_round_trip() {
        for kind in ServiceKind::ALL {
            assert_eq!(ServiceKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(
            ServiceKind::from_name("refresh_token"),
            Some(ServiceKind::RefreshAccessToken)
        );
        assert_eq!(ServiceKind::from_name("teleport"), None);
    }

    #[test]
    fn test_endpoint_name_mapping() {
        assert_eq!(
            ServiceKind::Authorization.endpoint_name(),
            Some("authorization_endpoint")
        );
        assert_eq!(ServiceKind::AccessToken.endpoint_name(), Some("token_endpoint"));
        assert_eq!(
            ServiceKind::RefreshAccessToken.endpoint_name(),
            Some("token_endpoint")
        );
        assert_eq!(ServiceKind::UserInfo.endpoint_name(), Some("userinfo_endpoint"));
        assert_eq!(ServiceKind::ProviderInfo.endpoint_name(), None);
    }

    #[test]
    fn test_registry_builds_configured_services_only() {
        let registry = ServiceRegistry::with_builtin();
        let mut specs = BTreeMap::new();
        specs.insert("authorization".to_string(), ServiceSpec::standard());
        specs.insert("access_token".to_string(), ServiceSpec::standard());

        let services = registry.build("https://op.example.com", &specs).unwrap();
        assert_eq!(services.len(), 2);
        assert!(services.contains_key(&ServiceKind::Authorization));
        assert!(services.contains_key(&ServiceKind::AccessToken));
        assert!(!services.contains_key(&ServiceKind::UserInfo));
    }

    #[test]
    fn test_registry_rejects_unknown_names() {
        let registry = ServiceRegistry::with_builtin();

        let mut specs = BTreeMap::new();
        specs.insert("teleport".to_string(), ServiceSpec::standard());
        let err = registry.build("https://op.example.com", &specs).err().unwrap();
        assert!(matches!(err, RpError::Configuration { .. }));

        let mut specs = BTreeMap::new();
        specs.insert("access_token".to_string(), ServiceSpec::with_strategy("myspace"));
        let err = registry.build("https://op.example.com", &specs).err().unwrap();
        assert!(err.to_string().contains("myspace"));
    }

    #[test]
    fn test_error_from_response_uses_oauth_body() {
        let response = HttpResponse::new(
            400,
            r#"{"error":"invalid_grant","error_description":"expired"}"#,
        );
        let err = error_from_response(ServiceKind::AccessToken, &response);
        assert!(matches!(err, RpError::TokenExchange { .. }));
        assert!(err.to_string().contains("invalid_grant: expired"));

        let err =
            error_from_response(ServiceKind::UserInfo, &HttpResponse::new(502, "bad gateway"));
        assert!(matches!(err, RpError::UserInfo { .. }));
        assert!(err.to_string().contains("HTTP 502"));
    }
}
