//! Relying party configuration and OP configuration resolution.
//!
//! [`RpConfig`] holds the process-wide settings plus one [`ClientConfig`] per
//! configured OpenID Provider. The entry stored under the empty key (`""`) is
//! the default template: it supplies every field an issuer-specific entry
//! leaves out, and is used on its own for dynamically discovered providers.
//!
//! # Example (TOML)
//!
//! ```toml
//! base_url = "https://app.example.com/rp"
//! request_timeout = "10s"
//!
//! [clients.""]
//! client_preferences = { application_type = "web", contacts = ["ops@example.com"] }
//! behaviour = { response_types = ["code"], scope = ["openid", "email"] }
//!
//! [clients."".services]
//! webfinger = {}
//! discovery = {}
//! registration = {}
//! authorization = {}
//! access_token = {}
//! userinfo = {}
//!
//! [clients.github]
//! issuer = "https://github.com/login/oauth/authorize"
//! client_id = "eeeeeeeee"
//! client_secret = "aaaaaaaaaaaaaaaaaaaa"
//!
//! [clients.github.behaviour]
//! response_types = ["code"]
//! scope = ["user", "public_repo"]
//! token_endpoint_auth_method = ""
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::service::{ServiceKind, StrategyRegistry};
use crate::transport::HttpMethod;

/// Key of the default client template.
pub const DEFAULT_CLIENT_KEY: &str = "";

/// Root relying party configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpConfig {
    /// Public base URL of the RP. Callback URLs are derived from it.
    pub base_url: String,

    /// Secret prefix mixed into the issuer hash used in callback URLs.
    pub hash_seed: String,

    /// Timeout applied to every call to an OP.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Clock skew tolerated when validating ID tokens.
    #[serde(with = "humantime_serde")]
    pub clock_skew_tolerance: Duration,

    /// Whether plain HTTP provider endpoints are accepted.
    /// This should only be enabled for testing.
    pub allow_http: bool,

    /// Client configurations keyed by issuer identifier.
    pub clients: BTreeMap<String, ClientConfig>,
}

impl Default for RpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            hash_seed: String::new(),
            request_timeout: Duration::from_secs(10),
            clock_skew_tolerance: Duration::from_secs(60),
            allow_http: false,
            clients: BTreeMap::new(),
        }
    }
}

impl RpConfig {
    /// Creates a configuration for the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parses a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and any error reported
    /// by [`RpConfig::validate`].
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the hash seed.
    #[must_use]
    pub fn with_hash_seed(mut self, seed: impl Into<String>) -> Self {
        self.hash_seed = seed.into();
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the clock skew tolerance.
    #[must_use]
    pub fn with_clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_skew_tolerance = tolerance;
        self
    }

    /// Allows HTTP (non-HTTPS) provider endpoints.
    #[must_use]
    pub fn with_allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Adds a client configuration under `key`.
    #[must_use]
    pub fn with_client(mut self, key: impl Into<String>, client: ClientConfig) -> Self {
        self.clients.insert(key.into(), client);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - `base_url` is not an absolute URL
    /// - a client names an unknown service or provider strategy
    /// - a client declares an unparseable issuer URL
    /// - a client uses an unsupported `userinfo_request_method` or service
    ///   `request_method`
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.base_url).map_err(|e| {
            ConfigError::InvalidValue(format!("base_url '{}': {}", self.base_url, e))
        })?;

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "request_timeout must be greater than zero".to_string(),
            ));
        }

        let strategies = StrategyRegistry::with_builtin();
        for (key, client) in &self.clients {
            client
                .validate(&strategies)
                .map_err(|e| ConfigError::InvalidValue(format!("client '{}': {}", key, e)))?;
        }

        Ok(())
    }
}

/// Requested client behaviour towards one OP.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Behaviour {
    /// Response types, the first one is used for authorization requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types: Vec<String>,

    /// Requested scopes. Accepts a list or a space separated string.
    #[serde(
        default,
        deserialize_with = "deserialize_space_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub scope: Vec<String>,

    /// Client authentication method at the token endpoint.
    /// An empty string means no client authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,

    /// Optional `response_mode` (e.g. `form_post`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,

    /// Send a PKCE S256 challenge with the authorization request.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pkce: bool,
}

impl Behaviour {
    /// Creates behaviour with the given response types and scopes.
    #[must_use]
    pub fn new(response_types: &[&str], scope: &[&str]) -> Self {
        Self {
            response_types: response_types.iter().map(|s| s.to_string()).collect(),
            scope: scope.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Sets the token endpoint authentication method.
    #[must_use]
    pub fn with_token_endpoint_auth_method(mut self, method: impl Into<String>) -> Self {
        self.token_endpoint_auth_method = Some(method.into());
        self
    }

    /// Sets the response mode.
    #[must_use]
    pub fn with_response_mode(mut self, mode: impl Into<String>) -> Self {
        self.response_mode = Some(mode.into());
        self
    }

    /// Enables or disables PKCE.
    #[must_use]
    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.pkce = enabled;
        self
    }

    /// Returns the response type used for authorization requests.
    #[must_use]
    pub fn response_type(&self) -> &str {
        self.response_types
            .first()
            .map(String::as_str)
            .unwrap_or("code")
    }
}

/// Per-service settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// Provider strategy (`standard`, `github`, `linkedin`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,

    /// Client authentication method used when the behaviour does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_authn_method: Option<String>,

    /// HTTP method override (userinfo only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
}

impl ServiceSpec {
    /// Creates a spec using the standard strategy.
    #[must_use]
    pub fn standard() -> Self {
        Self::default()
    }

    /// Creates a spec using the named strategy.
    #[must_use]
    pub fn with_strategy(strategy: impl Into<String>) -> Self {
        Self {
            strategy: Some(strategy.into()),
            ..Self::default()
        }
    }

    /// Sets the default client authentication method.
    #[must_use]
    pub fn with_default_authn_method(mut self, method: impl Into<String>) -> Self {
        self.default_authn_method = Some(method.into());
        self
    }

    /// Sets the HTTP method override.
    #[must_use]
    pub fn with_request_method(mut self, method: impl Into<String>) -> Self {
        self.request_method = Some(method.into());
        self
    }
}

/// Static description of one OpenID Provider.
///
/// All fields are optional so that an issuer-specific entry can be merged
/// field by field over the default template.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// The OP issuer identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Statically registered client ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Statically registered client secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Redirect URIs. Derived from the callback URLs when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uris: Option<Vec<String>>,

    /// Post logout redirect URIs. Defaults to the RP base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_logout_redirect_uris: Option<Vec<String>>,

    /// Requested behaviour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behaviour: Option<Behaviour>,

    /// Client metadata sent at dynamic registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_preferences: Option<Map<String, Value>>,

    /// Enabled services keyed by service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<BTreeMap<String, ServiceSpec>>,

    /// Static provider metadata. Disables discovery when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_info: Option<Map<String, Value>>,

    /// HTTP method for userinfo requests (`GET` or `POST`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_request_method: Option<String>,
}

impl ClientConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the issuer.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Sets static client credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    /// Sets the redirect URIs.
    #[must_use]
    pub fn with_redirect_uris(mut self, uris: Vec<String>) -> Self {
        self.redirect_uris = Some(uris);
        self
    }

    /// Sets the behaviour.
    #[must_use]
    pub fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = Some(behaviour);
        self
    }

    /// Sets the registration preferences.
    #[must_use]
    pub fn with_client_preferences(mut self, preferences: Map<String, Value>) -> Self {
        self.client_preferences = Some(preferences);
        self
    }

    /// Enables a service.
    #[must_use]
    pub fn with_service(mut self, name: impl Into<String>, spec: ServiceSpec) -> Self {
        self.services
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), spec);
        self
    }

    /// Sets static provider metadata.
    #[must_use]
    pub fn with_provider_info(mut self, provider_info: Map<String, Value>) -> Self {
        self.provider_info = Some(provider_info);
        self
    }

    /// Sets the userinfo request method.
    #[must_use]
    pub fn with_userinfo_request_method(mut self, method: impl Into<String>) -> Self {
        self.userinfo_request_method = Some(method.into());
        self
    }

    /// Returns this configuration with every absent field taken from `template`.
    #[must_use]
    pub fn merged_over(&self, template: &ClientConfig) -> ClientConfig {
        ClientConfig {
            issuer: self.issuer.clone().or_else(|| template.issuer.clone()),
            client_id: self.client_id.clone().or_else(|| template.client_id.clone()),
            client_secret: self
                .client_secret
                .clone()
                .or_else(|| template.client_secret.clone()),
            redirect_uris: self
                .redirect_uris
                .clone()
                .or_else(|| template.redirect_uris.clone()),
            post_logout_redirect_uris: self
                .post_logout_redirect_uris
                .clone()
                .or_else(|| template.post_logout_redirect_uris.clone()),
            behaviour: self.behaviour.clone().or_else(|| template.behaviour.clone()),
            client_preferences: self
                .client_preferences
                .clone()
                .or_else(|| template.client_preferences.clone()),
            services: self.services.clone().or_else(|| template.services.clone()),
            provider_info: self
                .provider_info
                .clone()
                .or_else(|| template.provider_info.clone()),
            userinfo_request_method: self
                .userinfo_request_method
                .clone()
                .or_else(|| template.userinfo_request_method.clone()),
        }
    }

    fn validate(&self, strategies: &StrategyRegistry) -> Result<(), String> {
        if let Some(issuer) = &self.issuer {
            url::Url::parse(issuer).map_err(|e| format!("issuer '{}': {}", issuer, e))?;
        }

        for (name, spec) in self.services.iter().flatten() {
            if ServiceKind::from_name(name).is_none() {
                return Err(format!("unknown service '{}'", name));
            }
            if let Some(strategy) = &spec.strategy
                && !strategies.contains(strategy)
            {
                return Err(format!("unknown strategy '{}' for service '{}'", strategy, name));
            }
            if let Some(method) = &spec.request_method
                && HttpMethod::parse(method).is_none()
            {
                return Err(format!(
                    "unsupported request_method '{}' for service '{}'",
                    method, name
                ));
            }
        }

        if let Some(method) = &self.userinfo_request_method
            && HttpMethod::parse(method).is_none()
        {
            return Err(format!("unsupported userinfo_request_method '{}'", method));
        }

        Ok(())
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Outcome of resolving an identifier against the configured clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A statically configured OP (already merged over the template).
    Configured(ClientConfig),

    /// No static entry applies. The identifier must be run through WebFinger
    /// and provider discovery, using the template for everything else.
    NeedsDiscovery {
        /// The default client template.
        template: ClientConfig,
        /// The raw identifier, interpreted as an end-user identifier.
        user_id: String,
    },
}

/// Resolves issuer keys, issuer URLs and end-user identifiers to client
/// configurations.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    clients: BTreeMap<String, ClientConfig>,
}

impl ConfigResolver {
    /// Creates a resolver over the given client configurations.
    #[must_use]
    pub fn new(clients: BTreeMap<String, ClientConfig>) -> Self {
        Self { clients }
    }

    /// Returns the default template, if configured.
    #[must_use]
    pub fn template(&self) -> Option<&ClientConfig> {
        self.clients.get(DEFAULT_CLIENT_KEY)
    }

    /// Returns the configured keys, excluding the template.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.clients
            .keys()
            .filter(|k| !k.is_empty())
            .map(String::as_str)
    }

    /// Resolves an issuer key, issuer URL or end-user identifier.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` when nothing matches and no template
    /// without an issuer restriction exists.
    pub fn resolve(&self, identifier: &str) -> Result<Resolution, ConfigError> {
        if let Some(config) = self.configured(identifier) {
            return Ok(Resolution::Configured(config));
        }

        match self.template() {
            Some(template) if template.issuer.is_none() => Ok(Resolution::NeedsDiscovery {
                template: template.clone(),
                user_id: identifier.to_string(),
            }),
            _ => Err(ConfigError::Missing(format!(
                "no client configuration for '{}' and no default template",
                identifier
            ))),
        }
    }

    /// Returns the merged configuration for `identifier`, or the template
    /// itself when the identifier is empty or unknown.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` when neither exists.
    pub fn pick_config(&self, identifier: &str) -> Result<ClientConfig, ConfigError> {
        if let Some(config) = self.configured(identifier) {
            return Ok(config);
        }
        self.template().cloned().ok_or_else(|| {
            ConfigError::Missing(format!(
                "no client configuration for '{}' and no default template",
                identifier
            ))
        })
    }

    /// Returns the configuration to use for a known issuer URL.
    ///
    /// Looks for an entry declaring that issuer (or keyed by it), falling back
    /// to the template with the issuer filled in.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if no entry matches and no template
    /// without an issuer restriction exists.
    pub fn config_for_issuer(&self, issuer: &str) -> Result<ClientConfig, ConfigError> {
        if let Some(config) = self.configured(issuer) {
            return Ok(config);
        }
        match self.template() {
            Some(template) if template.issuer.is_none() => Ok(ClientConfig {
                issuer: Some(issuer.to_string()),
                ..template.clone()
            }),
            _ => Err(ConfigError::Missing(format!(
                "no client configuration for issuer '{}'",
                issuer
            ))),
        }
    }

    fn configured(&self, identifier: &str) -> Option<ClientConfig> {
        if identifier.is_empty() {
            return None;
        }
        let empty = ClientConfig::default();
        let template = self.template().unwrap_or(&empty);

        if let Some(config) = self.clients.get(identifier) {
            return Some(config.merged_over(template));
        }

        let wanted = identifier.trim_end_matches('/');
        self.clients
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .find(|(_, config)| {
                config
                    .issuer
                    .as_deref()
                    .is_some_and(|iss| iss.trim_end_matches('/') == wanted)
            })
            .map(|(_, config)| config.merged_over(template))
    }
}

/// Accepts either a JSON/TOML list of strings or a single space separated
/// string.
fn deserialize_space_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
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
        OneOrMany::One(s) => Ok(s.split_whitespace().map(String::from).collect()),
        OneOrMany::Many(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> ConfigResolver {
        let template = ClientConfig::new()
            .with_behaviour(Behaviour::new(&["code"], &["openid", "profile"]))
            .with_service("authorization", ServiceSpec::standard())
            .with_service("access_token", ServiceSpec::standard());

        let github = ClientConfig::new()
            .with_issuer("https://github.com/login/oauth/authorize")
            .with_credentials("eeeeeeeee", "aaaaaaaaaaaaaaaaaaaa")
            .with_behaviour(
                Behaviour::new(&["code"], &["user", "public_repo"])
                    .with_token_endpoint_auth_method(""),
            );

        let mut clients = BTreeMap::new();
        clients.insert(DEFAULT_CLIENT_KEY.to_string(), template);
        clients.insert("github".to_string(), github);
        ConfigResolver::new(clients)
    }

    #[test]
    fn test_config_defaults() {
        let config = RpConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.clock_skew_tolerance, Duration::from_secs(60));
        assert!(config.hash_seed.is_empty());
        assert!(!config.allow_http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_exact_key_merges_template() {
        let resolver = resolver();
        let Resolution::Configured(config) = resolver.resolve("github").unwrap() else {
            panic!("expected a static configuration");
        };

        assert_eq!(
            config.issuer.as_deref(),
            Some("https://github.com/login/oauth/authorize")
        );
        // Behaviour comes from the specific entry.
        assert_eq!(config.behaviour.as_ref().unwrap().scope, vec!["user", "public_repo"]);
        // Services fall back to the template.
        let services = config.services.unwrap();
        assert!(services.contains_key("authorization"));
        assert!(services.contains_key("access_token"));
    }

    #[test]
    fn test_resolve_by_issuer_url() {
        let resolver = resolver();
        let Resolution::Configured(config) = resolver
            .resolve("https://github.com/login/oauth/authorize")
            .unwrap()
        else {
            panic!("expected a static configuration");
        };
        assert_eq!(config.client_id.as_deref(), Some("eeeeeeeee"));
    }

    #[test]
    fn test_resolve_unknown_needs_discovery() {
        let resolver = resolver();
        let resolution = resolver.resolve("acct:alice@example.com").unwrap();
        assert!(matches!(
            resolution,
            Resolution::NeedsDiscovery { ref user_id, .. } if user_id == "acct:alice@example.com"
        ));
    }

    #[test]
    fn test_resolve_without_template_fails() {
        let mut clients = BTreeMap::new();
        clients.insert(
            "github".to_string(),
            ClientConfig::new().with_issuer("https://github.com/login/oauth/authorize"),
        );
        let resolver = ConfigResolver::new(clients);

        assert!(matches!(
            resolver.resolve("facebook"),
            Err(ConfigError::Missing(_))
        ));
        assert!(resolver.pick_config("facebook").is_err());
    }

    #[test]
    fn test_pick_config_template_has_no_issuer() {
        let resolver = resolver();
        let config = resolver.pick_config("").unwrap();
        assert!(config.issuer.is_none());
    }

    #[test]
    fn test_config_for_issuer_uses_template() {
        let resolver = resolver();
        let config = resolver
            .config_for_issuer("https://server.example.com")
            .unwrap();
        assert_eq!(config.issuer.as_deref(), Some("https://server.example.com"));
        assert!(config.client_id.is_none());
    }

    #[test]
    fn test_scope_accepts_string() {
        let behaviour: Behaviour = serde_json::from_value(json!({
            "response_types": ["code"],
            "scope": "openid email"
        }))
        .unwrap();
        assert_eq!(behaviour.scope, vec!["openid", "email"]);
        assert_eq!(behaviour.response_type(), "code");
    }

    #[test]
    fn test_from_toml_str() {
        let config = RpConfig::from_toml_str(
            r#"
            base_url = "https://example.com/rp"
            request_timeout = "5s"

            [clients.github]
            issuer = "https://github.com/login/oauth/authorize"
            client_id = "eeeeeeeee"
            behaviour = { response_types = ["code"], scope = ["user"] }

            [clients.github.services]
            authorization = {}
            access_token = { strategy = "github" }
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://example.com/rp");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        let github = &config.clients["github"];
        assert_eq!(
            github.services.as_ref().unwrap()["access_token"].strategy.as_deref(),
            Some("github")
        );
    }

    #[test]
    fn test_validate_rejects_unknown_service() {
        let config = RpConfig::new("https://example.com/rp").with_client(
            "x",
            ClientConfig::new().with_service("teleport", ServiceSpec::standard()),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn test_validate_rejects_unknown_strategy() {
        let config = RpConfig::new("https://example.com/rp").with_client(
            "x",
            ClientConfig::new().with_service("access_token", ServiceSpec::with_strategy("myspace")),
        );
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_validate_rejects_bad_request_method() {
        let config = RpConfig::new("https://example.com/rp").with_client(
            "x",
            ClientConfig::new()
                .with_service("userinfo", ServiceSpec::standard().with_request_method("PATCH")),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("PATCH"));

        let config = RpConfig::new("https://example.com/rp").with_client(
            "x",
            ClientConfig::new()
                .with_service("userinfo", ServiceSpec::standard().with_request_method("POST")),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let config = RpConfig::new("not a url");
        assert!(config.validate().is_err());
    }
}
