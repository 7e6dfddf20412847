use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value};

use super::ServiceKind;
use crate::RpResult;
use crate::callback::CallbackUrls;
use crate::config::Behaviour;
use crate::error::RpError;
use crate::keys::SharedKeyStore;
use crate::message::{ProviderMetadata, RegistrationResponse};

/// Everything the services of one client know about their OP and about the
/// RP's registration with it.
///
/// Snapshots are immutable; the client swaps in a new one when discovery or
/// registration learns something.
#[derive(Clone)]
pub struct ServiceContext {
    /// The OP issuer this client serves.
    pub issuer: String,

    pub client_id: Option<String>,

    pub client_secret: Option<String>,

    /// Provider metadata, static or discovered.
    pub provider_info: ProviderMetadata,

    /// Resolved URL per service.
    pub endpoints: BTreeMap<ServiceKind, String>,

    pub redirect_uris: Vec<String>,

    pub post_logout_redirect_uris: Vec<String>,

    /// Callback URLs derived for this issuer.
    pub callbacks: CallbackUrls,

    /// Whether `redirect_uris` came from configuration.
    pub static_redirect_uris: bool,

    pub behaviour: Behaviour,

    /// Client metadata sent at dynamic registration.
    pub client_preferences: Map<String, Value>,

    /// Dynamic registration response, once registered.
    pub registration: Option<RegistrationResponse>,

    /// RP base URL.
    pub base_url: String,

    /// Clock skew tolerated on ID token time claims.
    pub clock_skew_tolerance: Duration,

    /// Issuer-scoped key store.
    pub keys: SharedKeyStore,
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("endpoints", &self.endpoints)
            .field("redirect_uris", &self.redirect_uris)
            .field("registered", &self.registration.is_some())
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    /// Returns the URL of `kind`'s endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the endpoint was never resolved.
    pub fn endpoint(&self, kind: ServiceKind) -> RpResult<&str> {
        self.endpoints.get(&kind).map(String::as_str).ok_or_else(|| {
            RpError::configuration(format!(
                "no endpoint known for service '{}' at {}",
                kind, self.issuer
            ))
        })
    }

    /// Returns the client ID.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the client is not registered.
    pub fn require_client_id(&self) -> RpResult<&str> {
        self.client_id
            .as_deref()
            .ok_or_else(|| RpError::configuration(format!("no client_id for {}", self.issuer)))
    }

    /// Returns the redirect URI for the configured response type and mode.
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        let derived = self.callbacks.for_response(
            self.behaviour.response_type(),
            self.behaviour.response_mode.as_deref(),
        );
        if self.static_redirect_uris {
            self.redirect_uris
                .first()
                .map(String::as_str)
                .unwrap_or(derived)
        } else {
            derived
        }
    }
}

#[cfg(test)]
impl ServiceContext {
    /// Context for a statically registered client of `issuer`.
    pub(crate) fn for_tests(issuer: &str) -> Self {
        Self {
            issuer: issuer.to_string(),
            client_id: Some("client_1".to_string()),
            client_secret: Some("secret".to_string()),
            provider_info: ProviderMetadata::default(),
            endpoints: BTreeMap::new(),
            redirect_uris: Vec::new(),
            post_logout_redirect_uris: Vec::new(),
            callbacks: crate::callback::callbacks_for("https://rp.example.com", "", issuer),
            static_redirect_uris: false,
            behaviour: Behaviour::new(&["code"], &["openid"]),
            client_preferences: Map::new(),
            registration: None,
            base_url: "https://rp.example.com".to_string(),
            clock_skew_tolerance: Duration::from_secs(60),
            keys: std::sync::Arc::new(crate::keys::InMemoryKeyStore::new()),
        }
    }

    pub(crate) fn with_endpoint(mut self, kind: ServiceKind, url: &str) -> Self {
        self.endpoints.insert(kind, url.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_uri_follows_behaviour() {
        let mut ctx = ServiceContext::for_tests("https://op.example.com");
        assert_eq!(ctx.redirect_uri(), ctx.callbacks.code);

        ctx.behaviour = Behaviour::new(&["id_token token"], &["openid"]);
        assert_eq!(ctx.redirect_uri(), ctx.callbacks.implicit);

        ctx.behaviour = Behaviour::new(&["code"], &["openid"]).with_response_mode("form_post");
        assert_eq!(ctx.redirect_uri(), ctx.callbacks.form_post);
    }

    #[test]
    fn test_static_redirect_uri_wins() {
        let mut ctx = ServiceContext::for_tests("https://op.example.com");
        ctx.redirect_uris = vec!["https://rp.example.com/cb".to_string()];
        ctx.static_redirect_uris = true;
        assert_eq!(ctx.redirect_uri(), "https://rp.example.com/cb");
    }

    #[test]
    fn test_missing_endpoint_is_configuration_error() {
        let ctx = ServiceContext::for_tests("https://op.example.com");
        assert!(matches!(
            ctx.endpoint(ServiceKind::UserInfo),
            Err(RpError::Configuration { .. })
        ));
        let ctx = ctx.with_endpoint(ServiceKind::UserInfo, "https://op.example.com/me");
        assert_eq!(ctx.endpoint(ServiceKind::UserInfo).unwrap(), "https://op.example.com/me");
    }
}
