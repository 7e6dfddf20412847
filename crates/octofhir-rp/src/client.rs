//! Per-issuer client.
//!
//! A [`Client`] binds the RP to exactly one OpenID Provider. It owns the
//! services configured for that OP and a [`ServiceContext`] snapshot that
//! discovery and registration replace atomically. Every network call a client
//! makes goes through [`Client::send`], which enforces the request timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode_header};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::sync::{Mutex, MutexGuard};

use crate::RpResult;
use crate::callback::callbacks_for;
use crate::config::{Behaviour, ClientConfig};
use crate::error::{FlowStep, RpError};
use crate::keys::{SharedKeyStore, decoding_keys_for, has_kid};
use crate::message::{Claims, IdTokenClaims, ProviderMetadata, RegistrationResponse};
use crate::service::{
    RequestArgs, Service, ServiceContext, ServiceKind, ServiceRegistry, resolve_authn_method,
};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Setup progress of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientStage {
    /// Constructed from configuration.
    Configured,
    /// Provider metadata known and endpoints resolved.
    Discovered,
    /// Client credentials known.
    Registered,
}

impl ClientStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Configured,
            1 => Self::Discovered,
            _ => Self::Registered,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Discovered => "discovered",
            Self::Registered => "registered",
        }
    }
}

/// Settings and collaborators shared by every client of one handler.
#[derive(Clone)]
pub struct ClientEnvironment {
    pub base_url: String,
    pub hash_seed: String,
    pub request_timeout: Duration,
    pub clock_skew_tolerance: Duration,
    pub keys: SharedKeyStore,
    pub transport: Arc<dyn HttpTransport>,
    pub services: ServiceRegistry,
}

/// Runtime binding of the RP to one OpenID Provider.
pub struct Client {
    issuer: String,
    context: ArcSwap<ServiceContext>,
    services: BTreeMap<ServiceKind, Arc<dyn Service>>,
    transport: Arc<dyn HttpTransport>,
    request_timeout: Duration,
    static_provider_info: bool,
    stage: AtomicU8,
    setup_lock: Mutex<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("issuer", &self.issuer)
            .field("stage", &self.stage())
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Builds a client for `issuer` from its merged configuration.
    ///
    /// Only the configured services are instantiated. Static provider
    /// metadata and credentials are seeded into the context; redirect URIs
    /// default to the callback matching the configured response type.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown services or strategies and
    /// for malformed static provider metadata.
    pub fn from_config(
        issuer: &str,
        config: &ClientConfig,
        env: &ClientEnvironment,
    ) -> RpResult<Self> {
        let mut specs = config.services.clone().unwrap_or_default();
        if let Some(method) = &config.userinfo_request_method
            && let Some(spec) = specs.get_mut(ServiceKind::UserInfo.name())
        {
            spec.request_method.get_or_insert_with(|| method.clone());
        }
        let services = env.services.build(issuer, &specs)?;

        let provider_info = match &config.provider_info {
            Some(map) => ProviderMetadata::from_map(map).map_err(|e| {
                RpError::configuration(format!("invalid provider_info for {}: {}", issuer, e))
            })?,
            None => ProviderMetadata::default(),
        };
        let endpoints = services
            .values()
            .filter_map(|service| {
                let name = service.endpoint_name()?;
                let url = provider_info.endpoint(name)?;
                Some((service.kind(), url.to_string()))
            })
            .collect();

        let behaviour = config
            .behaviour
            .clone()
            .unwrap_or_else(|| Behaviour::new(&["code"], &["openid"]));
        let callbacks = callbacks_for(&env.base_url, &env.hash_seed, issuer);
        let (redirect_uris, static_redirect_uris) = match &config.redirect_uris {
            Some(uris) if !uris.is_empty() => (uris.clone(), true),
            _ => (
                vec![
                    callbacks
                        .for_response(behaviour.response_type(), behaviour.response_mode.as_deref())
                        .to_string(),
                ],
                false,
            ),
        };

        let context = ServiceContext {
            issuer: issuer.to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            provider_info,
            endpoints,
            redirect_uris,
            post_logout_redirect_uris: config.post_logout_redirect_uris.clone().unwrap_or_default(),
            callbacks,
            static_redirect_uris,
            behaviour,
            client_preferences: config.client_preferences.clone().unwrap_or_default(),
            registration: None,
            base_url: env.base_url.clone(),
            clock_skew_tolerance: env.clock_skew_tolerance,
            keys: env.keys.clone(),
        };

        tracing::debug!(
            issuer = %issuer,
            services = services.len(),
            static_provider_info = config.provider_info.is_some(),
            static_client = config.client_id.is_some(),
            "Constructed client"
        );

        Ok(Self {
            issuer: issuer.to_string(),
            context: ArcSwap::from_pointee(context),
            services,
            transport: env.transport.clone(),
            request_timeout: env.request_timeout,
            static_provider_info: config.provider_info.is_some(),
            stage: AtomicU8::new(ClientStage::Configured as u8),
            setup_lock: Mutex::new(()),
        })
    }

    /// The issuer this client serves.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the current context snapshot.
    #[must_use]
    pub fn context(&self) -> Arc<ServiceContext> {
        self.context.load_full()
    }

    #[must_use]
    pub fn stage(&self) -> ClientStage {
        ClientStage::from_u8(self.stage.load(Ordering::Acquire))
    }

    /// Returns `true` if `kind` is configured for this client.
    #[must_use]
    pub fn has_service(&self, kind: ServiceKind) -> bool {
        self.services.contains_key(&kind)
    }

    /// Returns the configured service of `kind`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the service is not configured.
    pub fn service(&self, kind: ServiceKind) -> RpResult<&Arc<dyn Service>> {
        self.services.get(&kind).ok_or_else(|| {
            RpError::configuration(format!(
                "service '{}' is not configured for {}",
                kind, self.issuer
            ))
        })
    }

    /// Replaces the context with a modified copy.
    pub fn update_context<F>(&self, update: F)
    where
        F: Fn(&mut ServiceContext),
    {
        self.context.rcu(|current| {
            let mut next = ServiceContext::clone(current);
            update(&mut next);
            next
        });
    }

    pub(crate) async fn lock_setup(&self) -> MutexGuard<'_, ()> {
        self.setup_lock.lock().await
    }

    fn advance(&self, stage: ClientStage) {
        self.stage.fetch_max(stage as u8, Ordering::AcqRel);
    }

    /// Builds the request of one service call without sending it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the service is not configured, and
    /// whatever the service reports for missing arguments.
    pub fn build_request(&self, kind: ServiceKind, args: &RequestArgs) -> RpResult<HttpRequest> {
        let service = self.service(kind)?;
        service.build_request(&self.context(), args)
    }

    /// Performs one service call: builds the request, sends it and parses
    /// the response.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Timeout` when the call exceeds the request timeout
    /// and the step-specific error for transport and provider failures.
    pub async fn do_request(&self, kind: ServiceKind, args: &RequestArgs) -> RpResult<Claims> {
        let service = self.service(kind)?;
        let request = service.build_request(&self.context(), args)?;
        tracing::debug!(
            issuer = %self.issuer,
            service = %kind,
            method = request.method.as_str(),
            "Calling provider"
        );
        let response = self.send(kind.flow_step(), request).await?;
        service.parse_response(&response)
    }

    /// Sends a request under the client's timeout.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Timeout` on expiry and the step-specific error for
    /// other transport failures.
    pub async fn send(&self, step: FlowStep, request: HttpRequest) -> RpResult<HttpResponse> {
        match tokio::time::timeout(self.request_timeout, self.transport.call(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                tracing::warn!(
                    issuer = %self.issuer,
                    step = %step,
                    "Provider call failed: {}",
                    err
                );
                Err(RpError::from_transport(step, err))
            }
            Err(_) => {
                tracing::warn!(issuer = %self.issuer, step = %step, "Provider call timed out");
                Err(RpError::Timeout { step })
            }
        }
    }

    /// Makes provider metadata available and resolves service endpoints.
    ///
    /// Static metadata is used as is, after checking its declared issuer.
    /// Otherwise the discovery service is called and the returned issuer must
    /// equal this client's issuer.
    ///
    /// # Errors
    ///
    /// - `RpError::Correlation` on an issuer mismatch
    /// - `RpError::Configuration` when neither static metadata nor discovery
    ///   is available, or a service endpoint cannot be resolved
    /// - discovery errors and timeouts from the metadata request
    pub async fn discover(&self) -> RpResult<String> {
        let current = self.context();

        let metadata = if self.static_provider_info {
            current.provider_info.clone()
        } else {
            if !self.has_service(ServiceKind::ProviderInfo) {
                return Err(RpError::configuration(format!(
                    "no provider_info configured and discovery is disabled for {}",
                    self.issuer
                )));
            }
            let claims = self
                .do_request(ServiceKind::ProviderInfo, &RequestArgs::new())
                .await?;
            let discovered = ProviderMetadata::from_map(&claims)
                .map_err(|e| RpError::discovery(format!("invalid provider metadata: {}", e)))?;
            discovered.merged_with(&current.provider_info)
        };

        if let Some(declared) = metadata.issuer.as_deref()
            && !issuers_match(declared, &self.issuer)
        {
            tracing::warn!(
                issuer = %self.issuer,
                declared = %declared,
                "Provider metadata names a different issuer"
            );
            return Err(RpError::correlation(format!(
                "provider metadata issuer '{}' does not match '{}'",
                declared, self.issuer
            )));
        }

        let endpoints = self.resolve_endpoints(&metadata, current.client_id.is_some())?;
        self.update_context(|ctx| {
            ctx.provider_info = metadata.clone();
            ctx.endpoints = endpoints.clone();
        });
        self.advance(ClientStage::Discovered);

        tracing::debug!(issuer = %self.issuer, "Provider metadata resolved");
        Ok(self.issuer.clone())
    }

    fn resolve_endpoints(
        &self,
        metadata: &ProviderMetadata,
        has_client_id: bool,
    ) -> RpResult<BTreeMap<ServiceKind, String>> {
        let mut endpoints = BTreeMap::new();
        for service in self.services.values() {
            let Some(name) = service.endpoint_name() else {
                continue;
            };
            match metadata.endpoint(name) {
                Some(url) => {
                    endpoints.insert(service.kind(), url.to_string());
                }
                None if service.kind() == ServiceKind::Registration && has_client_id => {}
                None => {
                    return Err(RpError::configuration(format!(
                        "provider {} has no '{}' for service '{}'",
                        self.issuer,
                        name,
                        service.kind()
                    )));
                }
            }
        }
        Ok(endpoints)
    }

    /// Obtains client credentials, registering dynamically when none are
    /// configured.
    ///
    /// Post logout redirect URIs default to the RP base URL.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if registration is needed but not
    /// configured, and registration errors or timeouts from the OP.
    pub async fn register(&self) -> RpResult<()> {
        if self.context().post_logout_redirect_uris.is_empty() {
            self.update_context(|ctx| {
                if ctx.post_logout_redirect_uris.is_empty() {
                    ctx.post_logout_redirect_uris = vec![ctx.base_url.clone()];
                }
            });
        }

        if self.context().client_id.is_some() {
            self.advance(ClientStage::Registered);
            return Ok(());
        }

        if !self.has_service(ServiceKind::Registration) {
            return Err(RpError::configuration(format!(
                "no client_id configured and registration is disabled for {}",
                self.issuer
            )));
        }

        let claims = self
            .do_request(ServiceKind::Registration, &RequestArgs::new())
            .await?;
        let registration: RegistrationResponse = serde_json::from_value(Value::Object(claims))
            .map_err(|e| RpError::registration(format!("invalid registration response: {}", e)))?;

        self.update_context(|ctx| {
            ctx.client_id = Some(registration.client_id.clone());
            ctx.client_secret = registration.client_secret.clone();
            if let Some(uris) = registration.redirect_uris.as_ref().filter(|u| !u.is_empty()) {
                ctx.redirect_uris = uris.clone();
            }
            if let Some(uris) = registration.post_logout_redirect_uris.as_ref() {
                ctx.post_logout_redirect_uris = uris.clone();
            }
            ctx.registration = Some(registration.clone());
        });
        self.advance(ClientStage::Registered);

        tracing::info!(issuer = %self.issuer, "Registered client with provider");
        Ok(())
    }

    /// Returns the client authentication method used at `kind`'s endpoint.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the service is not configured.
    pub fn client_authn_method(&self, kind: ServiceKind) -> RpResult<String> {
        let service = self.service(kind)?;
        let context = self.context();
        let method = resolve_authn_method(&context, service.default_authn_method());
        if !method.is_empty()
            && context.provider_info.token_endpoint_auth_methods_supported.is_some()
            && !context.provider_info.supports_token_auth_method(&method)
        {
            tracing::warn!(
                issuer = %self.issuer,
                method = %method,
                "Provider does not advertise the configured auth method"
            );
        }
        Ok(method)
    }

    /// Verifies an ID token issued to this client.
    ///
    /// Checks the signature against the provider keys (or the client secret
    /// for HMAC algorithms), the issuer, the audience, the expiry with the
    /// configured leeway, and the nonce when one is expected. Unknown key
    /// IDs trigger one JWKS refresh.
    ///
    /// # Errors
    ///
    /// - `RpError::Correlation` for issuer, audience or nonce mismatches
    /// - `RpError::Signature` for malformed tokens, bad signatures, expired
    ///   tokens and missing keys
    pub async fn verify_id_token(
        &self,
        raw: &str,
        expected_nonce: Option<&str>,
    ) -> RpResult<IdTokenClaims> {
        let header = decode_header(raw)
            .map_err(|e| RpError::signature(format!("malformed ID token: {}", e)))?;
        let context = self.context();
        let client_id = context.require_client_id()?;

        let keys = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = context.client_secret.as_deref().ok_or_else(|| {
                    RpError::signature("HMAC signed ID token but no client_secret")
                })?;
                vec![DecodingKey::from_secret(secret.as_bytes())]
            }
            _ => self.provider_keys(&header).await?,
        };

        let trimmed = self.issuer.trim_end_matches('/');
        let with_slash = format!("{}/", trimmed);
        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[client_id]);
        validation.set_issuer(&[trimmed, with_slash.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = context.clock_skew_tolerance.as_secs();

        let mut last_error = None;
        let mut verified = None;
        for key in &keys {
            match jsonwebtoken::decode::<IdTokenClaims>(raw, key, &validation) {
                Ok(data) => {
                    verified = Some(data.claims);
                    break;
                }
                Err(err) => {
                    use jsonwebtoken::errors::ErrorKind;
                    match err.kind() {
                        ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => {
                            tracing::warn!(
                                issuer = %self.issuer,
                                "ID token issued for someone else"
                            );
                            return Err(RpError::correlation(format!("ID token rejected: {}", err)));
                        }
                        _ => last_error = Some(err),
                    }
                }
            }
        }
        let claims = verified.ok_or_else(|| {
            RpError::signature(
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no usable verification key".to_string()),
            )
        })?;

        if let Some(expected) = expected_nonce
            && claims.nonce.as_deref() != Some(expected)
        {
            tracing::warn!(issuer = %self.issuer, "ID token nonce mismatch");
            return Err(RpError::correlation("ID token nonce does not match the session"));
        }

        Ok(claims)
    }

    async fn provider_keys(&self, header: &Header) -> RpResult<Vec<DecodingKey>> {
        let context = self.context();
        let kid = header.kid.as_deref();
        let mut jwks = context.keys.verification_keys(&self.issuer);

        let stale = match kid {
            Some(kid) => !has_kid(&jwks, kid),
            None => jwks.is_empty(),
        };
        if stale {
            self.refresh_keys().await?;
            jwks = context.keys.verification_keys(&self.issuer);
        }

        let keys = decoding_keys_for(&jwks, kid, header.alg);
        if keys.is_empty() {
            return Err(RpError::signature(format!(
                "no {:?} verification key{} for {}",
                header.alg,
                kid.map(|k| format!(" with kid '{}'", k)).unwrap_or_default(),
                self.issuer
            )));
        }
        Ok(keys)
    }

    /// Downloads the provider JWKS into the key store.
    ///
    /// # Errors
    ///
    /// Returns a signature error when the provider has no `jwks_uri` or the
    /// document is unusable, and a timeout when the download stalls.
    pub async fn refresh_keys(&self) -> RpResult<usize> {
        let context = self.context();
        let jwks_uri = context
            .provider_info
            .jwks_uri
            .as_deref()
            .ok_or_else(|| RpError::signature(format!("no jwks_uri known for {}", self.issuer)))?;

        let request = HttpRequest::get(jwks_uri).with_header("Accept", "application/json");
        let response = self.send(FlowStep::Jwks, request).await?;
        if !response.is_success() {
            return Err(RpError::signature(format!(
                "JWKS request to {} returned HTTP {}",
                jwks_uri, response.status
            )));
        }
        let set: JwkSet = response
            .json_body()
            .map_err(|e| RpError::signature(format!("invalid JWKS document: {}", e)))?;

        let count = context.keys.import_keys(&self.issuer, &set);
        tracing::debug!(issuer = %self.issuer, keys = count, "Refreshed provider keys");
        Ok(count)
    }

    /// Checks a value delivered next to an ID token against the matching
    /// hash claim (`at_hash` for access tokens, `c_hash` for codes).
    ///
    /// `raw_id_token` must already be verified; its header selects the
    /// digest. A missing claim fails only when `required`.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Correlation` on a mismatch or a missing required
    /// claim, and `RpError::Signature` for an unreadable header.
    pub fn verify_token_hash(
        &self,
        raw_id_token: &str,
        claim_name: &str,
        claim: Option<&str>,
        value: &str,
        required: bool,
    ) -> RpResult<()> {
        let Some(expected) = claim else {
            if required {
                tracing::warn!(
                    issuer = %self.issuer,
                    claim = claim_name,
                    "ID token lacks a required hash"
                );
                return Err(RpError::correlation(format!("ID token has no {}", claim_name)));
            }
            return Ok(());
        };

        let header = decode_header(raw_id_token)
            .map_err(|e| RpError::signature(format!("malformed ID token: {}", e)))?;
        if token_hash(header.alg, value) != expected {
            tracing::warn!(issuer = %self.issuer, claim = claim_name, "ID token hash mismatch");
            return Err(RpError::correlation(format!(
                "{} does not match the value returned with the ID token",
                claim_name
            )));
        }
        Ok(())
    }
}

/// Compares issuer identifiers, ignoring a trailing slash.
#[must_use]
pub fn issuers_match(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

/// Computes an `at_hash` or `c_hash` value: the base64url encoded left half
/// of the digest of `value`, using the hash size of `alg`.
#[must_use]
pub fn token_hash(alg: Algorithm, value: &str) -> String {
    let digest = match alg {
        Algorithm::HS256 | Algorithm::RS256 | Algorithm::PS256 | Algorithm::ES256 => {
            Sha256::digest(value.as_bytes()).to_vec()
        }
        Algorithm::HS384 | Algorithm::RS384 | Algorithm::PS384 | Algorithm::ES384 => {
            Sha384::digest(value.as_bytes()).to_vec()
        }
        _ => Sha512::digest(value.as_bytes()).to_vec(),
    };
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use jsonwebtoken::{EncodingKey, encode};
    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;
    use crate::config::ServiceSpec;
    use crate::keys::{InMemoryKeyStore, generate_ec_signing_key};
    use crate::transport::TransportError;

    const ISSUER: &str = "https://op.example.com";

    /// Answers every request with the same response, optionally after a delay.
    struct FixedTransport {
        response: HttpResponse,
        delay: Duration,
    }

    #[async_trait]
    impl HttpTransport for FixedTransport {
        async fn call(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.response.clone())
        }
    }

    fn env(response: HttpResponse, delay: Duration) -> ClientEnvironment {
        ClientEnvironment {
            base_url: "https://rp.example.com".to_string(),
            hash_seed: String::new(),
            request_timeout: Duration::from_millis(200),
            clock_skew_tolerance: Duration::from_secs(60),
            keys: Arc::new(InMemoryKeyStore::new()),
            transport: Arc::new(FixedTransport { response, delay }),
            services: ServiceRegistry::with_builtin(),
        }
    }

    fn build_client(config: &ClientConfig, response: HttpResponse) -> Client {
        Client::from_config(ISSUER, config, &env(response, Duration::ZERO)).unwrap()
    }

    fn static_config() -> ClientConfig {
        let mut provider_info = serde_json::Map::new();
        provider_info.insert("issuer".to_string(), json!(ISSUER));
        provider_info.insert(
            "authorization_endpoint".to_string(),
            json!("https://op.example.com/authorize"),
        );
        provider_info.insert("token_endpoint".to_string(), json!("https://op.example.com/token"));
        ClientConfig::new()
            .with_credentials("client_1", "a-very-long-shared-secret-for-hmac")
            .with_service("authorization", ServiceSpec::standard())
            .with_service("access_token", ServiceSpec::standard())
            .with_provider_info(provider_info)
    }

    #[tokio::test]
    async fn test_static_provider_info() {
        let client = build_client(&static_config(), HttpResponse::new(500, ""));
        assert_eq!(client.stage(), ClientStage::Configured);
        assert!(!client.context().static_redirect_uris);
        assert_eq!(client.context().redirect_uris, vec![client.context().callbacks.code.clone()]);

        assert_eq!(client.discover().await.unwrap(), ISSUER);
        assert_eq!(client.stage(), ClientStage::Discovered);
        assert_eq!(
            client.context().endpoint(ServiceKind::AccessToken).unwrap(),
            "https://op.example.com/token"
        );

        client.register().await.unwrap();
        assert_eq!(client.stage(), ClientStage::Registered);
        assert_eq!(
            client.context().post_logout_redirect_uris,
            vec!["https://rp.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_static_issuer_mismatch() {
        let mut config = static_config();
        config
            .provider_info
            .as_mut()
            .unwrap()
            .insert("issuer".to_string(), json!("https://evil.example.com"));
        let client = build_client(&config, HttpResponse::new(500, ""));
        assert!(matches!(client.discover().await, Err(RpError::Correlation { .. })));
        assert_eq!(client.stage(), ClientStage::Configured);
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint() {
        let config = static_config().with_service("userinfo", ServiceSpec::standard());
        let client = build_client(&config, HttpResponse::new(500, ""));
        let err = client.discover().await.unwrap_err();
        assert!(matches!(err, RpError::Configuration { .. }));
        assert!(err.to_string().contains("userinfo_endpoint"));
    }

    #[tokio::test]
    async fn test_authorization_call_reports_authorization_error() {
        let client = build_client(&static_config(), HttpResponse::new(500, ""));
        client.discover().await.unwrap();
        let err = client
            .do_request(ServiceKind::Authorization, &RequestArgs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::Authorization { .. }));
        assert!(err.to_string().contains("invalid_response"));
    }

    #[tokio::test]
    async fn test_discovery_issuer_must_match() {
        let metadata = HttpResponse::json(&json!({
            "issuer": "https://op.example.com/",
            "authorization_endpoint": "https://op.example.com/authorize"
        }));
        let config = ClientConfig::new()
            .with_credentials("client_1", "secret")
            .with_service("discovery", ServiceSpec::standard())
            .with_service("authorization", ServiceSpec::standard());
        let client = build_client(&config, metadata);
        client.discover().await.unwrap();

        let mixup = HttpResponse::json(&json!({
            "issuer": "https://other.example.com",
            "authorization_endpoint": "https://op.example.com/authorize"
        }));
        let client = build_client(&config, mixup);
        assert!(matches!(client.discover().await, Err(RpError::Correlation { .. })));
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let config = ClientConfig::new().with_service("discovery", ServiceSpec::standard());
        let client = Client::from_config(
            ISSUER,
            &config,
            &env(HttpResponse::json(&json!({"issuer": ISSUER})), Duration::from_secs(5)),
        )
        .unwrap();
        let err = client.discover().await.unwrap_err();
        assert!(matches!(
            err,
            RpError::Timeout {
                step: FlowStep::Discovery
            }
        ));
    }

    #[tokio::test]
    async fn test_register_requires_service() {
        let config = ClientConfig::new().with_provider_info(serde_json::Map::new());
        let client = build_client(&config, HttpResponse::new(500, ""));
        assert!(matches!(client.register().await, Err(RpError::Configuration { .. })));
        assert_eq!(client.stage(), ClientStage::Configured);
    }

    fn hs256_token(claims: serde_json::Value) -> String {
        encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"a-very-long-shared-secret-for-hmac"),
        )
        .unwrap()
    }

    fn id_claims(nonce: &str) -> serde_json::Value {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        json!({
            "iss": ISSUER,
            "sub": "alice",
            "aud": "client_1",
            "exp": now + 300,
            "iat": now,
            "nonce": nonce,
            "email": "alice@example.com"
        })
    }

    #[tokio::test]
    async fn test_verify_hmac_id_token() {
        let client = build_client(&static_config(), HttpResponse::new(500, ""));

        let claims = client
            .verify_id_token(&hs256_token(id_claims("n1")), Some("n1"))
            .await
            .unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.extra["email"], "alice@example.com");

        let err = client
            .verify_id_token(&hs256_token(id_claims("n1")), Some("n2"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpError::Correlation { .. }));

        let mut foreign = id_claims("n1");
        foreign["aud"] = json!("someone_else");
        let err = client.verify_id_token(&hs256_token(foreign), Some("n1")).await.unwrap_err();
        assert!(matches!(err, RpError::Correlation { .. }));

        let err = client.verify_id_token("not-a-jwt", None).await.unwrap_err();
        assert!(matches!(err, RpError::Signature { .. }));
    }

    #[tokio::test]
    async fn test_verify_fetches_jwks_for_unknown_kid() {
        let signing_key = generate_ec_signing_key().unwrap();
        let jwks = json!({"keys": [signing_key.public_jwk.clone().unwrap()]});

        let mut config = static_config();
        config
            .provider_info
            .as_mut()
            .unwrap()
            .insert("jwks_uri".to_string(), json!("https://op.example.com/jwks"));
        let client = build_client(&config, HttpResponse::json(&jwks));
        client.discover().await.unwrap();

        let mut header = jsonwebtoken::Header::new(Algorithm::ES384);
        header.kid = Some(signing_key.kid.clone());
        let token = encode(&header, &id_claims("n1"), &signing_key.encoding_key).unwrap();

        let claims = client.verify_id_token(&token, Some("n1")).await.unwrap();
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(client.context().keys.verification_keys(ISSUER).len(), 1);
    }

    #[test]
    fn test_issuers_match() {
        assert!(issuers_match("https://op.example.com/", "https://op.example.com"));
        assert!(!issuers_match("https://op.example.com/a", "https://op.example.com"));
    }

    #[test]
    fn test_token_hash() {
        // OpenID Connect Core, Appendix A.3
        assert_eq!(
            token_hash(Algorithm::RS256, "jHkWEdUXMU1BwAsC4vtUsZwnNXE"),
            "77QmUPtjPfzWtF2AnpK9RQ"
        );
        assert_eq!(token_hash(Algorithm::ES384, "at").len(), 32);
        assert_eq!(token_hash(Algorithm::HS512, "at").len(), 43);
    }

    #[test]
    fn test_verify_token_hash() {
        let client = build_client(&static_config(), HttpResponse::new(200, ""));
        let raw = encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &json!({"sub": "alice"}),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let at_hash = token_hash(Algorithm::HS256, "genuine-at");

        assert!(client
            .verify_token_hash(&raw, "at_hash", Some(&at_hash), "genuine-at", true)
            .is_ok());
        assert!(matches!(
            client.verify_token_hash(&raw, "at_hash", Some(&at_hash), "substituted-at", false),
            Err(RpError::Correlation { .. })
        ));
        assert!(matches!(
            client.verify_token_hash(&raw, "at_hash", None, "genuine-at", true),
            Err(RpError::Correlation { .. })
        ));
        assert!(client
            .verify_token_hash(&raw, "c_hash", None, "code", false)
            .is_ok());
    }
}
