//! Flow orchestration.
//!
//! [`RpHandler`] is the entry point callers use. It resolves which OP a login
//! targets, sets up the client for that OP (discovery and registration when
//! needed), starts authorization, and carries each session through the
//! callback, token exchange, refresh and userinfo steps.
//!
//! # Flow
//!
//! ```text
//! begin ──► finalize_auth ──► get_access_token ──► get_user_info
//!   │             │                  │
//! AuthSent   AuthReceived     TokenExchanged ──► refresh_access_token
//! ```
//!
//! Every step is an explicit call. A failed step leaves the session in the
//! last state it reached, so the caller may retry just that step.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use url::Url;

use crate::RpResult;
use crate::callback::{CallbackUrls, callbacks_for};
use crate::client::{Client, ClientEnvironment, ClientStage, issuers_match};
use crate::config::{ClientConfig, ConfigResolver, Resolution, RpConfig};
use crate::error::RpError;
use crate::keys::{InMemoryKeyStore, SharedKeyStore};
use crate::message::{AuthorizationResponse, Claims, IdTokenClaims, Jrd, TokenSet};
use crate::pkce::{CHALLENGE_METHOD_S256, PkceVerifier};
use crate::registry::ClientRegistry;
use crate::service::{RequestArgs, ServiceKind, ServiceRegistry};
use crate::session::{InMemorySessionStore, SessionRecord, SessionStore};
use crate::transport::{HttpTransport, ReqwestTransport};

/// Result of [`RpHandler::begin`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeginResponse {
    /// Authorization URL the user agent must be redirected to.
    pub url: String,
    /// State value correlating the callback with the session.
    pub state: String,
}

/// Tokens of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessAndIdToken {
    pub access_token: String,
    /// Verified ID token claims, when an ID token was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdTokenClaims>,
    /// The full token response with `expires_at` computed.
    pub token: TokenSet,
}

/// Everything [`RpHandler::finalize`] learned about the end-user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeResult {
    pub state: String,
    pub issuer: String,
    /// End-user claims, ID token claims completed by userinfo.
    pub userinfo: Claims,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdTokenClaims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_state: Option<String>,
}

/// Relying party flow orchestrator.
///
/// Owns the client registry and the session store. One handler serves any
/// number of concurrent flows against any number of OPs.
pub struct RpHandler {
    resolver: ConfigResolver,
    registry: ClientRegistry,
    sessions: Arc<dyn SessionStore>,
}

impl RpHandler {
    /// Creates a handler with in-memory stores and the `reqwest` transport.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid or the
    /// HTTP client cannot be built.
    pub fn new(config: RpConfig) -> RpResult<Self> {
        let transport = ReqwestTransport::new(config.request_timeout, config.allow_http)
            .map_err(|e| RpError::configuration(format!("failed to build HTTP client: {}", e)))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Creates a handler that sends every request through `transport`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid.
    pub fn with_transport(config: RpConfig, transport: Arc<dyn HttpTransport>) -> RpResult<Self> {
        config.validate()?;

        let env = ClientEnvironment {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            hash_seed: config.hash_seed.clone(),
            request_timeout: config.request_timeout,
            clock_skew_tolerance: config.clock_skew_tolerance,
            keys: Arc::new(InMemoryKeyStore::new()),
            transport,
            services: ServiceRegistry::with_builtin(),
        };

        tracing::debug!(
            base_url = %env.base_url,
            clients = config.clients.len(),
            "Relying party handler created"
        );

        Ok(Self {
            resolver: ConfigResolver::new(config.clients),
            registry: ClientRegistry::new(env),
            sessions: Arc::new(InMemorySessionStore::new()),
        })
    }

    /// Replaces the session store.
    #[must_use]
    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Replaces the key store. Clients created later use it.
    #[must_use]
    pub fn with_key_store(self, keys: SharedKeyStore) -> Self {
        let env = ClientEnvironment {
            keys,
            ..self.registry.environment().clone()
        };
        Self {
            registry: ClientRegistry::new(env),
            ..self
        }
    }

    /// Replaces the service registry. Clients created later use it.
    #[must_use]
    pub fn with_service_registry(self, services: ServiceRegistry) -> Self {
        let env = ClientEnvironment {
            services,
            ..self.registry.environment().clone()
        };
        Self {
            registry: ClientRegistry::new(env),
            ..self
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    #[must_use]
    pub fn key_store(&self) -> &SharedKeyStore {
        &self.registry.environment().keys
    }

    // -------------------------------------------------------------------------
    // Client setup
    // -------------------------------------------------------------------------

    /// Returns the configuration for an issuer key or URL, or the default
    /// template for an empty or unknown identifier.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when neither exists.
    pub fn pick_config(&self, identifier: &str) -> RpResult<ClientConfig> {
        Ok(self.resolver.pick_config(identifier)?)
    }

    /// Returns the client for `config`'s issuer, constructing it on first use.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration has no issuer or
    /// names unknown services or strategies.
    pub async fn init_client(&self, config: &ClientConfig) -> RpResult<Arc<Client>> {
        let issuer = config
            .issuer
            .as_deref()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| RpError::configuration("client configuration has no issuer"))?;
        self.registry.client_for(issuer, config).await
    }

    /// Resolves `target` to an OP and brings its client to the registered
    /// stage.
    ///
    /// `target` is a configured issuer key, a configured issuer URL, or an
    /// end-user identifier that is looked up with WebFinger. Setup of one
    /// client is serialized; a registered client is returned immediately.
    ///
    /// # Errors
    ///
    /// Returns configuration, discovery, correlation and registration errors
    /// of the failing step. The client keeps the stage it last reached.
    pub async fn client_setup(&self, target: &str) -> RpResult<Arc<Client>> {
        if target.is_empty() {
            return Err(RpError::configuration("no issuer or user identifier given"));
        }

        let config = match self.resolver.resolve(target)? {
            Resolution::Configured(config) => config,
            Resolution::NeedsDiscovery { template, user_id } => {
                let issuer = self.discover_issuer(&template, &user_id).await?;
                self.resolver.config_for_issuer(&issuer)?
            }
        };

        let client = self.init_client(&config).await?;
        if client.stage() == ClientStage::Registered {
            return Ok(client);
        }

        {
            let _guard = client.lock_setup().await;
            if client.stage() < ClientStage::Discovered {
                self.do_provider_info(&client).await?;
            }
            if client.stage() < ClientStage::Registered {
                self.do_client_registration(&client).await?;
            }
        }

        tracing::info!(issuer = %client.issuer(), "Client ready");
        Ok(client)
    }

    /// Looks up the issuer of an end-user identifier with WebFinger.
    async fn discover_issuer(&self, template: &ClientConfig, user_id: &str) -> RpResult<String> {
        let spec = template
            .services
            .as_ref()
            .and_then(|services| services.get(ServiceKind::WebFinger.name()))
            .cloned()
            .ok_or_else(|| {
                RpError::configuration(format!(
                    "'{}' is not a configured issuer and WebFinger is not enabled",
                    user_id
                ))
            })?;

        let lookup = Client::from_config(
            "",
            &ClientConfig::new().with_service(ServiceKind::WebFinger.name(), spec),
            self.registry.environment(),
        )?;
        let mut args = RequestArgs::new();
        args.insert("resource".to_string(), user_id.to_string());
        let claims = lookup.do_request(ServiceKind::WebFinger, &args).await?;

        let jrd: Jrd = serde_json::from_value(Value::Object(claims))
            .map_err(|e| RpError::discovery(format!("invalid WebFinger response: {}", e)))?;
        let issuer = jrd
            .issuer()
            .ok_or_else(|| RpError::discovery(format!("no issuer link for '{}'", user_id)))?;

        tracing::debug!(issuer = %issuer, "WebFinger resolved issuer");
        Ok(issuer.to_string())
    }

    /// Resolves provider metadata for `client` and returns its issuer.
    ///
    /// # Errors
    ///
    /// See [`Client::discover`].
    pub async fn do_provider_info(&self, client: &Client) -> RpResult<String> {
        client.discover().await
    }

    /// Makes sure `client` has credentials, registering dynamically when
    /// needed, and records its callback hash.
    ///
    /// # Errors
    ///
    /// See [`Client::register`].
    pub async fn do_client_registration(&self, client: &Client) -> RpResult<()> {
        let hash = client.context().callbacks.hash.clone();
        self.sessions.set_issuer_hash(&hash, client.issuer()).await?;
        client.register().await
    }

    /// Returns the callback URLs of `issuer` and records its hash.
    ///
    /// # Errors
    ///
    /// Returns session store errors.
    pub async fn create_callbacks(&self, issuer: &str) -> RpResult<CallbackUrls> {
        let env = self.registry.environment();
        let callbacks = callbacks_for(&env.base_url, &env.hash_seed, issuer);
        self.sessions.set_issuer_hash(&callbacks.hash, issuer).await?;
        Ok(callbacks)
    }

    // -------------------------------------------------------------------------
    // Authorization
    // -------------------------------------------------------------------------

    /// Starts a login against `target`.
    ///
    /// Sets the client up, then creates a session and returns the
    /// authorization URL. `extra_args` override the configured request
    /// parameters (`scope`, `prompt`, `login_hint`...).
    ///
    /// # Errors
    ///
    /// Returns the errors of [`RpHandler::client_setup`] and
    /// [`RpHandler::init_authorization`].
    pub async fn begin(&self, target: &str, extra_args: &RequestArgs) -> RpResult<BeginResponse> {
        let client = self.client_setup(target).await?;
        self.init_authorization(&client, extra_args).await
    }

    /// Builds the authorization request for a set-up client and records the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the client has no authorization
    /// service or endpoint.
    pub async fn init_authorization(
        &self,
        client: &Client,
        extra_args: &RequestArgs,
    ) -> RpResult<BeginResponse> {
        let state = random_token();
        let nonce = random_token();

        let mut args = extra_args.clone();
        args.insert("state".to_string(), state.clone());
        args.insert("nonce".to_string(), nonce.clone());

        let verifier = client.context().behaviour.pkce.then(PkceVerifier::generate);
        if let Some(verifier) = &verifier {
            args.insert("code_challenge".to_string(), verifier.challenge());
            args.insert(
                "code_challenge_method".to_string(),
                CHALLENGE_METHOD_S256.to_string(),
            );
        }

        let request = client.build_request(ServiceKind::Authorization, &args)?;
        let auth_request: BTreeMap<String, String> = Url::parse(&request.url)
            .map_err(|e| RpError::configuration(format!("invalid authorization URL: {}", e)))?
            .query_pairs()
            .into_owned()
            .collect();

        let mut record = SessionRecord::new(state.clone(), client.issuer(), nonce, auth_request);
        if let Some(verifier) = verifier {
            record = record.with_pkce_verifier(verifier.as_str());
        }
        self.sessions.create(record).await?;

        tracing::debug!(
            issuer = %client.issuer(),
            state = %state_prefix(&state),
            "Authorization request created"
        );
        Ok(BeginResponse {
            url: request.url,
            state,
        })
    }

    /// Correlates a callback with its session and records the response.
    ///
    /// The callback's `state` must belong to a session started against
    /// `issuer` by `client`. OP errors become `RpError::Authorization`.
    /// ID tokens delivered directly (implicit and hybrid flows) are verified
    /// here, including the nonce.
    ///
    /// Returns the caller-relevant parameters: `state`, `code` and any
    /// tokens.
    ///
    /// # Errors
    ///
    /// - `RpError::Correlation` for unknown states, issuer mix-ups and nonce
    ///   mismatches
    /// - `RpError::Authorization` when the OP reported an error
    /// - `RpError::Signature` for ID tokens that do not verify
    pub async fn finalize_auth(
        &self,
        client: &Client,
        issuer: &str,
        params: &BTreeMap<String, String>,
    ) -> RpResult<AuthorizationResponse> {
        let response = AuthorizationResponse::from_params(params);
        let state = response
            .state
            .clone()
            .ok_or_else(|| RpError::correlation("authorization response has no state"))?;

        let record = self.sessions.get(&state).await?.ok_or_else(|| {
            tracing::warn!(state = %state_prefix(&state), "Callback for unknown state");
            RpError::correlation("authorization response state does not match any session")
        })?;

        if !issuers_match(record.issuer(), issuer) || !issuers_match(client.issuer(), issuer) {
            tracing::warn!(
                state = %state_prefix(&state),
                expected = %record.issuer(),
                received = %issuer,
                "Callback issuer does not match the session"
            );
            return Err(RpError::correlation(format!(
                "session was started against '{}', callback came for '{}'",
                record.issuer(),
                issuer
            )));
        }

        self.check_response_issuer(client, &response)?;

        if let Some(error) = &response.error {
            tracing::warn!(
                issuer = %issuer,
                state = %state_prefix(&state),
                error = %error,
                "Provider returned an authorization error"
            );
            return Err(RpError::authorization(
                error.clone(),
                response.error_description.clone().unwrap_or_default(),
            ));
        }

        let response_type = record
            .auth_request()
            .get("response_type")
            .cloned()
            .unwrap_or_else(|| client.context().behaviour.response_type().to_string());
        let expects = |part: &str| response_type.split_whitespace().any(|p| p == part);

        if expects("code") && response.code.is_none() {
            return Err(RpError::authorization(
                "invalid_response",
                "authorization response has no code",
            ));
        }
        if expects("id_token") && response.id_token.is_none() {
            return Err(RpError::authorization(
                "invalid_response",
                "authorization response has no id_token",
            ));
        }

        let id_token = match &response.id_token {
            Some(raw) => {
                let claims = client.verify_id_token(raw, Some(record.nonce())).await?;
                // Front-channel values must be bound to the ID token.
                if let Some(access_token) = &response.access_token {
                    client.verify_token_hash(
                        raw,
                        "at_hash",
                        claims.at_hash.as_deref(),
                        access_token,
                        true,
                    )?;
                }
                if let Some(code) = &response.code {
                    client.verify_token_hash(raw, "c_hash", claims.c_hash.as_deref(), code, true)?;
                }
                Some(claims)
            }
            None => None,
        };
        let implicit_token = response.access_token.clone().map(|access_token| {
            TokenSet {
                access_token,
                token_type: response.token_type.clone(),
                expires_in: response.expires_in,
                id_token: response.id_token.clone(),
                scope: response.scope.clone(),
                ..TokenSet::default()
            }
            .with_expiry_from(now())
        });

        let stored = response.clone();
        self.sessions
            .update(
                &state,
                Box::new(move |record| {
                    record.set_auth_response(stored);
                    if let Some(claims) = id_token {
                        record.set_id_token(claims);
                    }
                    if let Some(token) = implicit_token {
                        record.set_token(token);
                    }
                    Ok(())
                }),
            )
            .await?;

        tracing::debug!(
            issuer = %issuer,
            state = %state_prefix(&state),
            "Authorization response accepted"
        );
        Ok(AuthorizationResponse {
            iss: None,
            session_state: None,
            error: None,
            error_description: None,
            ..response
        })
    }

    /// Checks the RFC 9207 `iss` parameter.
    fn check_response_issuer(
        &self,
        client: &Client,
        response: &AuthorizationResponse,
    ) -> RpResult<()> {
        match response.iss.as_deref() {
            Some(iss) if !issuers_match(iss, client.issuer()) => {
                tracing::warn!(
                    issuer = %client.issuer(),
                    received = %iss,
                    "Mismatched iss parameter"
                );
                Err(RpError::correlation(format!(
                    "authorization response iss '{}' does not match '{}'",
                    iss,
                    client.issuer()
                )))
            }
            None if client
                .context()
                .provider_info
                .authorization_response_iss_parameter_supported
                == Some(true) =>
            {
                Err(RpError::correlation("authorization response is missing iss"))
            }
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Tokens
    // -------------------------------------------------------------------------

    /// Exchanges the session's authorization code for tokens.
    ///
    /// The ID token, when present, is verified against the session nonce.
    /// Token and claims are stored on the session.
    ///
    /// # Errors
    ///
    /// - `RpError::Session` for an unknown session or one without a code
    /// - `RpError::Correlation` if `client` serves another issuer or the ID
    ///   token does not match
    /// - `RpError::TokenExchange` / `RpError::Timeout` from the token request
    /// - `RpError::Signature` for ID tokens that do not verify
    pub async fn get_access_token(&self, state: &str, client: &Client) -> RpResult<TokenSet> {
        let record = self.get_session_information(state).await?;
        ensure_same_issuer(&record, client)?;

        let code = record
            .auth_response()
            .and_then(|r| r.code.clone())
            .ok_or_else(|| RpError::session("session has no authorization code"))?;

        let mut args = RequestArgs::new();
        args.insert("code".to_string(), code);
        if let Some(redirect_uri) = record.auth_request().get("redirect_uri") {
            args.insert("redirect_uri".to_string(), redirect_uri.clone());
        }
        if let Some(verifier) = record.pkce_verifier() {
            args.insert("code_verifier".to_string(), verifier.to_string());
        }

        let claims = client.do_request(ServiceKind::AccessToken, &args).await?;
        let token = token_from_claims(claims)?.with_expiry_from(now());

        let id_token = match &token.id_token {
            Some(raw) => {
                let claims = client.verify_id_token(raw, Some(record.nonce())).await?;
                client.verify_token_hash(
                    raw,
                    "at_hash",
                    claims.at_hash.as_deref(),
                    &token.access_token,
                    false,
                )?;
                Some(claims)
            }
            None => None,
        };

        let stored = token.clone();
        self.sessions
            .update(
                state,
                Box::new(move |record| {
                    record.set_token(stored);
                    if let Some(claims) = id_token {
                        record.set_id_token(claims);
                    }
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(
            issuer = %client.issuer(),
            state = %state_prefix(state),
            "Tokens obtained"
        );
        Ok(token)
    }

    /// Returns the session's tokens, exchanging the code first when no
    /// token has been obtained yet.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`RpHandler::get_access_token`].
    pub async fn get_access_and_id_token(&self, state: &str) -> RpResult<AccessAndIdToken> {
        let record = self.get_session_information(state).await?;
        let token = match record.token() {
            Some(token) => token.clone(),
            None => {
                let client = self.get_client_from_session_key(state).await?;
                self.get_access_token(state, &client).await?
            }
        };

        let id_token = self
            .sessions
            .get(state)
            .await?
            .and_then(|r| r.id_token().cloned());
        Ok(AccessAndIdToken {
            access_token: token.access_token.clone(),
            id_token,
            token,
        })
    }

    /// Refreshes the session's access token.
    ///
    /// The stored refresh token is kept unless the OP rotates it.
    ///
    /// # Errors
    ///
    /// - `RpError::Session` when the session has no refresh token
    /// - `RpError::TokenExchange` / `RpError::Timeout` from the refresh request
    pub async fn refresh_access_token(
        &self,
        state: &str,
        client: &Client,
        scope: Option<&str>,
    ) -> RpResult<TokenSet> {
        let record = self.get_session_information(state).await?;
        ensure_same_issuer(&record, client)?;

        let current = record
            .token()
            .cloned()
            .ok_or_else(|| RpError::session("session has no token to refresh"))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| RpError::session("session has no refresh token"))?;

        let mut args = RequestArgs::new();
        args.insert("refresh_token".to_string(), refresh_token);
        if let Some(scope) = scope {
            args.insert("scope".to_string(), scope.to_string());
        }

        let claims = client.do_request(ServiceKind::RefreshAccessToken, &args).await?;
        let fresh = token_from_claims(claims)?.with_expiry_from(now());

        let id_token = match &fresh.id_token {
            Some(raw) => Some(client.verify_id_token(raw, None).await?),
            None => None,
        };
        if let (Some(new), Some(old)) = (&id_token, record.id_token())
            && new.sub != old.sub
        {
            return Err(RpError::correlation("refreshed ID token names a different subject"));
        }

        let token = current.refreshed_with(fresh);
        let stored = token.clone();
        self.sessions
            .update(
                state,
                Box::new(move |record| {
                    record.set_token(stored);
                    if let Some(claims) = id_token {
                        record.set_id_token(claims);
                    }
                    Ok(())
                }),
            )
            .await?;

        tracing::debug!(
            issuer = %client.issuer(),
            state = %state_prefix(state),
            "Access token refreshed"
        );
        Ok(token)
    }

    // -------------------------------------------------------------------------
    // UserInfo
    // -------------------------------------------------------------------------

    /// Calls the userinfo endpoint and returns the end-user claims.
    ///
    /// Without an explicit `access_token` the session's token is used, which
    /// must not be expired. ID token claims take precedence; userinfo only
    /// adds claims the ID token lacks. The raw response is stored on the
    /// session.
    ///
    /// # Errors
    ///
    /// - `RpError::ExpiredToken` when the session's token has expired
    /// - `RpError::Correlation` when userinfo names another subject
    /// - `RpError::UserInfo` / `RpError::Timeout` from the request
    pub async fn get_user_info(
        &self,
        state: &str,
        client: &Client,
        access_token: Option<&str>,
    ) -> RpResult<Claims> {
        let record = self.get_session_information(state).await?;
        ensure_same_issuer(&record, client)?;

        let access_token = match access_token {
            Some(token) => token.to_string(),
            None => self.get_valid_access_token(state).await?.0,
        };

        let mut args = RequestArgs::new();
        args.insert("access_token".to_string(), access_token);
        let userinfo = client.do_request(ServiceKind::UserInfo, &args).await?;

        let merged = merge_claims(record.id_token(), &userinfo)?;

        self.sessions
            .update(
                state,
                Box::new(move |record| {
                    record.set_userinfo(userinfo);
                    Ok(())
                }),
            )
            .await?;
        Ok(merged)
    }

    /// Returns the end-user claims carried by an ID token, `sub` included.
    #[must_use]
    pub fn userinfo_in_id_token(claims: &IdTokenClaims) -> Claims {
        claims.user_claims()
    }

    // -------------------------------------------------------------------------
    // Composite callback handling
    // -------------------------------------------------------------------------

    /// Handles a callback end to end: correlation, token exchange when a
    /// code was returned, and userinfo when the service is configured.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step.
    pub async fn finalize(
        &self,
        issuer: &str,
        params: &BTreeMap<String, String>,
    ) -> RpResult<FinalizeResult> {
        let client = self.registry.get(issuer).ok_or_else(|| {
            tracing::warn!(issuer = %issuer, "Callback for an issuer without a client");
            RpError::correlation(format!("no client for issuer '{}'", issuer))
        })?;

        let response = self.finalize_auth(&client, issuer, params).await?;
        let state = response
            .state
            .clone()
            .ok_or_else(|| RpError::correlation("authorization response has no state"))?;

        let token = if response.code.is_some() && client.has_service(ServiceKind::AccessToken) {
            Some(self.get_access_token(&state, &client).await?)
        } else {
            self.get_session_information(&state).await?.token().cloned()
        };

        let record = self.get_session_information(&state).await?;
        let id_token = record.id_token().cloned();

        let userinfo = if token.is_some() && client.has_service(ServiceKind::UserInfo) {
            self.get_user_info(&state, &client, None).await?
        } else {
            id_token
                .as_ref()
                .map(Self::userinfo_in_id_token)
                .unwrap_or_default()
        };

        tracing::info!(
            issuer = %issuer,
            state = %state_prefix(&state),
            "Authentication completed"
        );
        Ok(FinalizeResult {
            state,
            issuer: client.issuer().to_string(),
            userinfo,
            token,
            id_token,
            session_state: record.auth_response().and_then(|r| r.session_state.clone()),
        })
    }

    /// Like [`RpHandler::finalize`], for a callback identified by the issuer
    /// hash in its URL.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Correlation` for an unknown hash, then the errors of
    /// [`RpHandler::finalize`].
    pub async fn finalize_for_hash(
        &self,
        hash: &str,
        params: &BTreeMap<String, String>,
    ) -> RpResult<FinalizeResult> {
        let issuer = self.sessions.issuer_for_hash(hash).await?.ok_or_else(|| {
            tracing::warn!(hash = %hash, "Callback for an unknown issuer hash");
            RpError::correlation("callback hash does not belong to any issuer")
        })?;
        self.finalize(&issuer, params).await
    }

    // -------------------------------------------------------------------------
    // Session lookups
    // -------------------------------------------------------------------------

    /// Returns a snapshot of the session.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Session` if no session has this state.
    pub async fn get_session_information(&self, state: &str) -> RpResult<SessionRecord> {
        self.sessions.get(state).await?.ok_or_else(|| {
            RpError::session(format!("no session for state '{}'", state_prefix(state)))
        })
    }

    /// Returns the client serving the session's issuer.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Session` if the session or its client is unknown.
    pub async fn get_client_from_session_key(&self, state: &str) -> RpResult<Arc<Client>> {
        let record = self.get_session_information(state).await?;
        self.registry.get(record.issuer()).ok_or_else(|| {
            RpError::session(format!("no client for issuer '{}'", record.issuer()))
        })
    }

    /// Returns `true` if the session holds an unexpired authentication.
    ///
    /// The ID token expiry decides when there is one; otherwise the access
    /// token expiry.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Session` if no session has this state.
    pub async fn has_active_authentication(&self, state: &str) -> RpResult<bool> {
        let record = self.get_session_information(state).await?;
        let now = now();
        Ok(match (record.id_token(), record.token()) {
            (Some(id_token), _) => id_token.exp > now,
            (None, Some(token)) => !token.is_expired_at(now),
            (None, None) => false,
        })
    }

    /// Returns the session's access token and its expiry, if it is still
    /// valid.
    ///
    /// # Errors
    ///
    /// - `RpError::Session` when the session or its token is missing
    /// - `RpError::ExpiredToken` when the token is past `expires_at`
    pub async fn get_valid_access_token(&self, state: &str) -> RpResult<(String, Option<i64>)> {
        let record = self.get_session_information(state).await?;
        let token = record
            .token()
            .ok_or_else(|| RpError::session("session has no access token"))?;
        if token.is_expired_at(now()) {
            return Err(RpError::ExpiredToken {
                expires_at: token.expires_at.unwrap_or_default(),
            });
        }
        Ok((token.access_token.clone(), token.expires_at))
    }

    /// Returns the client authentication method `client` uses at the
    /// endpoint of `kind`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the service is not configured.
    pub fn get_client_authn_method(&self, client: &Client, kind: ServiceKind) -> RpResult<String> {
        client.client_authn_method(kind)
    }

    /// Deletes a session. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns session store errors.
    pub async fn delete_session(&self, state: &str) -> RpResult<bool> {
        self.sessions.delete(state).await
    }

    /// Deletes sessions created more than `age` ago.
    ///
    /// # Errors
    ///
    /// Returns session store errors.
    pub async fn purge_sessions_older_than(&self, age: Duration) -> RpResult<usize> {
        self.sessions.purge_older_than(age).await
    }
}

fn ensure_same_issuer(record: &SessionRecord, client: &Client) -> RpResult<()> {
    if issuers_match(record.issuer(), client.issuer()) {
        Ok(())
    } else {
        Err(RpError::correlation(format!(
            "session belongs to '{}', not to '{}'",
            record.issuer(),
            client.issuer()
        )))
    }
}

/// Combines ID token and userinfo claims. ID token claims win; a userinfo
/// `sub` naming someone else is rejected.
fn merge_claims(id_token: Option<&IdTokenClaims>, userinfo: &Claims) -> RpResult<Claims> {
    let Some(id_token) = id_token else {
        return Ok(userinfo.clone());
    };
    if let Some(sub) = userinfo.get("sub").and_then(Value::as_str)
        && sub != id_token.sub
    {
        tracing::warn!("Userinfo subject differs from the ID token subject");
        return Err(RpError::correlation(
            "userinfo sub does not match the ID token sub",
        ));
    }

    let mut merged = id_token.user_claims();
    for (name, value) in userinfo {
        merged.entry(name.clone()).or_insert_with(|| value.clone());
    }
    Ok(merged)
}

fn token_from_claims(claims: Claims) -> RpResult<TokenSet> {
    serde_json::from_value(Value::Object(claims))
        .map_err(|e| RpError::token_exchange(format!("invalid token response: {}", e)))
}

/// 256 random bits, base64url encoded.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Leading part of a state value, for logs.
fn state_prefix(state: &str) -> &str {
    state.get(..8).unwrap_or(state)
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
