//! Dynamic client registration (OpenID Connect Dynamic Client Registration 1.0).

use std::sync::Arc;

use serde_json::{Value, json};

use super::{RequestArgs, Service, ServiceContext, ServiceKind, ProviderStrategy, decode_response};
use crate::RpResult;
use crate::error::RpError;
use crate::message::Claims;
use crate::transport::{HttpRequest, HttpResponse};

/// Registers the RP with an OP.
///
/// The request body is the configured client preferences plus the redirect
/// URIs and the response types and auth method of the behaviour. Explicit
/// preferences win over derived values.
pub struct RegistrationService {
    strategy: Arc<dyn ProviderStrategy>,
}

impl RegistrationService {
    #[must_use]
    pub fn new(strategy: Arc<dyn ProviderStrategy>) -> Self {
        Self { strategy }
    }

    fn request_body(context: &ServiceContext) -> Value {
        let mut body = context.client_preferences.clone();

        let redirect_uris = if context.redirect_uris.is_empty() {
            vec![context.redirect_uri().to_string()]
        } else {
            context.redirect_uris.clone()
        };
        body.insert("redirect_uris".to_string(), json!(redirect_uris));

        if !context.post_logout_redirect_uris.is_empty() {
            body.entry("post_logout_redirect_uris")
                .or_insert_with(|| json!(context.post_logout_redirect_uris));
        }

        let behaviour = &context.behaviour;
        if !behaviour.response_types.is_empty() {
            body.entry("response_types")
                .or_insert_with(|| json!(behaviour.response_types));
            body.entry("grant_types")
                .or_insert_with(|| json!(grant_types_for(&behaviour.response_types)));
        }
        if let Some(method) = behaviour
            .token_endpoint_auth_method
            .as_deref()
            .filter(|m| !m.is_empty())
        {
            body.entry("token_endpoint_auth_method")
                .or_insert_with(|| json!(method));
        }

        Value::Object(body)
    }
}

impl Service for RegistrationService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Registration
    }

    fn build_request(
        &self,
        context: &ServiceContext,
        _args: &RequestArgs,
    ) -> RpResult<HttpRequest> {
        let endpoint = context.endpoint(self.kind())?;
        let request = HttpRequest::post_json(endpoint, &Self::request_body(context))
            .with_header("Accept", "application/json");
        Ok(self.strategy.prepare_request(self.kind(), request))
    }

    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims> {
        let claims = decode_response(self.kind(), self.strategy.as_ref(), response)?;
        if !claims.get("client_id").is_some_and(|v| v.is_string()) {
            return Err(RpError::registration("registration response has no client_id"));
        }
        Ok(claims)
    }
}

/// Grant types needed for a set of response types.
fn grant_types_for(response_types: &[String]) -> Vec<&'static str> {
    let mut grants = Vec::new();
    let mut add = |grant| {
        if !grants.contains(&grant) {
            grants.push(grant);
        }
    };
    for response_type in response_types {
        let parts: Vec<&str> = response_type.split_whitespace().collect();
        if parts.contains(&"code") {
            add("authorization_code");
        }
        if parts.contains(&"id_token") || parts.contains(&"token") {
            add("implicit");
        }
    }
    grants
}
