//! Token endpoint services: authorization code exchange and refresh.

use std::sync::Arc;

use super::{
    ClientAuthMethod, RequestArgs, Service, ServiceContext, ServiceKind, ProviderStrategy,
    decode_response, resolve_authn_method,
};
use crate::RpResult;
use crate::error::RpError;
use crate::message::Claims;
use crate::transport::{HttpRequest, HttpResponse};

/// Exchanges an authorization code for tokens.
///
/// Arguments: `code` (required), `redirect_uri` (defaults to the client's
/// redirect URI) and `code_verifier` when PKCE was used.
pub struct AccessTokenService {
    strategy: Arc<dyn ProviderStrategy>,
    default_authn_method: Option<String>,
}

impl AccessTokenService {
    #[must_use]
    pub fn new(strategy: Arc<dyn ProviderStrategy>, default_authn_method: Option<String>) -> Self {
        Self {
            strategy,
            default_authn_method,
        }
    }
}

impl Service for AccessTokenService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::AccessToken
    }

    fn default_authn_method(&self) -> Option<&str> {
        self.default_authn_method.as_deref()
    }

    fn build_request(&self, context: &ServiceContext, args: &RequestArgs) -> RpResult<HttpRequest> {
        let code = args
            .get("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RpError::session("no authorization code to exchange"))?;
        let redirect_uri = args
            .get("redirect_uri")
            .map(String::as_str)
            .unwrap_or_else(|| context.redirect_uri());

        let mut params = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.clone()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
        ];
        if let Some(verifier) = args.get("code_verifier") {
            params.push(("code_verifier".to_string(), verifier.clone()));
        }

        token_request(self, self.strategy.as_ref(), context, params)
    }

    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims> {
        parse_token_response(self.kind(), self.strategy.as_ref(), response)
    }
}

/// Refreshes an access token.
///
/// Arguments: `refresh_token` (required) and an optional `scope`.
pub struct RefreshAccessTokenService {
    strategy: Arc<dyn ProviderStrategy>,
    default_authn_method: Option<String>,
}

impl RefreshAccessTokenService {
    #[must_use]
    pub fn new(strategy: Arc<dyn ProviderStrategy>, default_authn_method: Option<String>) -> Self {
        Self {
            strategy,
            default_authn_method,
        }
    }
}

impl Service for RefreshAccessTokenService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::RefreshAccessToken
    }

    fn default_authn_method(&self) -> Option<&str> {
        self.default_authn_method.as_deref()
    }

    fn build_request(&self, context: &ServiceContext, args: &RequestArgs) -> RpResult<HttpRequest> {
        let refresh_token = args
            .get("refresh_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RpError::session("no refresh token available"))?;

        let mut params = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.clone()),
        ];
        if let Some(scope) = args.get("scope").filter(|s| !s.is_empty()) {
            params.push(("scope".to_string(), scope.clone()));
        }

        token_request(self, self.strategy.as_ref(), context, params)
    }

    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims> {
        parse_token_response(self.kind(), self.strategy.as_ref(), response)
    }
}

/// Adds client authentication to the token request parameters and builds
/// the `POST`.
fn token_request(
    service: &dyn Service,
    strategy: &dyn ProviderStrategy,
    context: &ServiceContext,
    mut params: Vec<(String, String)>,
) -> RpResult<HttpRequest> {
    let endpoint = context.endpoint(service.kind())?;
    let method_name = resolve_authn_method(context, service.default_authn_method());
    let method = ClientAuthMethod::parse(&method_name).ok_or_else(|| {
        RpError::configuration(format!(
            "unsupported token endpoint auth method '{}'",
            method_name
        ))
    })?;

    let mut headers = Vec::new();
    method.apply(context, endpoint, &mut params, &mut headers)?;

    let request = headers.into_iter().fold(
        HttpRequest::post_form(endpoint, &params).with_header("Accept", "application/json"),
        |request, (name, value)| request.with_header(name, value),
    );
    Ok(strategy.prepare_request(service.kind(), request))
}

fn parse_token_response(
    kind: ServiceKind,
    strategy: &dyn ProviderStrategy,
    response: &HttpResponse,
) -> RpResult<Claims> {
    let claims = decode_response(kind, strategy, response)?;

    // Some providers answer 200 with an error body.
    if let Some(error) = claims.get("error").and_then(|e| e.as_str()) {
        let description = claims
            .get("error_description")
            .and_then(|d| d.as_str())
            .map(|d| format!(": {}", d))
            .unwrap_or_default();
        return Err(RpError::for_step(
            kind.flow_step(),
            format!("{} request failed: {}{}", kind, error, description),
        ));
    }
    if !claims.get("access_token").is_some_and(|t| t.is_string()) {
        return Err(RpError::for_step(
            kind.flow_step(),
            format!("{} response has no access_token", kind),
        ));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde_json::json;

    use super::*;
    use crate::config::Behaviour;
    use crate::service::{GitHubStrategy, StandardStrategy};

    const TOKEN_ENDPOINT: &str = "https://op.example.com/token";

    fn context() -> ServiceContext {
        ServiceContext::for_tests("https://op.example.com")
            .with_endpoint(ServiceKind::AccessToken, TOKEN_ENDPOINT)
            .with_endpoint(ServiceKind::RefreshAccessToken, TOKEN_ENDPOINT)
    }

    fn args(pairs: &[(&str, &str)]) -> RequestArgs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_code_exchange_request() {
        let ctx = context();
        let service = AccessTokenService::new(Arc::new(StandardStrategy), None);
        let request = service
            .build_request(&ctx, &args(&[("code", "access_code"), ("code_verifier", "v")]))
            .unwrap();

        assert_eq!(request.url, TOKEN_ENDPOINT);
        let params = request.form_params();
        assert_eq!(params["grant_type"], "authorization_code");
        assert_eq!(params["code"], "access_code");
        assert_eq!(params["redirect_uri"], ctx.callbacks.code);
        assert_eq!(params["code_verifier"], "v");
        assert!(!params.contains_key("client_secret"));

        let expected = format!("Basic {}", STANDARD.encode("client_1:secret"));
        assert_eq!(request.header("authorization"), Some(expected.as_str()));
    }

    #[test]
    fn test_service_default_authn_method() {
        let ctx = context();
        let service = AccessTokenService::new(
            Arc::new(StandardStrategy),
            Some("client_secret_post".to_string()),
        );
        let request = service.build_request(&ctx, &args(&[("code", "c")])).unwrap();
        assert_eq!(request.form_params()["client_secret"], "secret");
        assert!(request.header("authorization").is_none());
    }

    #[test]
    fn test_empty_authn_method_sends_client_id_only() {
        let mut ctx = context();
        ctx.behaviour = Behaviour::new(&["code"], &["user"]).with_token_endpoint_auth_method("");
        let service = AccessTokenService::new(Arc::new(GitHubStrategy), None);
        let request = service.build_request(&ctx, &args(&[("code", "c")])).unwrap();

        let params = request.form_params();
        assert_eq!(params["client_id"], "client_1");
        assert!(!params.contains_key("client_secret"));
        assert!(request.header("authorization").is_none());
        assert_eq!(request.header("accept"), Some("application/json"));
    }

    #[test]
    fn test_unknown_authn_method() {
        let mut ctx = context();
        ctx.behaviour = Behaviour::default().with_token_endpoint_auth_method("tls_client_auth");
        let service = AccessTokenService::new(Arc::new(StandardStrategy), None);
        assert!(matches!(
            service.build_request(&ctx, &args(&[("code", "c")])),
            Err(RpError::Configuration { .. })
        ));
    }

    #[test]
    fn test_missing_code_is_session_error() {
        let service = AccessTokenService::new(Arc::new(StandardStrategy), None);
        assert!(matches!(
            service.build_request(&context(), &RequestArgs::new()),
            Err(RpError::Session { .. })
        ));
    }

    #[test]
    fn test_refresh_request() {
        let service = RefreshAccessTokenService::new(Arc::new(StandardStrategy), None);
        let request = service
            .build_request(&context(), &args(&[("refresh_token", "rt"), ("scope", "openid email")]))
            .unwrap();
        let params = request.form_params();
        assert_eq!(params["grant_type"], "refresh_token");
        assert_eq!(params["refresh_token"], "rt");
        assert_eq!(params["scope"], "openid email");

        assert!(matches!(
            service.build_request(&context(), &RequestArgs::new()),
            Err(RpError::Session { .. })
        ));
    }

    #[test]
    fn test_parse_token_response() {
        let service = AccessTokenService::new(Arc::new(StandardStrategy), None);
        let ok = HttpResponse::json(&json!({
            "access_token": "at",
            "token_type": "Bearer",
            "expires_in": 3600
        }));
        assert_eq!(service.parse_response(&ok).unwrap()["access_token"], "at");

        let in_band = HttpResponse::json(&json!({"error": "bad_verification_code"}));
        let err = service.parse_response(&in_band).unwrap_err();
        assert!(matches!(err, RpError::TokenExchange { .. }));
        assert!(err.to_string().contains("bad_verification_code"));

        let refresh = RefreshAccessTokenService::new(Arc::new(StandardStrategy), None);
        let err = refresh
            .parse_response(&HttpResponse::new(400, r#"{"error":"invalid_grant"}"#))
            .unwrap_err();
        assert!(matches!(err, RpError::TokenExchange { .. }));
        assert!(err.to_string().contains("invalid_grant"));
    }
}
