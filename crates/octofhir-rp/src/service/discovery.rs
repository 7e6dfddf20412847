//! Provider metadata discovery.
//!
//! Fetches `{issuer}/.well-known/openid-configuration`. Checking that the
//! returned issuer matches the requested one is left to the client, which
//! knows which issuer it serves.

use std::sync::Arc;

use super::{RequestArgs, Service, ServiceContext, ServiceKind, ProviderStrategy, decode_response};
use crate::RpResult;
use crate::error::RpError;
use crate::message::Claims;
use crate::transport::{HttpRequest, HttpResponse};

const WELL_KNOWN_PATH: &str = ".well-known/openid-configuration";

/// Retrieves OpenID Provider metadata.
pub struct ProviderInfoService {
    strategy: Arc<dyn ProviderStrategy>,
}

impl ProviderInfoService {
    #[must_use]
    pub fn new(strategy: Arc<dyn ProviderStrategy>) -> Self {
        Self { strategy }
    }
}

impl Service for ProviderInfoService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::ProviderInfo
    }

    fn build_request(
        &self,
        context: &ServiceContext,
        _args: &RequestArgs,
    ) -> RpResult<HttpRequest> {
        let mut url = url::Url::parse(&context.issuer).map_err(|e| {
            RpError::discovery(format!("invalid issuer URL '{}': {}", context.issuer, e))
        })?;
        let path = format!("{}/{}", url.path().trim_end_matches('/'), WELL_KNOWN_PATH);
        url.set_path(&path);

        let request = HttpRequest::get(url.as_str()).with_header("Accept", "application/json");
        Ok(self.strategy.prepare_request(self.kind(), request))
    }

    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims> {
        let claims = decode_response(self.kind(), self.strategy.as_ref(), response)?;
        if !claims.get("issuer").is_some_and(|v| v.is_string()) {
            return Err(RpError::discovery("provider metadata has no issuer"));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::StandardStrategy;

    fn service() -> ProviderInfoService {
        ProviderInfoService::new(Arc::new(StandardStrategy))
    }

    #[test]
    fn test_build_discovery_url() {
        let request = service()
            .build_request(
                &ServiceContext::for_tests("https://server.example.com"),
                &RequestArgs::new(),
            )
            .unwrap();
        assert_eq!(
            request.url,
            "https://server.example.com/.well-known/openid-configuration"
        );

        let request = service()
            .build_request(
                &ServiceContext::for_tests("https://op.example.com/tenant/"),
                &RequestArgs::new(),
            )
            .unwrap();
        assert_eq!(
            request.url,
            "https://op.example.com/tenant/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_parse_requires_issuer() {
        let ok = HttpResponse::json(&serde_json::json!({
            "issuer": "https://server.example.com",
            "authorization_endpoint": "https://server.example.com/authorize"
        }));
        assert!(service().parse_response(&ok).is_ok());

        let missing = HttpResponse::json(&serde_json::json!({"token_endpoint": "x"}));
        assert!(matches!(
            service().parse_response(&missing),
            Err(RpError::Discovery { .. })
        ));

        assert!(matches!(
            service().parse_response(&HttpResponse::new(404, "")),
            Err(RpError::Discovery { .. })
        ));
    }
}
