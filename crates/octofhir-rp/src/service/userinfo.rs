//! UserInfo endpoint (OpenID Connect Core Section 5.3).

use std::sync::Arc;

use super::{RequestArgs, Service, ServiceContext, ServiceKind, ProviderStrategy, decode_response};
use crate::RpResult;
use crate::error::RpError;
use crate::message::Claims;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse};

/// Fetches claims about the authenticated end-user.
///
/// The access token is taken from the `access_token` argument and sent as a
/// bearer token with either method.
pub struct UserInfoService {
    strategy: Arc<dyn ProviderStrategy>,
    method: HttpMethod,
}

impl UserInfoService {
    /// Creates the service. An absent method means `GET`.
    #[must_use]
    pub fn new(strategy: Arc<dyn ProviderStrategy>, request_method: Option<&str>) -> Self {
        let method = request_method
            .and_then(HttpMethod::parse)
            .unwrap_or(HttpMethod::Get);
        Self { strategy, method }
    }

    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.method
    }
}

impl Service for UserInfoService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::UserInfo
    }

    fn build_request(&self, context: &ServiceContext, args: &RequestArgs) -> RpResult<HttpRequest> {
        let endpoint = context.endpoint(self.kind())?;
        let access_token = args
            .get("access_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RpError::session("no access token for the userinfo request"))?;

        let request = match self.method {
            HttpMethod::Get => HttpRequest::get(endpoint),
            HttpMethod::Post => HttpRequest::post_form(endpoint, &[]),
        }
        .with_header("Authorization", format!("Bearer {}", access_token))
        .with_header("Accept", "application/json");

        Ok(self.strategy.prepare_request(self.kind(), request))
    }

    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims> {
        if response.is_success()
            && response
                .content_type()
                .is_some_and(|ct| ct.starts_with("application/jwt"))
        {
            return Err(RpError::userinfo(
                "signed or encrypted userinfo responses are not supported",
            ));
        }

        let claims = decode_response(self.kind(), self.strategy.as_ref(), response)?;
        if !claims.get("sub").is_some_and(|s| s.is_string()) {
            return Err(RpError::userinfo("userinfo response has no sub"));
        }
        Ok(claims)
    }
}
