//! Authorization request construction and callback parsing.

use std::collections::BTreeMap;
use std::sync::Arc;

use url::Url;

use super::{
    ProviderStrategy, RequestArgs, Service, ServiceContext, ServiceKind, error_from_response,
};
use crate::RpResult;
use crate::error::RpError;
use crate::message::{AuthorizationResponse, Claims};
use crate::transport::{HttpRequest, HttpResponse};

/// Builds authorization requests.
///
/// The request is a `GET` to the authorization endpoint whose URL is handed
/// back to the caller for redirecting the user agent; it is never sent by
/// the RP itself.
///
/// Defaults come from the context (response type, scope, client ID,
/// redirect URI, response mode). Call arguments override them, and any other
/// argument (`state`, `nonce`, `prompt`, `login_hint`, PKCE parameters) is
/// added as is.
pub struct AuthorizationService {
    strategy: Arc<dyn ProviderStrategy>,
}

impl AuthorizationService {
    #[must_use]
    pub fn new(strategy: Arc<dyn ProviderStrategy>) -> Self {
        Self { strategy }
    }

    /// Returns the request parameters for one authorization request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the client has no `client_id`.
    pub fn request_params(
        &self,
        context: &ServiceContext,
        args: &RequestArgs,
    ) -> RpResult<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        params.insert(
            "response_type".to_string(),
            context.behaviour.response_type().to_string(),
        );
        params.insert("client_id".to_string(), context.require_client_id()?.to_string());
        params.insert("redirect_uri".to_string(), context.redirect_uri().to_string());
        params.insert("scope".to_string(), scope_with_openid(&context.behaviour.scope));
        if let Some(mode) = &context.behaviour.response_mode {
            params.insert("response_mode".to_string(), mode.clone());
        }

        for (name, value) in args {
            params.insert(name.clone(), value.clone());
        }
        Ok(params)
    }
}

impl Service for AuthorizationService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Authorization
    }

    fn build_request(&self, context: &ServiceContext, args: &RequestArgs) -> RpResult<HttpRequest> {
        let endpoint = context.endpoint(self.kind())?;
        let mut url = Url::parse(endpoint).map_err(|e| {
            RpError::configuration(format!("invalid authorization endpoint '{}': {}", endpoint, e))
        })?;
        url.query_pairs_mut()
            .extend_pairs(self.request_params(context, args)?);

        Ok(self
            .strategy
            .prepare_request(self.kind(), HttpRequest::get(url.as_str())))
    }

    /// Reads the authorization response out of a redirect's `Location`.
    ///
    /// Parameters are taken from the query and the fragment, the fragment
    /// winning for implicit and hybrid responses.
    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims> {
        if !(300..400).contains(&response.status) {
            return Err(error_from_response(self.kind(), response));
        }
        let location = response
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("location"))
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| {
                RpError::authorization("invalid_response", "authorization redirect has no Location")
            })?;
        let url = Url::parse(location).map_err(|e| {
            RpError::authorization("invalid_response", format!("invalid redirect location: {}", e))
        })?;

        let mut params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        if let Some(fragment) = url.fragment() {
            params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
        }
        Ok(AuthorizationResponse::from_params(&params).to_claims())
    }
}

/// Joins scopes with spaces, appending `openid` when it is missing.
fn scope_with_openid(scope: &[String]) -> String {
    let mut scopes: Vec<&str> = scope.iter().map(String::as_str).collect();
    if !scopes.contains(&"openid") {
        scopes.push("openid");
    }
    scopes.join(" ")
}
