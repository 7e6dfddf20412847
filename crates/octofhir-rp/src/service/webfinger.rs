//! WebFinger issuer discovery (OpenID Connect Discovery Section 2).

use std::sync::Arc;

use url::Url;

use super::{RequestArgs, Service, ServiceContext, ServiceKind, ProviderStrategy, decode_response};
use crate::RpResult;
use crate::error::RpError;
use crate::message::{Claims, OIDC_ISSUER_REL};
use crate::transport::{HttpRequest, HttpResponse};

/// Looks up the issuer of an end-user identifier.
///
/// Expects the identifier in the `resource` argument.
pub struct WebFingerService {
    strategy: Arc<dyn ProviderStrategy>,
}

impl WebFingerService {
    #[must_use]
    pub fn new(strategy: Arc<dyn ProviderStrategy>) -> Self {
        Self { strategy }
    }
}

impl Service for WebFingerService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::WebFinger
    }

    fn build_request(
        &self,
        _context: &ServiceContext,
        args: &RequestArgs,
    ) -> RpResult<HttpRequest> {
        let resource = args
            .get("resource")
            .filter(|r| !r.is_empty())
            .ok_or_else(|| RpError::discovery("WebFinger requires a user identifier"))?;
        let (resource, mut url) = webfinger_target(resource)?;

        url.query_pairs_mut()
            .append_pair("resource", &resource)
            .append_pair("rel", OIDC_ISSUER_REL);

        let request = HttpRequest::get(url.as_str()).with_header("Accept", "application/jrd+json");
        Ok(self.strategy.prepare_request(self.kind(), request))
    }

    fn parse_response(&self, response: &HttpResponse) -> RpResult<Claims> {
        decode_response(self.kind(), self.strategy.as_ref(), response)
    }
}

/// Normalizes a user identifier and returns it with the WebFinger URL of
/// its host.
///
/// `alice@example.com` becomes `acct:alice@example.com`; bare host names and
/// URLs are used as URL resources.
fn webfinger_target(identifier: &str) -> RpResult<(String, Url)> {
    let invalid =
        || RpError::discovery(format!("cannot derive a WebFinger host from '{}'", identifier));

    let (resource, scheme, authority) = if let Some(account) = identifier.strip_prefix("acct:") {
        let host = account.rsplit_once('@').map(|(_, h)| h).ok_or_else(invalid)?;
        (identifier.to_string(), "https", host.to_string())
    } else if identifier.contains("://") {
        let parsed = Url::parse(identifier).map_err(|_| invalid())?;
        let host = parsed.host_str().ok_or_else(invalid)?;
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let scheme = if parsed.scheme() == "http" { "http" } else { "https" };
        (identifier.to_string(), scheme, authority)
    } else if let Some((_, host)) = identifier
        .rsplit_once('@')
        .filter(|_| !identifier.contains('/'))
    {
        (format!("acct:{}", identifier), "https", host.to_string())
    } else {
        let resource = format!("https://{}", identifier);
        let parsed = Url::parse(&resource).map_err(|_| invalid())?;
        let host = parsed.host_str().ok_or_else(invalid)?.to_string();
        (resource, "https", host)
    };

    if authority.is_empty() {
        return Err(invalid());
    }
    let url = Url::parse(&format!("{}://{}/.well-known/webfinger", scheme, authority))
        .map_err(|_| invalid())?;
    Ok((resource, url))
}
