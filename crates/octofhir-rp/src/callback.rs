//! Per-issuer callback URLs.
//!
//! Each issuer gets its own callback path segment, the issuer hash, so an
//! inbound callback can be routed back to the issuer that produced it.

use sha2::{Digest, Sha256};

/// Path prefix of the authorization code callback.
pub const CODE_CALLBACK: &str = "authz_cb";
/// Path prefix of the implicit flow callback.
pub const IMPLICIT_CALLBACK: &str = "authz_im_cb";
/// Path prefix of the form post callback.
pub const FORM_POST_CALLBACK: &str = "authz_fp_cb";

/// Callback URLs for one issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrls {
    /// `<base_url>/authz_cb/<hash>`
    pub code: String,
    /// `<base_url>/authz_im_cb/<hash>`
    pub implicit: String,
    /// `<base_url>/authz_fp_cb/<hash>`
    pub form_post: String,
    /// The issuer hash.
    pub hash: String,
}

impl CallbackUrls {
    /// Returns the callback matching a response type and optional response mode.
    ///
    /// `form_post` wins over the response type. Response types without
    /// `code` use the implicit callback.
    #[must_use]
    pub fn for_response(&self, response_type: &str, response_mode: Option<&str>) -> &str {
        if response_mode == Some("form_post") {
            return &self.form_post;
        }
        if response_type.split_whitespace().any(|t| t == "code") {
            &self.code
        } else {
            &self.implicit
        }
    }
}

/// Computes `hex(sha256(seed || issuer))`.
///
/// A trailing slash on the issuer is ignored.
#[must_use]
pub fn issuer_hash(seed: &str, issuer: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(issuer.trim_end_matches('/').as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives the callback URLs of `issuer` under `base_url`.
#[must_use]
pub fn callbacks_for(base_url: &str, seed: &str, issuer: &str) -> CallbackUrls {
    let hash = issuer_hash(seed, issuer);
    let base = base_url.trim_end_matches('/');
    CallbackUrls {
        code: format!("{}/{}/{}", base, CODE_CALLBACK, hash),
        implicit: format!("{}/{}/{}", base, IMPLICIT_CALLBACK, hash),
        form_post: format!("{}/{}/{}", base, FORM_POST_CALLBACK, hash),
        hash,
    }
}
