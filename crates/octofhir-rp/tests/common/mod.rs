//! Mock OpenID Provider shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use jsonwebtoken::{Header, encode};
use serde_json::{Value, json};
use time::OffsetDateTime;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use octofhir_rp::{ClientConfig, RpConfig, ServiceSpec, SigningKey, generate_ec_signing_key};

pub const CLIENT_ID: &str = "client_1";
pub const CLIENT_SECRET: &str = "abcdefghijklmnop";
pub const RP_BASE_URL: &str = "https://rp.example.com";

/// A mock OP with an ES384 signing key.
pub struct TestOp {
    pub server: MockServer,
    pub key: SigningKey,
}

impl TestOp {
    pub async fn start() -> Self {
        init_tracing();
        Self {
            server: MockServer::start().await,
            key: generate_ec_signing_key().expect("signing key"),
        }
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.server.uri(), endpoint)
    }

    pub fn metadata(&self) -> Value {
        json!({
            "issuer": self.issuer(),
            "authorization_endpoint": self.url("/authorize"),
            "token_endpoint": self.url("/token"),
            "userinfo_endpoint": self.url("/userinfo"),
            "registration_endpoint": self.url("/register"),
            "jwks_uri": self.url("/jwks"),
            "response_types_supported": ["code", "id_token", "id_token token"],
            "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"]
        })
    }

    /// Serves the discovery document. Returns the mock so callers can set
    /// expectations before mounting.
    pub fn discovery(&self) -> Mock {
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(self.metadata()))
    }

    pub async fn mount_discovery(&self) {
        self.discovery().mount(&self.server).await;
    }

    pub async fn mount_jwks(&self) {
        let jwk = self.key.public_jwk.clone().expect("public jwk");
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [jwk] })))
            .mount(&self.server)
            .await;
    }

    /// Signs an ID token for `sub` with the OP key.
    pub fn id_token(&self, audience: &str, nonce: Option<&str>, extra: Value) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut claims = json!({
            "iss": self.issuer(),
            "sub": "alice",
            "aud": audience,
            "exp": now + 3600,
            "iat": now,
        });
        if let Some(object) = claims.as_object_mut() {
            if let Some(nonce) = nonce {
                object.insert("nonce".to_string(), json!(nonce));
            }
            if let Value::Object(extra) = extra {
                object.extend(extra);
            }
        }

        let mut header = Header::new(self.key.algorithm);
        header.kid = Some(self.key.kid.clone());
        encode(&header, &claims, &self.key.encoding_key).expect("sign ID token")
    }

    /// Static configuration for this OP with discovery enabled.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new()
            .with_issuer(self.issuer())
            .with_credentials(CLIENT_ID, CLIENT_SECRET)
            .with_service("discovery", ServiceSpec::standard())
            .with_service("authorization", ServiceSpec::standard())
            .with_service("access_token", ServiceSpec::standard())
            .with_service("refresh_access_token", ServiceSpec::standard())
            .with_service("userinfo", ServiceSpec::standard())
    }
}

pub fn rp_config() -> RpConfig {
    RpConfig::new(RP_BASE_URL)
        .with_hash_seed("integration-seed")
        .with_allow_http(true)
        .with_request_timeout(Duration::from_secs(2))
}

pub fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn params(pairs: &[(&str, &str)]) -> std::collections::BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("octofhir_rp=debug")
        .try_init();
}
