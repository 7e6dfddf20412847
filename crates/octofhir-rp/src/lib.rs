//! # octofhir-rp
//!
//! OpenID Connect relying party for the OctoFHIR server.
//!
//! This crate provides:
//! - Static and dynamic (WebFinger + discovery) OP resolution
//! - Dynamic client registration
//! - Authorization code, implicit, hybrid and form_post flows
//! - Token exchange, refresh and userinfo with ID token verification
//! - Per-flow session tracking keyed by `state`
//!
//! ## Overview
//!
//! [`RpHandler`] is the entry point. It owns a [`ClientRegistry`] with one
//! [`Client`] per OP and a [`SessionStore`] with one [`SessionRecord`] per
//! login attempt. Every outbound call goes through an [`HttpTransport`] and
//! is bounded by the configured request timeout.
//!
//! ## Modules
//!
//! - [`config`] - RP configuration and per-OP config resolution
//! - [`client`] - Per-issuer client state, discovery and registration
//! - [`registry`] - Issuer to client cache
//! - [`handler`] - Flow orchestration
//! - [`service`] - Protocol services and provider strategies
//! - [`session`] - Session records and storage
//! - [`callback`] - Callback URL derivation
//! - [`keys`] - Key storage for ID token verification and client assertions
//! - [`message`] - Protocol message types
//! - [`transport`] - HTTP abstraction
//! - [`pkce`] - PKCE verifiers
//! - [`error`] - Error types

pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod keys;
pub mod message;
pub mod pkce;
pub mod registry;
pub mod service;
pub mod session;
pub mod transport;

pub use callback::{CallbackUrls, callbacks_for, issuer_hash};
pub use client::{Client, ClientEnvironment, ClientStage, issuers_match};
pub use config::{Behaviour, ClientConfig, ConfigError, ConfigResolver, RpConfig, ServiceSpec};
pub use error::{ErrorKind, FlowStep, RpError};
pub use handler::{AccessAndIdToken, BeginResponse, FinalizeResult, RpHandler};
pub use keys::{InMemoryKeyStore, KeyStore, SharedKeyStore, SigningKey, generate_ec_signing_key};
pub use message::{AuthorizationResponse, Claims, IdTokenClaims, ProviderMetadata, TokenSet};
pub use registry::ClientRegistry;
pub use service::{ProviderStrategy, RequestArgs, Service, ServiceKind, ServiceRegistry};
pub use session::{FlowState, InMemorySessionStore, SessionRecord, SessionStore};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};

/// Type alias for relying party results.
pub type RpResult<T> = Result<T, RpError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octofhir_rp::prelude::*;
/// ```
pub mod prelude {
    pub use crate::RpResult;
    pub use crate::config::{Behaviour, ClientConfig, RpConfig, ServiceSpec};
    pub use crate::error::{ErrorKind, FlowStep, RpError};
    pub use crate::handler::{AccessAndIdToken, BeginResponse, FinalizeResult, RpHandler};
    pub use crate::message::{Claims, IdTokenClaims, TokenSet};
    pub use crate::service::{RequestArgs, ServiceKind};
    pub use crate::session::{FlowState, SessionStore};
}
