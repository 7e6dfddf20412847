//! Relying party error types.
//!
//! Every failure surfaced by the orchestrator is an [`RpError`]. Errors are
//! grouped into [`ErrorKind`]s so callers can decide whether to retry a step,
//! restart the flow, or treat the failure as a possible attack.

use std::fmt;

use crate::transport::TransportError;

/// The protocol step that performed a network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowStep {
    /// WebFinger issuer lookup.
    WebFinger,
    /// Provider metadata discovery.
    Discovery,
    /// Dynamic client registration.
    Registration,
    /// Authorization endpoint request.
    Authorization,
    /// Authorization code exchange.
    TokenExchange,
    /// Refresh token grant.
    Refresh,
    /// UserInfo endpoint call.
    UserInfo,
    /// Provider JWKS download.
    Jwks,
}

impl FlowStep {
    /// Returns the step name as used in logs and error messages.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebFinger => "webfinger",
            Self::Discovery => "discovery",
            Self::Registration => "registration",
            Self::Authorization => "authorization",
            Self::TokenExchange => "token_exchange",
            Self::Refresh => "refresh",
            Self::UserInfo => "userinfo",
            Self::Jwks => "jwks",
        }
    }
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while orchestrating an OpenID Connect flow.
#[derive(Debug, thiserror::Error)]
pub enum RpError {
    /// Bad or missing configuration. Not retried.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The state, issuer, audience or nonce did not match what this RP
    /// expects. Treated as a possible attack.
    #[error("Correlation error: {message}")]
    Correlation {
        /// Description of the mismatch.
        message: String,
    },

    /// WebFinger lookup or provider metadata discovery failed.
    #[error("Discovery failed: {message}")]
    Discovery {
        /// Description of the failure.
        message: String,
    },

    /// Dynamic client registration failed.
    #[error("Registration failed: {message}")]
    Registration {
        /// Description of the failure.
        message: String,
    },

    /// Code exchange or refresh at the token endpoint failed.
    #[error("Token exchange failed: {message}")]
    TokenExchange {
        /// Description of the failure.
        message: String,
    },

    /// The userinfo endpoint call failed.
    #[error("UserInfo request failed: {message}")]
    UserInfo {
        /// Description of the failure.
        message: String,
    },

    /// A network call did not complete in time.
    #[error("Timed out during {step}")]
    Timeout {
        /// The step whose request timed out.
        step: FlowStep,
    },

    /// The stored access token is past its `expires_at`.
    #[error("Access token expired at {expires_at}")]
    ExpiredToken {
        /// Expiry as a Unix timestamp.
        expires_at: i64,
    },

    /// An ID token could not be decoded or its signature did not verify.
    #[error("ID token signature verification failed: {message}")]
    Signature {
        /// Description of the verification failure.
        message: String,
    },

    /// The OP answered the authorization request with an error.
    #[error("Authorization error from provider: {error} - {description}")]
    Authorization {
        /// OAuth error code.
        error: String,
        /// Optional human readable description.
        description: String,
    },

    /// The session lacks something the requested step needs.
    #[error("Session error: {message}")]
    Session {
        /// Description of what is missing.
        message: String,
    },
}

/// Coarse classification of [`RpError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Correlation,
    Discovery,
    Registration,
    TokenExchange,
    UserInfo,
    Timeout,
    ExpiredToken,
    Signature,
    Authorization,
    Session,
}

impl RpError {
    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Correlation` error.
    #[must_use]
    pub fn correlation(message: impl Into<String>) -> Self {
        Self::Correlation {
            message: message.into(),
        }
    }

    /// Creates a new `Discovery` error.
    #[must_use]
    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    /// Creates a new `Registration` error.
    #[must_use]
    pub fn registration(message: impl Into<String>) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    /// Creates a new `TokenExchange` error.
    #[must_use]
    pub fn token_exchange(message: impl Into<String>) -> Self {
        Self::TokenExchange {
            message: message.into(),
        }
    }

    /// Creates a new `UserInfo` error.
    #[must_use]
    pub fn userinfo(message: impl Into<String>) -> Self {
        Self::UserInfo {
            message: message.into(),
        }
    }

    /// Creates a new `Signature` error.
    #[must_use]
    pub fn signature(message: impl Into<String>) -> Self {
        Self::Signature {
            message: message.into(),
        }
    }

    /// Creates a new `Session` error.
    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Creates an `Authorization` error from an OAuth error response.
    #[must_use]
    pub fn authorization(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Authorization {
            error: error.into(),
            description: description.into(),
        }
    }

    /// Creates the provider-side error matching the step that failed.
    #[must_use]
    pub fn for_step(step: FlowStep, message: impl Into<String>) -> Self {
        match step {
            FlowStep::WebFinger | FlowStep::Discovery => Self::discovery(message),
            FlowStep::Registration => Self::registration(message),
            FlowStep::Authorization => Self::authorization("invalid_response", message),
            FlowStep::TokenExchange | FlowStep::Refresh => Self::token_exchange(message),
            FlowStep::UserInfo => Self::userinfo(message),
            FlowStep::Jwks => Self::signature(message),
        }
    }

    /// Maps a transport failure onto the step that issued the request.
    #[must_use]
    pub fn from_transport(step: FlowStep, err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout { step },
            other => Self::for_step(step, other.to_string()),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Correlation { .. } => ErrorKind::Correlation,
            Self::Discovery { .. } => ErrorKind::Discovery,
            Self::Registration { .. } => ErrorKind::Registration,
            Self::TokenExchange { .. } => ErrorKind::TokenExchange,
            Self::UserInfo { .. } => ErrorKind::UserInfo,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ExpiredToken { .. } => ErrorKind::ExpiredToken,
            Self::Signature { .. } => ErrorKind::Signature,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::Session { .. } => ErrorKind::Session,
        }
    }

    /// Returns `true` if the same step may succeed when called again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Discovery
                | ErrorKind::Registration
                | ErrorKind::TokenExchange
                | ErrorKind::UserInfo
                | ErrorKind::Timeout
        )
    }

    /// Returns `true` if this error may indicate an attack (mix-up, replay,
    /// forged token).
    #[must_use]
    pub fn is_security_violation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Correlation | ErrorKind::Signature)
    }
}

impl From<crate::config::ConfigError> for RpError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}
