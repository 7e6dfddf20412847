//! Session storage for in-flight authorization attempts.
//!
//! A session is keyed by the `state` value sent to the OP and lives until an
//! external supervisor deletes or purges it.
//!
//! # Implementation Notes
//!
//! Implementations must:
//!
//! - reject a second `create` for an existing `state`
//! - serialize `update` calls for the same `state` while letting distinct
//!   states proceed independently
//! - leave the record untouched when an update closure fails

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use crate::RpResult;
use crate::error::RpError;
use crate::message::{AuthorizationResponse, Claims, IdTokenClaims, TokenSet};

/// Progress of one authorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlowState {
    /// The authorization request was built and handed to the caller.
    AuthSent,
    /// The callback was received and correlated.
    AuthReceived,
    /// Tokens were obtained (token endpoint or implicit response).
    TokenExchanged,
    /// The userinfo endpoint was called.
    UserInfoFetched,
}

impl FlowState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthSent => "auth_sent",
            Self::AuthReceived => "auth_received",
            Self::TokenExchanged => "token_exchanged",
            Self::UserInfoFetched => "userinfo_fetched",
        }
    }
}

/// One authorization attempt.
///
/// The issuer is fixed at creation. Everything the flow learns afterwards is
/// recorded through the setters.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    state: String,
    issuer: String,
    nonce: String,
    auth_request: BTreeMap<String, String>,
    pkce_verifier: Option<String>,
    auth_response: Option<AuthorizationResponse>,
    token: Option<TokenSet>,
    id_token: Option<IdTokenClaims>,
    userinfo: Option<Claims>,
    flow_state: FlowState,
    created_at: OffsetDateTime,
}

impl SessionRecord {
    /// Creates a record for a freshly sent authorization request.
    #[must_use]
    pub fn new(
        state: impl Into<String>,
        issuer: impl Into<String>,
        nonce: impl Into<String>,
        auth_request: BTreeMap<String, String>,
    ) -> Self {
        Self {
            state: state.into(),
            issuer: issuer.into(),
            nonce: nonce.into(),
            auth_request,
            pkce_verifier: None,
            auth_response: None,
            token: None,
            id_token: None,
            userinfo: None,
            flow_state: FlowState::AuthSent,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Attaches the PKCE verifier sent with the request.
    #[must_use]
    pub fn with_pkce_verifier(mut self, verifier: impl Into<String>) -> Self {
        self.pkce_verifier = Some(verifier.into());
        self
    }

    /// Overrides the creation time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Parameters of the authorization request as sent.
    pub fn auth_request(&self) -> &BTreeMap<String, String> {
        &self.auth_request
    }

    pub fn pkce_verifier(&self) -> Option<&str> {
        self.pkce_verifier.as_deref()
    }

    pub fn auth_response(&self) -> Option<&AuthorizationResponse> {
        self.auth_response.as_ref()
    }

    pub fn token(&self) -> Option<&TokenSet> {
        self.token.as_ref()
    }

    /// Verified ID token claims.
    pub fn id_token(&self) -> Option<&IdTokenClaims> {
        self.id_token.as_ref()
    }

    /// Last userinfo response.
    pub fn userinfo(&self) -> Option<&Claims> {
        self.userinfo.as_ref()
    }

    pub fn flow_state(&self) -> FlowState {
        self.flow_state
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn set_auth_response(&mut self, response: AuthorizationResponse) {
        self.auth_response = Some(response);
        self.advance(FlowState::AuthReceived);
    }

    pub fn set_token(&mut self, token: TokenSet) {
        self.token = Some(token);
        self.advance(FlowState::TokenExchanged);
    }

    pub fn set_id_token(&mut self, claims: IdTokenClaims) {
        self.id_token = Some(claims);
    }

    pub fn set_userinfo(&mut self, claims: Claims) {
        self.userinfo = Some(claims);
        self.advance(FlowState::UserInfoFetched);
    }

    /// Moves the flow state forward. Never moves it back.
    pub fn advance(&mut self, state: FlowState) {
        if state > self.flow_state {
            self.flow_state = state;
        }
    }
}

/// Mutation applied by [`SessionStore::update`].
pub type SessionUpdate<'a> = Box<dyn FnOnce(&mut SessionRecord) -> RpResult<()> + Send + 'a>;

/// Storage for sessions and the issuer hash index.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Stores a new session.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Session` if a session with the same state exists.
    async fn create(&self, record: SessionRecord) -> RpResult<()>;

    /// Returns a snapshot of the session for `state`.
    async fn get(&self, state: &str) -> RpResult<Option<SessionRecord>>;

    /// Applies `f` to the session atomically and returns the new snapshot.
    ///
    /// If `f` fails the stored record is left as it was.
    ///
    /// # Errors
    ///
    /// Returns `RpError::Session` if the session does not exist, or the error
    /// returned by `f`.
    async fn update<'a>(&self, state: &str, f: SessionUpdate<'a>) -> RpResult<SessionRecord>;

    /// Deletes a session. Returns `true` if one existed.
    async fn delete(&self, state: &str) -> RpResult<bool>;

    /// Deletes sessions created more than `age` ago. Returns the count.
    async fn purge_older_than(&self, age: Duration) -> RpResult<usize>;

    /// Records which issuer a callback hash belongs to.
    async fn set_issuer_hash(&self, hash: &str, issuer: &str) -> RpResult<()>;

    /// Returns the issuer for a callback hash.
    async fn issuer_for_hash(&self, hash: &str) -> RpResult<Option<String>>;
}

/// [`SessionStore`] kept in memory.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionRecord>,
    issuer_hashes: DashMap<String, String>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, record: SessionRecord) -> RpResult<()> {
        match self.sessions.entry(record.state.clone()) {
            Entry::Occupied(_) => Err(RpError::session("a session with this state already exists")),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, state: &str) -> RpResult<Option<SessionRecord>> {
        Ok(self.sessions.get(state).map(|r| r.value().clone()))
    }

    async fn update<'a>(&self, state: &str, f: SessionUpdate<'a>) -> RpResult<SessionRecord> {
        let mut entry = self
            .sessions
            .get_mut(state)
            .ok_or_else(|| RpError::session("unknown session"))?;

        let mut next = entry.value().clone();
        f(&mut next)?;
        *entry.value_mut() = next.clone();
        Ok(next)
    }

    async fn delete(&self, state: &str) -> RpResult<bool> {
        Ok(self.sessions.remove(state).is_some())
    }

    async fn purge_older_than(&self, age: Duration) -> RpResult<usize> {
        let cutoff = OffsetDateTime::now_utc() - age;
        let before = self.sessions.len();
        self.sessions.retain(|_, record| record.created_at >= cutoff);
        let purged = before.saturating_sub(self.sessions.len());
        if purged > 0 {
            tracing::debug!(purged, "Purged stale sessions");
        }
        Ok(purged)
    }

    async fn set_issuer_hash(&self, hash: &str, issuer: &str) -> RpResult<()> {
        self.issuer_hashes
            .insert(hash.to_string(), issuer.to_string());
        Ok(())
    }

    async fn issuer_for_hash(&self, hash: &str) -> RpResult<Option<String>> {
        Ok(self.issuer_hashes.get(hash).map(|i| i.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn record(state: &str) -> SessionRecord {
        SessionRecord::new(state, "https://op.example.com", "nonce", BTreeMap::new())
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_state() {
        let store = InMemorySessionStore::new();
        store.create(record("s1")).await.unwrap();
        let err = store.create(record("s1")).await.unwrap_err();
        assert!(matches!(err, RpError::Session { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let store = InMemorySessionStore::new();
        store.create(record("s1")).await.unwrap();

        let updated = store
            .update(
                "s1",
                Box::new(|r| {
                    r.set_auth_response(AuthorizationResponse {
                        code: Some("code".to_string()),
                        ..Default::default()
                    });
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.flow_state(), FlowState::AuthReceived);

        let stored = store.get("s1").await.unwrap().unwrap();
        assert_eq!(
            stored.auth_response().and_then(|r| r.code.as_deref()),
            Some("code")
        );
        assert_eq!(stored.issuer(), "https://op.example.com");
    }

    #[tokio::test]
    async fn test_failed_update_leaves_record() {
        let store = InMemorySessionStore::new();
        store.create(record("s1")).await.unwrap();

        let result = store
            .update(
                "s1",
                Box::new(|r| {
                    r.set_userinfo(Claims::new());
                    Err(RpError::correlation("sub mismatch"))
                }),
            )
            .await;
        assert!(result.is_err());

        let stored = store.get("s1").await.unwrap().unwrap();
        assert!(stored.userinfo().is_none());
        assert_eq!(stored.flow_state(), FlowState::AuthSent);
    }

    #[tokio::test]
    async fn test_update_unknown_state() {
        let store = InMemorySessionStore::new();
        let result = store.update("missing", Box::new(|_| Ok(()))).await;
        assert!(matches!(result, Err(RpError::Session { .. })));
    }

    #[test]
    fn test_flow_state_never_moves_back() {
        let mut r = record("s1");
        r.set_token(TokenSet::default());
        r.set_auth_response(AuthorizationResponse::default());
        assert_eq!(r.flow_state(), FlowState::TokenExchanged);
    }

    #[tokio::test]
    async fn test_purge_and_delete() {
        let store = InMemorySessionStore::new();
        let old = record("old")
            .with_created_at(OffsetDateTime::now_utc() - Duration::from_secs(3600));
        store.create(old).await.unwrap();
        store.create(record("fresh")).await.unwrap();

        assert_eq!(store.purge_older_than(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(store.get("old").await.unwrap().is_none());

        assert!(store.delete("fresh").await.unwrap());
        assert!(!store.delete("fresh").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_issuer_hash_index() {
        let store = InMemorySessionStore::new();
        store
            .set_issuer_hash("abc", "https://op.example.com")
            .await
            .unwrap();
        assert_eq!(
            store.issuer_for_hash("abc").await.unwrap().as_deref(),
            Some("https://op.example.com")
        );
        assert!(store.issuer_for_hash("def").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_updates_same_state() {
        let store = Arc::new(InMemorySessionStore::new());
        store.create(record("s1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(
                        "s1",
                        Box::new(move |r| {
                            let count = r
                                .userinfo()
                                .and_then(|c| c.get("count"))
                                .and_then(|v| v.as_i64())
                                .unwrap_or(0);
                            let mut claims = Claims::new();
                            claims.insert("count".to_string(), (count + 1).into());
                            claims.insert("writer".to_string(), i.into());
                            r.set_userinfo(claims);
                            Ok(())
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.userinfo().unwrap()["count"], 16);
    }
}
