//! The OAuth refresh protocol.
//!
//! ```text
//! Valid ──expiry──▶ Expired ──refresh──▶ Refreshing ──ok──▶ Valid
//!                                            │
//!                                            └─replay─▶ ReplayDetected
//! ```
//!
//! At most one refresh runs per session. Callers that queue behind an
//! in-flight refresh receive the outcome of that attempt, success or
//! failure, instead of spending the (single-use) refresh token again.
//! While a refresh runs, the shared session has its refresh token removed.
//! On failure the pre-refresh session is put back, so a timed-out or
//! rejected refresh leaves no partial update behind. DPoP nonces the server
//! hands out along the way are written to the session immediately and
//! survive both outcomes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::Request;
use smol_str::SmolStr;
use tern_common::error::TransportError;
use tern_common::http_client::{HttpClient, TimeoutClient};
use tern_common::identity::{DidResolver, HttpDidResolver};
use tern_common::session::{OAuthSession, Session, SessionEvent, SessionEvents, keys, now_unix};
use tokio::sync::{Mutex, RwLock};

use crate::config::OAuthConfig;
use crate::dpop::{DpopContext, wrap_request_with_dpop};
use crate::error::RefreshError;
use crate::metadata::MetadataCache;
use crate::token::{
    RefreshRequestParameters, RequestPayload, TokenErrorResponse, TokenGrantType, TokenResponse,
};

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Where a session stands in the refresh protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Valid,
    Expired,
    Refreshing,
    /// The current refresh token was reported as reused; a new login is
    /// needed
    ReplayDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Only refresh if the token is still expired once we hold the lock
    Lazy,
    /// Refresh unless another caller already did while we waited
    Explicit,
}

/// Single-flight refresher for one OAuth session.
pub struct SessionRefresher<C> {
    http: TimeoutClient<C>,
    config: OAuthConfig,
    metadata: MetadataCache,
    resolver: Option<HttpDidResolver<TimeoutClient<C>>>,
    /// Held while a refresh runs; holds the error of the last attempt
    flight: Mutex<Option<RefreshError>>,
    /// Finished attempts, bumped after `flight` is updated
    attempts: AtomicU64,
    replayed: RwLock<HashMap<SmolStr, (u16, Bytes)>>,
}

impl<C> SessionRefresher<C> {
    pub fn new(http: C, config: OAuthConfig) -> Self {
        Self {
            http: TimeoutClient::with_timeout(http, config.timeout),
            config,
            metadata: MetadataCache::new(),
            resolver: None,
            flight: Mutex::new(None),
            attempts: AtomicU64::new(0),
            replayed: RwLock::new(HashMap::new()),
        }
    }

    /// Re-resolve the account's DID document after every successful
    /// refresh, following PDS migrations.
    pub fn with_did_resolution(mut self, plc_directory: impl Into<SmolStr>) -> Self
    where
        C: Clone,
    {
        let http = TimeoutClient::with_timeout(self.http.inner().clone(), self.config.timeout);
        self.resolver = Some(HttpDidResolver::with_plc_directory(http, plc_directory));
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// The timeout-wrapped client used for token and resource requests.
    pub fn http(&self) -> &TimeoutClient<C> {
        &self.http
    }

    pub async fn state(&self, session: &OAuthSession) -> RefreshState {
        if let Some(token) = session.refresh() {
            if self.replayed.read().await.contains_key(token) {
                return RefreshState::ReplayDetected;
            }
        }
        if self.flight.try_lock().is_err() {
            RefreshState::Refreshing
        } else if session.token_expired() {
            RefreshState::Expired
        } else {
            RefreshState::Valid
        }
    }
}

impl<C: HttpClient + Sync> SessionRefresher<C> {
    /// Refresh if the access token has expired; a no-op otherwise.
    pub async fn refresh_if_expired(
        &self,
        session: &RwLock<OAuthSession>,
        events: &SessionEvents,
    ) -> Result<OAuthSession, RefreshError> {
        self.run(session, events, Trigger::Lazy).await
    }

    /// Refresh now, unless a concurrent caller already did.
    pub async fn refresh(
        &self,
        session: &RwLock<OAuthSession>,
        events: &SessionEvents,
    ) -> Result<OAuthSession, RefreshError> {
        self.run(session, events, Trigger::Explicit).await
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", name = "refresh", skip_all, fields(trigger = ?trigger)))]
    async fn run(
        &self,
        session: &RwLock<OAuthSession>,
        events: &SessionEvents,
        trigger: Trigger,
    ) -> Result<OAuthSession, RefreshError> {
        let ticket = self.attempts.load(Ordering::Acquire);
        let seen = session.read().await.token().map(SmolStr::new);
        let mut last = self.flight.lock().await;
        if self.attempts.load(Ordering::Acquire) != ticket {
            // an attempt finished while we waited; its outcome is ours
            return match last.as_ref() {
                Some(err) => Err(err.duplicate()),
                None => Ok(session.read().await.clone()),
            };
        }
        let current = session.read().await.clone();

        if current.token() != seen.as_deref() {
            // the session was replaced while we waited
            return Ok(current);
        }
        if trigger == Trigger::Lazy && !current.token_expired() {
            return Ok(current);
        }

        let refresh_token = SmolStr::new(current.refresh().ok_or(RefreshError::NoRefreshToken)?);
        if let Some((status, body)) = self.replayed.read().await.get(&refresh_token) {
            return Err(RefreshError::Replayed {
                status: *status,
                body: body.clone(),
            });
        }
        let issuer = SmolStr::new(current.issuer().ok_or(RefreshError::NoIssuer)?);

        let mut hidden = current.without_refresh();
        commit(session, &mut hidden).await;
        events.emit(SessionEvent::RefreshStarted {
            snapshot: hidden.data().clone(),
        });

        let outcome = self
            .attempt(session, events, current, &issuer, refresh_token)
            .await;
        *last = outcome.as_ref().err().map(RefreshError::duplicate);
        self.attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn attempt(
        &self,
        session: &RwLock<OAuthSession>,
        events: &SessionEvents,
        mut next: OAuthSession,
        issuer: &str,
        refresh_token: SmolStr,
    ) -> Result<OAuthSession, RefreshError> {
        let mut ctx = DpopContext::authorization_server(
            &self.config.dpop_key,
            next.dpop_nonce().map(SmolStr::new),
        )
        .persist_to(session, events);
        let result = self.exchange(&mut ctx, issuer, &refresh_token).await;

        let tokens = match result {
            Ok(tokens) => tokens,
            Err(err) => {
                commit(session, &mut next).await;
                if let RefreshError::Replayed { status, body } = &err {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(status, "refresh token replay detected");
                    self.replayed
                        .write()
                        .await
                        .insert(refresh_token, (*status, body.clone()));
                    events.emit(SessionEvent::RefreshTokenReplayed {
                        status: *status,
                        body: body.clone(),
                    });
                }
                return Err(err);
            }
        };

        next.set_tokens(
            &tokens.access_token,
            tokens.refresh_token.as_deref(),
            tokens.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            now_unix(),
        );
        next.put(keys::TOKEN_TYPE, tokens.token_type.as_str());
        if let Some(scope) = &tokens.scope {
            next.put(keys::SCOPE, scope.as_str());
        }
        commit(session, &mut next).await;

        if self.follow_did_document(&mut next).await {
            commit(session, &mut next).await;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(did = next.did(), "session refreshed");
        events.emit(SessionEvent::Updated {
            session: next.data().clone(),
        });
        Ok(next)
    }

    async fn exchange(
        &self,
        ctx: &mut DpopContext<'_>,
        issuer: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse, RefreshError> {
        let metadata = self.metadata.get_or_fetch(&self.http, issuer).await?;
        let method = self.config.client_auth.method();
        if !metadata.supports_auth_method(method) {
            return Err(RefreshError::UnsupportedAuthMethod(method.into()));
        }
        let credentials = self
            .config
            .client_auth
            .credentials(&self.config.client_id, &metadata.issuer)?;
        let body = serde_html_form::to_string(RequestPayload {
            client_id: credentials.client_id,
            client_assertion_type: credentials.assertion_type,
            client_assertion: credentials.assertion,
            parameters: RefreshRequestParameters {
                grant_type: TokenGrantType::RefreshToken,
                refresh_token: refresh_token.into(),
                scope: None,
            },
        })?;
        let request = Request::builder()
            .method(http::Method::POST)
            .uri(metadata.token_endpoint.as_str())
            .header(
                http::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .header(http::header::ACCEPT, "application/json")
            .body(body.into_bytes())
            .map_err(TransportError::from)?;

        let response = wrap_request_with_dpop(&self.http, ctx, request).await?;
        if response.status().is_success() {
            return Ok(serde_json::from_slice(response.body())?);
        }

        let status = response.status().as_u16();
        let body = Bytes::copy_from_slice(response.body());
        match serde_json::from_slice::<TokenErrorResponse>(&body) {
            Ok(error) if error.is_refresh_replay() => Err(RefreshError::Replayed { status, body }),
            Ok(error) => Err(RefreshError::Rejected {
                status,
                error: Some(error.error),
                body,
            }),
            Err(_) => Err(RefreshError::Rejected {
                status,
                error: None,
                body,
            }),
        }
    }

    /// Best effort: a failed lookup keeps the session as it is.
    async fn follow_did_document(&self, session: &mut OAuthSession) -> bool {
        let (Some(resolver), Some(did)) = (&self.resolver, session.did()) else {
            return false;
        };
        let doc = match resolver.resolve_did_doc(did).await {
            Ok(doc) => doc,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_e, "did document re-resolution failed");
                return false;
            }
        };
        let Some(pds) = doc.pds_endpoint() else {
            return false;
        };
        let pds = pds.as_str().trim_end_matches('/').to_string();
        if session.pds().map(|p| p.trim_end_matches('/')) == Some(pds.as_str()) {
            return false;
        }
        #[cfg(feature = "tracing")]
        tracing::info!(%pds, "account moved to a new PDS");
        session.put(keys::PDS, pds);
        if let Some(handle) = doc.handle() {
            session.put(keys::HANDLE, handle.as_str());
        }
        if let Ok(value) = serde_json::to_value(&doc) {
            session.put(keys::DID_DOC, value);
        }
        true
    }
}

/// Install `next` as the live session. Nonces the live session picked up
/// since `next` was read are carried over.
async fn commit(session: &RwLock<OAuthSession>, next: &mut OAuthSession) {
    let mut live = session.write().await;
    for key in [keys::DPOP_NONCE, keys::DPOP_PDS_NONCE] {
        if let Some(nonce) = live.get(key).cloned() {
            next.put(key, nonce);
        }
    }
    *live = next.clone();
}
