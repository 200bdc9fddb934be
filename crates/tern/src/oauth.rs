//! OAuth sessions with DPoP-bound access tokens.

use std::sync::Arc;

use http::header::AUTHORIZATION;
use http::{HeaderValue, Request, Response};
use smol_str::SmolStr;
use tern_common::AuthorizationToken;
use tern_common::error::{AuthError, ClientResult, TransportError};
use tern_common::http_client::{HttpClient, TimeoutClient};
use tern_common::session::{OAuthSession, Session, SessionEvents, SessionStore, SessionStoreExt};
use tern_oauth::dpop::{DpopContext, wrap_request_with_dpop};
use tern_oauth::{OAuthConfig, RefreshState, SessionRefresher};
use tokio::sync::RwLock;

use crate::options::AgentOptions;
use crate::request::{RequestBuilder, Signer};

/// Where an OAuth agent persists its session.
pub type OAuthStore = Arc<dyn SessionStore>;

/// Agent for an OAuth session obtained elsewhere.
///
/// Every signed request carries `Authorization: DPoP <access_token>` and a
/// fresh proof bound to the token (`ath`) and to the PDS's latest nonce. An
/// expired token is refreshed through [`SessionRefresher`] before the
/// request goes out, at most once at a time.
pub struct OAuthAgent<C> {
    http: TimeoutClient<C>,
    refresher: SessionRefresher<C>,
    options: AgentOptions,
    session: RwLock<OAuthSession>,
    events: SessionEvents,
    store: Option<OAuthStore>,
}

impl<C: Clone> OAuthAgent<C> {
    pub fn new(http: C, config: OAuthConfig, session: OAuthSession, options: AgentOptions) -> Self {
        let mut refresher = SessionRefresher::new(http.clone(), config);
        if options.follow_pds_moves {
            refresher = refresher.with_did_resolution(options.plc_directory.clone());
        }
        Self {
            http: TimeoutClient::with_timeout(http, options.timeout),
            refresher,
            options,
            session: RwLock::new(session),
            events: SessionEvents::default(),
            store: None,
        }
    }

    /// Load the session stored under `did`.
    pub async fn restore(
        http: C,
        config: OAuthConfig,
        store: OAuthStore,
        did: &str,
        options: AgentOptions,
    ) -> ClientResult<Self> {
        let session = store
            .load_session::<OAuthSession>(did)
            .await
            .map_err(|e| TransportError::Other(Box::new(e)))?
            .ok_or(AuthError::NotAuthenticated)?;
        Ok(Self::new(http, config, session, options).with_store(store))
    }
}

impl<C> OAuthAgent<C> {
    /// Persist the session after every refresh.
    pub fn with_store(mut self, store: OAuthStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    pub fn refresher(&self) -> &SessionRefresher<C> {
        &self.refresher
    }

    pub fn client(&self) -> &TimeoutClient<C> {
        &self.http
    }

    /// Snapshot of the current session.
    pub async fn session(&self) -> OAuthSession {
        self.session.read().await.clone()
    }

    pub async fn did(&self) -> Option<SmolStr> {
        self.session.read().await.did().map(SmolStr::new)
    }

    pub async fn token(&self) -> Option<SmolStr> {
        self.session.read().await.token().map(SmolStr::new)
    }

    /// The current refresh token; hidden while a refresh is in flight.
    pub async fn refresh(&self) -> Option<SmolStr> {
        self.session.read().await.refresh().map(SmolStr::new)
    }

    pub async fn pds(&self) -> Option<SmolStr> {
        self.session.read().await.pds().map(SmolStr::new)
    }

    pub async fn token_expired(&self) -> bool {
        self.session.read().await.token_expired()
    }

    pub async fn state(&self) -> RefreshState {
        let session = self.session().await;
        self.refresher.state(&session).await
    }
}

impl<C: HttpClient + Sync> OAuthAgent<C> {
    pub fn http(&self, require_auth: bool) -> RequestBuilder<'_, C> {
        RequestBuilder::new(Signer::OAuth(self), require_auth)
    }

    /// Refresh now, unless a concurrent caller already did.
    pub async fn refresh_token(&self) -> ClientResult<SmolStr> {
        let before = self.token().await;
        let session = self.refresher.refresh(&self.session, &self.events).await?;
        self.settle(before.as_deref(), session).await
    }

    /// Current access token, refreshed first if it has expired.
    pub(crate) async fn access_token(&self) -> ClientResult<SmolStr> {
        let before = {
            let session = self.session.read().await;
            match session.token() {
                Some(token) if !session.token_expired() => return Ok(token.into()),
                None if session.refresh().is_none() => {
                    return Err(AuthError::NotAuthenticated.into());
                }
                token => token.map(SmolStr::new),
            }
        };
        let session = self
            .refresher
            .refresh_if_expired(&self.session, &self.events)
            .await?;
        self.settle(before.as_deref(), session).await
    }

    /// The PDS rejected `rejected` as expired.
    pub(crate) async fn refresh_after_rejection(&self, rejected: &str) -> ClientResult<SmolStr> {
        if let Some(token) = self.token().await.filter(|t| t.as_str() != rejected) {
            return Ok(token);
        }
        self.refresh_token().await
    }

    /// Persist a refreshed session and hand back its access token.
    async fn settle(&self, before: Option<&str>, session: OAuthSession) -> ClientResult<SmolStr> {
        let token = session
            .token()
            .map(SmolStr::new)
            .ok_or(AuthError::ReauthenticationRequired)?;
        if before != Some(token.as_str()) {
            if let Some(store) = &self.store {
                store
                    .save_session(&session)
                    .await
                    .map_err(|e| TransportError::Other(Box::new(e)))?;
            }
        }
        Ok(token)
    }

    pub(crate) async fn send(
        &self,
        mut request: Request<Vec<u8>>,
        token: Option<&str>,
    ) -> ClientResult<Response<Vec<u8>>> {
        let Some(token) = token else {
            return Ok(self.http.send_http(request).await?);
        };
        let value = HeaderValue::from_str(&AuthorizationToken::Dpop(token.into()).header_value())
            .map_err(|e| TransportError::InvalidRequest(format!("invalid token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);

        let nonce = self.session.read().await.dpop_pds_nonce().map(SmolStr::new);
        let mut ctx = DpopContext::resource_server(&self.refresher.config().dpop_key, nonce)
            .persist_to(&self.session, &self.events);
        Ok(wrap_request_with_dpop(&self.http, &mut ctx, request).await?)
    }
}
