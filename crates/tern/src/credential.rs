//! App-password sessions.
//!
//! A [`CredentialAgent`] signs requests with `Authorization: Bearer
//! <accessJwt>`. When the access JWT runs out it calls
//! `com.atproto.server.refreshSession` with the refresh JWT as the bearer
//! token; like OAuth refresh tokens, refresh JWTs are single use, so only
//! one refresh runs at a time and callers waiting on it share its outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderValue, Method, Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tern_common::AuthorizationToken;
use tern_common::did_doc::DidDocument;
use tern_common::error::{AuthError, ClientError, ClientResult, DecodeError, TransportError};
use tern_common::http_client::{HttpClient, TimeoutClient};
use tern_common::identity::{DidResolver, HttpDidResolver, IdentityError};
use tern_common::session::{
    CredentialSession, Session, SessionEvent, SessionEvents, SessionStore, SessionStoreExt, keys,
    now_unix,
};
use tern_oauth::jose::decode_claims;
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::options::AgentOptions;
use crate::request::{self, RequestBuilder, Signer};

pub const CREATE_SESSION: &str = "com.atproto.server.createSession";
pub const REFRESH_SESSION: &str = "com.atproto.server.refreshSession";
pub const DELETE_SESSION: &str = "com.atproto.server.deleteSession";

/// Access-token lifetime assumed when the JWT does not say.
pub const DEFAULT_ACCESS_LIFETIME: i64 = 2 * 60 * 60;

/// Where a credential agent persists its session.
pub type CredentialStore = Arc<dyn SessionStore>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionInput<'a> {
    identifier: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_factor_token: Option<&'a str>,
}

/// Output of `createSession` and `refreshSession`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionOutput {
    access_jwt: SmolStr,
    refresh_jwt: SmolStr,
    did: SmolStr,
    #[serde(default)]
    handle: Option<SmolStr>,
    #[serde(default)]
    did_doc: Option<Value>,
    #[serde(default)]
    email: Option<SmolStr>,
    #[serde(default)]
    active: Option<bool>,
}

impl SessionOutput {
    fn apply(self, session: &mut CredentialSession, now: i64) {
        let lifetime = access_lifetime(&self.access_jwt);
        session
            .set_tokens(&self.access_jwt, Some(&self.refresh_jwt), lifetime, now)
            .put(keys::DID, self.did.as_str());
        if let Some(handle) = &self.handle {
            session.put(keys::HANDLE, handle.as_str());
        }
        if let Some(email) = &self.email {
            session.put("email", email.as_str());
        }
        if let Some(active) = self.active {
            session.put("active", active);
        }
        if let Some(doc) = self.did_doc {
            // the entryway may hand us off to the account's own PDS
            let pds = serde_json::from_value::<DidDocument>(doc.clone())
                .ok()
                .and_then(|doc| doc.pds_endpoint());
            if let Some(pds) = pds {
                session.put(keys::PDS, pds.as_str().trim_end_matches('/'));
            }
            session.put(keys::DID_DOC, doc);
        }
    }
}

/// Lifetime of an access JWT in seconds, from its own `exp - iat`.
///
/// Falls back to [`DEFAULT_ACCESS_LIFETIME`] when the token cannot be read.
pub fn access_lifetime(jwt: &str) -> i64 {
    decode_claims(jwt)
        .and_then(|claims| Some(claims.registered.exp? - claims.registered.iat?))
        .filter(|lifetime| *lifetime > 0)
        .unwrap_or(DEFAULT_ACCESS_LIFETIME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Only refresh if the token is still expired once we hold the lock
    Expired,
    /// Refresh unless the token changed since the caller looked at it
    Requested,
}

/// Agent for app-password sessions.
pub struct CredentialAgent<C> {
    http: TimeoutClient<C>,
    options: AgentOptions,
    session: RwLock<CredentialSession>,
    events: SessionEvents,
    /// Held while a refresh runs; holds the error of the last attempt
    flight: Mutex<Option<ClientError>>,
    /// Finished refresh attempts, bumped after `flight` is updated
    attempts: AtomicU64,
    store: Option<CredentialStore>,
}

impl<C> CredentialAgent<C> {
    /// Agent with no session; call [`login`](Self::login) before signed requests.
    pub fn new(http: C, options: AgentOptions) -> Self {
        Self::with_session(http, CredentialSession::default(), options)
    }

    pub fn with_session(http: C, session: CredentialSession, options: AgentOptions) -> Self {
        Self {
            http: TimeoutClient::with_timeout(http, options.timeout),
            options,
            session: RwLock::new(session),
            events: SessionEvents::default(),
            flight: Mutex::new(None),
            attempts: AtomicU64::new(0),
            store: None,
        }
    }

    /// Persist the session after every login and refresh.
    pub fn with_store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    pub fn client(&self) -> &TimeoutClient<C> {
        &self.http
    }

    /// Snapshot of the current session.
    pub async fn session(&self) -> CredentialSession {
        self.session.read().await.clone()
    }

    pub async fn did(&self) -> Option<SmolStr> {
        self.session.read().await.did().map(SmolStr::new)
    }

    pub async fn token(&self) -> Option<SmolStr> {
        self.session.read().await.token().map(SmolStr::new)
    }

    /// The current refresh JWT.
    pub async fn refresh(&self) -> Option<SmolStr> {
        self.session.read().await.refresh().map(SmolStr::new)
    }

    pub async fn pds(&self) -> Option<SmolStr> {
        self.session.read().await.pds().map(SmolStr::new)
    }

    pub async fn token_expired(&self) -> bool {
        self.session.read().await.token_expired()
    }
}

impl<C: HttpClient + Sync + Clone> CredentialAgent<C> {
    /// Load the session stored under `did`.
    ///
    /// A stored session without a `pds` gets one from the DID document.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", name = "credential_restore", skip(http, store, options)))]
    pub async fn restore(
        http: C,
        store: CredentialStore,
        did: &str,
        options: AgentOptions,
    ) -> ClientResult<Self> {
        let mut session = store
            .load_session::<CredentialSession>(did)
            .await
            .map_err(|e| TransportError::Other(Box::new(e)))?
            .ok_or(AuthError::NotAuthenticated)?;
        if session.pds().is_none() {
            let resolver = HttpDidResolver::with_plc_directory(
                TimeoutClient::with_timeout(http.clone(), options.timeout),
                options.plc_directory.clone(),
            );
            let doc = resolver.resolve_did_doc(did).await?;
            let pds = doc.pds_endpoint().ok_or(IdentityError::MissingPdsEndpoint)?;
            session.put(keys::PDS, pds.as_str().trim_end_matches('/'));
        }
        Ok(Self::with_session(http, session, options).with_store(store))
    }
}

impl<C: HttpClient + Sync> CredentialAgent<C> {
    pub fn http(&self, require_auth: bool) -> RequestBuilder<'_, C> {
        RequestBuilder::new(Signer::Credential(self), require_auth)
    }

    /// Sign in with a handle or DID and an app password.
    ///
    /// `pds` is the server to ask; if the response carries a DID document,
    /// later requests go to the PDS it names instead.
    pub async fn login(
        &self,
        pds: &Url,
        identifier: &str,
        password: &str,
    ) -> ClientResult<CredentialSession> {
        self.login_with_factor(pds, identifier, password, None).await
    }

    /// [`login`](Self::login) for accounts with email two-factor enabled.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", name = "credential_login", skip_all, fields(%pds, identifier)))]
    pub async fn login_with_factor(
        &self,
        pds: &Url,
        identifier: &str,
        password: &str,
        auth_factor_token: Option<&str>,
    ) -> ClientResult<CredentialSession> {
        let input = CreateSessionInput {
            identifier,
            password,
            auth_factor_token,
        };
        let body = serde_json::to_vec(&input)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let url = request::xrpc_url(pds.as_str(), CREATE_SESSION)?;
        let output = self.call_session(url, None, Some(body)).await?;

        let mut session = CredentialSession::default();
        session.put(keys::PDS, pds.as_str().trim_end_matches('/'));
        output.apply(&mut session, now_unix());
        self.commit(&session).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(did = session.did(), "logged in");
        Ok(session)
    }

    /// Refresh now, unless a concurrent caller already did.
    pub async fn refresh_token(&self) -> ClientResult<SmolStr> {
        let ticket = self.attempts.load(Ordering::Acquire);
        let seen = self.token().await;
        self.run(Trigger::Requested, ticket, seen).await
    }

    /// Revoke the refresh JWT on the server and forget the session.
    pub async fn logout(&self) -> ClientResult<()> {
        let session = self.session().await;
        if let (Some(refresh), Some(pds)) = (session.refresh(), session.pds()) {
            let url = request::xrpc_url(pds, DELETE_SESSION)?;
            let request = self.session_request(url, Some(refresh), None)?;
            request::check(self.http.send_http(request).await?)?;
        }
        if let (Some(store), Some(did)) = (&self.store, session.did()) {
            store
                .remove(did)
                .await
                .map_err(|e| TransportError::Other(Box::new(e)))?;
        }
        *self.session.write().await = CredentialSession::default();
        Ok(())
    }

    /// Current access token, refreshed first if it has expired.
    pub(crate) async fn access_token(&self) -> ClientResult<SmolStr> {
        let ticket = self.attempts.load(Ordering::Acquire);
        let seen = {
            let session = self.session.read().await;
            let token = session.token().ok_or(AuthError::NotAuthenticated)?;
            if !session.token_expired() {
                return Ok(token.into());
            }
            SmolStr::new(token)
        };
        self.run(Trigger::Expired, ticket, Some(seen)).await
    }

    /// The server rejected `rejected` as expired.
    pub(crate) async fn refresh_after_rejection(&self, rejected: &str) -> ClientResult<SmolStr> {
        let ticket = self.attempts.load(Ordering::Acquire);
        self.run(Trigger::Requested, ticket, Some(rejected.into()))
            .await
    }

    pub(crate) async fn send(
        &self,
        mut request: Request<Vec<u8>>,
        token: Option<&str>,
    ) -> ClientResult<Response<Vec<u8>>> {
        if let Some(token) = token {
            request
                .headers_mut()
                .insert(AUTHORIZATION, bearer(token)?);
        }
        Ok(self.http.send_http(request).await?)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", name = "credential_refresh", skip_all, fields(trigger = ?trigger)))]
    async fn run(
        &self,
        trigger: Trigger,
        ticket: u64,
        seen: Option<SmolStr>,
    ) -> ClientResult<SmolStr> {
        let mut last = self.flight.lock().await;
        if self.attempts.load(Ordering::Acquire) != ticket {
            // an attempt finished while we waited; its outcome is ours
            return match last.as_ref() {
                Some(err) => Err(err.duplicate()),
                None => self
                    .token()
                    .await
                    .ok_or_else(|| AuthError::NotAuthenticated.into()),
            };
        }
        let current = self.session().await;

        if current.token() != seen.as_deref()
            || (trigger == Trigger::Expired && !current.token_expired())
        {
            // someone else refreshed while we waited
            return current
                .token()
                .map(SmolStr::new)
                .ok_or_else(|| AuthError::NotAuthenticated.into());
        }

        let refresh = current.refresh().ok_or(AuthError::ReauthenticationRequired)?;
        let pds = current.pds().ok_or_else(|| {
            TransportError::InvalidRequest("session has no PDS endpoint".into())
        })?;
        let url = request::xrpc_url(pds, REFRESH_SESSION)?;

        let outcome = self.attempt(&current, refresh, url).await;
        *last = outcome.as_ref().err().map(ClientError::duplicate);
        self.attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn attempt(
        &self,
        current: &CredentialSession,
        refresh: &str,
        url: Url,
    ) -> ClientResult<SmolStr> {
        let output = self
            .call_session(url, Some(refresh), None)
            .await
            .map_err(refresh_failed)?;

        let mut next = current.clone();
        output.apply(&mut next, now_unix());
        self.commit(&next).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(did = next.did(), "session refreshed");
        next.token()
            .map(SmolStr::new)
            .ok_or_else(|| AuthError::NotAuthenticated.into())
    }

    async fn call_session(
        &self,
        url: Url,
        bearer: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> ClientResult<SessionOutput> {
        let request = self.session_request(url, bearer, body)?;
        let response = request::check(self.http.send_http(request).await?)?;
        Ok(serde_json::from_slice(response.body()).map_err(DecodeError::from)?)
    }

    fn session_request(
        &self,
        url: Url,
        token: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> ClientResult<Request<Vec<u8>>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(USER_AGENT, self.options.user_agent.as_str());
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, bearer(token)?);
        }
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        Ok(builder
            .body(body.unwrap_or_default())
            .map_err(TransportError::from)?)
    }

    async fn commit(&self, session: &CredentialSession) -> ClientResult<()> {
        *self.session.write().await = session.clone();
        if let Some(store) = &self.store {
            store
                .save_session(session)
                .await
                .map_err(|e| TransportError::Other(Box::new(e)))?;
        }
        self.events.emit(SessionEvent::Updated {
            session: session.data().clone(),
        });
        Ok(())
    }
}

fn bearer(token: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(&AuthorizationToken::Bearer(token.into()).header_value())
        .map_err(|e| TransportError::InvalidRequest(format!("invalid token: {e}")))
}

fn refresh_failed(e: ClientError) -> ClientError {
    match e {
        ClientError::Http(e) => AuthError::RefreshFailed {
            status: e.status.as_u16(),
            body: e.body,
        }
        .into(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn jwt(claims: serde_json::Value) -> String {
        format!(
            "eyJhbGciOiJIUzI1NiJ9.{}.c2ln",
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    #[test]
    fn lifetime_comes_from_the_jwt() {
        let token = jwt(serde_json::json!({"iat": 1_700_000_000, "exp": 1_700_000_600}));
        assert_eq!(access_lifetime(&token), 600);
    }

    #[test]
    fn unreadable_tokens_get_the_default_lifetime() {
        assert_eq!(access_lifetime("opaque"), DEFAULT_ACCESS_LIFETIME);
        let no_exp = jwt(serde_json::json!({"iat": 1_700_000_000}));
        assert_eq!(access_lifetime(&no_exp), DEFAULT_ACCESS_LIFETIME);
        let backwards = jwt(serde_json::json!({"iat": 10, "exp": 5}));
        assert_eq!(access_lifetime(&backwards), DEFAULT_ACCESS_LIFETIME);
    }

    #[test]
    fn output_moves_session_to_pds_from_did_doc() {
        let output: SessionOutput = serde_json::from_value(serde_json::json!({
            "accessJwt": "a",
            "refreshJwt": "r",
            "did": "did:plc:alice",
            "handle": "alice.test",
            "didDoc": {
                "id": "did:plc:alice",
                "service": [{
                    "id": "#atproto_pds",
                    "type": "AtprotoPersonalDataServer",
                    "serviceEndpoint": "https://home.pds.test"
                }]
            }
        }))
        .unwrap();
        let mut session = CredentialSession::default();
        session.put(keys::PDS, "https://entryway.test");
        output.apply(&mut session, 1_000);

        assert_eq!(session.pds(), Some("https://home.pds.test"));
        assert_eq!(session.handle(), Some("alice.test"));
        assert_eq!(session.expires_in(), Some(DEFAULT_ACCESS_LIFETIME));
        assert_eq!(session.token_created_at(), Some(1_000));
        assert_eq!(session.did_doc().unwrap().id, "did:plc:alice");
    }
}
