use std::collections::VecDeque;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::header::{AUTHORIZATION, USER_AGENT};
use http::{Method, Response as HttpResponse, StatusCode};
use serde_json::json;
use tern::common::session::{MemorySessionStore, SessionStore, SessionStoreExt, now_unix};
use tern::credential::{DEFAULT_ACCESS_LIFETIME, REFRESH_SESSION};
use tern::{
    Agent, AgentOptions, AuthError, ClientError, CredentialAgent, CredentialSession,
    CredentialStore, HttpClient, Session, SessionEvent,
};
use tokio::sync::Mutex;
use url::Url;

#[derive(Clone, Default)]
struct MockClient {
    queue: Arc<Mutex<VecDeque<http::Response<Vec<u8>>>>>,
    log: Arc<Mutex<Vec<http::Request<Vec<u8>>>>>,
}

impl MockClient {
    async fn push(&self, resp: http::Response<Vec<u8>>) {
        self.queue.lock().await.push_back(resp);
    }

    async fn requests(&self) -> Vec<http::Request<Vec<u8>>> {
        self.log.lock().await.clone()
    }
}

impl HttpClient for MockClient {
    type Error = std::convert::Infallible;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, Self::Error> {
        self.log.lock().await.push(request);
        tokio::task::yield_now().await;
        Ok(self
            .queue
            .lock()
            .await
            .pop_front()
            .expect("no queued response"))
    }
}

fn json(status: StatusCode, body: serde_json::Value) -> http::Response<Vec<u8>> {
    HttpResponse::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .unwrap()
}

fn jwt(iat: i64, exp: i64) -> String {
    let claims = json!({"scope": "com.atproto.access", "sub": "did:plc:alice", "iat": iat, "exp": exp});
    format!(
        "eyJ0eXAiOiJhdCtqd3QiLCJhbGciOiJFUzI1NksifQ.{}.c2lnbmF0dXJl",
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

fn session_output(access: &str, refresh: &str) -> http::Response<Vec<u8>> {
    json(
        StatusCode::OK,
        json!({
            "accessJwt": access,
            "refreshJwt": refresh,
            "handle": "alice.test",
            "did": "did:plc:alice",
            "active": true
        }),
    )
}

fn expired_token() -> http::Response<Vec<u8>> {
    json(
        StatusCode::BAD_REQUEST,
        json!({"error": "ExpiredToken", "message": "Token has expired"}),
    )
}

fn ok() -> http::Response<Vec<u8>> {
    json(StatusCode::OK, json!({"did": "did:plc:alice"}))
}

/// A session whose access token was issued `age` seconds ago and lives an hour.
fn session(age: i64) -> CredentialSession {
    let mut s = CredentialSession::default();
    s.put("did", "did:plc:alice")
        .put("handle", "alice.test")
        .put("pds", "https://pds.test")
        .set_tokens("acc0", Some("ref0"), 3600, now_unix() - age);
    s
}

fn auth(req: &http::Request<Vec<u8>>) -> Option<&str> {
    req.headers().get(AUTHORIZATION).map(|v| v.to_str().unwrap())
}

#[tokio::test]
async fn login_stores_tokens_and_expiry() {
    let client = MockClient::default();
    let now = now_unix();
    let access = jwt(now, now + 600);
    client.push(session_output(&access, "ref1")).await;
    let store: CredentialStore = Arc::new(MemorySessionStore::new());
    let agent = CredentialAgent::new(client.clone(), AgentOptions::default()).with_store(store.clone());
    let mut events = agent.events().subscribe();

    let pds = Url::parse("https://pds.test").unwrap();
    let session = agent.login(&pds, "alice.test", "hunter2").await.unwrap();

    assert_eq!(session.token(), Some(access.as_str()));
    assert_eq!(session.refresh(), Some("ref1"));
    assert_eq!(session.did(), Some("did:plc:alice"));
    assert_eq!(session.pds(), Some("https://pds.test"));
    assert_eq!(session.expires_in(), Some(600));
    assert!(!agent.token_expired().await);
    assert_eq!(agent.session().await, session);
    let stored: Option<CredentialSession> = store.load_session("did:plc:alice").await.unwrap();
    assert_eq!(stored, Some(session.clone()));
    assert!(matches!(events.try_recv().unwrap(), SessionEvent::Updated { .. }));

    let requests = client.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method(), Method::POST);
    assert_eq!(
        requests[0].uri(),
        "https://pds.test/xrpc/com.atproto.server.createSession"
    );
    assert_eq!(auth(&requests[0]), None);
    let body: serde_json::Value = serde_json::from_slice(requests[0].body()).unwrap();
    assert_eq!(body, json!({"identifier": "alice.test", "password": "hunter2"}));
}

#[tokio::test]
async fn opaque_access_token_gets_default_lifetime() {
    let client = MockClient::default();
    client.push(session_output("opaque", "ref1")).await;
    let agent = CredentialAgent::new(client, AgentOptions::default());

    let pds = Url::parse("https://pds.test/").unwrap();
    let session = agent.login(&pds, "alice.test", "hunter2").await.unwrap();
    assert_eq!(session.expires_in(), Some(DEFAULT_ACCESS_LIFETIME));
    assert_eq!(session.expires_in(), Some(7200));
}

#[tokio::test]
async fn failed_login_leaves_agent_signed_out() {
    let client = MockClient::default();
    client
        .push(json(
            StatusCode::UNAUTHORIZED,
            json!({"error": "AuthenticationRequired", "message": "Invalid identifier or password"}),
        ))
        .await;
    let agent = CredentialAgent::new(client, AgentOptions::default());

    let pds = Url::parse("https://pds.test").unwrap();
    let err = agent.login(&pds, "alice.test", "wrong").await.unwrap_err();
    let ClientError::Http(err) = err else {
        panic!("expected an HTTP error, got {err:?}");
    };
    assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    assert_eq!(err.error_code().as_deref(), Some("AuthenticationRequired"));
    assert_eq!(agent.token().await, None);

    let err = agent
        .http(true)
        .query("app.bsky.actor.getProfile")
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Auth(AuthError::NotAuthenticated)));
}

#[tokio::test]
async fn signed_requests_carry_bearer_token() {
    let client = MockClient::default();
    client.push(ok()).await;
    client.push(ok()).await;
    let agent = CredentialAgent::with_session(client.clone(), session(100), AgentOptions::default());

    let out: serde_json::Value = agent
        .http(true)
        .query("app.bsky.actor.getProfile")
        .param("actor", "alice.test")
        .send_json()
        .await
        .unwrap();
    assert_eq!(out["did"], "did:plc:alice");
    agent
        .http(false)
        .get(Url::parse("https://appview.test/xrpc/app.bsky.feed.getFeed").unwrap())
        .send()
        .await
        .unwrap();

    let requests = client.requests().await;
    assert_eq!(
        requests[0].uri(),
        "https://pds.test/xrpc/app.bsky.actor.getProfile?actor=alice.test"
    );
    assert_eq!(auth(&requests[0]), Some("Bearer acc0"));
    assert!(
        requests[0].headers()[USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("tern/")
    );
    assert_eq!(auth(&requests[1]), None);
}

#[tokio::test]
async fn expired_session_refreshes_before_the_request() {
    let client = MockClient::default();
    let now = now_unix();
    let fresh = jwt(now, now + 3600);
    client.push(session_output(&fresh, "ref1")).await;
    client.push(ok()).await;
    let agent = CredentialAgent::with_session(client.clone(), session(3700), AgentOptions::default());
    assert!(agent.token_expired().await);

    agent
        .http(true)
        .procedure("com.atproto.repo.createRecord")
        .json(&json!({"repo": "did:plc:alice", "collection": "app.bsky.feed.post"}))
        .send()
        .await
        .unwrap();

    let requests = client.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0].uri(),
        format!("https://pds.test/xrpc/{REFRESH_SESSION}").as_str()
    );
    assert_eq!(auth(&requests[0]), Some("Bearer ref0"));
    assert_eq!(requests[1].method(), Method::POST);
    assert_eq!(auth(&requests[1]), Some(format!("Bearer {fresh}").as_str()));
    assert_eq!(agent.refresh().await.as_deref(), Some("ref1"));
    assert!(!agent.token_expired().await);
}

#[tokio::test]
async fn expired_token_response_is_refreshed_and_retried_once() {
    let client = MockClient::default();
    client.push(expired_token()).await;
    client.push(session_output("acc1", "ref1")).await;
    client.push(ok()).await;
    let agent = CredentialAgent::with_session(client.clone(), session(100), AgentOptions::default());

    agent
        .http(true)
        .query("app.bsky.actor.getProfile")
        .send()
        .await
        .unwrap();

    let requests = client.requests().await;
    assert_eq!(requests.len(), 3);
    assert_eq!(auth(&requests[0]), Some("Bearer acc0"));
    assert!(requests[1].uri().path().ends_with(REFRESH_SESSION));
    assert_eq!(auth(&requests[1]), Some("Bearer ref0"));
    assert_eq!(auth(&requests[2]), Some("Bearer acc1"));
}

#[tokio::test]
async fn second_expired_response_is_returned() {
    let client = MockClient::default();
    client.push(expired_token()).await;
    client.push(session_output("acc1", "ref1")).await;
    client.push(expired_token()).await;
    let agent = CredentialAgent::with_session(client.clone(), session(100), AgentOptions::default());

    let err = agent
        .http(true)
        .query("app.bsky.actor.getProfile")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_token_expired());
    assert_eq!(client.requests().await.len(), 3);
}

#[tokio::test]
async fn concurrent_requests_share_one_refresh() {
    let client = MockClient::default();
    client.push(session_output("acc1", "ref1")).await;
    client.push(ok()).await;
    client.push(ok()).await;
    let agent = CredentialAgent::with_session(client.clone(), session(3700), AgentOptions::default());

    let (a, b) = tokio::join!(
        agent.http(true).query("app.bsky.actor.getProfile").send(),
        agent.http(true).query("app.bsky.feed.getTimeline").send(),
    );
    a.unwrap();
    b.unwrap();

    let requests = client.requests().await;
    let refreshes = requests
        .iter()
        .filter(|r| r.uri().path().ends_with(REFRESH_SESSION))
        .count();
    assert_eq!(refreshes, 1);
    assert_eq!(requests.len(), 3);
    assert!(requests[1..].iter().all(|r| auth(r) == Some("Bearer acc1")));
}

#[tokio::test]
async fn concurrent_requests_share_a_failed_refresh() {
    let client = MockClient::default();
    client.push(expired_token()).await;
    let original = session(3700);
    let agent = CredentialAgent::with_session(client.clone(), original.clone(), AgentOptions::default());

    let (a, b) = tokio::join!(
        agent.http(true).query("app.bsky.actor.getProfile").send(),
        agent.http(true).query("app.bsky.feed.getTimeline").send(),
    );
    for result in [a, b] {
        assert!(matches!(
            result,
            Err(ClientError::Auth(AuthError::RefreshFailed { status: 400, .. }))
        ));
    }

    let requests = client.requests().await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].uri().path().ends_with(REFRESH_SESSION));
    assert_eq!(agent.session().await, original);
}

#[tokio::test]
async fn rejected_refresh_keeps_the_old_session() {
    let client = MockClient::default();
    client.push(expired_token()).await;
    let original = session(3700);
    let agent = CredentialAgent::with_session(client.clone(), original.clone(), AgentOptions::default());

    let err = agent.refresh_token().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Auth(AuthError::RefreshFailed { status: 400, .. })
    ));
    assert_eq!(agent.session().await, original);
}

#[tokio::test]
async fn agent_dispatches_to_credential_variant() {
    let client = MockClient::default();
    client.push(session_output("acc1", "ref1")).await;
    let agent: Agent<MockClient> =
        CredentialAgent::with_session(client.clone(), session(100), AgentOptions::default()).into();

    assert_eq!(agent.did().await.as_deref(), Some("did:plc:alice"));
    assert_eq!(agent.token().await.as_deref(), Some("acc0"));
    assert_eq!(agent.refresh().await.as_deref(), Some("ref0"));
    assert!(!agent.token_expired().await);

    assert_eq!(agent.refresh_token().await.unwrap(), "acc1");
    assert_eq!(agent.refresh().await.as_deref(), Some("ref1"));
    assert_eq!(agent.session_data().await.get("accessJwt").unwrap(), "acc1");
    assert_eq!(client.requests().await.len(), 1);
}

#[tokio::test]
async fn restore_and_logout() {
    let client = MockClient::default();
    client.push(json(StatusCode::OK, json!({}))).await;
    let store: CredentialStore = Arc::new(MemorySessionStore::new());
    store.save_session(&session(100)).await.unwrap();

    let agent = CredentialAgent::restore(client.clone(), store.clone(), "did:plc:alice", AgentOptions::default())
        .await
        .unwrap();
    assert_eq!(agent.pds().await.as_deref(), Some("https://pds.test"));

    agent.logout().await.unwrap();
    let requests = client.requests().await;
    assert!(requests[0].uri().path().ends_with("com.atproto.server.deleteSession"));
    assert_eq!(auth(&requests[0]), Some("Bearer ref0"));
    assert_eq!(agent.token().await, None);
    assert!(store.load("did:plc:alice").await.unwrap().is_none());

    let missing = CredentialAgent::restore(client, store, "did:plc:bob", AgentOptions::default()).await;
    assert!(matches!(
        missing,
        Err(ClientError::Auth(AuthError::NotAuthenticated))
    ));
}
