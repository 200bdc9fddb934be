use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderValue, Method, Response as HttpResponse, StatusCode};
use tern_common::http_client::HttpClient;
use tern_common::session::{NonceOrigin, OAuthSession, Session, SessionEvent, SessionEvents};
use tern_oauth::jose::decode_claims;
use tern_oauth::metadata::AuthorizationServerMetadata;
use tern_oauth::{DpopKey, OAuthConfig, RefreshError, RefreshState, SessionRefresher};
use tokio::sync::{Mutex, RwLock, broadcast};

#[derive(Clone, Default)]
struct MockClient {
    queue: Arc<Mutex<VecDeque<http::Response<Vec<u8>>>>>,
    log: Arc<Mutex<Vec<http::Request<Vec<u8>>>>>,
    delay: Option<Duration>,
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
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
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

fn token_use_dpop_nonce() -> http::Response<Vec<u8>> {
    let mut resp = json(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"error": "use_dpop_nonce"}),
    );
    resp.headers_mut()
        .insert("DPoP-Nonce", HeaderValue::from_static("n1"));
    resp
}

fn token_refresh_ok() -> http::Response<Vec<u8>> {
    json(
        StatusCode::OK,
        serde_json::json!({
            "access_token": "newacc",
            "token_type": "DPoP",
            "refresh_token": "newref",
            "expires_in": 3600,
            "scope": "atproto transition:generic",
            "sub": "did:plc:alice"
        }),
    )
}

fn token_replayed() -> http::Response<Vec<u8>> {
    json(
        StatusCode::BAD_REQUEST,
        serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Refresh token replayed"
        }),
    )
}

fn expired_session() -> OAuthSession {
    let mut s = OAuthSession::default();
    s.put("did", "did:plc:alice")
        .put("handle", "alice.test")
        .put("iss", "https://issuer")
        .put("pds", "https://pds.test")
        .set_tokens("oldacc", Some("r0"), 3600, 1_000);
    s
}

async fn refresher(client: MockClient) -> SessionRefresher<MockClient> {
    let config = OAuthConfig::new("https://app.test/client-metadata.json", DpopKey::generate())
        .timeout(Duration::from_secs(5))
        .build();
    let refresher = SessionRefresher::new(client, config);
    refresher
        .metadata()
        .insert(AuthorizationServerMetadata {
            issuer: "https://issuer".into(),
            token_endpoint: "https://issuer/token".into(),
            token_endpoint_auth_methods_supported: Some(vec!["none".into()]),
            dpop_signing_alg_values_supported: Some(vec!["ES256".into()]),
            ..Default::default()
        })
        .await;
    refresher
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn refresh_performs_nonce_handshake_and_updates_session() {
    let client = MockClient::default();
    client.push(token_use_dpop_nonce()).await;
    client.push(token_refresh_ok()).await;
    let refresher = refresher(client.clone()).await;
    let session = RwLock::new(expired_session());
    let events = SessionEvents::default();
    let mut rx = events.subscribe();

    let updated = refresher.refresh_if_expired(&session, &events).await.unwrap();

    assert_eq!(updated.token(), Some("newacc"));
    assert_eq!(updated.refresh(), Some("newref"));
    assert_eq!(updated.expires_in(), Some(3600));
    assert!(!updated.token_expired());
    assert_eq!(updated.scope(), Some("atproto transition:generic"));
    assert_eq!(updated.dpop_nonce(), Some("n1"));
    assert_eq!(*session.read().await, updated);

    let requests = client.requests().await;
    assert_eq!(requests.len(), 2);
    for req in &requests {
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "https://issuer/token");
        let body = String::from_utf8(req.body().clone()).unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=r0"));
        assert!(body.contains("client_id=https%3A%2F%2Fapp.test%2Fclient-metadata.json"));
    }
    let first = decode_claims(requests[0].headers()["DPoP"].to_str().unwrap()).unwrap();
    let second = decode_claims(requests[1].headers()["DPoP"].to_str().unwrap()).unwrap();
    assert_eq!(first.public.nonce, None);
    assert_eq!(second.public.nonce.as_deref(), Some("n1"));
    assert_eq!(second.public.htu.as_deref(), Some("https://issuer/token"));
    assert_ne!(first.registered.jti, second.registered.jti);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 3);
    match &events[0] {
        SessionEvent::RefreshStarted { snapshot } => {
            assert!(snapshot.get("refresh_token").is_none());
            assert_eq!(snapshot.get("access_token").unwrap(), "oldacc");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        &events[1],
        SessionEvent::NonceReceived { nonce, origin: NonceOrigin::AuthorizationServer } if nonce == "n1"
    ));
    assert!(matches!(&events[2], SessionEvent::Updated { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_refreshes_share_one_post() {
    let client = MockClient::default();
    client.push(token_refresh_ok()).await;
    let refresher = Arc::new(refresher(client.clone()).await);
    let session = Arc::new(RwLock::new(expired_session()));
    let events = Arc::new(SessionEvents::default());

    let spawn = || {
        let (refresher, session, events) = (refresher.clone(), session.clone(), events.clone());
        tokio::spawn(async move { refresher.refresh_if_expired(&session, &events).await })
    };
    let (a, b) = (spawn(), spawn());
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(client.requests().await.len(), 1);
    assert_eq!(a.token(), Some("newacc"));
    assert_eq!(a, b);
}

#[tokio::test]
async fn explicit_refresh_after_someone_else_refreshed_is_a_noop() {
    let client = MockClient::default();
    client.push(token_refresh_ok()).await;
    let refresher = refresher(client.clone()).await;
    let session = RwLock::new(expired_session());
    let events = SessionEvents::default();

    let (a, b) = tokio::join!(
        refresher.refresh(&session, &events),
        refresher.refresh(&session, &events)
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(client.requests().await.len(), 1);
}

#[tokio::test]
async fn valid_session_is_left_alone() {
    let client = MockClient::default();
    let refresher = refresher(client.clone()).await;
    let mut fresh = expired_session();
    fresh.set_tokens("acc", Some("r0"), 3600, tern_common::session::now_unix());
    let session = RwLock::new(fresh.clone());

    let out = refresher
        .refresh_if_expired(&session, &SessionEvents::default())
        .await
        .unwrap();
    assert_eq!(out, fresh);
    assert!(client.requests().await.is_empty());
    assert_eq!(refresher.state(&out).await, RefreshState::Valid);
}

#[tokio::test]
async fn replay_is_terminal_and_reported_once() {
    let client = MockClient::default();
    client.push(token_replayed()).await;
    let refresher = refresher(client.clone()).await;
    let original = expired_session();
    let session = RwLock::new(original.clone());
    let events = SessionEvents::default();
    let mut rx = events.subscribe();

    let err = refresher.refresh(&session, &events).await.unwrap_err();
    assert!(matches!(err, RefreshError::Replayed { status: 400, .. }));
    assert!(err.is_terminal());
    assert_eq!(*session.read().await, original);

    let err = refresher.refresh(&session, &events).await.unwrap_err();
    assert!(matches!(err, RefreshError::Replayed { .. }));
    assert_eq!(client.requests().await.len(), 1);

    let replays: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|ev| match ev {
            SessionEvent::RefreshTokenReplayed { status, body } => Some((status, body)),
            _ => None,
        })
        .collect();
    assert_eq!(replays.len(), 1);
    assert_eq!(replays[0].0, 400);
    assert!(
        std::str::from_utf8(&replays[0].1)
            .unwrap()
            .contains("Refresh token replayed")
    );
    assert_eq!(
        refresher.state(&session.read().await.clone()).await,
        RefreshState::ReplayDetected
    );
}

#[tokio::test]
async fn rejected_refresh_surfaces_error_body() {
    let client = MockClient::default();
    client
        .push(json(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "invalid_grant", "error_description": "Token expired"}),
        ))
        .await;
    let refresher = refresher(client).await;
    let original = expired_session();
    let session = RwLock::new(original.clone());

    let err = refresher
        .refresh(&session, &SessionEvents::default())
        .await
        .unwrap_err();
    match err {
        RefreshError::Rejected { status, error, body } => {
            assert_eq!(status, 400);
            assert_eq!(error.as_deref(), Some("invalid_grant"));
            assert!(std::str::from_utf8(&body).unwrap().contains("Token expired"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(*session.read().await, original);
}

#[tokio::test(start_paused = true)]
async fn timed_out_refresh_restores_snapshot() {
    let client = MockClient {
        delay: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    client.push(token_refresh_ok()).await;
    let refresher = refresher(client).await;
    let original = expired_session();
    let session = RwLock::new(original.clone());

    let err = refresher
        .refresh(&session, &SessionEvents::default())
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(*session.read().await, original);
    assert_eq!(session.read().await.refresh(), Some("r0"));
}

#[tokio::test(start_paused = true)]
async fn waiters_share_a_timed_out_attempt() {
    let client = MockClient {
        delay: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    client.push(token_refresh_ok()).await;
    let refresher = refresher(client.clone()).await;
    let session = RwLock::new(expired_session());
    let events = SessionEvents::default();

    let (a, b) = tokio::join!(
        refresher.refresh_if_expired(&session, &events),
        refresher.refresh_if_expired(&session, &events)
    );
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert!(a.is_timeout(), "{a:?}");
    assert!(b.is_timeout(), "{b:?}");
    assert_eq!(client.requests().await.len(), 1);
    assert_eq!(session.read().await.refresh(), Some("r0"));
}

#[tokio::test]
async fn waiters_share_a_rejected_attempt() {
    let client = MockClient::default();
    client
        .push(json(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "invalid_grant"}),
        ))
        .await;
    let refresher = refresher(client.clone()).await;
    let session = RwLock::new(expired_session());
    let events = SessionEvents::default();

    let (a, b) = tokio::join!(
        refresher.refresh(&session, &events),
        refresher.refresh(&session, &events)
    );
    for err in [a.unwrap_err(), b.unwrap_err()] {
        assert!(
            matches!(err, RefreshError::Rejected { status: 400, .. }),
            "{err:?}"
        );
    }
    assert_eq!(client.requests().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rotated_nonce_is_stored_before_the_retry() {
    let client = MockClient {
        delay: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    client.push(token_use_dpop_nonce()).await;
    client.push(token_refresh_ok()).await;
    let refresher = refresher(client.clone()).await;
    let session = RwLock::new(expired_session());
    let events = SessionEvents::default();

    let (updated, ()) = tokio::join!(refresher.refresh(&session, &events), async {
        // between the challenge and the retried response
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let live = session.read().await;
        assert_eq!(live.dpop_nonce(), Some("n1"));
        assert_eq!(live.refresh(), None);
    });
    assert_eq!(updated.unwrap().dpop_nonce(), Some("n1"));
    assert_eq!(client.requests().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn pds_nonce_written_during_refresh_survives() {
    let client = MockClient {
        delay: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    client.push(token_refresh_ok()).await;
    let refresher = refresher(client).await;
    let session = RwLock::new(expired_session());
    let events = SessionEvents::default();

    let (updated, ()) = tokio::join!(refresher.refresh(&session, &events), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.write().await.put("dpop_pds_nonce", "p2");
    });
    let updated = updated.unwrap();
    assert_eq!(updated.token(), Some("newacc"));
    assert_eq!(updated.dpop_pds_nonce(), Some("p2"));
    assert_eq!(session.read().await.dpop_pds_nonce(), Some("p2"));
}

#[tokio::test]
async fn unsupported_client_auth_is_rejected_before_posting() {
    let client = MockClient::default();
    let config = OAuthConfig::new("https://app.test/client-metadata.json", DpopKey::generate()).build();
    let refresher = SessionRefresher::new(client.clone(), config);
    refresher
        .metadata()
        .insert(AuthorizationServerMetadata {
            issuer: "https://issuer".into(),
            token_endpoint: "https://issuer/token".into(),
            token_endpoint_auth_methods_supported: Some(vec!["private_key_jwt".into()]),
            ..Default::default()
        })
        .await;
    let session = RwLock::new(expired_session());

    let err = refresher
        .refresh(&session, &SessionEvents::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RefreshError::UnsupportedAuthMethod(ref m) if m == "none"));
    assert!(client.requests().await.is_empty());
    assert_eq!(session.read().await.refresh(), Some("r0"));
}

#[tokio::test]
async fn refresh_follows_pds_migration() {
    let client = MockClient::default();
    client.push(token_refresh_ok()).await;
    client
        .push(json(
            StatusCode::OK,
            serde_json::json!({
                "id": "did:plc:alice",
                "alsoKnownAs": ["at://alice.example"],
                "service": [{
                    "id": "#atproto_pds",
                    "type": "AtprotoPersonalDataServer",
                    "serviceEndpoint": "https://new-pds.test"
                }]
            }),
        ))
        .await;
    let refresher = refresher(client.clone())
        .await
        .with_did_resolution("https://plc.test");
    let session = RwLock::new(expired_session());
    let events = SessionEvents::default();

    let updated = refresher.refresh(&session, &events).await.unwrap();
    assert_eq!(updated.pds(), Some("https://new-pds.test"));
    assert_eq!(updated.handle(), Some("alice.example"));
    assert_eq!(updated.did_doc().unwrap().id, "did:plc:alice");
    assert_eq!(updated.token(), Some("newacc"));

    let requests = client.requests().await;
    assert_eq!(requests[1].uri(), "https://plc.test/did:plc:alice");
}

#[tokio::test]
async fn failed_did_lookup_keeps_new_tokens() {
    let client = MockClient::default();
    client.push(token_refresh_ok()).await;
    client
        .push(json(StatusCode::NOT_FOUND, serde_json::json!({})))
        .await;
    let refresher = refresher(client.clone())
        .await
        .with_did_resolution("https://plc.test");
    let session = RwLock::new(expired_session());

    let updated = refresher
        .refresh(&session, &SessionEvents::default())
        .await
        .unwrap();
    assert_eq!(updated.token(), Some("newacc"));
    assert_eq!(updated.pds(), Some("https://pds.test"));
}
