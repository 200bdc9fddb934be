//! DPoP (RFC 9449) proofs and the server nonce handshake.
//!
//! Every request bound to an access token carries a fresh proof signed with
//! the client's P-256 key. Servers rotate nonces unpredictably: a request
//! sent with a stale nonce is rejected with `use_dpop_nonce` and a
//! `DPoP-Nonce` header, after which it is re-sent exactly once with a new
//! proof carrying that nonce.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use http::{Request, Response};
use jose_jwa::{Algorithm, Signing};
use jose_jwk::{Jwk, Key, crypto};
use p256::ecdsa::SigningKey;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use smol_str::SmolStr;
use tern_common::error::TransportError;
use tern_common::http_client::HttpClient;
use tern_common::session::{
    NonceOrigin, OAuthSession, Session, SessionEvent, SessionEvents, keys,
};
use tokio::sync::RwLock;

use crate::error::DpopError;
use crate::jose::{
    create_signed_jwt,
    jws::RegisteredHeader,
    jwt::{Claims, PublicClaims, RegisteredClaims},
};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";
pub const DPOP_HEADER: &str = "DPoP";
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

type Result<T> = core::result::Result<T, DpopError>;

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// The client's DPoP key: a P-256 secret key in JWK form.
///
/// Serializes as the private JWK so it can be stored next to the session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DpopKey(Key);

impl DpopKey {
    /// Fresh random P-256 key.
    pub fn generate() -> Self {
        Self(Key::from(&crypto::Key::from(p256::SecretKey::random(
            &mut OsRng,
        ))))
    }

    /// Wrap an existing JWK, which must hold a P-256 secret key.
    pub fn from_jwk(key: Key) -> Result<Self> {
        let key = Self(key);
        key.secret()?;
        Ok(key)
    }

    pub fn from_secret_key(secret: p256::SecretKey) -> Self {
        Self(Key::from(&crypto::Key::from(secret)))
    }

    pub fn as_jwk(&self) -> &Key {
        &self.0
    }

    fn secret(&self) -> Result<p256::SecretKey> {
        match crypto::Key::try_from(&self.0).map_err(DpopError::JwkCrypto)? {
            crypto::Key::P256(crypto::Kind::Secret(sk)) => Ok(sk),
            _ => Err(DpopError::UnsupportedKey),
        }
    }

    /// Public half, as embedded in proof headers.
    pub fn public_jwk(&self) -> Result<Jwk> {
        let secret = self.secret()?;
        Ok(Jwk {
            key: Key::from(&crypto::Key::from(secret.public_key())),
            prm: Default::default(),
        })
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        Ok(SigningKey::from(self.secret()?))
    }
}

impl fmt::Debug for DpopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DpopKey(..)")
    }
}

/// Where a DPoP-bound request gets its key and nonce, and where a rotated
/// nonce goes.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait DpopDataSource {
    fn key(&self) -> &DpopKey;
    fn origin(&self) -> NonceOrigin;
    fn nonce(&self) -> Option<SmolStr>;
    /// Called with a rotated nonce before the request is retried with it.
    async fn set_nonce(&mut self, nonce: SmolStr);
}

/// A [`DpopDataSource`] for a single call. The caller seeds it with the
/// nonce it holds and afterwards reads [`DpopContext::received`] to learn
/// whether the server rotated it.
///
/// With [`DpopContext::persist_to`] a rotated nonce is also written to the
/// session as soon as it arrives.
#[derive(Debug)]
pub struct DpopContext<'k> {
    key: &'k DpopKey,
    origin: NonceOrigin,
    nonce: Option<SmolStr>,
    received: Option<SmolStr>,
    sink: Option<(&'k RwLock<OAuthSession>, &'k SessionEvents)>,
}

impl<'k> DpopContext<'k> {
    pub fn new(key: &'k DpopKey, origin: NonceOrigin, nonce: Option<SmolStr>) -> Self {
        Self {
            key,
            origin,
            nonce,
            received: None,
            sink: None,
        }
    }

    pub fn authorization_server(key: &'k DpopKey, nonce: Option<SmolStr>) -> Self {
        Self::new(key, NonceOrigin::AuthorizationServer, nonce)
    }

    pub fn resource_server(key: &'k DpopKey, nonce: Option<SmolStr>) -> Self {
        Self::new(key, NonceOrigin::ResourceServer, nonce)
    }

    /// Store rotated nonces in `session` under the key for this origin and
    /// announce them on `events`.
    pub fn persist_to(
        mut self,
        session: &'k RwLock<OAuthSession>,
        events: &'k SessionEvents,
    ) -> Self {
        self.sink = Some((session, events));
        self
    }

    /// Nonce handed out by the server during the call, if it changed.
    pub fn received(&self) -> Option<&SmolStr> {
        self.received.as_ref()
    }

    pub fn into_received(self) -> Option<SmolStr> {
        self.received
    }
}

impl DpopDataSource for DpopContext<'_> {
    fn key(&self) -> &DpopKey {
        self.key
    }

    fn origin(&self) -> NonceOrigin {
        self.origin
    }

    fn nonce(&self) -> Option<SmolStr> {
        self.nonce.clone()
    }

    async fn set_nonce(&mut self, nonce: SmolStr) {
        self.nonce = Some(nonce.clone());
        if let Some((session, events)) = self.sink {
            let key = match self.origin {
                NonceOrigin::AuthorizationServer => keys::DPOP_NONCE,
                NonceOrigin::ResourceServer => keys::DPOP_PDS_NONCE,
            };
            session.write().await.put(key, nonce.as_str());
            events.emit(SessionEvent::NonceReceived {
                nonce: nonce.clone(),
                origin: self.origin,
            });
        }
        self.received = Some(nonce);
    }
}

/// Send `request` with a DPoP proof, performing the nonce handshake.
///
/// A rotated nonce is always stored in `data_source`. The request is
/// re-sent once, and only when the server rejected it with
/// `use_dpop_nonce`; a nonce on an accepted response is just kept.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(uri = %request.uri())))]
pub async fn wrap_request_with_dpop<T, N>(
    client: &T,
    data_source: &mut N,
    mut request: Request<Vec<u8>>,
) -> Result<Response<Vec<u8>>>
where
    T: HttpClient,
    N: DpopDataSource,
{
    let method = SmolStr::new(request.method().as_str());
    let uri = htu(request.uri());
    // https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
    let ath = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("DPoP "))
        .map(access_token_hash);

    let init_nonce = data_source.nonce();
    let init_proof = build_dpop_proof(
        data_source.key(),
        &method,
        &uri,
        init_nonce.as_deref(),
        ath.as_deref(),
    )?;
    request.headers_mut().insert(DPOP_HEADER, init_proof.parse()?);
    let response = client
        .send_http(request.clone())
        .await
        .map_err(TransportError::from_client)?;

    let next_nonce = response
        .headers()
        .get(DPOP_NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(SmolStr::new);
    let next_nonce = match next_nonce {
        Some(s) if Some(&s) != init_nonce.as_ref() => {
            #[cfg(feature = "tracing")]
            tracing::debug!(origin = ?data_source.origin(), "dpop nonce rotated");
            data_source.set_nonce(s.clone()).await;
            s
        }
        // no nonce, or the one we already sent: nothing to retry with
        _ => return Ok(response),
    };

    if !is_use_dpop_nonce_error(data_source.origin(), &response) {
        return Ok(response);
    }
    let next_proof = build_dpop_proof(
        data_source.key(),
        &method,
        &uri,
        Some(&next_nonce),
        ath.as_deref(),
    )?;
    request.headers_mut().insert(DPOP_HEADER, next_proof.parse()?);
    let response = client
        .send_http(request)
        .await
        .map_err(TransportError::from_client)?;
    Ok(response)
}

/// True when the response asks for the request to be repeated with a new
/// nonce.
pub fn is_use_dpop_nonce_error(origin: NonceOrigin, response: &Response<Vec<u8>>) -> bool {
    match origin {
        // https://datatracker.ietf.org/doc/html/rfc9449#name-authorization-server-provid
        NonceOrigin::AuthorizationServer => {
            matches!(response.status().as_u16(), 400 | 401)
                && serde_json::from_slice::<ErrorResponse>(response.body())
                    .is_ok_and(|res| res.error == "use_dpop_nonce")
        }
        // https://datatracker.ietf.org/doc/html/rfc9449#name-resource-server-provided-no
        NonceOrigin::ResourceServer => {
            response.status() == 401
                && response
                    .headers()
                    .get(http::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|www_auth| {
                        www_auth.starts_with("DPoP")
                            && www_auth.contains(r#"error="use_dpop_nonce""#)
                    })
        }
    }
}

/// The `htu` claim: the request URI without query or fragment.
pub fn htu(uri: &http::Uri) -> SmolStr {
    match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => {
            SmolStr::new(format!("{scheme}://{authority}{}", uri.path()))
        }
        _ => SmolStr::new(uri.path()),
    }
}

/// The `ath` claim: base64url SHA-256 of the access token.
pub fn access_token_hash(token: &str) -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(sha2::Sha256::digest(token.as_bytes()))
        .into()
}

pub(crate) fn generate_jti() -> SmolStr {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes).into()
}

/// Build a compact JWS (ES256) for DPoP with embedded public JWK.
pub fn build_dpop_proof(
    key: &DpopKey,
    method: &str,
    url: &str,
    nonce: Option<&str>,
    ath: Option<&str>,
) -> Result<SmolStr> {
    let secret = key.secret()?;
    let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
    header.typ = Some(JWT_HEADER_TYP_DPOP.into());
    header.jwk = Some(key.public_jwk()?);

    let claims = Claims {
        registered: RegisteredClaims {
            jti: Some(generate_jti()),
            iat: Some(Utc::now().timestamp()),
            ..Default::default()
        },
        public: PublicClaims {
            htm: Some(method.into()),
            htu: Some(url.into()),
            ath: ath.map(SmolStr::new),
            nonce: nonce.map(SmolStr::new),
        },
    };
    Ok(create_signed_jwt(&SigningKey::from(secret), &header, &claims)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::decode_claims;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Response<Vec<u8>>>>,
        seen: Mutex<Vec<Request<Vec<u8>>>>,
    }

    impl Scripted {
        fn push(&self, status: u16, headers: &[(&str, &str)], body: &str) {
            let mut builder = Response::builder().status(status);
            for (k, v) in headers {
                builder = builder.header(*k, *v);
            }
            self.responses
                .lock()
                .unwrap()
                .push_back(builder.body(body.as_bytes().to_vec()).unwrap());
        }

        fn proofs(&self) -> Vec<Claims> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|r| {
                    decode_claims(r.headers()[DPOP_HEADER].to_str().unwrap()).unwrap()
                })
                .collect()
        }
    }

    impl HttpClient for Scripted {
        type Error = TransportError;

        async fn send_http(
            &self,
            request: Request<Vec<u8>>,
        ) -> core::result::Result<Response<Vec<u8>>, TransportError> {
            self.seen.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Connect("script exhausted".into()))
        }
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Vec<u8>> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("DPoP {token}"));
        }
        builder.body(Vec::new()).unwrap()
    }

    #[test]
    fn proof_has_expected_shape() {
        let key = DpopKey::generate();
        let proof = build_dpop_proof(
            &key,
            "POST",
            "https://pds.test/xrpc/x",
            Some("n1"),
            Some("hash"),
        )
        .unwrap();
        let header: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(proof.split('.').next().unwrap())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(header["typ"], "dpop+jwt");
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["jwk"]["kty"], "EC");
        assert_eq!(header["jwk"]["crv"], "P-256");
        assert!(header["jwk"].get("d").is_none());

        let claims = decode_claims(&proof).unwrap();
        assert_eq!(claims.public.htm.as_deref(), Some("POST"));
        assert_eq!(claims.public.nonce.as_deref(), Some("n1"));
        assert_eq!(claims.public.ath.as_deref(), Some("hash"));
        assert!(claims.registered.iat.is_some());

        let again = build_dpop_proof(&key, "POST", "https://pds.test/xrpc/x", None, None).unwrap();
        assert_ne!(
            decode_claims(&again).unwrap().registered.jti,
            claims.registered.jti
        );
    }

    #[test]
    fn htu_strips_query_and_fragment() {
        let uri: http::Uri = "https://pds.test/xrpc/app.bsky.feed.getTimeline?limit=5#frag"
            .parse()
            .unwrap();
        assert_eq!(htu(&uri), "https://pds.test/xrpc/app.bsky.feed.getTimeline");
    }

    #[test]
    fn ath_is_sha256_of_token() {
        // sha256("abc")
        assert_eq!(
            access_token_hash("abc"),
            "ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0"
        );
    }

    #[test]
    fn rejects_non_p256_keys() {
        let public = DpopKey::generate().public_jwk().unwrap().key;
        assert!(matches!(
            DpopKey::from_jwk(public),
            Err(DpopError::UnsupportedKey)
        ));
    }

    #[tokio::test]
    async fn resource_nonce_challenge_retries_once() {
        let client = Scripted::default();
        client.push(
            401,
            &[
                ("WWW-Authenticate", r#"DPoP error="use_dpop_nonce""#),
                ("DPoP-Nonce", "n2"),
            ],
            "",
        );
        client.push(200, &[], "{}");

        let key = DpopKey::generate();
        let mut ctx = DpopContext::resource_server(&key, Some("n1".into()));
        let response = wrap_request_with_dpop(
            &client,
            &mut ctx,
            get("https://pds.test/xrpc/x?cursor=1", Some("tok")),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(ctx.received().map(|s| s.as_str()), Some("n2"));
        let proofs = client.proofs();
        assert_eq!(proofs.len(), 2);
        assert_eq!(proofs[0].public.nonce.as_deref(), Some("n1"));
        assert_eq!(proofs[1].public.nonce.as_deref(), Some("n2"));
        assert_eq!(proofs[1].public.htu.as_deref(), Some("https://pds.test/xrpc/x"));
        assert_eq!(
            proofs[1].public.ath.as_deref(),
            Some(access_token_hash("tok").as_str())
        );
    }

    #[tokio::test]
    async fn auth_server_nonce_error_on_401_is_retried() {
        let client = Scripted::default();
        client.push(
            401,
            &[("DPoP-Nonce", "as-1")],
            r#"{"error":"use_dpop_nonce"}"#,
        );
        client.push(200, &[], "{}");

        let key = DpopKey::generate();
        let mut ctx = DpopContext::authorization_server(&key, None);
        let response = wrap_request_with_dpop(&client, &mut ctx, get("https://as.test/token", None))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(client.proofs().len(), 2);
        assert!(client.proofs()[1].public.ath.is_none());
    }

    #[tokio::test]
    async fn second_challenge_is_returned_not_retried() {
        let client = Scripted::default();
        for nonce in ["a", "b"] {
            client.push(
                400,
                &[("DPoP-Nonce", nonce)],
                r#"{"error":"use_dpop_nonce"}"#,
            );
        }
        let key = DpopKey::generate();
        let mut ctx = DpopContext::authorization_server(&key, None);
        let response = wrap_request_with_dpop(&client, &mut ctx, get("https://as.test/token", None))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        assert_eq!(client.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn nonce_on_success_is_stored_without_retry() {
        let client = Scripted::default();
        client.push(200, &[("DPoP-Nonce", "fresh")], "{}");
        let key = DpopKey::generate();
        let mut ctx = DpopContext::resource_server(&key, None);
        wrap_request_with_dpop(&client, &mut ctx, get("https://pds.test/xrpc/x", Some("t")))
            .await
            .unwrap();
        assert_eq!(client.seen.lock().unwrap().len(), 1);
        assert_eq!(ctx.into_received().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn same_nonce_is_not_retried() {
        let client = Scripted::default();
        client.push(
            401,
            &[
                ("WWW-Authenticate", r#"DPoP error="use_dpop_nonce""#),
                ("DPoP-Nonce", "same"),
            ],
            "",
        );
        let key = DpopKey::generate();
        let mut ctx = DpopContext::resource_server(&key, Some("same".into()));
        let response = wrap_request_with_dpop(&client, &mut ctx, get("https://pds.test/x", Some("t")))
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        assert!(ctx.received().is_none());
    }

    #[tokio::test]
    async fn persisted_nonce_goes_to_the_origin_key() {
        let client = Scripted::default();
        client.push(
            401,
            &[
                ("WWW-Authenticate", r#"DPoP error="use_dpop_nonce""#),
                ("DPoP-Nonce", "p1"),
            ],
            "",
        );
        client.push(200, &[], "{}");
        let key = DpopKey::generate();
        let session = RwLock::new(OAuthSession::default());
        let events = SessionEvents::default();
        let mut rx = events.subscribe();

        let mut ctx = DpopContext::resource_server(&key, None).persist_to(&session, &events);
        wrap_request_with_dpop(&client, &mut ctx, get("https://pds.test/xrpc/x", Some("t")))
            .await
            .unwrap();

        let session = session.read().await;
        assert_eq!(session.dpop_pds_nonce(), Some("p1"));
        assert_eq!(session.dpop_nonce(), None);
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::NonceReceived { nonce, origin: NonceOrigin::ResourceServer } if nonce == "p1"
        ));
        assert!(rx.try_recv().is_err());
    }
}
