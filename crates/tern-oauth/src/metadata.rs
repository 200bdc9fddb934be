//! Authorization server metadata discovery (RFC 8414).

use std::collections::HashMap;
use std::sync::Arc;

use http::{Request, StatusCode};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tern_common::error::TransportError;
use tern_common::http_client::HttpClient;
use tokio::sync::RwLock;
use url::Url;

use crate::error::MetadataError;

pub const WELL_KNOWN_AUTHORIZATION_SERVER: &str = "/.well-known/oauth-authorization-server";

/// The subset of authorization server metadata a refreshing client needs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthorizationServerMetadata {
    pub issuer: SmolStr,
    pub token_endpoint: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<SmolStr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_signing_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpop_signing_alg_values_supported: Option<Vec<SmolStr>>,
}

impl AuthorizationServerMetadata {
    /// Whether the server accepts client authentication `method`. Servers
    /// that do not advertise a list accept anything.
    pub fn supports_auth_method(&self, method: &str) -> bool {
        self.token_endpoint_auth_methods_supported
            .as_ref()
            .is_none_or(|methods| methods.iter().any(|m| m == method))
    }
}

/// Compare two issuer strings strictly but without spuriously failing on
/// trivial differences.
///
/// - Schemes must match exactly.
/// - Hostnames and effective ports must match.
/// - Paths must match, except that an empty path and `/` are equivalent.
/// - Query or fragment on either side fails the comparison.
pub fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(&str, &str, u16, &str)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let path = match url.path() {
            "" => "/",
            other => other,
        };
        Some((url.scheme(), url.host_str()?, url.port_or_known_default()?, path))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => match (normalize(&ua), normalize(&ub)) {
            (Some(na), Some(nb)) => na == nb,
            _ => false,
        },
        _ => a == b,
    }
}

/// Fetch and validate the metadata document of `issuer`.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(client)))]
pub async fn fetch_authorization_server_metadata<T: HttpClient + ?Sized>(
    client: &T,
    issuer: &str,
) -> Result<AuthorizationServerMetadata, MetadataError> {
    let url = Url::parse(issuer)?.join(WELL_KNOWN_AUTHORIZATION_SERVER)?;
    let req = Request::builder()
        .uri(url.as_str())
        .header(http::header::ACCEPT, "application/json")
        .body(Vec::new())
        .map_err(TransportError::from)?;
    let res = client
        .send_http(req)
        .await
        .map_err(TransportError::from_client)?;
    if res.status() != StatusCode::OK {
        return Err(MetadataError::HttpStatus(res.status()));
    }
    let mut metadata: AuthorizationServerMetadata = serde_json::from_slice(res.body())?;
    // https://datatracker.ietf.org/doc/html/rfc8414#section-3.3
    if !issuer_equivalent(&metadata.issuer, issuer) {
        return Err(MetadataError::IssuerMismatch {
            expected: issuer.into(),
            found: metadata.issuer,
        });
    }
    metadata.issuer = issuer.into();
    Ok(metadata)
}

/// Per-agent cache of discovered metadata, keyed by issuer.
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    entries: Arc<RwLock<HashMap<SmolStr, Arc<AuthorizationServerMetadata>>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, issuer: &str) -> Option<Arc<AuthorizationServerMetadata>> {
        self.entries.read().await.get(issuer).cloned()
    }

    pub async fn insert(&self, metadata: AuthorizationServerMetadata) -> Arc<AuthorizationServerMetadata> {
        let metadata = Arc::new(metadata);
        self.entries
            .write()
            .await
            .insert(metadata.issuer.clone(), metadata.clone());
        metadata
    }

    /// Cached metadata for `issuer`, fetching it on first use.
    pub async fn get_or_fetch<T: HttpClient + ?Sized>(
        &self,
        client: &T,
        issuer: &str,
    ) -> Result<Arc<AuthorizationServerMetadata>, MetadataError> {
        if let Some(hit) = self.get(issuer).await {
            return Ok(hit);
        }
        let metadata = fetch_authorization_server_metadata(client, issuer).await?;
        Ok(self.insert(metadata).await)
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Canned {
        body: serde_json::Value,
        hits: Mutex<Vec<String>>,
    }

    impl HttpClient for Canned {
        type Error = TransportError;

        async fn send_http(
            &self,
            request: Request<Vec<u8>>,
        ) -> Result<http::Response<Vec<u8>>, TransportError> {
            self.hits.lock().unwrap().push(request.uri().to_string());
            Ok(http::Response::builder()
                .status(200)
                .body(serde_json::to_vec(&self.body).unwrap())
                .unwrap())
        }
    }

    fn canned(issuer: &str) -> Canned {
        Canned {
            body: serde_json::json!({
                "issuer": issuer,
                "token_endpoint": "https://bsky.social/oauth/token",
                "token_endpoint_auth_methods_supported": ["none", "private_key_jwt"],
                "scopes_supported": ["atproto"],
            }),
            hits: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn issuer_equivalence_rules() {
        assert!(issuer_equivalent("https://issuer", "https://issuer/"));
        assert!(issuer_equivalent("https://issuer:443/", "https://issuer/"));
        assert!(!issuer_equivalent("http://issuer/", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/a", "https://issuer/b"));
        assert!(!issuer_equivalent("https://issuer/?q=1", "https://issuer/"));
    }

    #[tokio::test]
    async fn fetches_and_caches_metadata() {
        let client = canned("https://bsky.social");
        let cache = MetadataCache::new();
        let md = cache
            .get_or_fetch(&client, "https://bsky.social/")
            .await
            .unwrap();
        assert_eq!(md.token_endpoint, "https://bsky.social/oauth/token");
        assert_eq!(md.issuer, "https://bsky.social/");
        assert!(md.supports_auth_method("none"));
        assert!(!md.supports_auth_method("client_secret_post"));

        cache.get_or_fetch(&client, "https://bsky.social/").await.unwrap();
        assert_eq!(
            client.hits.lock().unwrap().as_slice(),
            ["https://bsky.social/.well-known/oauth-authorization-server"]
        );
    }

    #[tokio::test]
    async fn rejects_foreign_issuer() {
        let client = canned("https://evil.test");
        let err = fetch_authorization_server_metadata(&client, "https://bsky.social")
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::IssuerMismatch { .. }));
    }
}
