//! DID document resolution for `did:plc` and `did:web`.

use std::future::Future;

use http::StatusCode;
use miette::Diagnostic;
use percent_encoding::percent_decode_str;
use smol_str::SmolStr;
use thiserror::Error;
use url::Url;

use crate::did_doc::DidDocument;
use crate::error::TransportError;
use crate::http_client::HttpClient;

/// Public PLC directory.
pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";

/// Errors that can occur during identity resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum IdentityError {
    /// DID method other than `plc` or `web`
    #[error("unsupported DID method: {0}")]
    #[diagnostic(
        code(tern_common::identity::unsupported_did_method),
        help("supported DID methods: did:web, did:plc")
    )]
    UnsupportedDidMethod(SmolStr),

    /// Transport failure talking to the directory or web host
    #[error("HTTP error: {0}")]
    #[diagnostic(
        code(tern_common::identity::http),
        help("check network connectivity and TLS configuration")
    )]
    Http(#[from] TransportError),

    /// Non-success status from the directory or web host
    #[error("HTTP status {0}")]
    #[diagnostic(code(tern_common::identity::http_status))]
    HttpStatus(StatusCode),

    /// Could not build the document URL
    #[error("URL parse error: {0}")]
    #[diagnostic(code(tern_common::identity::url))]
    Url(#[from] url::ParseError),

    /// Document body was not valid JSON
    #[error("serialize/deserialize error: {0}")]
    #[diagnostic(code(tern_common::identity::serde))]
    Serde(#[from] serde_json::Error),

    /// The fetched document describes a different DID
    #[error("DID doc id mismatch: expected {expected}, got {found}")]
    #[diagnostic(
        code(tern_common::identity::doc_id_mismatch),
        help("document id differs from requested DID; do not trust this document")
    )]
    DocIdMismatch {
        /// DID that was requested
        expected: SmolStr,
        /// Id found in the document
        found: SmolStr,
    },

    /// The document has no `AtprotoPersonalDataServer` service
    #[error("missing PDS endpoint in DID document")]
    #[diagnostic(code(tern_common::identity::missing_pds_endpoint))]
    MissingPdsEndpoint,
}

/// Resolves a DID to its document.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait DidResolver {
    /// Fetch and validate the document for `did`.
    fn resolve_did_doc(
        &self,
        did: &str,
    ) -> impl Future<Output = Result<DidDocument, IdentityError>>;
}

/// Resolver that fetches documents over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDidResolver<C> {
    http: C,
    plc_directory: SmolStr,
}

impl<C> HttpDidResolver<C> {
    /// Resolver using the public PLC directory.
    pub fn new(http: C) -> Self {
        Self {
            http,
            plc_directory: SmolStr::new_static(DEFAULT_PLC_DIRECTORY),
        }
    }

    pub fn with_plc_directory(http: C, plc_directory: impl Into<SmolStr>) -> Self {
        Self {
            http,
            plc_directory: plc_directory.into(),
        }
    }

    pub fn plc_directory(&self) -> &str {
        &self.plc_directory
    }

    /// Document URL for a DID.
    ///
    /// - `did:plc:abc` → `{plc_directory}/did:plc:abc`
    /// - `did:web:example.com` → `https://example.com/.well-known/did.json`
    /// - `did:web:example.com:user:alice` → `https://example.com/user/alice/did.json`
    pub fn document_url(&self, did: &str) -> Result<Url, IdentityError> {
        if did.starts_with("did:plc:") {
            let base = self.plc_directory.trim_end_matches('/');
            return Ok(Url::parse(&format!("{base}/{did}"))?);
        }
        let rest = did
            .strip_prefix("did:web:")
            .ok_or_else(|| IdentityError::UnsupportedDidMethod(SmolStr::new(did)))?;
        let mut parts = rest.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| IdentityError::UnsupportedDidMethod(SmolStr::new(did)))?;
        // ports are encoded as %3A in the host segment
        let host = percent_decode_str(host).decode_utf8_lossy();
        let mut url = Url::parse(&format!("https://{host}/"))?;
        let path: Vec<&str> = parts.collect();
        if path.is_empty() {
            url.set_path(".well-known/did.json");
        } else {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| IdentityError::Url(url::ParseError::SetHostOnCannotBeABaseUrl))?;
            for seg in path {
                segments.push(&percent_decode_str(seg).decode_utf8_lossy());
            }
            segments.push("did.json");
        }
        Ok(url)
    }
}

impl<C: HttpClient + Sync> DidResolver for HttpDidResolver<C> {
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self)))]
    async fn resolve_did_doc(&self, did: &str) -> Result<DidDocument, IdentityError> {
        let url = self.document_url(did)?;
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(url.as_str())
            .header(http::header::ACCEPT, "application/did+ld+json, application/json")
            .body(Vec::new())
            .map_err(TransportError::from)?;
        let response = self
            .http
            .send_http(request)
            .await
            .map_err(TransportError::from_client)?;
        if !response.status().is_success() {
            return Err(IdentityError::HttpStatus(response.status()));
        }
        let doc: DidDocument = serde_json::from_slice(response.body())?;
        if doc.id != did {
            return Err(IdentityError::DocIdMismatch {
                expected: SmolStr::new(did),
                found: doc.id,
            });
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Error)]
    #[error("unused")]
    struct Unused;

    struct CannedClient {
        status: u16,
        body: Vec<u8>,
        seen: Mutex<Vec<String>>,
    }

    impl CannedClient {
        fn new(status: u16, body: serde_json::Value) -> Self {
            Self {
                status,
                body: serde_json::to_vec(&body).unwrap(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for CannedClient {
        type Error = Unused;

        async fn send_http(
            &self,
            request: http::Request<Vec<u8>>,
        ) -> Result<http::Response<Vec<u8>>, Unused> {
            self.seen.lock().unwrap().push(request.uri().to_string());
            Ok(http::Response::builder()
                .status(self.status)
                .body(self.body.clone())
                .unwrap())
        }
    }

    #[test]
    fn builds_document_urls() {
        let r = HttpDidResolver::new(());
        assert_eq!(
            r.document_url("did:plc:abc").unwrap().as_str(),
            "https://plc.directory/did:plc:abc"
        );
        assert_eq!(
            r.document_url("did:web:example.com").unwrap().as_str(),
            "https://example.com/.well-known/did.json"
        );
        assert_eq!(
            r.document_url("did:web:example.com:user:alice")
                .unwrap()
                .as_str(),
            "https://example.com/user/alice/did.json"
        );
        assert_eq!(
            r.document_url("did:web:localhost%3A8080").unwrap().as_str(),
            "https://localhost:8080/.well-known/did.json"
        );
        assert!(matches!(
            r.document_url("did:key:z123"),
            Err(IdentityError::UnsupportedDidMethod(_))
        ));
    }

    #[tokio::test]
    async fn resolves_plc_documents() {
        let client = CannedClient::new(
            200,
            json!({
                "id": "did:plc:alice",
                "alsoKnownAs": ["at://alice.test"],
                "service": [{"id": "#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": "https://pds.test"}]
            }),
        );
        let resolver = HttpDidResolver::new(client);
        let doc = resolver.resolve_did_doc("did:plc:alice").await.unwrap();
        assert_eq!(doc.pds_endpoint().unwrap().as_str(), "https://pds.test/");
        assert_eq!(
            resolver.http.seen.lock().unwrap().as_slice(),
            ["https://plc.directory/did:plc:alice"]
        );
    }

    #[tokio::test]
    async fn rejects_mismatched_documents() {
        let resolver = HttpDidResolver::new(CannedClient::new(200, json!({"id": "did:plc:mallory"})));
        let err = resolver.resolve_did_doc("did:plc:alice").await.unwrap_err();
        assert!(matches!(err, IdentityError::DocIdMismatch { .. }));

        let resolver = HttpDidResolver::new(CannedClient::new(404, json!({})));
        let err = resolver.resolve_did_doc("did:plc:alice").await.unwrap_err();
        assert!(matches!(err, IdentityError::HttpStatus(s) if s == StatusCode::NOT_FOUND));
    }
}
