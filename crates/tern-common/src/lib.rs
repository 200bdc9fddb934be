//! Core building blocks for tern: the deterministic CBOR codec, `did:key`
//! cryptography, the session data model, DID documents and the HTTP client
//! seam shared by the other crates.

pub use bytes;
pub use cid;
pub use http;
pub use smol_str;
pub use url;

pub mod cbor;
pub mod did_doc;
pub mod did_key;
pub mod error;
/// HTTP client abstraction used by tern crates.
pub mod http_client;
pub mod identity;
/// Session model, lifecycle events and storage.
pub mod session;

pub use error::{AuthError, ClientError, ClientResult, DecodeError, HttpError, TransportError};
pub use http_client::{HttpClient, TimeoutClient};
pub use session::{CredentialSession, OAuthSession, Session, SessionData, SessionEvent, SessionEvents};

/// Authorization token types for XRPC requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationToken {
    /// Bearer token (access JWT, refresh JWT to refresh the session)
    Bearer(smol_str::SmolStr),
    /// DPoP token (proof-of-possession) for OAuth
    Dpop(smol_str::SmolStr),
}

impl AuthorizationToken {
    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            Self::Bearer(token) => format!("Bearer {token}"),
            Self::Dpop(token) => format!("DPoP {token}"),
        }
    }
}
