//! OAuth plumbing for AT Protocol sessions: DPoP proofs and the nonce
//! handshake, token endpoint types, authorization server discovery and the
//! single-flight refresh protocol.
//!
//! Sessions are created by an external authorization step; this crate only
//! keeps them alive.

pub mod client_auth;
pub mod config;
pub mod dpop;
pub mod error;
pub mod jose;
pub mod metadata;
pub mod refresh;
pub mod token;

pub use client_auth::ClientAuth;
pub use config::OAuthConfig;
pub use dpop::DpopKey;
pub use error::{DpopError, MetadataError, RefreshError};
pub use refresh::{RefreshState, SessionRefresher};

/// Algorithm used for DPoP proofs and client assertions.
pub const FALLBACK_ALG: &str = "ES256";
