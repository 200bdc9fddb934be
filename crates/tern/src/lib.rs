//! # tern
//!
//! AT Protocol client sessions and event streams.
//!
//! An [`Agent`] signs requests for one account. [`CredentialAgent`] logs in
//! with an app password and uses bearer tokens; [`OAuthAgent`] takes an
//! OAuth session obtained elsewhere and uses DPoP-bound tokens. Either way,
//! expired tokens are refreshed before a request is sent, one refresh at a
//! time, and a request the server rejects as expired is retried once.
//!
//! ```no_run
//! # async fn example<C: tern::HttpClient + Sync>(http: C) -> tern::ClientResult<()> {
//! use tern::{AgentOptions, CredentialAgent};
//!
//! let agent = CredentialAgent::new(http, AgentOptions::default());
//! let pds = url::Url::parse("https://bsky.social").unwrap();
//! agent.login(&pds, "alice.bsky.social", "app-password").await?;
//!
//! let timeline: serde_json::Value = agent
//!     .http(true)
//!     .query("app.bsky.feed.getTimeline")
//!     .param("limit", 10)
//!     .send_json()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! The lower layers are re-exported: [`common`] (CBOR, `did:key`, the
//! session model), [`tern_oauth`] (DPoP and refresh) and, with the
//! `streaming` feature, [`stream`] (Jetstream and Firehose consumers).

pub mod agent;
pub mod credential;
pub mod oauth;
pub mod options;
pub mod request;

pub use agent::Agent;
pub use credential::{CredentialAgent, CredentialStore};
pub use oauth::{OAuthAgent, OAuthStore};
pub use options::AgentOptions;
pub use request::RequestBuilder;

pub use tern_common as common;
pub use tern_common::error::{AuthError, ClientError, ClientResult, HttpError, TransportError};
pub use tern_common::http_client::HttpClient;
pub use tern_common::session::{
    CredentialSession, OAuthSession, Session, SessionEvent, SessionEvents,
};
pub use tern_oauth::{DpopKey, OAuthConfig};
pub use tern_oauth;

#[cfg(feature = "streaming")]
pub use tern_stream as stream;
