//! Session data model, events and storage.
//!
//! A session is a flat JSON object. Credential (app password) and OAuth
//! sessions share the same storage and accessors; they differ only in the
//! names of their token fields, exposed through [`Session::TOKEN`] and
//! [`Session::REFRESH`].
//!
//! ```
//! use tern_common::session::{CredentialSession, Session};
//!
//! let mut session = CredentialSession::default();
//! session
//!     .put("did", "did:plc:alice")
//!     .set_tokens("access", Some("refresh"), 3600, 1_700_000_000);
//! assert_eq!(session.token(), Some("access"));
//! assert!(!session.is_expired_at(1_700_000_100));
//! assert!(session.is_expired_at(1_700_003_700));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::did_doc::DidDocument;

mod events;
mod store;

pub use events::{NonceOrigin, SessionEvent, SessionEvents};
pub use store::{
    FileSessionStore, MemorySessionStore, SessionStore, SessionStoreError, SessionStoreExt,
};

/// Well-known session keys.
pub mod keys {
    pub const DID: &str = "did";
    pub const HANDLE: &str = "handle";
    pub const ACCESS_JWT: &str = "accessJwt";
    pub const REFRESH_JWT: &str = "refreshJwt";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const TOKEN_CREATED_AT: &str = "token_created_at";
    pub const EXPIRES_IN: &str = "expires_in";
    pub const ISSUER: &str = "iss";
    pub const DPOP_NONCE: &str = "dpop_nonce";
    pub const DPOP_PDS_NONCE: &str = "dpop_pds_nonce";
    pub const PDS: &str = "pds";
    pub const SCOPE: &str = "scope";
    pub const TOKEN_TYPE: &str = "token_type";
    pub const DID_DOC: &str = "didDoc";
}

/// Raw key/value storage behind every session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionData(Map<String, Value>);

impl SessionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for SessionData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn as_unix_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp())
            .ok()
            .or_else(|| s.parse().ok()),
        _ => None,
    }
}

/// Accessor contract shared by credential and OAuth sessions.
pub trait Session: Clone + Default + Send + Sync + 'static {
    /// Key holding the access token.
    const TOKEN: &'static str;
    /// Key holding the refresh token.
    const REFRESH: &'static str;

    fn data(&self) -> &SessionData;
    fn data_mut(&mut self) -> &mut SessionData;
    fn from_data(data: SessionData) -> Self;

    fn get(&self, key: &str) -> Option<&Value> {
        self.data().get(key)
    }

    /// Value for `key`, or `default` when absent.
    fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn put(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.data_mut().insert(key, value);
        self
    }

    /// Overwrite every key present in `partial`.
    fn merge(&mut self, partial: Map<String, Value>) -> &mut Self {
        for (k, v) in partial {
            self.data_mut().insert(k, v);
        }
        self
    }

    fn forget(&mut self, key: &str) -> Option<Value> {
        self.data_mut().remove(key)
    }

    fn did(&self) -> Option<&str> {
        self.get_str(keys::DID)
    }

    fn handle(&self) -> Option<&str> {
        self.get_str(keys::HANDLE)
    }

    fn token(&self) -> Option<&str> {
        self.get_str(Self::TOKEN)
    }

    fn refresh(&self) -> Option<&str> {
        self.get_str(Self::REFRESH)
    }

    fn issuer(&self) -> Option<&str> {
        self.get_str(keys::ISSUER)
    }

    fn pds(&self) -> Option<&str> {
        self.get_str(keys::PDS)
    }

    fn scope(&self) -> Option<&str> {
        self.get_str(keys::SCOPE)
    }

    /// Authorization-server DPoP nonce.
    fn dpop_nonce(&self) -> Option<&str> {
        self.get_str(keys::DPOP_NONCE)
    }

    /// Resource-server (PDS) DPoP nonce.
    fn dpop_pds_nonce(&self) -> Option<&str> {
        self.get_str(keys::DPOP_PDS_NONCE)
    }

    /// Unix seconds at which the current access token was issued.
    fn token_created_at(&self) -> Option<i64> {
        self.get(keys::TOKEN_CREATED_AT).and_then(as_unix_seconds)
    }

    /// Lifetime of the current access token in seconds.
    fn expires_in(&self) -> Option<i64> {
        self.get(keys::EXPIRES_IN).and_then(as_unix_seconds)
    }

    fn expires_at(&self) -> Option<i64> {
        Some(self.token_created_at()? + self.expires_in()?)
    }

    /// True when expiry data is missing or `now >= token_created_at + expires_in`.
    fn is_expired_at(&self, now: i64) -> bool {
        match self.expires_at() {
            Some(at) => now >= at,
            None => true,
        }
    }

    fn token_expired(&self) -> bool {
        self.is_expired_at(now_unix())
    }

    fn did_doc(&self) -> Option<DidDocument> {
        self.get(keys::DID_DOC)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The single write path for tokens: access, refresh and expiry together.
    fn set_tokens(
        &mut self,
        access: &str,
        refresh: Option<&str>,
        expires_in: i64,
        created_at: i64,
    ) -> &mut Self {
        let data = self.data_mut();
        data.insert(Self::TOKEN, access);
        if let Some(refresh) = refresh {
            data.insert(Self::REFRESH, refresh);
        }
        data.insert(keys::EXPIRES_IN, expires_in);
        data.insert(keys::TOKEN_CREATED_AT, created_at);
        self
    }

    /// Copy of the session with the refresh token removed.
    fn without_refresh(&self) -> Self {
        let mut copy = self.clone();
        copy.forget(Self::REFRESH);
        copy
    }
}

/// App-password session (`accessJwt` / `refreshJwt`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialSession(SessionData);

impl Session for CredentialSession {
    const TOKEN: &'static str = keys::ACCESS_JWT;
    const REFRESH: &'static str = keys::REFRESH_JWT;

    fn data(&self) -> &SessionData {
        &self.0
    }

    fn data_mut(&mut self) -> &mut SessionData {
        &mut self.0
    }

    fn from_data(data: SessionData) -> Self {
        Self(data)
    }
}

/// OAuth session (`access_token` / `refresh_token`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OAuthSession(SessionData);

impl Session for OAuthSession {
    const TOKEN: &'static str = keys::ACCESS_TOKEN;
    const REFRESH: &'static str = keys::REFRESH_TOKEN;

    fn data(&self) -> &SessionData {
        &self.0
    }

    fn data_mut(&mut self) -> &mut SessionData {
        &mut self.0
    }

    fn from_data(data: SessionData) -> Self {
        Self(data)
    }
}
