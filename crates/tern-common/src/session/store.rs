//! Persistence of sessions between runs.
//!
//! Stores hold the raw [`SessionData`] of each account, keyed by DID, so
//! one store serves credential and OAuth agents alike; the agent turns the
//! data back into its own session type with [`Session::from_data`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::{Map, Value};
use smol_str::SmolStr;
use tokio::sync::{Mutex, RwLock};

use super::{Session, SessionData};

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum SessionStoreError {
    #[error("session file I/O failed: {0}")]
    #[diagnostic(code(tern_common::session_store::io))]
    Io(#[from] std::io::Error),

    #[error("session file is not valid JSON: {0}")]
    #[diagnostic(code(tern_common::session_store::json))]
    Json(#[from] serde_json::Error),

    /// The file parsed, but is not an object of DID -> session objects
    #[error("{path} does not hold a map of sessions")]
    #[diagnostic(
        code(tern_common::session_store::layout),
        help("delete the file to start over; it is recreated on the next login")
    )]
    Layout { path: PathBuf },
}

/// Where agents keep their sessions, keyed by DID.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, did: &str) -> Result<Option<SessionData>, SessionStoreError>;

    async fn save(&self, did: &str, data: &SessionData) -> Result<(), SessionStoreError>;

    async fn remove(&self, did: &str) -> Result<(), SessionStoreError>;
}

/// Typed access over any [`SessionStore`].
#[async_trait]
pub trait SessionStoreExt: SessionStore {
    async fn load_session<S: Session>(&self, did: &str) -> Result<Option<S>, SessionStoreError> {
        Ok(self.load(did).await?.map(S::from_data))
    }

    /// Save under the session's own DID; sessions without one are skipped.
    async fn save_session<S: Session>(&self, session: &S) -> Result<(), SessionStoreError> {
        match session.did() {
            Some(did) => self.save(did, session.data()).await,
            None => Ok(()),
        }
    }
}

impl<T: SessionStore + ?Sized> SessionStoreExt for T {}

/// Sessions kept for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore(Arc<RwLock<HashMap<SmolStr, SessionData>>>);

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, did: &str) -> Result<Option<SessionData>, SessionStoreError> {
        Ok(self.0.read().await.get(did).cloned())
    }

    async fn save(&self, did: &str, data: &SessionData) -> Result<(), SessionStoreError> {
        self.0.write().await.insert(did.into(), data.clone());
        Ok(())
    }

    async fn remove(&self, did: &str) -> Result<(), SessionStoreError> {
        self.0.write().await.remove(did);
        Ok(())
    }
}

/// Sessions in one pretty-printed JSON file, `{ "<did>": { ...session } }`.
///
/// Tokens are written in clear text; only suitable for development.
///
/// ```no_run
/// # async fn demo() -> Result<(), tern_common::session::SessionStoreError> {
/// use tern_common::session::{CredentialSession, FileSessionStore, SessionStoreExt};
/// let store = FileSessionStore::new("/tmp/tern-sessions.json");
/// let session: Option<CredentialSession> = store.load_session("did:plc:alice").await?;
/// # Ok(()) }
/// ```
#[derive(Clone, Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileSessionStore {
    /// Store at `path`. The file is created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>, SessionStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        match serde_json::from_slice(&bytes)? {
            Value::Object(map) if map.values().all(Value::is_object) => Ok(map),
            _ => Err(SessionStoreError::Layout {
                path: self.path.clone(),
            }),
        }
    }

    async fn write_all(&self, map: &Map<String, Value>) -> Result<(), SessionStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(map)?).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, did: &str) -> Result<Option<SessionData>, SessionStoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        Ok(match map.remove(did) {
            Some(Value::Object(entry)) => Some(SessionData::from_map(entry)),
            _ => None,
        })
    }

    async fn save(&self, did: &str, data: &SessionData) -> Result<(), SessionStoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        map.insert(did.to_string(), Value::Object(data.as_map().clone()));
        self.write_all(&map).await
    }

    async fn remove(&self, did: &str) -> Result<(), SessionStoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        if map.remove(did).is_some() {
            self.write_all(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CredentialSession, OAuthSession};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("tern-store-{}-{name}", std::process::id()))
            .join("sessions.json")
    }

    #[tokio::test]
    async fn memory_store_holds_both_session_kinds() {
        let store = MemorySessionStore::new();
        let mut oauth = OAuthSession::default();
        oauth.put("did", "did:plc:alice").set_tokens("at", Some("rt"), 3600, 1);
        let mut cred = CredentialSession::default();
        cred.put("did", "did:plc:bob").set_tokens("jwt", Some("rjwt"), 7200, 1);

        store.save_session(&oauth).await.unwrap();
        store.save_session(&cred).await.unwrap();

        let back: Option<OAuthSession> = store.load_session("did:plc:alice").await.unwrap();
        assert_eq!(back, Some(oauth));
        let back: Option<CredentialSession> = store.load_session("did:plc:bob").await.unwrap();
        assert_eq!(back.unwrap().token(), Some("jwt"));

        store.remove("did:plc:alice").await.unwrap();
        assert!(store.load("did:plc:alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_without_did_are_not_saved() {
        let store = MemorySessionStore::new();
        store
            .save_session(&CredentialSession::default())
            .await
            .unwrap();
        assert!(store.0.read().await.is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_flat_json() {
        let path = temp_path("flat");
        let _ = tokio::fs::remove_file(&path).await;
        let store = FileSessionStore::new(&path);

        assert!(store.load("did:plc:bob").await.unwrap().is_none());

        let mut s = CredentialSession::default();
        s.put("did", "did:plc:bob").set_tokens("a", Some("r"), 7200, 1);
        store.save_session(&s).await.unwrap();

        let raw: Value = serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(raw["did:plc:bob"]["accessJwt"], "a");

        let again = FileSessionStore::new(&path);
        let back: Option<CredentialSession> = again.load_session("did:plc:bob").await.unwrap();
        assert_eq!(back, Some(s));

        again.remove("did:plc:bob").await.unwrap();
        assert!(again.load("did:plc:bob").await.unwrap().is_none());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn unexpected_file_layout_is_reported() {
        let path = temp_path("layout");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, br#"{"did:plc:bob": "not a session"}"#)
            .await
            .unwrap();
        let store = FileSessionStore::new(&path);

        let err = store.load("did:plc:bob").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::Layout { .. }));
        let _ = tokio::fs::remove_file(&path).await;
    }
}
