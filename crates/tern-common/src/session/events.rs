use bytes::Bytes;
use smol_str::SmolStr;
use tokio::sync::broadcast;

use super::SessionData;

/// Which server handed out a DPoP nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceOrigin {
    /// The OAuth authorization server (token endpoint)
    AuthorizationServer,
    /// The PDS serving resource requests
    ResourceServer,
}

/// Lifecycle notifications published by an agent.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new DPoP nonce was received and stored
    NonceReceived {
        nonce: SmolStr,
        origin: NonceOrigin,
    },
    /// A refresh began; the snapshot has no refresh token
    RefreshStarted { snapshot: SessionData },
    /// The session changed (login, refresh, PDS move)
    Updated { session: SessionData },
    /// The authorization server reported that the refresh token was reused
    RefreshTokenReplayed { status: u16, body: Bytes },
}

/// Broadcast channel for [`SessionEvent`]s, owned by the publishing agent.
///
/// Emitting never blocks and never fails; events sent while nobody is
/// subscribed are dropped. Slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // Err only means there are no receivers
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
