use smol_str::SmolStr;
use tern_common::error::ClientResult;
use tern_common::http_client::HttpClient;
use tern_common::session::{Session, SessionData, SessionEvents};

use crate::credential::CredentialAgent;
use crate::oauth::OAuthAgent;
use crate::request::RequestBuilder;

/// An authenticated account, signed in with an app password or OAuth.
///
/// Both variants expose the same capability: build requests that carry
/// the account's credentials, read the current tokens and refresh them.
pub enum Agent<C> {
    Credential(CredentialAgent<C>),
    OAuth(OAuthAgent<C>),
}

impl<C> From<CredentialAgent<C>> for Agent<C> {
    fn from(agent: CredentialAgent<C>) -> Self {
        Self::Credential(agent)
    }
}

impl<C> From<OAuthAgent<C>> for Agent<C> {
    fn from(agent: OAuthAgent<C>) -> Self {
        Self::OAuth(agent)
    }
}

impl<C> Agent<C> {
    pub fn events(&self) -> &SessionEvents {
        match self {
            Self::Credential(agent) => agent.events(),
            Self::OAuth(agent) => agent.events(),
        }
    }

    /// The account's DID.
    pub async fn did(&self) -> Option<SmolStr> {
        match self {
            Self::Credential(agent) => agent.did().await,
            Self::OAuth(agent) => agent.did().await,
        }
    }

    /// The current access token, without checking its expiry.
    pub async fn token(&self) -> Option<SmolStr> {
        match self {
            Self::Credential(agent) => agent.token().await,
            Self::OAuth(agent) => agent.token().await,
        }
    }

    /// The current refresh token.
    pub async fn refresh(&self) -> Option<SmolStr> {
        match self {
            Self::Credential(agent) => agent.refresh().await,
            Self::OAuth(agent) => agent.refresh().await,
        }
    }

    pub async fn token_expired(&self) -> bool {
        match self {
            Self::Credential(agent) => agent.token_expired().await,
            Self::OAuth(agent) => agent.token_expired().await,
        }
    }

    /// Raw snapshot of the session, for persistence or inspection.
    pub async fn session_data(&self) -> SessionData {
        match self {
            Self::Credential(agent) => agent.session().await.data().clone(),
            Self::OAuth(agent) => agent.session().await.data().clone(),
        }
    }
}

impl<C: HttpClient + Sync> Agent<C> {
    /// Start a request; `require_auth` attaches the account's credentials.
    pub fn http(&self, require_auth: bool) -> RequestBuilder<'_, C> {
        match self {
            Self::Credential(agent) => agent.http(require_auth),
            Self::OAuth(agent) => agent.http(require_auth),
        }
    }

    /// Exchange the refresh token for a new access token, returning it.
    ///
    /// A no-op returning the current token if a concurrent caller already
    /// refreshed.
    pub async fn refresh_token(&self) -> ClientResult<SmolStr> {
        match self {
            Self::Credential(agent) => agent.refresh_token().await,
            Self::OAuth(agent) => agent.refresh_token().await,
        }
    }
}
