use bytes::Bytes;
use http::header::InvalidHeaderValue;
use jose_jwk::crypto;
use miette::Diagnostic;
use smol_str::SmolStr;
use tern_common::error::{AuthError, ClientError, TransportError};
use thiserror::Error;

/// Failures while building or sending a DPoP-bound request.
#[derive(Error, Debug, Diagnostic)]
pub enum DpopError {
    #[error(transparent)]
    #[diagnostic(code(tern_oauth::dpop::header))]
    InvalidHeaderValue(#[from] InvalidHeaderValue),

    #[error("crypto error: {0:?}")]
    #[diagnostic(code(tern_oauth::dpop::crypto))]
    JwkCrypto(crypto::Error),

    /// Only P-256 secret keys can sign DPoP proofs
    #[error("key does not match any alg supported by the server")]
    #[diagnostic(
        code(tern_oauth::dpop::unsupported_key),
        help("DPoP keys must be P-256 (ES256) secret keys")
    )]
    UnsupportedKey,

    #[error(transparent)]
    #[diagnostic(code(tern_oauth::dpop::serde))]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

/// Failures discovering authorization server metadata.
#[derive(Error, Debug, Diagnostic)]
pub enum MetadataError {
    #[error("invalid issuer URL: {0}")]
    #[diagnostic(code(tern_oauth::metadata::url))]
    Url(#[from] url::ParseError),

    #[error("authorization server metadata returned HTTP {0}")]
    #[diagnostic(
        code(tern_oauth::metadata::http_status),
        help("check well-known paths and server configuration")
    )]
    HttpStatus(http::StatusCode),

    #[error("issuer mismatch: expected {expected}, got {found}")]
    #[diagnostic(
        code(tern_oauth::metadata::issuer_mismatch),
        help("the metadata document must describe the issuer it was fetched from")
    )]
    IssuerMismatch { expected: SmolStr, found: SmolStr },

    #[error(transparent)]
    #[diagnostic(code(tern_oauth::metadata::serde))]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

/// Failures of the refresh protocol.
#[derive(Error, Debug, Diagnostic)]
pub enum RefreshError {
    /// The session holds no refresh token, or it is hidden by an
    /// in-flight refresh
    #[error("no refresh token available")]
    #[diagnostic(
        code(tern_oauth::refresh::no_refresh_token),
        help("sign in again to obtain a refresh token")
    )]
    NoRefreshToken,

    /// The session has no `iss`, so there is no token endpoint to call
    #[error("session has no issuer")]
    #[diagnostic(code(tern_oauth::refresh::no_issuer))]
    NoIssuer,

    /// The authorization server reported that this refresh token was
    /// already used. Terminal: the token is never sent again.
    #[error("refresh token was replayed (HTTP {status})")]
    #[diagnostic(
        code(tern_oauth::refresh::replayed),
        help("the token chain is broken; the user must sign in again")
    )]
    Replayed { status: u16, body: Bytes },

    /// The token endpoint rejected the refresh
    #[error("token endpoint returned HTTP {status}{}", .error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    #[diagnostic(code(tern_oauth::refresh::rejected))]
    Rejected {
        status: u16,
        error: Option<SmolStr>,
        body: Bytes,
    },

    /// The configured client authentication method is not offered by the server
    #[error("token endpoint does not support client authentication method {0}")]
    #[diagnostic(code(tern_oauth::refresh::unsupported_auth_method))]
    UnsupportedAuthMethod(SmolStr),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dpop(#[from] DpopError),

    #[error("failed to encode token request: {0}")]
    #[diagnostic(code(tern_oauth::refresh::form))]
    Form(#[from] serde_html_form::ser::Error),

    #[error("invalid token response: {0}")]
    #[diagnostic(code(tern_oauth::refresh::decode))]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

impl RefreshError {
    /// True when the refresh token must not be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Replayed { .. } | Self::NoRefreshToken)
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout(),
            Self::Dpop(DpopError::Transport(e)) => e.is_timeout(),
            Self::Metadata(MetadataError::Transport(e)) => e.is_timeout(),
            _ => false,
        }
    }

    /// A copy handed to callers that waited on the same refresh attempt.
    /// Errors that carry a source are flattened to their message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::NoRefreshToken => Self::NoRefreshToken,
            Self::NoIssuer => Self::NoIssuer,
            Self::Replayed { status, body } => Self::Replayed {
                status: *status,
                body: body.clone(),
            },
            Self::Rejected {
                status,
                error,
                body,
            } => Self::Rejected {
                status: *status,
                error: error.clone(),
                body: body.clone(),
            },
            Self::UnsupportedAuthMethod(m) => Self::UnsupportedAuthMethod(m.clone()),
            Self::Transport(e)
            | Self::Dpop(DpopError::Transport(e))
            | Self::Metadata(MetadataError::Transport(e)) => Self::Transport(e.duplicate()),
            other => Self::Transport(TransportError::Other(other.to_string().into())),
        }
    }
}

impl From<RefreshError> for ClientError {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::Replayed { status, body } => AuthError::RefreshReplayed {
                status,
                body: Some(body),
            }
            .into(),
            RefreshError::Rejected { status, body, .. } => AuthError::RefreshFailed {
                status,
                body: Some(body),
            }
            .into(),
            RefreshError::NoRefreshToken | RefreshError::NoIssuer => {
                AuthError::ReauthenticationRequired.into()
            }
            RefreshError::Transport(e)
            | RefreshError::Dpop(DpopError::Transport(e))
            | RefreshError::Metadata(MetadataError::Transport(e)) => e.into(),
            other => TransportError::Other(Box::new(other)).into(),
        }
    }
}

impl From<DpopError> for ClientError {
    fn from(e: DpopError) -> Self {
        match e {
            DpopError::Transport(e) => e.into(),
            DpopError::InvalidHeaderValue(e) => TransportError::InvalidRequest(e.to_string()).into(),
            other => TransportError::Other(Box::new(other)).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_maps_to_auth_error() {
        let err: ClientError = RefreshError::Replayed {
            status: 400,
            body: Bytes::from_static(br#"{"error":"invalid_grant"}"#),
        }
        .into();
        assert!(matches!(
            err,
            ClientError::Auth(AuthError::RefreshReplayed { status: 400, .. })
        ));
    }

    #[test]
    fn timeouts_are_recognised_through_layers() {
        assert!(RefreshError::Dpop(DpopError::Transport(TransportError::Timeout)).is_timeout());
        assert!(!RefreshError::NoIssuer.is_timeout());
        let err: ClientError = RefreshError::Transport(TransportError::Timeout).into();
        assert!(matches!(err, ClientError::Transport(TransportError::Timeout)));
    }

    #[test]
    fn duplicate_keeps_what_callers_match_on() {
        let timeout = RefreshError::Dpop(DpopError::Transport(TransportError::Timeout));
        assert!(timeout.duplicate().is_timeout());

        let rejected = RefreshError::Rejected {
            status: 400,
            error: Some("invalid_grant".into()),
            body: Bytes::from_static(b"{}"),
        };
        assert!(matches!(
            rejected.duplicate(),
            RefreshError::Rejected { status: 400, error: Some(e), .. } if e == "invalid_grant"
        ));

        let decode = RefreshError::Decode(serde_json::from_slice::<u8>(b"x").unwrap_err());
        assert_eq!(decode.duplicate().to_string(), format!("Transport error: {decode}"));
    }
}
