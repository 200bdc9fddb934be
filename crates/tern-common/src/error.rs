//! Error types shared by the HTTP-facing parts of tern

use bytes::Bytes;
use smol_str::SmolStr;

use crate::cbor::CodecError;
use crate::identity::IdentityError;

/// Client error type wrapping all possible error conditions
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ClientError {
    /// HTTP transport error
    #[error("HTTP transport error: {0}")]
    Transport(
        #[from]
        #[diagnostic_source]
        TransportError,
    ),

    /// Response deserialization failed
    #[error("{0}")]
    Decode(
        #[from]
        #[diagnostic_source]
        DecodeError,
    ),

    /// HTTP error response
    #[error("HTTP {0}")]
    Http(
        #[from]
        #[diagnostic_source]
        HttpError,
    ),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(
        #[from]
        #[diagnostic_source]
        AuthError,
    ),

    /// DID or handle resolution failed
    #[error("Identity error: {0}")]
    Identity(
        #[from]
        #[diagnostic_source]
        IdentityError,
    ),
}

impl ClientError {
    /// True when the error is an expired or rejected access token.
    pub fn is_token_expired(&self) -> bool {
        match self {
            Self::Auth(AuthError::TokenExpired | AuthError::InvalidToken) => true,
            Self::Http(e) => e.is_token_expired(),
            _ => false,
        }
    }

    /// A copy of this error for every caller that shared one failed
    /// operation. Decode and identity failures keep only their message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Transport(e) => Self::Transport(e.duplicate()),
            Self::Http(e) => Self::Http(e.clone()),
            Self::Auth(e) => Self::Auth(e.clone()),
            other => Self::Transport(TransportError::Other(other.to_string().into())),
        }
    }
}

/// Transport-level errors that occur during HTTP communication
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TransportError {
    /// Failed to establish connection to server
    #[error("Connection error: {0}")]
    Connect(String),

    /// Request timed out
    #[error("Request timeout")]
    #[diagnostic(help("the default request timeout is 30 seconds"))]
    Timeout,

    /// Request construction failed (malformed URI, headers, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other transport error
    #[error("Transport error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Response deserialization errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum DecodeError {
    /// JSON deserialization failed
    #[error("Failed to deserialize JSON: {0}")]
    Json(
        #[from]
        #[source]
        serde_json::Error,
    ),
    /// CBOR decoding failed
    #[error("Failed to decode CBOR: {0}")]
    Cbor(
        #[from]
        #[diagnostic_source]
        CodecError,
    ),
}

/// HTTP error response (non-2xx status)
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
pub struct HttpError {
    /// HTTP status code
    pub status: http::StatusCode,
    /// Response body if available
    pub body: Option<Bytes>,
    /// `WWW-Authenticate` header if the server sent one
    pub www_authenticate: Option<http::HeaderValue>,
}

impl HttpError {
    /// Build from a response, keeping the body and authentication challenge.
    pub fn from_response(response: &http::Response<Vec<u8>>) -> Self {
        Self {
            status: response.status(),
            body: Some(Bytes::copy_from_slice(response.body())),
            www_authenticate: response
                .headers()
                .get(http::header::WWW_AUTHENTICATE)
                .cloned(),
        }
    }

    /// The `error` field of an XRPC error body.
    pub fn error_code(&self) -> Option<SmolStr> {
        let body = self.body.as_ref()?;
        let json: serde_json::Value = serde_json::from_slice(body).ok()?;
        json.get("error")?.as_str().map(SmolStr::new)
    }

    /// `400 ExpiredToken`, or `401` whose body or challenge says `invalid_token`.
    pub fn is_token_expired(&self) -> bool {
        let code = self.error_code();
        match self.status.as_u16() {
            400 => code.as_deref() == Some("ExpiredToken"),
            401 => {
                matches!(code.as_deref(), Some("ExpiredToken" | "invalid_token"))
                    || self
                        .www_authenticate
                        .as_ref()
                        .and_then(|h| h.to_str().ok())
                        .is_some_and(|h| h.contains("error=\"invalid_token\""))
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {}", self.status)?;
        if let Some(body) = &self.body {
            if let Ok(s) = std::str::from_utf8(body) {
                write!(f, ":\n{}", s)?;
            }
        }
        Ok(())
    }
}

/// Result type for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[cfg(feature = "reqwest-client")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_builder() || e.is_request() {
            Self::InvalidRequest(e.to_string())
        } else {
            Self::Other(Box::new(e))
        }
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

impl TransportError {
    /// Wrap an [`HttpClient`](crate::HttpClient) error, unwrapping it when
    /// it already is a `TransportError` so timeouts stay recognisable.
    pub fn from_client<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(e);
        match boxed.downcast::<TransportError>() {
            Ok(inner) => *inner,
            Err(other) => Self::Other(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// A copy of this error; `Other` keeps only its message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Connect(msg) => Self::Connect(msg.clone()),
            Self::Timeout => Self::Timeout,
            Self::InvalidRequest(msg) => Self::InvalidRequest(msg.clone()),
            Self::Other(e) => Self::Other(e.to_string().into()),
        }
    }
}

/// Authentication and authorization errors
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
pub enum AuthError {
    /// Access token has expired (use refresh token to get a new one)
    #[error("Access token expired")]
    TokenExpired,

    /// Access token is invalid or malformed
    #[error("Invalid access token")]
    InvalidToken,

    /// Token refresh request failed
    #[error("Token refresh failed with HTTP {status}")]
    RefreshFailed {
        /// Status of the refresh response, 0 if none was received
        status: u16,
        /// Raw response body
        body: Option<Bytes>,
    },

    /// The server reported that the refresh token had already been used
    #[error("Refresh token was replayed (HTTP {status})")]
    #[diagnostic(
        code(tern::auth::refresh_replayed),
        help("the session is burned; sign in again to obtain a fresh refresh token")
    )]
    RefreshReplayed {
        /// Status of the refresh response
        status: u16,
        /// Raw response body
        body: Option<Bytes>,
    },

    /// The session cannot be recovered without a new login
    #[error("Re-authentication required")]
    #[diagnostic(code(tern::auth::reauthenticate))]
    ReauthenticationRequired,

    /// Request requires authentication but none was provided
    #[error("No authentication provided, but endpoint requires auth")]
    NotAuthenticated,

    /// Other authentication error
    #[error("Authentication error: {0:?}")]
    Other(http::HeaderValue),
}
