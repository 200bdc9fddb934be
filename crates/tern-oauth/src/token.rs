//! Token endpoint request and response bodies.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    DPoP,
    Bearer,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::DPoP => "DPoP",
            TokenType::Bearer => "Bearer",
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-5.1
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: SmolStr,
    pub token_type: TokenType,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<SmolStr>,
    pub scope: Option<SmolStr>,
    // atproto extension: the account DID the tokens belong to
    pub sub: Option<SmolStr>,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-5.2
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenErrorResponse {
    pub error: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<SmolStr>,
}

impl TokenErrorResponse {
    /// `invalid_grant` for a refresh token the server has already rotated.
    pub fn is_refresh_replay(&self) -> bool {
        if self.error != "invalid_grant" {
            return false;
        }
        let Some(description) = &self.error_description else {
            return false;
        };
        let description = description.to_ascii_lowercase();
        ["replayed", "already used", "already been used", "reused"]
            .iter()
            .any(|needle| description.contains(needle))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    RefreshToken,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequestParameters {
    pub grant_type: TokenGrantType,
    pub refresh_token: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
}

/// Form body sent to the token endpoint: client authentication followed by
/// the grant parameters.
#[derive(Serialize, Debug)]
pub struct RequestPayload<T: Serialize> {
    pub client_id: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_assertion_type: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_assertion: Option<SmolStr>,
    #[serde(flatten)]
    pub parameters: T,
}
