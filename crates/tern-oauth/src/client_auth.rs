//! Client authentication at the token endpoint.

use std::fmt;

use chrono::Utc;
use jose_jwa::{Algorithm, Signing};
use p256::ecdsa::SigningKey;
use smol_str::SmolStr;

use crate::dpop::generate_jti;
use crate::error::DpopError;
use crate::jose::{
    create_signed_jwt,
    jws::RegisteredHeader,
    jwt::{Claims, RegisteredClaims, RegisteredClaimsAud},
};

pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a client assertion in seconds.
pub const CLIENT_ASSERTION_LIFETIME: i64 = 60;

/// How the client proves its identity to the authorization server.
#[derive(Clone, Default)]
pub enum ClientAuth {
    /// Public client: only `client_id` is sent
    #[default]
    None,
    /// Confidential client signing ES256 assertions with a key published in
    /// its JWKS
    PrivateKeyJwt { key: SigningKey, kid: Option<SmolStr> },
}

impl ClientAuth {
    pub fn private_key_jwt(key: SigningKey, kid: Option<impl Into<SmolStr>>) -> Self {
        Self::PrivateKeyJwt {
            key,
            kid: kid.map(Into::into),
        }
    }

    /// `token_endpoint_auth_method` name.
    pub fn method(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PrivateKeyJwt { .. } => "private_key_jwt",
        }
    }

    /// Credentials to merge into a token endpoint request for `issuer`.
    pub fn credentials(&self, client_id: &str, issuer: &str) -> Result<ClientCredentials, DpopError> {
        match self {
            Self::None => Ok(ClientCredentials::new_id(client_id)),
            Self::PrivateKeyJwt { key, kid } => {
                let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
                header.kid = kid.clone();
                let iat = Utc::now().timestamp();
                // https://datatracker.ietf.org/doc/html/rfc7523#section-3
                let claims = RegisteredClaims {
                    iss: Some(client_id.into()),
                    sub: Some(client_id.into()),
                    aud: Some(RegisteredClaimsAud::Single(issuer.into())),
                    exp: Some(iat + CLIENT_ASSERTION_LIFETIME),
                    iat: Some(iat),
                    jti: Some(generate_jti()),
                };
                Ok(ClientCredentials {
                    client_id: client_id.into(),
                    assertion_type: Some(CLIENT_ASSERTION_TYPE_JWT_BEARER.into()),
                    assertion: Some(create_signed_jwt(key, &header, &Claims::from(claims))?),
                })
            }
        }
    }
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::PrivateKeyJwt { kid, .. } => f
                .debug_struct("PrivateKeyJwt")
                .field("kid", kid)
                .finish_non_exhaustive(),
        }
    }
}

/// `client_id` plus an optional signed assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: SmolStr,
    pub assertion_type: Option<SmolStr>,
    pub assertion: Option<SmolStr>,
}

impl ClientCredentials {
    pub fn new_id(client_id: impl Into<SmolStr>) -> Self {
        Self {
            client_id: client_id.into(),
            assertion_type: None,
            assertion: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::decode_claims;

    #[test]
    fn public_clients_send_only_their_id() {
        let creds = ClientAuth::None
            .credentials("https://app.test/client.json", "https://as.test")
            .unwrap();
        assert_eq!(creds, ClientCredentials::new_id("https://app.test/client.json"));
    }

    #[test]
    fn private_key_jwt_assertion_claims() {
        let auth = ClientAuth::private_key_jwt(
            SigningKey::random(&mut rand_core::OsRng),
            Some("key-1"),
        );
        assert_eq!(auth.method(), "private_key_jwt");
        let creds = auth
            .credentials("https://app.test/client.json", "https://as.test")
            .unwrap();
        assert_eq!(
            creds.assertion_type.as_deref(),
            Some(CLIENT_ASSERTION_TYPE_JWT_BEARER)
        );
        let claims = decode_claims(creds.assertion.as_deref().unwrap()).unwrap();
        let r = claims.registered;
        assert_eq!(r.iss.as_deref(), Some("https://app.test/client.json"));
        assert_eq!(r.sub, r.iss);
        assert_eq!(
            r.aud,
            Some(RegisteredClaimsAud::Single("https://as.test".into()))
        );
        assert_eq!(r.exp.unwrap() - r.iat.unwrap(), CLIENT_ASSERTION_LIFETIME);
        assert!(r.jti.is_some());
        assert!(!format!("{auth:?}").contains("SigningKey"));
    }
}
