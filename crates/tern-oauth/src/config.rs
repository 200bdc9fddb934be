use std::time::Duration;

use smol_str::SmolStr;
use tern_common::http_client::DEFAULT_TIMEOUT;

use crate::client_auth::ClientAuth;
use crate::dpop::DpopKey;

/// Client-side OAuth settings shared by every session of one application.
///
/// ```
/// use tern_oauth::{DpopKey, OAuthConfig};
///
/// let config = OAuthConfig::new("https://app.example/client-metadata.json", DpopKey::generate())
///     .build();
/// assert_eq!(config.timeout.as_secs(), 30);
/// ```
#[derive(Debug, Clone, bon::Builder)]
#[builder(start_fn = new)]
pub struct OAuthConfig {
    /// The client metadata URL registered with the authorization server
    #[builder(start_fn, into)]
    pub client_id: SmolStr,
    /// Key the access tokens are bound to
    #[builder(start_fn)]
    pub dpop_key: DpopKey,
    #[builder(default)]
    pub client_auth: ClientAuth,
    /// Deadline for each token endpoint or metadata request
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
}
