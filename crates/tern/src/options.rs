use std::time::Duration;

use smol_str::SmolStr;
use tern_common::http_client::DEFAULT_TIMEOUT;
use tern_common::identity::DEFAULT_PLC_DIRECTORY;

/// `User-Agent` sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = concat!("tern/", env!("CARGO_PKG_VERSION"));

/// Settings shared by both agent variants.
///
/// ```
/// use std::time::Duration;
/// use tern::AgentOptions;
///
/// let options = AgentOptions::new().timeout(Duration::from_secs(10)).build();
/// assert_eq!(options.plc_directory, "https://plc.directory");
/// assert!(options.follow_pds_moves);
/// ```
#[derive(Debug, Clone, bon::Builder)]
#[builder(start_fn = new)]
pub struct AgentOptions {
    /// Deadline for every outbound request
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
    #[builder(into, default = SmolStr::new_static(DEFAULT_USER_AGENT))]
    pub user_agent: SmolStr,
    /// Directory used to resolve `did:plc` documents
    #[builder(into, default = SmolStr::new_static(DEFAULT_PLC_DIRECTORY))]
    pub plc_directory: SmolStr,
    /// Re-resolve the DID document after each OAuth refresh and switch to
    /// the PDS it names.
    #[builder(default = true)]
    pub follow_pds_moves: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self::new().build()
    }
}
