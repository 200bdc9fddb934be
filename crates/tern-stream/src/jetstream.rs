//! Jetstream subscription support
//!
//! Jetstream is a simplified JSON-based alternative to the atproto firehose.
//! Filtering happens on the server: the wanted collections and DIDs are sent
//! as query parameters when connecting and can be changed later with an
//! `options_update` message.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

use crate::error::StreamError;
use crate::websocket::{WsMessage, WsText};

/// Public Jetstream instances, or a self-hosted one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JetstreamHost {
    #[default]
    UsEast1,
    UsEast2,
    UsWest1,
    UsWest2,
    /// Full websocket URL; `/subscribe` is appended when the path is empty
    Custom(Url),
}

impl JetstreamHost {
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Self::UsEast1 => Some("jetstream1.us-east.bsky.network"),
            Self::UsEast2 => Some("jetstream2.us-east.bsky.network"),
            Self::UsWest1 => Some("jetstream1.us-west.bsky.network"),
            Self::UsWest2 => Some("jetstream2.us-west.bsky.network"),
            Self::Custom(url) => url.host_str(),
        }
    }

    /// Subscription endpoint, without query parameters.
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        let mut url = match self {
            Self::Custom(url) => url.clone(),
            public => {
                let host = public.hostname().unwrap_or_default();
                Url::parse(&format!("wss://{host}"))?
            }
        };
        if matches!(url.path(), "" | "/") {
            url.set_path("/subscribe");
        }
        url.set_query(None);
        Ok(url)
    }
}

/// Parameters for subscribing to Jetstream
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, bon::Builder)]
#[serde(rename_all = "camelCase")]
#[builder(start_fn = new)]
pub struct JetstreamParams {
    /// Collection NSIDs; `app.bsky.graph.*` style prefixes are allowed (max 100)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub wanted_collections: Vec<SmolStr>,

    /// Repositories to include (max 10,000)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub wanted_dids: Vec<SmolStr>,

    /// Unix microseconds timestamp to start playback
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size_bytes: Option<u64>,

    /// Pause stream until the first `options_update`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_hello: Option<bool>,
}

impl JetstreamParams {
    /// Query string with one `wantedCollections`/`wantedDids` pair per value.
    pub fn query(&self) -> Result<String, StreamError> {
        serde_html_form::to_string(self).map_err(StreamError::decode)
    }

    /// Websocket URL for connecting to `host` with these parameters.
    pub fn url(&self, host: &JetstreamHost) -> Result<Url, StreamError> {
        let mut url = host.endpoint().map_err(StreamError::decode)?;
        let query = self.query()?;
        if !query.is_empty() {
            url.set_query(Some(&query));
        }
        Ok(url)
    }

    /// The filter part of these parameters, for an `options_update`.
    pub fn options(&self) -> SubscriberOptions {
        SubscriberOptions {
            wanted_collections: self.wanted_collections.clone(),
            wanted_dids: self.wanted_dids.clone(),
            max_message_size_bytes: self.max_message_size_bytes,
        }
    }
}

/// Filters that can be replaced on a live connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberOptions {
    #[serde(default)]
    pub wanted_collections: Vec<SmolStr>,
    #[serde(default)]
    pub wanted_dids: Vec<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size_bytes: Option<u64>,
}

/// Messages a client may send on an open Jetstream connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SubscriberMessage {
    OptionsUpdate(SubscriberOptions),
}

impl SubscriberMessage {
    pub fn to_ws(&self) -> Result<WsMessage, StreamError> {
        let json = serde_json::to_string(self).map_err(StreamError::decode)?;
        Ok(WsMessage::from(json))
    }
}

/// Commit operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

/// Commit event details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JetstreamCommit {
    pub rev: SmolStr,
    pub operation: CommitOperation,
    pub collection: SmolStr,
    pub rkey: SmolStr,
    /// Record data (present for create/update)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<SmolStr>,
}

impl JetstreamCommit {
    /// `collection/rkey`
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }
}

/// Identity event details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JetstreamIdentity {
    pub did: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<SmolStr>,
    pub seq: i64,
    pub time: SmolStr,
}

/// Account event details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JetstreamAccount {
    pub active: bool,
    pub did: SmolStr,
    pub seq: i64,
    pub time: SmolStr,
    /// Why the account is inactive (`takendown`, `deactivated`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SmolStr>,
}

/// Jetstream event, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JetstreamEvent {
    Commit {
        did: SmolStr,
        time_us: i64,
        commit: JetstreamCommit,
    },
    Identity {
        did: SmolStr,
        time_us: i64,
        identity: JetstreamIdentity,
    },
    Account {
        did: SmolStr,
        time_us: i64,
        account: JetstreamAccount,
    },
}

const KNOWN_KINDS: [&str; 3] = ["commit", "identity", "account"];

/// A decoded Jetstream frame together with its original JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct JetstreamMessage {
    pub event: JetstreamEvent,
    pub raw: WsText,
}

impl JetstreamMessage {
    pub fn decode(raw: WsText) -> Result<Self, StreamError> {
        match serde_json::from_str::<JetstreamEvent>(&raw) {
            Ok(event) => Ok(Self { event, raw }),
            Err(e) => {
                #[derive(Deserialize)]
                struct Kind {
                    kind: SmolStr,
                }
                match serde_json::from_str::<Kind>(&raw) {
                    Ok(Kind { kind }) if !KNOWN_KINDS.contains(&kind.as_str()) => {
                        Err(StreamError::unknown_frame_type(kind))
                    }
                    _ => Err(StreamError::decode(e)),
                }
            }
        }
    }

    /// Decode a websocket frame. Jetstream sends text, but uncompressed
    /// binary frames holding JSON are accepted too.
    pub fn from_ws(message: WsMessage) -> Result<Self, StreamError> {
        match message {
            WsMessage::Text(text) => Self::decode(text),
            WsMessage::Binary(bytes) => {
                Self::decode(WsText::try_from(bytes).map_err(StreamError::decode)?)
            }
            WsMessage::Close(frame) => Err(WsMessage::close_error(frame)),
        }
    }

    pub fn did(&self) -> &str {
        match &self.event {
            JetstreamEvent::Commit { did, .. }
            | JetstreamEvent::Identity { did, .. }
            | JetstreamEvent::Account { did, .. } => did,
        }
    }

    /// Resume cursor: server time in unix microseconds.
    pub fn time_us(&self) -> i64 {
        match &self.event {
            JetstreamEvent::Commit { time_us, .. }
            | JetstreamEvent::Identity { time_us, .. }
            | JetstreamEvent::Account { time_us, .. } => *time_us,
        }
    }

    pub fn commit(&self) -> Option<&JetstreamCommit> {
        match &self.event {
            JetstreamEvent::Commit { commit, .. } => Some(commit),
            _ => None,
        }
    }
}
