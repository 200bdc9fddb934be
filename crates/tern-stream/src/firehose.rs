//! `com.atproto.sync.subscribeRepos` frame decoding.
//!
//! Every binary frame holds two CBOR values back to back: a header
//! `{op, t}` and a body whose shape depends on `t`. `op = 1` is a regular
//! message, `op = -1` an error frame `{error, message}` the relay sends
//! before closing the connection.
//!
//! Commit bodies carry their record blocks as a CAR archive in `blocks`;
//! each operation that names a record CID gets that block attached,
//! both raw and decoded.

use bytes::Bytes;
use cid::Cid;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tern_common::cbor::{self, CborMap, CborValue, Decoder};
use url::Url;

use crate::car::{CarBlocks, parse_car_bytes};
use crate::error::StreamError;
use crate::websocket::WsMessage;

pub const SUBSCRIBE_REPOS: &str = "com.atproto.sync.subscribeRepos";

/// The main Bluesky relay.
pub const DEFAULT_RELAY: &str = "wss://bsky.network";

/// Header `op` of a regular message.
pub const OP_MESSAGE: i64 = 1;
/// Header `op` of an error frame.
pub const OP_ERROR: i64 = -1;

/// Parameters for subscribing to a relay's firehose
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, bon::Builder)]
#[serde(rename_all = "camelCase")]
#[builder(start_fn = new)]
pub struct FirehoseParams {
    /// Sequence number to replay from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
}

impl FirehoseParams {
    /// Websocket URL of the subscription on `relay`.
    pub fn url(&self, relay: &Url) -> Result<Url, StreamError> {
        let mut url = relay.clone();
        let mut path = url.path().trim_end_matches('/').to_owned();
        path.push_str("/xrpc/");
        path.push_str(SUBSCRIBE_REPOS);
        url.set_path(&path);

        let query = serde_html_form::to_string(self).map_err(StreamError::decode)?;
        url.set_query((!query.is_empty()).then_some(query.as_str()));
        Ok(url)
    }
}

/// First CBOR value of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: i64,
    /// Message type such as `#commit`; absent on error frames
    pub t: Option<SmolStr>,
}

impl FrameHeader {
    fn from_value(value: &CborValue) -> Result<Self, StreamError> {
        let map = value
            .as_map()
            .ok_or_else(|| StreamError::malformed("frame header is not a map"))?;
        let op = map
            .get_i64("op")
            .ok_or_else(|| StreamError::malformed("frame header has no `op`"))?;
        Ok(Self {
            op,
            t: map.get_str("t").map(SmolStr::new),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoAction {
    Create,
    Update,
    Delete,
}

impl RepoAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for RepoAction {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(StreamError::malformed(format!("unknown repo op action {other:?}"))),
        }
    }
}

/// One record mutation of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoOp {
    pub action: RepoAction,
    /// `collection/rkey`
    pub path: SmolStr,
    pub collection: SmolStr,
    pub rkey: SmolStr,
    /// New record CID; `None` for deletes
    pub cid: Option<Cid>,
    /// Previous record CID, sent by relays speaking sync v1.1
    pub prev: Option<Cid>,
    /// Decoded record, when its block was included
    pub record: Option<CborValue>,
    pub record_bytes: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirehoseCommit {
    pub seq: i64,
    pub repo: SmolStr,
    pub rev: SmolStr,
    /// Rev of the previous commit of this repo
    pub since: Option<SmolStr>,
    pub time: SmolStr,
    /// Commit object CID; the first root of `blocks`
    pub commit: Cid,
    pub ops: Vec<RepoOp>,
    pub blobs: Vec<Cid>,
    /// Previous MST root (sync v1.1)
    pub prev_data: Option<Cid>,
    /// Commit exceeded the relay's limits; `ops` and blocks may be partial
    pub too_big: bool,
    pub blocks: CarBlocks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseIdentity {
    pub seq: i64,
    pub did: SmolStr,
    pub time: SmolStr,
    pub handle: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseAccount {
    pub seq: i64,
    pub did: SmolStr,
    pub time: SmolStr,
    pub active: bool,
    pub status: Option<SmolStr>,
}

/// Repo state reset: `blocks` holds only the new commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseSync {
    pub seq: i64,
    pub did: SmolStr,
    pub rev: SmolStr,
    pub time: SmolStr,
    pub blocks: Bytes,
}

/// Informational message, e.g. `OutdatedCursor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseInfo {
    pub name: SmolStr,
    pub message: Option<SmolStr>,
}

/// Body of an `op = -1` frame, e.g. `FutureCursor` or `ConsumerTooSlow`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseErrorFrame {
    pub error: SmolStr,
    pub message: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FirehoseEvent {
    Commit(Box<FirehoseCommit>),
    Identity(FirehoseIdentity),
    Account(FirehoseAccount),
    Sync(FirehoseSync),
    Info(FirehoseInfo),
    Error(FirehoseErrorFrame),
}

/// A decoded frame. `body` and `raw` keep the undecoded forms for callers
/// that verify signatures or apply a stricter schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FirehoseMessage {
    pub header: FrameHeader,
    pub event: FirehoseEvent,
    pub body: CborValue,
    pub raw: Bytes,
}

impl FirehoseMessage {
    /// Decode one binary frame.
    pub async fn decode(raw: Bytes) -> Result<Self, StreamError> {
        let mut decoder = Decoder::new(&raw);
        let header = decoder.next_value().map_err(StreamError::decode)?;
        let body = decoder.next_value().map_err(StreamError::decode)?;
        if !decoder.is_empty() {
            return Err(StreamError::protocol(format!(
                "{} bytes after frame body",
                decoder.remaining().len()
            )));
        }

        let header = FrameHeader::from_value(&header)?;
        let event = match header.op {
            OP_ERROR => {
                let fields = Fields::new("error frame", &body)?;
                FirehoseEvent::Error(FirehoseErrorFrame {
                    error: fields.str("error")?,
                    message: fields.opt_str("message"),
                })
            }
            OP_MESSAGE => {
                let t = header
                    .t
                    .as_deref()
                    .ok_or_else(|| StreamError::malformed("message frame without `t`"))?;
                decode_body(t, &body).await?
            }
            op => return Err(StreamError::protocol(format!("unknown frame op {op}"))),
        };

        Ok(Self {
            header,
            event,
            body,
            raw,
        })
    }

    /// Decode a websocket frame; text frames are a protocol error.
    pub async fn from_ws(message: WsMessage) -> Result<Self, StreamError> {
        match message {
            WsMessage::Binary(bytes) => Self::decode(bytes).await,
            WsMessage::Text(_) => Err(StreamError::protocol(
                "expected binary frame for CBOR, got text",
            )),
            WsMessage::Close(frame) => Err(WsMessage::close_error(frame)),
        }
    }

    /// Stream sequence number, the firehose resume cursor.
    pub fn seq(&self) -> Option<i64> {
        match &self.event {
            FirehoseEvent::Commit(c) => Some(c.seq),
            FirehoseEvent::Identity(i) => Some(i.seq),
            FirehoseEvent::Account(a) => Some(a.seq),
            FirehoseEvent::Sync(s) => Some(s.seq),
            FirehoseEvent::Info(_) | FirehoseEvent::Error(_) => None,
        }
    }

    /// The repository the message is about.
    pub fn did(&self) -> Option<&str> {
        match &self.event {
            FirehoseEvent::Commit(c) => Some(&c.repo),
            FirehoseEvent::Identity(i) => Some(&i.did),
            FirehoseEvent::Account(a) => Some(&a.did),
            FirehoseEvent::Sync(s) => Some(&s.did),
            FirehoseEvent::Info(_) | FirehoseEvent::Error(_) => None,
        }
    }
}

async fn decode_body(t: &str, body: &CborValue) -> Result<FirehoseEvent, StreamError> {
    let fields = Fields::new(t, body)?;
    Ok(match t {
        "#commit" => FirehoseEvent::Commit(Box::new(decode_commit(&fields).await?)),
        "#identity" => FirehoseEvent::Identity(FirehoseIdentity {
            seq: fields.i64("seq")?,
            did: fields.str("did")?,
            time: fields.str("time")?,
            handle: fields.opt_str("handle"),
        }),
        "#account" => FirehoseEvent::Account(FirehoseAccount {
            seq: fields.i64("seq")?,
            did: fields.str("did")?,
            time: fields.str("time")?,
            active: fields.bool("active")?,
            status: fields.opt_str("status"),
        }),
        "#sync" => FirehoseEvent::Sync(FirehoseSync {
            seq: fields.i64("seq")?,
            did: fields.str("did")?,
            rev: fields.str("rev")?,
            time: fields.str("time")?,
            blocks: fields.bytes("blocks")?,
        }),
        "#info" => FirehoseEvent::Info(FirehoseInfo {
            name: fields.str("name")?,
            message: fields.opt_str("message"),
        }),
        other => return Err(StreamError::unknown_frame_type(other)),
    })
}

async fn decode_commit(fields: &Fields<'_>) -> Result<FirehoseCommit, StreamError> {
    let blocks = fields.bytes("blocks")?;
    let blocks = if blocks.is_empty() {
        CarBlocks::default()
    } else {
        parse_car_bytes(&blocks).await?
    };

    let ops = fields
        .array("ops")?
        .iter()
        .map(|op| decode_op(op, &blocks))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FirehoseCommit {
        seq: fields.i64("seq")?,
        repo: fields.str("repo")?,
        rev: fields.str("rev")?,
        since: fields.opt_str("since"),
        time: fields.str("time")?,
        commit: fields.link("commit")?,
        ops,
        blobs: fields.links("blobs")?,
        prev_data: fields.opt_link("prevData"),
        too_big: fields.opt_bool("tooBig").unwrap_or(false),
        blocks,
    })
}

fn decode_op(op: &CborValue, blocks: &CarBlocks) -> Result<RepoOp, StreamError> {
    let fields = Fields::new("repo op", op)?;
    let path = fields.str("path")?;
    let (collection, rkey) = path
        .split_once('/')
        .ok_or_else(|| StreamError::malformed(format!("repo op path {path:?} has no rkey")))?;
    let cid = fields.opt_link("cid");

    let record_bytes = cid.as_ref().and_then(|cid| blocks.get(cid)).cloned();
    let record = record_bytes
        .as_deref()
        .map(cbor::decode)
        .transpose()
        .map_err(StreamError::decode)?;

    Ok(RepoOp {
        action: fields.str("action")?.parse()?,
        collection: collection.into(),
        rkey: rkey.into(),
        path,
        cid,
        prev: fields.opt_link("prev"),
        record,
        record_bytes,
    })
}

/// Typed access to the fields of a body map.
struct Fields<'a> {
    what: &'a str,
    map: &'a CborMap,
}

impl<'a> Fields<'a> {
    fn new(what: &'a str, value: &'a CborValue) -> Result<Self, StreamError> {
        let map = value.as_map().ok_or_else(|| {
            StreamError::malformed(format!("{what} body is a {}, not a map", value.type_name()))
        })?;
        Ok(Self { what, map })
    }

    fn missing(&self, key: &str) -> StreamError {
        StreamError::malformed(format!("{} body has no valid `{key}`", self.what))
    }

    fn str(&self, key: &str) -> Result<SmolStr, StreamError> {
        self.opt_str(key).ok_or_else(|| self.missing(key))
    }

    fn opt_str(&self, key: &str) -> Option<SmolStr> {
        self.map.get_str(key).map(SmolStr::new)
    }

    fn i64(&self, key: &str) -> Result<i64, StreamError> {
        self.map.get_i64(key).ok_or_else(|| self.missing(key))
    }

    fn opt_bool(&self, key: &str) -> Option<bool> {
        self.map.get_bool(key)
    }

    fn bool(&self, key: &str) -> Result<bool, StreamError> {
        self.opt_bool(key).ok_or_else(|| self.missing(key))
    }

    fn bytes(&self, key: &str) -> Result<Bytes, StreamError> {
        self.map
            .get_bytes(key)
            .map(|b| b.0.clone())
            .ok_or_else(|| self.missing(key))
    }

    fn link(&self, key: &str) -> Result<Cid, StreamError> {
        self.opt_link(key).ok_or_else(|| self.missing(key))
    }

    /// Absent and `null` both read as `None`.
    fn opt_link(&self, key: &str) -> Option<Cid> {
        self.map.get(key).and_then(CborValue::as_link).copied()
    }

    fn array(&self, key: &str) -> Result<&'a [CborValue], StreamError> {
        self.map
            .get(key)
            .and_then(CborValue::as_array)
            .ok_or_else(|| self.missing(key))
    }

    fn links(&self, key: &str) -> Result<Vec<Cid>, StreamError> {
        match self.map.get(key) {
            None => Ok(Vec::new()),
            Some(value) => value
                .as_array()
                .ok_or_else(|| self.missing(key))?
                .iter()
                .map(|v| v.as_link().copied().ok_or_else(|| self.missing(key)))
                .collect(),
        }
    }
}
