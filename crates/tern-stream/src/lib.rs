//! Real-time AT Protocol event streams.
//!
//! Two wire formats are supported: Jetstream's JSON frames, filtered on the
//! server, and the relay firehose (`com.atproto.sync.subscribeRepos`), whose
//! CBOR frames are decoded here, commit records included, and filtered on
//! the client.
//!
//! ```no_run
//! # #[cfg(feature = "websocket")]
//! # async fn example() -> Result<(), tern_stream::StreamError> {
//! use tern_stream::websocket::tungstenite_client::TungsteniteClient;
//! use tern_stream::{JetstreamConsumer, JetstreamHost, JetstreamParams};
//!
//! let params = JetstreamParams::new()
//!     .wanted_collections(vec!["app.bsky.feed.post".into()])
//!     .build();
//! let mut consumer =
//!     JetstreamConsumer::connect(&TungsteniteClient::new(), &JetstreamHost::default(), &params)
//!         .await?;
//! while let Some(next) = consumer.next().await {
//!     match next {
//!         Ok(message) => println!("{}", message.did()),
//!         Err(e) if e.is_fatal() => return Err(e),
//!         Err(e) => eprintln!("skipped: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod car;
pub mod consumer;
pub mod error;
pub mod filter;
pub mod firehose;
pub mod jetstream;
pub mod websocket;

pub use consumer::{
    Firehose, FirehoseConsumer, Jetstream, JetstreamConsumer, StreamConsumer, StreamHandler,
    Subscription,
};
pub use error::{StreamError, StreamErrorKind};
pub use filter::FirehoseFilter;
pub use firehose::{FirehoseEvent, FirehoseMessage, FirehoseParams, RepoOp};
pub use jetstream::{JetstreamEvent, JetstreamHost, JetstreamMessage, JetstreamParams};
pub use websocket::{WebSocketClient, WebSocketConnection, WsMessage};
