//! WebSocket transport seam.
//!
//! Consumers only see [`WsMessage`] frames through a [`WsStream`] and write
//! subscriber options through a [`WsSink`]. Ping/pong never reaches them.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;

use bytes::Bytes;
use n0_future::Stream;
use n0_future::stream::Boxed;
use smol_str::SmolStr;
use url::Url;

use crate::error::StreamError;

/// Text frame payload, kept as validated UTF-8 so Jetstream can hand out
/// the raw JSON without copying it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsText(SmolStr);

impl WsText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for WsText {
    type Target = str;
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl From<String> for WsText {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&str> for WsText {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

/// Jetstream may send its JSON in binary frames.
impl TryFrom<Bytes> for WsText {
    type Error = std::str::Utf8Error;
    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Ok(Self(std::str::from_utf8(&bytes)?.into()))
    }
}

/// Close frame sent by the server, e.g. `1008` when a relay drops a slow
/// consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: SmolStr,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, " {}", self.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(WsText),
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

impl WsMessage {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    /// Payload of a data frame
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WsMessage::Text(t) => Some(t.as_bytes()),
            WsMessage::Binary(b) => Some(b),
            WsMessage::Close(_) => None,
        }
    }

    /// The error a consumer reports when the peer closes the connection.
    pub(crate) fn close_error(frame: Option<CloseFrame>) -> StreamError {
        match frame {
            Some(frame) => StreamError::closed_with(frame.to_string()),
            None => StreamError::closed(),
        }
    }
}

impl From<&str> for WsMessage {
    fn from(s: &str) -> Self {
        WsMessage::Text(WsText::from(s))
    }
}

impl From<String> for WsMessage {
    fn from(s: String) -> Self {
        WsMessage::Text(WsText::from(s))
    }
}

impl From<Vec<u8>> for WsMessage {
    fn from(vec: Vec<u8>) -> Self {
        WsMessage::Binary(Bytes::from(vec))
    }
}

/// Incoming frames.
pub struct WsStream(Boxed<Result<WsMessage, StreamError>>);

impl WsStream {
    #[cfg(not(target_arch = "wasm32"))]
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<WsMessage, StreamError>> + Send + 'static,
    {
        Self(Box::pin(stream))
    }

    #[cfg(target_arch = "wasm32")]
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<WsMessage, StreamError>> + 'static,
    {
        Self(Box::pin(stream))
    }

    /// Next frame; `None` once the underlying stream is exhausted.
    pub async fn recv(&mut self) -> Option<Result<WsMessage, StreamError>> {
        use n0_future::StreamExt as _;
        self.0.next().await
    }
}

impl fmt::Debug for WsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsStream").finish_non_exhaustive()
    }
}

#[cfg(not(target_arch = "wasm32"))]
type BoxedSink = Pin<Box<dyn n0_future::Sink<WsMessage, Error = StreamError> + Send>>;
#[cfg(target_arch = "wasm32")]
type BoxedSink = Pin<Box<dyn n0_future::Sink<WsMessage, Error = StreamError>>>;

/// Outgoing frames.
pub struct WsSink(BoxedSink);

impl WsSink {
    #[cfg(not(target_arch = "wasm32"))]
    pub fn new<S>(sink: S) -> Self
    where
        S: n0_future::Sink<WsMessage, Error = StreamError> + Send + 'static,
    {
        Self(Box::pin(sink))
    }

    #[cfg(target_arch = "wasm32")]
    pub fn new<S>(sink: S) -> Self
    where
        S: n0_future::Sink<WsMessage, Error = StreamError> + 'static,
    {
        Self(Box::pin(sink))
    }

    /// Send one message and flush it.
    pub async fn send(&mut self, message: WsMessage) -> Result<(), StreamError> {
        use futures::SinkExt as _;
        self.0.send(message).await
    }
}

impl fmt::Debug for WsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsSink").finish_non_exhaustive()
    }
}

/// Opens subscription sockets.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait WebSocketClient {
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(&self, url: Url) -> impl Future<Output = Result<WebSocketConnection, Self::Error>>;
}

/// An open socket, split into its two directions by the consumer.
pub struct WebSocketConnection {
    tx: WsSink,
    rx: WsStream,
}

impl WebSocketConnection {
    pub fn new(tx: WsSink, rx: WsStream) -> Self {
        Self { tx, rx }
    }

    pub fn split(self) -> (WsSink, WsStream) {
        (self.tx, self.rx)
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection").finish_non_exhaustive()
    }
}

/// [`WebSocketClient`] on tokio-tungstenite-wasm.
#[cfg(feature = "websocket")]
pub mod tungstenite_client {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite_wasm::Message;

    #[derive(Debug, Clone, Default)]
    pub struct TungsteniteClient;

    impl TungsteniteClient {
        pub fn new() -> Self {
            Self
        }
    }

    impl WebSocketClient for TungsteniteClient {
        type Error = tokio_tungstenite_wasm::Error;

        async fn connect(&self, url: Url) -> Result<WebSocketConnection, Self::Error> {
            #[cfg(feature = "tracing")]
            tracing::debug!(%url, "opening websocket");
            let (sink, stream) = tokio_tungstenite_wasm::connect(url.as_str()).await?.split();

            // ping/pong is answered by tungstenite itself
            let rx = WsStream::new(stream.map(|result| match result {
                Ok(msg) => Ok(incoming(msg)),
                Err(e) => Err(StreamError::transport(e)),
            }));
            let tx = WsSink::new(
                sink.with(|msg: WsMessage| async move {
                    Ok::<_, tokio_tungstenite_wasm::Error>(outgoing(msg))
                })
                .sink_map_err(StreamError::transport),
            );
            Ok(WebSocketConnection::new(tx, rx))
        }
    }

    fn incoming(msg: Message) -> WsMessage {
        match msg {
            Message::Text(text) => WsMessage::Text(WsText::from(text)),
            Message::Binary(vec) => WsMessage::Binary(Bytes::from(vec)),
            Message::Close(frame) => WsMessage::Close(
                frame.map(|f| CloseFrame::new(u16::from(f.code), f.reason.as_ref())),
            ),
        }
    }

    fn outgoing(msg: WsMessage) -> Message {
        match msg {
            WsMessage::Text(text) => Message::Text(text.as_str().to_owned()),
            WsMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
            WsMessage::Close(frame) => Message::Close(frame.map(|f| {
                tokio_tungstenite_wasm::CloseFrame {
                    code: f.code.into(),
                    reason: f.reason.to_string().into(),
                }
            })),
        }
    }
}
