//! Pull and push consumers over a websocket connection.
//!
//! A consumer decodes one frame at a time, in arrival order, and remembers
//! the cursor of the last frame it decoded so a caller can reconnect where
//! it left off. Frames that fail to decode are returned (or reported to the
//! handler) and skipped; transport errors and close frames end the
//! consumer. Reconnecting is left to the caller.

use std::future::Future;

use url::Url;

use crate::error::StreamError;
use crate::filter::FirehoseFilter;
use crate::firehose::{FirehoseMessage, FirehoseParams};
use crate::jetstream::{JetstreamHost, JetstreamMessage, JetstreamParams, SubscriberMessage, SubscriberOptions};
use crate::websocket::{WebSocketClient, WebSocketConnection, WsMessage, WsSink, WsStream};

/// How frames of one kind of stream are decoded.
pub trait Subscription {
    type Message;

    fn decode(&self, frame: WsMessage) -> impl Future<Output = Result<Self::Message, StreamError>>;

    /// Resume position carried by `message`, if any.
    fn cursor(message: &Self::Message) -> Option<i64>;

    /// Client-side filter applied after the cursor has been recorded.
    fn accept(&self, message: Self::Message) -> Option<Self::Message> {
        Some(message)
    }
}

/// Jetstream JSON frames; the cursor is `time_us`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Jetstream;

impl Subscription for Jetstream {
    type Message = JetstreamMessage;

    async fn decode(&self, frame: WsMessage) -> Result<JetstreamMessage, StreamError> {
        JetstreamMessage::from_ws(frame)
    }

    fn cursor(message: &JetstreamMessage) -> Option<i64> {
        Some(message.time_us())
    }
}

/// Firehose CBOR frames; the cursor is `seq`.
#[derive(Debug, Clone, Default)]
pub struct Firehose {
    pub filter: FirehoseFilter,
}

impl Subscription for Firehose {
    type Message = FirehoseMessage;

    async fn decode(&self, frame: WsMessage) -> Result<FirehoseMessage, StreamError> {
        FirehoseMessage::from_ws(frame).await
    }

    fn cursor(message: &FirehoseMessage) -> Option<i64> {
        message.seq()
    }

    fn accept(&self, message: FirehoseMessage) -> Option<FirehoseMessage> {
        self.filter.apply(message)
    }
}

/// Receives the messages of [`StreamConsumer::run`].
pub trait StreamHandler<M> {
    fn on_message(&mut self, message: M) -> impl Future<Output = ()>;

    /// A frame was skipped.
    fn on_error(&mut self, error: &StreamError) {
        let _ = error;
    }
}

/// Consumer of one websocket connection.
#[derive(Debug)]
pub struct StreamConsumer<S> {
    subscription: S,
    tx: WsSink,
    rx: WsStream,
    cursor: Option<i64>,
}

pub type JetstreamConsumer = StreamConsumer<Jetstream>;
pub type FirehoseConsumer = StreamConsumer<Firehose>;

impl<S: Subscription> StreamConsumer<S> {
    pub fn new(subscription: S, connection: WebSocketConnection) -> Self {
        let (tx, rx) = connection.split();
        Self {
            subscription,
            tx,
            rx,
            cursor: None,
        }
    }

    /// Cursor of the last decoded frame, including frames the filter dropped.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub fn subscription(&self) -> &S {
        &self.subscription
    }

    /// The next message. `Some(Err(_))` for a bad frame leaves the consumer
    /// usable unless the error [is fatal](StreamError::is_fatal); `None`
    /// once the connection has ended.
    pub async fn next(&mut self) -> Option<Result<S::Message, StreamError>> {
        loop {
            let frame = match self.rx.recv().await? {
                Ok(WsMessage::Close(frame)) => return Some(Err(WsMessage::close_error(frame))),
                Ok(frame) => frame,
                Err(e) => return Some(Err(e)),
            };
            let message = match self.subscription.decode(frame).await {
                Ok(message) => message,
                Err(e) => return Some(Err(e)),
            };
            if let Some(cursor) = S::cursor(&message) {
                self.cursor = Some(cursor);
            }
            if let Some(message) = self.subscription.accept(message) {
                return Some(Ok(message));
            }
        }
    }

    /// Feed every message to `handler` until the connection ends.
    ///
    /// Bad frames are logged, passed to [`StreamHandler::on_error`] and
    /// skipped. Returns `Ok(())` when the stream simply ends and the fatal
    /// error otherwise.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn run<H>(&mut self, handler: &mut H) -> Result<(), StreamError>
    where
        H: StreamHandler<S::Message>,
    {
        while let Some(next) = self.next().await {
            match next {
                Ok(message) => handler.on_message(message).await,
                Err(e) if e.is_fatal() => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(error = %e, cursor = ?self.cursor, "stream ended");
                    return Err(e);
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, cursor = ?self.cursor, "skipping frame");
                    handler.on_error(&e);
                }
            }
        }
        Ok(())
    }

    pub fn into_connection(self) -> WebSocketConnection {
        WebSocketConnection::new(self.tx, self.rx)
    }
}

impl JetstreamConsumer {
    pub async fn connect<C: WebSocketClient>(
        client: &C,
        host: &JetstreamHost,
        params: &JetstreamParams,
    ) -> Result<Self, StreamError> {
        let url = params.url(host)?;
        let connection = client.connect(url).await.map_err(StreamError::transport)?;
        Ok(Self::new(Jetstream, connection))
    }

    /// Replace the filters of the live connection.
    pub async fn update_options(&mut self, options: SubscriberOptions) -> Result<(), StreamError> {
        let message = SubscriberMessage::OptionsUpdate(options).to_ws()?;
        self.tx.send(message).await
    }
}

impl FirehoseConsumer {
    pub async fn connect<C: WebSocketClient>(
        client: &C,
        relay: &Url,
        params: &FirehoseParams,
        filter: FirehoseFilter,
    ) -> Result<Self, StreamError> {
        let url = params.url(relay)?;
        let connection = client.connect(url).await.map_err(StreamError::transport)?;
        Ok(Self::new(Firehose { filter }, connection))
    }
}
