//! Errors produced while reading an event stream.

use std::error::Error;
use std::fmt;

use smol_str::SmolStr;

/// Boxed error type for streaming operations
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Error type for streaming operations
#[derive(Debug)]
pub struct StreamError {
    kind: StreamErrorKind,
    source: Option<BoxError>,
}

/// Categories of streaming errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Network or I/O error
    Transport,
    /// Stream or connection closed
    Closed,
    /// Protocol violation or framing error
    Protocol,
    /// A frame could not be decoded
    Decode,
    /// A well-formed frame of a type this client does not know
    UnknownFrameType(SmolStr),
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, source: Option<BoxError>) -> Self {
        Self { kind, source }
    }

    pub fn kind(&self) -> &StreamErrorKind {
        &self.kind
    }

    /// Get the underlying error source
    pub fn source(&self) -> Option<&BoxError> {
        self.source.as_ref()
    }

    /// Create a "connection closed" error
    pub fn closed() -> Self {
        Self {
            kind: StreamErrorKind::Closed,
            source: None,
        }
    }

    /// Connection closed with a reason from the peer.
    pub fn closed_with(reason: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Closed,
            source: Some(reason.into().into()),
        }
    }

    /// Create a transport error with source
    pub fn transport(source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind: StreamErrorKind::Transport,
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Protocol,
            source: Some(msg.into().into()),
        }
    }

    pub fn decode(source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            kind: StreamErrorKind::Decode,
            source: Some(Box::new(source)),
        }
    }

    /// Decode error described by a message rather than an underlying error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Decode,
            source: Some(msg.into().into()),
        }
    }

    pub fn unknown_frame_type(t: impl Into<SmolStr>) -> Self {
        Self {
            kind: StreamErrorKind::UnknownFrameType(t.into()),
            source: None,
        }
    }

    /// Whether the connection is unusable after this error. Anything else
    /// concerns a single frame and the stream can keep going.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            StreamErrorKind::Transport | StreamErrorKind::Closed
        )
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StreamErrorKind::Transport => write!(f, "Transport error"),
            StreamErrorKind::Closed => write!(f, "Stream closed"),
            StreamErrorKind::Protocol => write!(f, "Protocol error"),
            StreamErrorKind::Decode => write!(f, "Malformed frame"),
            StreamErrorKind::UnknownFrameType(t) => write!(f, "Unknown frame type {t:?}"),
        }?;

        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }

        Ok(())
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl miette::Diagnostic for StreamError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let code = match self.kind {
            StreamErrorKind::Transport => "tern_stream::transport",
            StreamErrorKind::Closed => "tern_stream::closed",
            StreamErrorKind::Protocol => "tern_stream::protocol",
            StreamErrorKind::Decode => "tern_stream::decode",
            StreamErrorKind::UnknownFrameType(_) => "tern_stream::unknown_frame_type",
        };
        Some(Box::new(code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        match self.kind {
            StreamErrorKind::Transport | StreamErrorKind::Closed => Some(Box::new(
                "reconnect, passing the consumer's cursor to resume where it stopped",
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_carries_kind_and_source() {
        let source = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = StreamError::new(StreamErrorKind::Transport, Some(Box::new(source)));

        assert_eq!(err.kind(), &StreamErrorKind::Transport);
        assert!(err.source().is_some());
        assert!(err.is_fatal());
        assert_eq!(format!("{}", err), "Transport error: pipe closed");
    }

    #[test]
    fn frame_level_errors_are_not_fatal() {
        let err = StreamError::unknown_frame_type("#labels");
        assert_eq!(
            err.kind(),
            &StreamErrorKind::UnknownFrameType("#labels".into())
        );
        assert!(!err.is_fatal());
        assert!(!StreamError::malformed("missing seq").is_fatal());
        assert!(StreamError::closed().is_fatal());
        assert_eq!(err.to_string(), "Unknown frame type \"#labels\"");
    }
}
