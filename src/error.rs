use std::io;

use thiserror::Error;

/// Result type alias for replex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
///
/// Server-returned error replies travel through the reply tree as data
/// ([`Reply::Error`](crate::proto::Reply::Error)) and only become
/// [`Error::Redis`] when a caller converts a reply with
/// [`Reply::into_result`](crate::proto::Reply::into_result).
#[derive(Debug, Error)]
pub enum Error {
    /// An IO error occurred on a connection.
    #[error("io error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// The peer violated the wire protocol. Fatal for the connection.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// The server returned an error reply.
    #[error("redis error: {message}")]
    Redis {
        /// Error message from the server, verbatim.
        message: String,
    },

    /// The server returned a nil reply where a value was requested.
    #[error("redis nil")]
    Nil,

    /// No reachable primary serves the requested slot.
    #[error("no reachable primary for the requested slot")]
    NoSlot,

    /// No seed address was configured.
    #[error("no seed address configured")]
    NoAddr,

    /// A pipeline mixed keyless commands with keyed ones.
    #[error("pipeline mixes keyless and keyed commands")]
    MixedSlot,

    /// An operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The connection (or the client) was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Permanent slot ownership redirect. Handled internally by the router;
    /// escapes only when redirect retries are exhausted.
    #[error("MOVED {slot} {address}")]
    Moved {
        /// Slot whose owner changed.
        slot: u16,
        /// Address of the new owner.
        address: String,
    },

    /// Temporary redirect during slot migration. Handled internally.
    #[error("ASK {slot} {address}")]
    Ask {
        /// Slot being migrated.
        slot: u16,
        /// Address of the importing node.
        address: String,
    },

    /// The node asked for a retry during migration. Handled internally.
    #[error("TRYAGAIN")]
    TryAgain,
}

impl Error {
    /// Returns true if this error is the nil sentinel.
    pub fn is_nil(&self) -> bool {
        matches!(self, Error::Nil)
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    // Terminal wire errors fan out to every pending caller, so they must be
    // reproducible without being Clone (io::Error is not).
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::Io { source } => Error::Io {
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Error::Protocol { message } => Error::Protocol {
                message: message.clone(),
            },
            Error::Redis { message } => Error::Redis {
                message: message.clone(),
            },
            Error::Nil => Error::Nil,
            Error::NoSlot => Error::NoSlot,
            Error::NoAddr => Error::NoAddr,
            Error::MixedSlot => Error::MixedSlot,
            Error::Timeout => Error::Timeout,
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::Moved { slot, address } => Error::Moved {
                slot: *slot,
                address: address.clone(),
            },
            Error::Ask { slot, address } => Error::Ask {
                slot: *slot,
                address: address.clone(),
            },
            Error::TryAgain => Error::TryAgain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let error = Error::Io { source: io_err };
        assert!(error.to_string().contains("io error"));
    }

    #[test]
    fn test_error_display_redirects() {
        let error = Error::Moved {
            slot: 42,
            address: "127.0.0.1:7001".to_string(),
        };
        assert_eq!(error.to_string(), "MOVED 42 127.0.0.1:7001");
    }

    #[test]
    fn test_error_is_nil() {
        assert!(Error::Nil.is_nil());
        assert!(!Error::Timeout.is_nil());
    }

    #[test]
    fn test_error_duplicate_preserves_kind() {
        let orig = Error::Io {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "gone"),
        };
        match orig.duplicate() {
            Error::Io { source } => assert_eq!(source.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected duplicate: {other:?}"),
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let error: Error = io_err.into();
        assert!(matches!(error, Error::Io { .. }));
    }
}
