//! Stable error domain for the client.
//!
//! # Why
//! Every fallible call in this crate — wire parsing, dialing, publish,
//! subscribe, request/reply, drain — needs to collapse onto one error
//! shape so callers can match on `ErrorKind` instead of threading a
//! different error type through each API. Raw `io::Error`s are
//! classified into a stable kind at the boundary (see
//! [`Error::from_io`]) rather than leaked upward, the same way a
//! transport adapter classifies kernel errors before they reach
//! application code.
use std::fmt;
use std::io;

/// The stable error kinds named in the broker client contract.
///
/// `#[non_exhaustive]` because new kinds may be added as the stream
/// layer grows without that being a breaking change for callers that
/// only match a subset with a wildcard arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    ProtocolError,
    IoError,
    Timeout,
    ConnectionClosed,
    NoServer,
    StaleConnection,
    AuthViolation,
    AuthExpired,
    PermissionsViolation,
    InsufficientBuffer,
    InvalidSubject,
    InvalidArgument,
    InvalidSubscription,
    IllegalState,
    SlowConsumer,
    MaxPayloadExceeded,
    MaxMessagesDelivered,
    NoResponders,
    NoMemory,
    NotSupportedByServer,
    Draining,
    TlsError,
    MissedHeartbeat,
    ConsumerDesynced,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::IoError => "io_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionClosed => "connection_closed",
            ErrorKind::NoServer => "no_server",
            ErrorKind::StaleConnection => "stale_connection",
            ErrorKind::AuthViolation => "auth_violation",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::PermissionsViolation => "permissions_violation",
            ErrorKind::InsufficientBuffer => "insufficient_buffer",
            ErrorKind::InvalidSubject => "invalid_subject",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::InvalidSubscription => "invalid_subscription",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::SlowConsumer => "slow_consumer",
            ErrorKind::MaxPayloadExceeded => "max_payload_exceeded",
            ErrorKind::MaxMessagesDelivered => "max_messages_delivered",
            ErrorKind::NoResponders => "no_responders",
            ErrorKind::NoMemory => "no_memory",
            ErrorKind::NotSupportedByServer => "not_supported_by_server",
            ErrorKind::Draining => "draining",
            ErrorKind::TlsError => "tls_error",
            ErrorKind::MissedHeartbeat => "missed_heartbeat",
            ErrorKind::ConsumerDesynced => "consumer_desynced",
        };
        f.write_str(s)
    }
}

/// The crate's single error type.
///
/// Carries a [`ErrorKind`], a human-readable message, and an optional
/// source error (typically an `io::Error` from the socket).
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classify a raw I/O error the way a transport adapter classifies
    /// kernel errors before they cross into application code: timeouts
    /// become [`ErrorKind::Timeout`], everything else becomes
    /// [`ErrorKind::IoError`] with the original error preserved as the
    /// source.
    pub fn from_io(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            _ => ErrorKind::IoError,
        };
        let message = err.to_string();
        Error::new(kind, message).with_source(err)
    }
}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        impl Error {
            #[allow(non_snake_case)]
            pub fn $name(message: impl Into<String>) -> Self {
                Error::new(ErrorKind::$kind, message)
            }
        }
    };
}

ctor!(protocol_error, ProtocolError);
ctor!(timeout, Timeout);
ctor!(connection_closed, ConnectionClosed);
ctor!(no_server, NoServer);
ctor!(stale_connection, StaleConnection);
ctor!(auth_violation, AuthViolation);
ctor!(auth_expired, AuthExpired);
ctor!(permissions_violation, PermissionsViolation);
ctor!(insufficient_buffer, InsufficientBuffer);
ctor!(invalid_subject, InvalidSubject);
ctor!(invalid_argument, InvalidArgument);
ctor!(invalid_subscription, InvalidSubscription);
ctor!(illegal_state, IllegalState);
ctor!(slow_consumer, SlowConsumer);
ctor!(max_payload_exceeded, MaxPayloadExceeded);
ctor!(max_messages_delivered, MaxMessagesDelivered);
ctor!(no_responders, NoResponders);
ctor!(not_supported_by_server, NotSupportedByServer);
ctor!(draining, Draining);
ctor!(tls_error, TlsError);
ctor!(missed_heartbeat, MissedHeartbeat);
ctor!(consumer_desynced, ConsumerDesynced);

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeout_classifies_as_timeout() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded");
        let err = Error::from_io(io_err);
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn io_other_classifies_as_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err = Error::from_io(io_err);
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(err.source.is_some());
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::no_responders("no responders for subject help");
        let text = err.to_string();
        assert!(text.contains("no_responders"));
        assert!(text.contains("help"));
    }
}
