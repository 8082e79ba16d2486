//! Error types for session and stream lifecycle operations.
//!
//! The taxonomy separates failures the caller can act on: a
//! [`Kind::ProtocolViolation`] is fatal to a single stream, never the
//! session; a [`Kind::ConnectFailure`] happens before any session exists and
//! must not be confused with a [`Kind::SessionError`] after one does.

use std::error::Error as StdError;
use std::fmt;

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur driving HTTP/2 sessions and streams.
#[derive(Clone)]
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Inner {
    fn clone(&self) -> Self {
        Inner {
            kind: self.kind.clone(),
            // Trait objects cannot be cloned; the source is dropped.
            source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// Malformed or out-of-order operation, e.g. missing request
    /// pseudo-headers or trailers sent before the peer signaled readiness.
    /// Fatal to the stream, not the session.
    ProtocolViolation,
    /// Operation called on an entity whose state forbids it, e.g. a second
    /// `respond` on the same stream. Affects no other entity.
    InvalidState,
    /// Push attempted while the session-level push flag is off or the peer
    /// disabled push. Recoverable; the caller may retry if the flag changes.
    PushDisabled,
    /// Client-side failure before a session exists.
    ConnectFailure,
    /// Session-level failure: transport reset, settings negotiation, GOAWAY.
    SessionError,
    /// Engine-reported failure scoped to a single stream.
    Stream,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(Inner { kind, source: None }),
        }
    }

    #[must_use = "Error builder methods return a new Error and should be used"]
    pub(crate) fn with<E: Into<Box<dyn StdError + Send + Sync>>>(mut self, source: E) -> Error {
        self.inner.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.inner.kind, Kind::ProtocolViolation)
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidState)
    }

    pub fn is_push_disabled(&self) -> bool {
        matches!(self.inner.kind, Kind::PushDisabled)
    }

    pub fn is_connect_failure(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectFailure)
    }

    pub fn is_session_error(&self) -> bool {
        matches!(self.inner.kind, Kind::SessionError)
    }

    pub fn is_stream_error(&self) -> bool {
        matches!(self.inner.kind, Kind::Stream)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("strand::Error");

        f.field("kind", &self.inner.kind);

        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }

        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.inner.kind {
            Kind::ProtocolViolation => "protocol violation",
            Kind::InvalidState => "operation invalid in current state",
            Kind::PushDisabled => "server push is disabled",
            Kind::ConnectFailure => "error establishing connection",
            Kind::SessionError => "session-level error",
            Kind::Stream => "stream-level error",
        };
        if let Some(ref source) = self.inner.source {
            write!(f, "{msg}: {source}")
        } else {
            f.write_str(msg)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|err| &**err as &(dyn StdError + 'static))
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Error {
        // `reason()` alone would also match GOAWAY codes, which are
        // session-scoped; only a stream reset is a stream error.
        let kind = if err.is_reset() {
            Kind::Stream
        } else {
            Kind::SessionError
        };
        Error::new(kind).with(err)
    }
}

// Constructors, kept free of formatting noise at call sites.

pub(crate) fn protocol_violation(msg: impl Into<String>) -> Error {
    Error::new(Kind::ProtocolViolation).with(msg.into())
}

pub(crate) fn invalid_state(msg: impl Into<String>) -> Error {
    Error::new(Kind::InvalidState).with(msg.into())
}

pub(crate) fn push_disabled() -> Error {
    Error::new(Kind::PushDisabled)
}

pub(crate) fn connect_failure<E: Into<Box<dyn StdError + Send + Sync>>>(source: E) -> Error {
    Error::new(Kind::ConnectFailure).with(source)
}

pub(crate) fn session_error<E: Into<Box<dyn StdError + Send + Sync>>>(source: E) -> Error {
    Error::new(Kind::SessionError).with(source)
}

/// Numeric reason code attached to abnormal stream termination.
///
/// `0` is a graceful finish. The distinguished [`ResetCode::SESSION_TERMINATED`]
/// value is delivered to every live stream when its owning session fails or
/// is force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResetCode(pub u32);

impl ResetCode {
    pub const NO_ERROR: ResetCode = ResetCode(0x0);
    pub const PROTOCOL_ERROR: ResetCode = ResetCode(0x1);
    pub const INTERNAL_ERROR: ResetCode = ResetCode(0x2);
    pub const REFUSED_STREAM: ResetCode = ResetCode(0x7);
    pub const CANCEL: ResetCode = ResetCode(0x8);
    /// Reset code observed by streams killed by session teardown. Numerically
    /// CANCEL (0x8), which is what the engine puts on the wire for them.
    pub const SESSION_TERMINATED: ResetCode = ResetCode(0x8);
}

impl From<h2::Reason> for ResetCode {
    fn from(reason: h2::Reason) -> ResetCode {
        ResetCode(u32::from(reason))
    }
}

impl From<ResetCode> for h2::Reason {
    fn from(code: ResetCode) -> h2::Reason {
        h2::Reason::from(code.0)
    }
}

impl fmt::Display for ResetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_kind() {
        assert!(protocol_violation("missing :path").is_protocol_violation());
        assert!(invalid_state("already responded").is_invalid_state());
        assert!(push_disabled().is_push_disabled());
        assert!(connect_failure("refused".to_string()).is_connect_failure());
        assert!(!push_disabled().is_invalid_state());
    }

    #[test]
    fn display_includes_source() {
        let err = invalid_state("response already sent");
        assert_eq!(
            err.to_string(),
            "operation invalid in current state: response already sent"
        );
        assert_eq!(push_disabled().to_string(), "server push is disabled");
    }

    #[test]
    fn clone_drops_source_but_keeps_kind() {
        let err = protocol_violation("bad header").clone();
        assert!(err.is_protocol_violation());
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn reset_code_round_trips_through_reason() {
        let code = ResetCode::CANCEL;
        let reason: h2::Reason = code.into();
        assert_eq!(ResetCode::from(reason), code);
        assert_eq!(ResetCode::SESSION_TERMINATED, ResetCode(0x8));
    }
}
