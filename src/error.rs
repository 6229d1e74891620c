//! Defines error handling constructs for murmur.
//!
//! This module centralizes the error types used throughout the node runtime. [`ErrorCode`] is the set of
//! wire-level codes carried in `error` replies, [`NodeError`] is what a handler returns when a request cannot be
//! served, and the remaining types describe failures of the runtime itself: undecodable input lines, duplicate
//! handler registration, and sending on a closed outbox.

use std::{any::Any, borrow::Cow, error, fmt, num::ParseIntError};

use serde::{Deserialize, Serialize};

use crate::message::{Body, Envelope};

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Error codes understood by the protocol.
///
/// Each code serializes as its integer value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCode {
    /// The requested operation could not be completed within a timeout.
    Timeout,
    /// The destination node does not exist.
    NodeNotFound,
    /// The requested operation is not supported by this node.
    NotSupported,
    /// The operation definitely cannot be performed at this time.
    Unavailable,
    /// The request was malformed.
    Malformed,
    /// The node crashed while handling the request.
    Crashed,
    /// The operation was aborted.
    Aborted,
    /// The requested key does not exist.
    KeyNotExist,
    /// The key already exists.
    KeyAlreadyExist,
    /// A precondition of the request did not hold.
    PreconditionFailed,
    /// A transaction conflicted with another.
    TxConflict,
}

impl ErrorCode {
    /// Returns the integer code sent on the wire.
    pub const fn code(self) -> u32 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::Unavailable => 11,
            ErrorCode::Malformed => 12,
            ErrorCode::Crashed => 13,
            ErrorCode::Aborted => 14,
            ErrorCode::KeyNotExist => 20,
            ErrorCode::KeyAlreadyExist => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxConflict => 30,
        }
    }

    /// Looks up an error code by its integer wire value.
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::Unavailable,
            12 => ErrorCode::Malformed,
            13 => ErrorCode::Crashed,
            14 => ErrorCode::Aborted,
            20 => ErrorCode::KeyNotExist,
            21 => ErrorCode::KeyAlreadyExist,
            22 => ErrorCode::PreconditionFailed,
            30 => ErrorCode::TxConflict,
            _ => return None,
        })
    }

    /// The canonical human readable text for this code.
    pub const fn text(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "Timed out",
            ErrorCode::NodeNotFound => "Node not found",
            ErrorCode::NotSupported => "Operation not supported",
            ErrorCode::Unavailable => "Temporary unavailable",
            ErrorCode::Malformed => "Malformed request",
            ErrorCode::Crashed => "Crashed",
            ErrorCode::Aborted => "Aborted",
            ErrorCode::KeyNotExist => "Key does not exist",
            ErrorCode::KeyAlreadyExist => "Key already exist",
            ErrorCode::PreconditionFailed => "Precondition failed",
            ErrorCode::TxConflict => "Transaction conflict",
        }
    }

    /// Returns `true` if an error with this code guarantees the operation did not take place.
    ///
    /// A timeout or a crash may have happened after the operation was applied, so those are indefinite.
    pub const fn is_definite(self) -> bool {
        !matches!(self, ErrorCode::Timeout | ErrorCode::Crashed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text(), self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = u32::deserialize(deserializer)?;
        ErrorCode::from_code(code).ok_or_else(|| {
            serde::de::Error::invalid_value(
                serde::de::Unexpected::Unsigned(code.into()),
                &"a known error code",
            )
        })
    }
}

/// An error returned by a handler, sent back to the requester as an `error` reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeError {
    code: ErrorCode,
    text: Cow<'static, str>,
}

impl NodeError {
    /// Creates an error with a custom description.
    pub fn new(code: ErrorCode, text: impl Into<Cow<'static, str>>) -> Self {
        NodeError {
            code,
            text: text.into(),
        }
    }

    /// Shorthand for a [`ErrorCode::Malformed`] error with the canonical text.
    pub fn malformed() -> Self {
        ErrorCode::Malformed.into()
    }

    /// Shorthand for a [`ErrorCode::NotSupported`] error with the canonical text.
    pub fn not_supported() -> Self {
        ErrorCode::NotSupported.into()
    }

    /// The error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The error description.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn into_parts(self) -> (ErrorCode, String) {
        (self.code, self.text.into_owned())
    }
}

impl From<ErrorCode> for NodeError {
    fn from(code: ErrorCode) -> Self {
        NodeError {
            code,
            text: Cow::Borrowed(code.text()),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.text)
    }
}

impl error::Error for NodeError {}

/// An input line that could not be decoded into an envelope and probe.
///
/// Whatever addressing could be recovered from the line is kept so an error reply can still be routed.
#[derive(Debug)]
pub struct DecodeError {
    /// The `src` field, if one could be read.
    pub src: Option<String>,
    /// The `dest` field, if one could be read.
    pub dest: Option<String>,
    /// The body's `msg_id`, if one could be read.
    pub msg_id: Option<u64>,
    err: serde_json::Error,
}

impl DecodeError {
    pub(crate) fn json(err: serde_json::Error) -> Self {
        DecodeError {
            src: None,
            dest: None,
            msg_id: None,
            err,
        }
    }

    /// Always [`ErrorCode::Malformed`].
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Malformed
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid message: {}", self.err)
    }
}

impl error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.err)
    }
}

/// A panic caught while running a handler.
pub struct PanicError(Box<dyn Any + Send>);

impl PanicError {
    /// Wraps a panic payload returned by `catch_unwind` or a panicked task.
    pub fn new(payload: Box<dyn Any + Send>) -> Self {
        PanicError(payload)
    }

    /// Returns the panic message if the payload is a string, as produced by [`std::panic!`].
    pub fn as_str(&self) -> Option<&str> {
        self.0
            .downcast_ref::<&'static str>()
            .copied()
            .or_else(|| self.0.downcast_ref::<String>().map(String::as_str))
    }
}

impl fmt::Debug for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicError").field(&self.as_str()).finish()
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(msg) => write!(f, "panicked: {msg}"),
            None => write!(f, "panicked"),
        }
    }
}

impl error::Error for PanicError {}

/// An error that can occur when registering handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler is already registered for this message type.
    DuplicateHandler(Cow<'static, str>),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateHandler(kind) => {
                write!(f, "handler for '{kind}' registered twice")
            }
        }
    }
}

impl error::Error for RegistryError {}

/// Error returned when sending on an outbox whose writer has stopped.
///
/// The unsent envelope is handed back.
#[derive(Clone, Debug, PartialEq)]
pub struct SendError(pub Envelope<Body>);

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbox closed")
    }
}

impl error::Error for SendError {}

/// Error returned when loading a [`Config`](crate::config::Config).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    Invalid {
        /// The variable name.
        var: &'static str,
        /// The parse failure.
        err: ParseIntError,
    },
    /// A capacity was set to zero.
    ZeroCapacity {
        /// The variable name.
        var: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, err } => write!(f, "invalid value for {var}: {err}"),
            ConfigError::ZeroCapacity { var } => write!(f, "{var} must be greater than zero"),
        }
    }
}

impl error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_round_trip_through_wire_values() {
        for code in [0, 1, 10, 11, 12, 13, 14, 20, 21, 22, 30] {
            let parsed = ErrorCode::from_code(code).unwrap();
            assert_eq!(parsed.code(), code);
        }
        assert_eq!(ErrorCode::from_code(2), None);
        assert_eq!(ErrorCode::from_code(31), None);
    }

    #[test]
    fn error_code_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&ErrorCode::Malformed).unwrap(), "12");
        assert_eq!(
            serde_json::from_str::<ErrorCode>("30").unwrap(),
            ErrorCode::TxConflict
        );
        assert!(serde_json::from_str::<ErrorCode>("15").is_err());
    }

    #[test]
    fn definite_codes() {
        assert!(!ErrorCode::Timeout.is_definite());
        assert!(!ErrorCode::Crashed.is_definite());
        assert!(ErrorCode::NotSupported.is_definite());
        assert!(ErrorCode::Malformed.is_definite());
    }

    #[test]
    fn node_error_defaults_to_canonical_text() {
        let err = NodeError::from(ErrorCode::NotSupported);
        assert_eq!(err.text(), "Operation not supported");
        assert_eq!(err.to_string(), "10: Operation not supported");

        let err = NodeError::new(ErrorCode::Unavailable, "try later");
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert_eq!(err.text(), "try later");
    }

    #[test]
    fn panic_error_extracts_message() {
        let err = PanicError::new(Box::new("boom"));
        assert_eq!(err.as_str(), Some("boom"));
        assert_eq!(err.to_string(), "panicked: boom");

        let err = PanicError::new(Box::new(String::from("owned")));
        assert_eq!(err.as_str(), Some("owned"));

        let err = PanicError::new(Box::new(7u8));
        assert_eq!(err.as_str(), None);
        assert_eq!(err.to_string(), "panicked");
    }
}
