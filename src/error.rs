//! Error taxonomy for the frame transport.
//!
//! Failures fall into three families: protocol violations, which are fatal to
//! the whole connection rather than a single stream; I/O failures on any
//! endpoint, which escalate to closing the entire transport; and intentional
//! shutdown, which reaches every blocked waiter as a [`CloseStatus`]. The
//! control and data channels are not independently recoverable, so there is
//! no per-channel error variant.

use std::sync::Arc;

use thiserror::Error;

use crate::wire::PayloadTag;

/// Violations of the wire protocol. Always fatal to the transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A control header carried a frame-type byte with no known meaning.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    /// A payload tag did not fit in the 56 bits the control header affords.
    #[error("payload tag {0} exceeds 56 bits")]
    TagOverflow(u64),
    /// A tagged payload arrived with a different length than its control
    /// header declared.
    #[error("payload length mismatch for tag {tag}: declared {declared}, delivered {delivered}")]
    LengthMismatch {
        tag: PayloadTag,
        declared: usize,
        delivered: usize,
    },
    /// Two reads were issued for the same outstanding payload tag.
    #[error("duplicate read for tag {0}")]
    DuplicateRead(PayloadTag),
    /// A payload length exceeded the negotiated receive limit or the wire's
    /// length field.
    #[error("payload of {len} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge { len: usize, limit: usize },
    /// A frame kind that carries no payload arrived with payload bytes.
    #[error("unexpected payload of {len} bytes on {frame_type} frame")]
    UnexpectedPayload { frame_type: &'static str, len: usize },
}

/// Reason the transport stopped, carried to every blocked waiter.
///
/// Shutdown and failure share the same propagation path and differ only in
/// the carried status: [`CloseStatus::ok`] for an intentional close, a
/// message otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseStatus {
    message: Option<Arc<str>>,
}

impl CloseStatus {
    /// Status for an intentional, error-free close.
    #[must_use]
    pub const fn ok() -> Self { Self { message: None } }

    /// Status describing a failure.
    #[must_use]
    pub fn failed(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    /// Whether this status represents an error-free close.
    #[must_use]
    pub const fn is_ok(&self) -> bool { self.message.is_none() }

    /// Replace an ok status with the generic "transport closed" message, so
    /// waiters failed by a clean shutdown still observe a reason.
    #[must_use]
    pub fn or_closed(self) -> Self {
        match self.message {
            Some(_) => self,
            None => Self::failed("transport closed"),
        }
    }
}

impl std::fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => f.write_str("transport closed"),
        }
    }
}

impl From<&TransportError> for CloseStatus {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::Closed(status) => status.clone(),
            other => Self::failed(other.to_string()),
        }
    }
}

/// Top-level error surfaced by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// An endpoint's underlying byte stream failed.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport was closed while the operation was outstanding.
    #[error("transport closed: {0}")]
    Closed(CloseStatus),
}

impl TransportError {
    /// Shorthand for [`TransportError::Closed`] with an ok status.
    #[must_use]
    pub const fn closed() -> Self { Self::Closed(CloseStatus::ok()) }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
