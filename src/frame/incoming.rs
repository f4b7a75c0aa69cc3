//! Incoming frames whose payload may resolve after the header.
//!
//! Control headers for tagged frames arrive before their payload, which
//! travels separately on a data connection. [`IncomingFrame`] carries the
//! parsed header immediately and resolves the payload lazily, so a reader is
//! never head-of-line blocked behind a payload still in flight elsewhere.

use bytes::Bytes;

use super::{Frame, FrameHeader};
use crate::{
    error::{ProtocolError, Result},
    input_queue::ReadTicket,
};

/// Payload of an [`IncomingFrame`]: already present, or pending delivery on a
/// data connection.
#[derive(Debug)]
pub enum IncomingPayload {
    /// Payload that arrived inline on the control channel.
    Inline(Bytes),
    /// Payload still travelling on a data connection, keyed by its tag.
    Pending(ReadTicket),
}

/// A reassembling frame: header now, payload possibly later.
#[derive(Debug)]
pub struct IncomingFrame {
    header: FrameHeader,
    payload: IncomingPayload,
}

impl IncomingFrame {
    pub(crate) fn inline(header: FrameHeader, payload: Bytes) -> Self {
        debug_assert_eq!(payload.len(), header.payload_len as usize);
        Self {
            header,
            payload: IncomingPayload::Inline(payload),
        }
    }

    pub(crate) fn pending(header: FrameHeader, ticket: ReadTicket) -> Self {
        Self {
            header,
            payload: IncomingPayload::Pending(ticket),
        }
    }

    /// The parsed control header, available before the payload.
    #[must_use]
    pub const fn header(&self) -> &FrameHeader { &self.header }

    /// Whether the payload arrived inline on the control channel.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self.payload, IncomingPayload::Inline(_))
    }

    /// Await the payload and build the logical frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::LengthMismatch`] when the delivered payload
    /// disagrees with the declared length (fatal to the transport), a
    /// protocol error when the payload is malformed for the frame kind, or
    /// the close status if the transport shut down before delivery.
    pub async fn resolve(self) -> Result<Frame> {
        let declared = self.header.payload_len as usize;
        let payload = match self.payload {
            IncomingPayload::Inline(bytes) => bytes,
            IncomingPayload::Pending(ticket) => {
                let tag = ticket.tag();
                let bytes = ticket.complete().await?;
                if bytes.len() != declared {
                    return Err(ProtocolError::LengthMismatch {
                        tag,
                        declared,
                        delivered: bytes.len(),
                    }
                    .into());
                }
                bytes
            }
        };
        Ok(Frame::from_header(self.header, payload)?)
    }
}
