//! Logical frame model for the transport.
//!
//! A [`Frame`] is the unit callers write and read: a tagged variant over the
//! protocol's frame kinds, each carrying a stream id and, where the kind has
//! one, a payload. [`FrameHeader`] is the wire-agnostic description used by
//! the header codec; [`IncomingFrame`] defers payload resolution for frames
//! whose bytes travel on a data connection and may arrive after the header.

mod incoming;

pub use incoming::{IncomingFrame, IncomingPayload};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{error::ProtocolError, wire::checked_payload_len};

/// Discriminant byte identifying a frame kind on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Settings exchange; always stream 0.
    Settings = 0x00,
    /// Metadata opening a stream.
    InitialMetadata = 0x80,
    /// Metadata closing a stream.
    TrailingMetadata = 0x81,
    /// Half-close marker for a stream.
    EndOfStream = 0x82,
    /// A complete, unchunked message.
    Message = 0xa0,
    /// Announces a chunked message and its total length.
    BeginMessage = 0xa1,
    /// One ordered chunk of a previously announced message.
    MessageChunk = 0xa2,
    /// Stream cancellation.
    Cancel = 0xff,
}

impl FrameType {
    /// Parse a frame-type byte.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownFrameType`] for bytes with no assigned
    /// meaning; an unknown type is fatal to the whole connection.
    pub const fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Self::Settings),
            0x80 => Ok(Self::InitialMetadata),
            0x81 => Ok(Self::TrailingMetadata),
            0x82 => Ok(Self::EndOfStream),
            0xa0 => Ok(Self::Message),
            0xa1 => Ok(Self::BeginMessage),
            0xa2 => Ok(Self::MessageChunk),
            0xff => Ok(Self::Cancel),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    /// Return the wire byte for this kind.
    #[must_use]
    pub const fn as_byte(self) -> u8 { self as u8 }

    /// Human-readable kind name used in diagnostics and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::InitialMetadata => "initial-metadata",
            Self::TrailingMetadata => "trailing-metadata",
            Self::EndOfStream => "end-of-stream",
            Self::Message => "message",
            Self::BeginMessage => "begin-message",
            Self::MessageChunk => "message-chunk",
            Self::Cancel => "cancel",
        }
    }

    /// Whether this kind carries payload bytes on the wire.
    #[must_use]
    pub const fn has_payload(self) -> bool {
        !matches!(self, Self::EndOfStream | Self::Cancel)
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire-agnostic description of a frame: its kind, stream, and payload size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload_len: u32,
}

/// A logical frame travelling through the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Settings exchange payload; settings ride stream 0.
    Settings { payload: Bytes },
    /// Metadata opening `stream_id`.
    InitialMetadata { stream_id: u32, payload: Bytes },
    /// Metadata closing `stream_id`.
    TrailingMetadata { stream_id: u32, payload: Bytes },
    /// Half-close for `stream_id`.
    EndOfStream { stream_id: u32 },
    /// A complete message for `stream_id`.
    Message { stream_id: u32, payload: Bytes },
    /// Announces a chunked message totalling `length` bytes.
    BeginMessage { stream_id: u32, length: u64 },
    /// One ordered chunk of an announced message.
    MessageChunk { stream_id: u32, payload: Bytes },
    /// Cancels `stream_id`.
    Cancel { stream_id: u32 },
}

/// Byte length of the encoded [`Frame::BeginMessage`] payload (LE u64).
const BEGIN_MESSAGE_PAYLOAD_LEN: usize = 8;

impl Frame {
    /// Return the frame's kind.
    #[must_use]
    pub const fn frame_type(&self) -> FrameType {
        match self {
            Self::Settings { .. } => FrameType::Settings,
            Self::InitialMetadata { .. } => FrameType::InitialMetadata,
            Self::TrailingMetadata { .. } => FrameType::TrailingMetadata,
            Self::EndOfStream { .. } => FrameType::EndOfStream,
            Self::Message { .. } => FrameType::Message,
            Self::BeginMessage { .. } => FrameType::BeginMessage,
            Self::MessageChunk { .. } => FrameType::MessageChunk,
            Self::Cancel { .. } => FrameType::Cancel,
        }
    }

    /// Return the stream this frame belongs to. Settings frames ride the
    /// reserved stream 0.
    #[must_use]
    pub const fn stream_id(&self) -> u32 {
        match self {
            Self::Settings { .. } => 0,
            Self::InitialMetadata { stream_id, .. }
            | Self::TrailingMetadata { stream_id, .. }
            | Self::EndOfStream { stream_id }
            | Self::Message { stream_id, .. }
            | Self::BeginMessage { stream_id, .. }
            | Self::MessageChunk { stream_id, .. }
            | Self::Cancel { stream_id } => *stream_id,
        }
    }

    /// Serialize the frame's payload bytes. Cheap for the common case: all
    /// payload-carrying variants hold [`Bytes`] and clone by reference count.
    #[must_use]
    pub fn payload_bytes(&self) -> Bytes {
        match self {
            Self::Settings { payload }
            | Self::InitialMetadata { payload, .. }
            | Self::TrailingMetadata { payload, .. }
            | Self::Message { payload, .. }
            | Self::MessageChunk { payload, .. } => payload.clone(),
            Self::BeginMessage { length, .. } => {
                let mut buf = BytesMut::with_capacity(BEGIN_MESSAGE_PAYLOAD_LEN);
                buf.put_u64_le(*length);
                buf.freeze()
            }
            Self::EndOfStream { .. } | Self::Cancel { .. } => Bytes::new(),
        }
    }

    /// Build the wire-agnostic header for this frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] when the payload exceeds
    /// the wire's u32 length field; the chunker bounds its output well below
    /// that, so this only trips on unchunked caller payloads.
    pub fn header(&self) -> Result<FrameHeader, ProtocolError> {
        let payload_len = match self {
            Self::Settings { payload }
            | Self::InitialMetadata { payload, .. }
            | Self::TrailingMetadata { payload, .. }
            | Self::Message { payload, .. }
            | Self::MessageChunk { payload, .. } => checked_payload_len(payload.len())?,
            Self::BeginMessage { .. } => BEGIN_MESSAGE_PAYLOAD_LEN as u32,
            Self::EndOfStream { .. } | Self::Cancel { .. } => 0,
        };
        Ok(FrameHeader {
            frame_type: self.frame_type(),
            stream_id: self.stream_id(),
            payload_len,
        })
    }

    /// Rebuild a frame from a parsed header and its delivered payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedPayload`] when bytes accompany a
    /// payload-free kind, or when a begin-message payload is not the 8-byte
    /// length encoding.
    pub fn from_header(header: FrameHeader, payload: Bytes) -> Result<Self, ProtocolError> {
        let stream_id = header.stream_id;
        match header.frame_type {
            FrameType::Settings => Ok(Self::Settings { payload }),
            FrameType::InitialMetadata => Ok(Self::InitialMetadata { stream_id, payload }),
            FrameType::TrailingMetadata => Ok(Self::TrailingMetadata { stream_id, payload }),
            FrameType::Message => Ok(Self::Message { stream_id, payload }),
            FrameType::MessageChunk => Ok(Self::MessageChunk { stream_id, payload }),
            FrameType::BeginMessage => {
                let bytes: [u8; BEGIN_MESSAGE_PAYLOAD_LEN] =
                    payload.as_ref().try_into().map_err(|_| {
                        ProtocolError::UnexpectedPayload {
                            frame_type: FrameType::BeginMessage.name(),
                            len: payload.len(),
                        }
                    })?;
                Ok(Self::BeginMessage {
                    stream_id,
                    length: u64::from_le_bytes(bytes),
                })
            }
            FrameType::EndOfStream | FrameType::Cancel => {
                if !payload.is_empty() {
                    return Err(ProtocolError::UnexpectedPayload {
                        frame_type: header.frame_type.name(),
                        len: payload.len(),
                    });
                }
                match header.frame_type {
                    FrameType::EndOfStream => Ok(Self::EndOfStream { stream_id }),
                    _ => Ok(Self::Cancel { stream_id }),
                }
            }
        }
    }
}
