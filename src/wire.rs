//! Fixed-layout header codecs and alignment arithmetic.
//!
//! Two headers exist on the wire. The control channel carries a 24-byte
//! header combining the frame type and payload tag in one little-endian u64,
//! followed by the stream id and payload length; the trailing eight bytes are
//! reserved and zero. Each data connection prefixes payload bytes with a
//! 20-byte header of tag, send timestamp, and payload length. Both are packed
//! by hand: the layouts are contractual and leave no room for a generic
//! serializer.

use crate::{
    error::ProtocolError,
    frame::{FrameHeader, FrameType},
};

/// Encoded size of a control-channel header.
pub const CONTROL_HEADER_LEN: usize = 24;

/// Encoded size of a data-channel header: {tag: 8, timestamp: 8, length: 4}.
pub const DATA_HEADER_LEN: usize = 20;

/// Correlation id linking a control-channel header to a payload delivered on
/// a data connection.
///
/// Tag 0 is reserved: on the control channel it means the payload follows
/// inline, and on a data connection it marks the out-of-band security-frame
/// side channel. Tags share the control header's u64 with the frame-type
/// byte, so only 56 bits are usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadTag(u64);

impl PayloadTag {
    /// The reserved tag: inline payload on the control channel, security
    /// side channel on a data connection.
    pub const CONTROL: Self = Self(0);

    /// Largest encodable tag (56 bits).
    pub const MAX: Self = Self((1 << 56) - 1);

    /// Wrap a raw tag value without validation. Encoding validates range.
    #[must_use]
    pub const fn new(tag: u64) -> Self { Self(tag) }

    /// Return the raw tag value.
    #[must_use]
    pub const fn get(self) -> u64 { self.0 }

    /// Whether this is the reserved tag 0.
    #[must_use]
    pub const fn is_control(self) -> bool { self.0 == 0 }
}

impl From<u64> for PayloadTag {
    fn from(value: u64) -> Self { Self(value) }
}

impl From<PayloadTag> for u64 {
    fn from(value: PayloadTag) -> Self { value.0 }
}

impl std::fmt::Display for PayloadTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bytes of filler needed so `len` bytes end on an `alignment` boundary.
///
/// Zero when already aligned.
#[must_use]
pub const fn padding(len: usize, alignment: usize) -> usize {
    let rem = len % alignment;
    if rem == 0 { 0 } else { alignment - rem }
}

/// Validate a payload length against the wire's u32 length field.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] when `len` does not fit.
pub(crate) fn checked_payload_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge {
        len,
        limit: u32::MAX as usize,
    })
}

/// Control-channel header: a [`FrameHeader`] plus the payload tag.
///
/// Tag 0 means the payload follows immediately on the control channel;
/// nonzero tags announce a payload travelling on a data connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlHeader {
    pub header: FrameHeader,
    pub payload_tag: PayloadTag,
}

impl ControlHeader {
    /// Header for an inline (tag 0) frame.
    #[must_use]
    pub const fn inline(header: FrameHeader) -> Self {
        Self {
            header,
            payload_tag: PayloadTag::CONTROL,
        }
    }

    /// Serialize into the fixed 24-byte control layout.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::TagOverflow`] when the tag exceeds 56 bits;
    /// the tag allocator never produces such values, so hitting this is a
    /// caller contract violation.
    pub fn encode(&self) -> Result<[u8; CONTROL_HEADER_LEN], ProtocolError> {
        if self.payload_tag > PayloadTag::MAX {
            return Err(ProtocolError::TagOverflow(self.payload_tag.get()));
        }
        let mut buf = [0u8; CONTROL_HEADER_LEN];
        let type_and_tag =
            u64::from(self.header.frame_type.as_byte()) | (self.payload_tag.get() << 8);
        buf[0..8].copy_from_slice(&type_and_tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.header.stream_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.header.payload_len.to_le_bytes());
        Ok(buf)
    }

    /// Parse the fixed 24-byte control layout.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownFrameType`] when the low byte names no
    /// known frame kind.
    pub fn decode(buf: &[u8; CONTROL_HEADER_LEN]) -> Result<Self, ProtocolError> {
        let type_and_tag = u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice"));
        #[expect(
            clippy::cast_possible_truncation,
            reason = "low byte of the combined field is the frame type by layout"
        )]
        let frame_type = FrameType::from_byte(type_and_tag as u8)?;
        let payload_tag = PayloadTag::new(type_and_tag >> 8);
        let stream_id = u32::from_le_bytes(buf[8..12].try_into().expect("4-byte slice"));
        let payload_len = u32::from_le_bytes(buf[12..16].try_into().expect("4-byte slice"));
        Ok(Self {
            header: FrameHeader {
                frame_type,
                stream_id,
                payload_len,
            },
            payload_tag,
        })
    }
}

/// Data-channel header preceding payload bytes on a data connection.
///
/// The timestamp is transport-clock nanoseconds at the moment the sending
/// loop serialized the batch; the receiver may feed it to RTT estimation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub payload_tag: PayloadTag,
    pub send_timestamp_ns: u64,
    pub payload_len: u32,
}

impl DataHeader {
    /// Serialize into the fixed 20-byte data layout.
    #[must_use]
    pub fn encode(&self) -> [u8; DATA_HEADER_LEN] {
        let mut buf = [0u8; DATA_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.payload_tag.get().to_le_bytes());
        buf[8..16].copy_from_slice(&self.send_timestamp_ns.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Parse the fixed 20-byte data layout.
    ///
    /// All field values are representable, so parsing cannot fail; tag
    /// semantics are the reader's concern.
    #[must_use]
    pub fn decode(buf: &[u8; DATA_HEADER_LEN]) -> Self {
        Self {
            payload_tag: PayloadTag::new(u64::from_le_bytes(
                buf[0..8].try_into().expect("8-byte slice"),
            )),
            send_timestamp_ns: u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
            payload_len: u32::from_le_bytes(buf[16..20].try_into().expect("4-byte slice")),
        }
    }
}
