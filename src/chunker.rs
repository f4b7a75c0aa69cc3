//! Splits oversized messages into bounded, ordered chunks.
//!
//! Messages at or under the chunk limit travel as one self-contained
//! [`Frame::Message`]. Anything larger becomes a [`Frame::BeginMessage`]
//! declaring the total length, followed by ordered [`Frame::MessageChunk`]s.
//! Emission is a lazy iterator: the caller transmits each chunk, awaiting
//! downstream backpressure, before pulling the next one.
//!
//! The final chunk is never a tiny straggler. Once cutting a full-size chunk
//! would leave less than half the limit behind, the remainder splits into two
//! near-equal chunks instead, with the first rounded up to the configured
//! alignment and capped at the limit.

use bytes::Bytes;

use crate::{config::TransportOptions, frame::Frame};

/// Chunking parameters: the size cap and the encode alignment.
#[derive(Clone, Copy, Debug)]
pub struct MessageChunker {
    max_chunk_size: usize,
    alignment: usize,
}

impl MessageChunker {
    /// Create a chunker. A `max_chunk_size` of 0 disables chunking entirely.
    #[must_use]
    pub const fn new(max_chunk_size: usize, alignment: usize) -> Self {
        Self {
            max_chunk_size,
            alignment: if alignment == 0 { 1 } else { alignment },
        }
    }

    /// Build a chunker from negotiated options.
    #[must_use]
    pub const fn from_options(options: &TransportOptions) -> Self {
        Self::new(options.max_send_chunk_size, options.encode_alignment)
    }

    /// Split `message` for `stream_id` into an ordered frame sequence.
    #[must_use]
    pub fn chunk(&self, stream_id: u32, message: Bytes) -> MessageChunks {
        let state = if self.max_chunk_size == 0 || message.len() <= self.max_chunk_size {
            ChunkState::Whole
        } else {
            ChunkState::Announce
        };
        MessageChunks {
            stream_id,
            total: message.len() as u64,
            remaining: message,
            max_chunk_size: self.max_chunk_size,
            alignment: self.alignment,
            state,
        }
    }

    /// Length of the next chunk to cut from `remaining` bytes.
    fn next_chunk_len(max: usize, alignment: usize, remaining: usize) -> usize {
        if remaining <= max {
            return remaining;
        }
        if remaining - max >= max / 2 {
            return max;
        }
        // Straggler zone: split the remainder into two near-equal chunks,
        // first one rounded up to a whole number of alignment units.
        let units = remaining.div_ceil(alignment);
        let first = (units.div_ceil(2) * alignment).min(max);
        if first == 0 || first >= remaining {
            remaining.div_ceil(2)
        } else {
            first
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ChunkState {
    /// Message fits in one frame.
    Whole,
    /// Begin-message announcement not yet emitted.
    Announce,
    /// Chunks being cut.
    Streaming,
    Done,
}

/// Lazy, ordered frame sequence produced by [`MessageChunker::chunk`].
#[derive(Debug)]
pub struct MessageChunks {
    stream_id: u32,
    total: u64,
    remaining: Bytes,
    max_chunk_size: usize,
    alignment: usize,
    state: ChunkState,
}

impl Iterator for MessageChunks {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        match self.state {
            ChunkState::Whole => {
                self.state = ChunkState::Done;
                Some(Frame::Message {
                    stream_id: self.stream_id,
                    payload: std::mem::take(&mut self.remaining),
                })
            }
            ChunkState::Announce => {
                self.state = ChunkState::Streaming;
                Some(Frame::BeginMessage {
                    stream_id: self.stream_id,
                    length: self.total,
                })
            }
            ChunkState::Streaming => {
                let len = MessageChunker::next_chunk_len(
                    self.max_chunk_size,
                    self.alignment,
                    self.remaining.len(),
                );
                let payload = self.remaining.split_to(len);
                if self.remaining.is_empty() {
                    self.state = ChunkState::Done;
                }
                Some(Frame::MessageChunk {
                    stream_id: self.stream_id,
                    payload,
                })
            }
            ChunkState::Done => None,
        }
    }
}
