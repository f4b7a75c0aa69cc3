//! Negotiated transport options.
//!
//! Both peers exchange their preferences once, during the control-channel
//! settings handshake, and the resolved values stay fixed for the life of
//! the transport. The settings payload format itself is external; this
//! module only models the resolved values and the merge rule.

/// Resolved per-transport configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    /// Alignment for payloads this peer encodes onto data connections.
    pub encode_alignment: usize,
    /// Alignment this peer expects on payloads it decodes.
    pub decode_alignment: usize,
    /// Largest chunk this peer will send; 0 disables chunking.
    pub max_send_chunk_size: usize,
    /// Largest chunk this peer accepts.
    pub max_recv_chunk_size: usize,
    /// Payloads at or under this size always ride the control channel.
    pub inline_payload_threshold: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            encode_alignment: 64,
            decode_alignment: 64,
            max_send_chunk_size: 1024 * 1024,
            max_recv_chunk_size: 1024 * 1024,
            inline_payload_threshold: 8 * 1024,
        }
    }
}

impl TransportOptions {
    /// Merge this peer's preferences with the remote's advertised settings.
    ///
    /// Chunk sizes take the minimum of what we send and what the peer
    /// receives (and vice versa); alignments must agree exactly, since both
    /// sides pad and strip with the same arithmetic.
    ///
    /// Returns `None` when the alignments are incompatible, which aborts the
    /// handshake.
    #[must_use]
    pub fn merge_negotiated(self, remote: &Self) -> Option<Self> {
        if self.encode_alignment != remote.decode_alignment
            || self.decode_alignment != remote.encode_alignment
        {
            return None;
        }
        Some(Self {
            encode_alignment: self.encode_alignment,
            decode_alignment: self.decode_alignment,
            max_send_chunk_size: merge_chunk_size(self.max_send_chunk_size, remote.max_recv_chunk_size),
            max_recv_chunk_size: merge_chunk_size(self.max_recv_chunk_size, remote.max_send_chunk_size),
            inline_payload_threshold: self.inline_payload_threshold,
        })
    }

    /// Whether a peer-declared payload length respects the receive limit.
    ///
    /// A limit of 0 means unchunked and accepts any length the wire can
    /// describe.
    #[must_use]
    pub const fn accepts_recv_len(&self, len: usize) -> bool {
        self.max_recv_chunk_size == 0 || len <= self.max_recv_chunk_size
    }
}

/// Minimum of two chunk limits, where 0 means "unchunked" and defers to the
/// other side's limit.
fn merge_chunk_size(ours: usize, theirs: usize) -> usize {
    match (ours, theirs) {
        (0, other) | (other, 0) => other,
        (a, b) => a.min(b),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let options = TransportOptions::default();
        assert_eq!(options.encode_alignment, 64);
        assert_eq!(options.decode_alignment, 64);
        assert_eq!(options.max_send_chunk_size, 1024 * 1024);
        assert_eq!(options.max_recv_chunk_size, 1024 * 1024);
        assert_eq!(options.inline_payload_threshold, 8 * 1024);
    }

    #[rstest]
    #[case(1024, 512, 512)]
    #[case(512, 1024, 512)]
    #[case(0, 1024, 1024)]
    #[case(1024, 0, 1024)]
    #[case(0, 0, 0)]
    fn chunk_sizes_take_the_smaller_limit(
        #[case] ours: usize,
        #[case] theirs: usize,
        #[case] expected: usize,
    ) {
        let local = TransportOptions {
            max_send_chunk_size: ours,
            ..TransportOptions::default()
        };
        let remote = TransportOptions {
            max_recv_chunk_size: theirs,
            ..TransportOptions::default()
        };
        let merged = local.merge_negotiated(&remote).expect("alignments agree");
        assert_eq!(merged.max_send_chunk_size, expected);
    }

    #[rstest]
    #[case(1024, 512, true)]
    #[case(1024, 1024, true)]
    #[case(1024, 1025, false)]
    #[case(0, 1 << 30, true)]
    fn receive_limit_bounds_declared_lengths(
        #[case] limit: usize,
        #[case] len: usize,
        #[case] accepted: bool,
    ) {
        let options = TransportOptions {
            max_recv_chunk_size: limit,
            ..TransportOptions::default()
        };
        assert_eq!(options.accepts_recv_len(len), accepted);
    }

    #[test]
    fn mismatched_alignment_fails_negotiation() {
        let remote = TransportOptions {
            decode_alignment: 128,
            ..TransportOptions::default()
        };
        assert_eq!(TransportOptions::default().merge_negotiated(&remote), None);
    }
}
