//! Correlates tag-labelled payload arrivals with pending read requests.
//!
//! A tagged control header promises payload bytes that travel separately on
//! a data connection, in either order: the read request can land before the
//! bytes, or the bytes before the request. The queue holds whichever side
//! arrives first and resolves the pair as soon as both exist. Delivered tags
//! are remembered as a compacted high-water mark plus the out-of-order
//! stragglers above it, so duplicate deliveries stay idempotent without the
//! map growing over the transport's life (tags are allocated monotonically
//! from 1). Closing the transport fails every pending and future read with
//! the close status.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    error::{CloseStatus, ProtocolError, Result, TransportError},
    wire::PayloadTag,
};

/// One tag's progress through the correlation map.
#[derive(Debug)]
enum TagState {
    /// A read request is waiting for bytes.
    Waiting(oneshot::Sender<Result<Bytes, CloseStatus>>),
    /// Bytes arrived before any read request.
    Buffered(Bytes),
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<PayloadTag, TagState>,
    /// Every tag at or below this value has been delivered.
    retired_floor: u64,
    /// Delivered tags above the floor, awaiting compaction into it.
    retired: BTreeSet<u64>,
    closed: Option<CloseStatus>,
}

impl QueueState {
    fn is_retired(&self, tag: PayloadTag) -> bool {
        tag.get() <= self.retired_floor || self.retired.contains(&tag.get())
    }

    /// Record a delivered tag, folding any contiguous run into the floor.
    fn retire(&mut self, tag: PayloadTag) {
        let value = tag.get();
        if value <= self.retired_floor {
            return;
        }
        if value == self.retired_floor + 1 {
            self.retired_floor = value;
            while self.retired.remove(&(self.retired_floor + 1)) {
                self.retired_floor += 1;
            }
        } else {
            self.retired.insert(value);
        }
    }
}

/// Counters exposed by [`InputQueue::depths`] for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputQueueDepths {
    /// Reads waiting for payload bytes.
    pub pending_reads: usize,
    /// Payloads waiting for a read request.
    pub buffered_payloads: usize,
}

/// Outstanding read keyed by payload tag; resolves when the bytes arrive or
/// the transport closes.
#[derive(Debug)]
pub struct ReadTicket {
    tag: PayloadTag,
    receiver: oneshot::Receiver<Result<Bytes, CloseStatus>>,
}

impl ReadTicket {
    /// The tag this ticket is waiting on.
    #[must_use]
    pub const fn tag(&self) -> PayloadTag { self.tag }

    /// Await the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] carrying the close or cancellation
    /// status when the transport shut down before delivery.
    pub async fn complete(self) -> Result<Bytes> {
        match self.receiver.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(status)) => Err(TransportError::Closed(status)),
            // Sender dropped without a verdict: the queue itself went away.
            Err(_) => Err(TransportError::Closed(CloseStatus::ok().or_closed())),
        }
    }
}

/// Tag-to-completion correlation map.
#[derive(Debug, Default)]
pub struct InputQueue {
    state: std::sync::Mutex<QueueState>,
}

impl InputQueue {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Request the payload for `tag`.
    ///
    /// Resolves immediately when the bytes already arrived; otherwise the
    /// returned ticket suspends its holder until delivery, cancellation, or
    /// close.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateRead`] when a read for `tag` is
    /// already outstanding, or [`TransportError::Closed`] after
    /// [`set_closed`](Self::set_closed).
    pub fn read(&self, tag: PayloadTag) -> Result<ReadTicket> {
        let (sender, receiver) = oneshot::channel();
        let ticket = ReadTicket { tag, receiver };

        let mut state = self.lock();
        if let Some(status) = &state.closed {
            return Err(TransportError::Closed(status.clone()));
        }
        if state.is_retired(tag) || matches!(state.entries.get(&tag), Some(TagState::Waiting(_))) {
            return Err(ProtocolError::DuplicateRead(tag).into());
        }
        if let Some(TagState::Buffered(bytes)) = state.entries.remove(&tag) {
            state.retire(tag);
            // Receiver is still in hand, so the send cannot fail.
            let _ = sender.send(Ok(bytes));
        } else {
            state.entries.insert(tag, TagState::Waiting(sender));
        }
        Ok(ticket)
    }

    /// Deliver payload bytes for `tag`.
    ///
    /// Wakes a waiting read or buffers the bytes until one arrives. Tag 0
    /// and tags already delivered are ignored, making duplicate delivery
    /// idempotent.
    pub fn complete_read(&self, tag: PayloadTag, bytes: Bytes) {
        if tag.is_control() {
            return;
        }
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }
        if state.is_retired(tag) {
            debug!(%tag, "ignoring duplicate payload delivery");
            return;
        }
        match state.entries.remove(&tag) {
            Some(TagState::Waiting(sender)) => {
                state.retire(tag);
                // A dropped ticket is equivalent to a cancelled read.
                let _ = sender.send(Ok(bytes));
            }
            Some(buffered @ TagState::Buffered(_)) => {
                debug!(%tag, "ignoring duplicate payload delivery");
                state.entries.insert(tag, buffered);
            }
            None => {
                state.entries.insert(tag, TagState::Buffered(bytes));
            }
        }
    }

    /// Remove the pending read behind `ticket` and wake it with cancellation.
    pub fn cancel(&self, ticket: &ReadTicket) { self.cancel_tag(ticket.tag()); }

    /// Remove a pending read by tag, waking its waiter with cancellation.
    pub fn cancel_tag(&self, tag: PayloadTag) {
        let mut state = self.lock();
        if let Some(TagState::Waiting(sender)) = state.entries.remove(&tag) {
            let _ = sender.send(Err(CloseStatus::failed("read cancelled")));
        }
    }

    /// Fail every pending read, and all future ones, with `status`.
    ///
    /// An ok status is reported as "transport closed" so waiters always see
    /// a reason.
    pub fn set_closed(&self, status: CloseStatus) {
        let status = status.or_closed();
        let mut state = self.lock();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(status.clone());
        for (_, entry) in state.entries.drain() {
            if let TagState::Waiting(sender) = entry {
                let _ = sender.send(Err(status.clone()));
            }
        }
    }

    /// Current queue depths for diagnostics.
    #[must_use]
    pub fn depths(&self) -> InputQueueDepths {
        let state = self.lock();
        let mut depths = InputQueueDepths::default();
        for entry in state.entries.values() {
            match entry {
                TagState::Waiting(_) => depths.pending_reads += 1,
                TagState::Buffered(_) => depths.buffered_payloads += 1,
            }
        }
        depths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(value: u64) -> PayloadTag { PayloadTag::new(value) }

    #[tokio::test]
    async fn read_then_delivery_resolves() {
        let queue = InputQueue::new();
        let ticket = queue.read(tag(1)).expect("first read");
        queue.complete_read(tag(1), Bytes::from_static(b"payload"));
        assert_eq!(ticket.complete().await.expect("delivered"), "payload");
    }

    #[tokio::test]
    async fn delivery_then_read_resolves_immediately() {
        let queue = InputQueue::new();
        queue.complete_read(tag(2), Bytes::from_static(b"early"));
        let ticket = queue.read(tag(2)).expect("read after delivery");
        assert_eq!(ticket.complete().await.expect("buffered"), "early");
    }

    #[test]
    fn duplicate_read_fails_fast() {
        let queue = InputQueue::new();
        let _ticket = queue.read(tag(3)).expect("first read");
        assert!(matches!(
            queue.read(tag(3)),
            Err(TransportError::Protocol(ProtocolError::DuplicateRead(t))) if t == tag(3),
        ));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_ignored() {
        let queue = InputQueue::new();
        let ticket = queue.read(tag(4)).expect("read");
        queue.complete_read(tag(4), Bytes::from_static(b"first"));
        queue.complete_read(tag(4), Bytes::from_static(b"second"));
        assert_eq!(ticket.complete().await.expect("first wins"), "first");
    }

    #[tokio::test]
    async fn retired_tags_leave_no_state_behind() {
        let queue = InputQueue::new();
        for value in 1..=64 {
            let ticket = queue.read(tag(value)).expect("read");
            queue.complete_read(tag(value), Bytes::from_static(b"x"));
            ticket.complete().await.expect("delivered");
        }
        assert_eq!(queue.depths(), InputQueueDepths::default());

        // Late duplicates are still recognized without resurrecting state.
        queue.complete_read(tag(40), Bytes::from_static(b"dup"));
        assert_eq!(queue.depths(), InputQueueDepths::default());
        assert!(matches!(
            queue.read(tag(40)),
            Err(TransportError::Protocol(ProtocolError::DuplicateRead(t))) if t == tag(40),
        ));
    }

    #[tokio::test]
    async fn out_of_order_delivery_still_detects_duplicates() {
        let queue = InputQueue::new();
        for value in [3u64, 1, 2] {
            let ticket = queue.read(tag(value)).expect("read");
            queue.complete_read(tag(value), Bytes::from_static(b"x"));
            ticket.complete().await.expect("delivered");
        }
        for value in 1..=3 {
            assert!(
                matches!(
                    queue.read(tag(value)),
                    Err(TransportError::Protocol(ProtocolError::DuplicateRead(_))),
                ),
                "tag {value} must stay retired",
            );
        }
        let _ticket = queue.read(tag(4)).expect("fresh tag still reads");
        assert_eq!(queue.depths().pending_reads, 1);
    }

    #[test]
    fn control_tag_deliveries_are_dropped() {
        let queue = InputQueue::new();
        queue.complete_read(PayloadTag::CONTROL, Bytes::from_static(b"oob"));
        assert_eq!(queue.depths(), InputQueueDepths::default());
    }

    #[tokio::test]
    async fn cancel_wakes_the_waiter() {
        let queue = InputQueue::new();
        let ticket = queue.read(tag(5)).expect("read");
        queue.cancel_tag(tag(5));
        let error = ticket.complete().await.expect_err("cancelled");
        assert!(matches!(
            error,
            TransportError::Closed(status) if status == CloseStatus::failed("read cancelled"),
        ));
        // The slot is free again for a fresh read.
        let _ticket = queue.read(tag(5)).expect("slot released");
    }

    #[tokio::test]
    async fn close_fails_pending_and_future_reads() {
        let queue = InputQueue::new();
        let pending = queue.read(tag(6)).expect("read");
        queue.set_closed(CloseStatus::failed("peer went away"));

        let error = pending.complete().await.expect_err("failed by close");
        assert!(matches!(
            error,
            TransportError::Closed(status) if status == CloseStatus::failed("peer went away"),
        ));
        assert!(matches!(
            queue.read(tag(7)),
            Err(TransportError::Closed(status)) if status == CloseStatus::failed("peer went away"),
        ));
    }

    #[tokio::test]
    async fn ok_close_reports_transport_closed() {
        let queue = InputQueue::new();
        let pending = queue.read(tag(8)).expect("read");
        queue.set_closed(CloseStatus::ok());
        let error = pending.complete().await.expect_err("failed by close");
        assert_eq!(error.to_string(), "transport closed: transport closed");
    }
}
