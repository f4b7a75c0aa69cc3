//! Output scheduler: fans one shared outgoing-payload queue across the pool
//! of data connections.
//!
//! Producers append [`QueuedFrame`]s to a single FIFO. Each data connection
//! registers a [`Reader`]; its write loop calls [`Reader::next`], which marks
//! the reader ready and suspends until the scheduling loop assigns it a
//! batch. The loop runs as one cooperative task: on every pass it gathers
//! each reader's predicted delivery data, hands the picture to a
//! [`SchedulingPolicy`], and pops frames in FIFO order onto the chosen
//! readers, preserving per-destination order.
//!
//! Liveness uses a three-state atomic (idle / processing / work-arrived): a
//! wakeup landing while a pass runs flips the flag instead of notifying, so
//! it is neither lost nor double-scheduled. A reader torn down mid-assignment
//! has its batch returned to the head of the queue; at-most-once delivery is
//! preserved, strict global FIFO is not.

mod policy;

pub use policy::{ChannelInfo, SchedulingPolicy, WeightedFairPolicy};

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use bytes::Bytes;
use tokio::{
    sync::{Notify, oneshot},
    time::Instant,
};
use tracing::{debug, trace};

use crate::{
    error::{CloseStatus, Result, TransportError},
    rate::{RateSnapshot, SharedSendRate},
    wire::PayloadTag,
};

/// Scheduling loop is asleep with no pending work signal.
const IDLE: u8 = 0;
/// Scheduling loop is running a pass.
const PROCESSING: u8 = 1;
/// Work arrived while a pass was running; run another before sleeping.
const WORK_ARRIVED: u8 = 2;

/// Unit of work in the shared queue: one tagged payload bound for some data
/// connection, costed in wire tokens (header + payload + padding).
#[derive(Debug)]
pub struct QueuedFrame {
    pub tag: PayloadTag,
    pub payload: Bytes,
    pub tokens: u64,
}

#[derive(Debug)]
struct ReaderSlot {
    /// Present while the reader is parked in [`Reader::next`] ("reading").
    batch_sender: Option<oneshot::Sender<Vec<QueuedFrame>>>,
    rate: SharedSendRate,
}

#[derive(Debug, Default)]
struct SchedState {
    queue: VecDeque<QueuedFrame>,
    queued_tokens: u64,
    readers: HashMap<usize, ReaderSlot>,
    next_reader_id: usize,
    closed: Option<CloseStatus>,
}

#[derive(Debug, Default)]
struct SchedulerShared {
    state: std::sync::Mutex<SchedState>,
    liveness: AtomicU8,
    wake: Notify,
}

impl SchedulerShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Flag new work for the scheduling loop, waking it only on the
    /// idle-to-work transition.
    fn signal_work(&self) {
        if self.liveness.swap(WORK_ARRIVED, Ordering::AcqRel) == IDLE {
            self.wake.notify_one();
        }
    }

    fn requeue_front(&self, batch: Vec<QueuedFrame>) {
        let mut state = self.lock();
        for frame in batch.into_iter().rev() {
            state.queued_tokens += frame.tokens;
            state.queue.push_front(frame);
        }
    }
}

/// Per-reader diagnostics row.
#[derive(Clone, Debug)]
pub struct ReaderSnapshot {
    pub id: usize,
    /// Whether the reader is parked awaiting a batch.
    pub reading: bool,
    pub rate: RateSnapshot,
}

/// Read-only view of scheduler state.
#[derive(Clone, Debug)]
pub struct SchedulerSnapshot {
    pub queued_frames: usize,
    pub queued_tokens: u64,
    pub readers: Vec<ReaderSnapshot>,
}

/// Shared outgoing-payload queue plus its scheduling loop handle.
#[derive(Clone, Debug, Default)]
pub struct OutputScheduler {
    shared: Arc<SchedulerShared>,
}

impl OutputScheduler {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a frame to the shared FIFO and signal the scheduling loop.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the scheduler is closed; the
    /// frame is not accepted.
    pub fn write(&self, frame: QueuedFrame) -> Result<()> {
        {
            let mut state = self.shared.lock();
            if let Some(status) = &state.closed {
                return Err(TransportError::Closed(status.clone()));
            }
            state.queued_tokens += frame.tokens;
            state.queue.push_back(frame);
        }
        self.shared.signal_work();
        Ok(())
    }

    /// Register a data connection, returning its [`Reader`].
    #[must_use]
    pub fn register_reader(&self, rate: SharedSendRate) -> Reader {
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_reader_id;
            state.next_reader_id += 1;
            state.readers.insert(
                id,
                ReaderSlot {
                    batch_sender: None,
                    rate: rate.clone(),
                },
            );
            id
        };
        debug!(reader = id, "registered scheduler reader");
        Reader {
            id,
            shared: Arc::clone(&self.shared),
            rate,
        }
    }

    /// Drive scheduling passes until the scheduler closes. Spawn exactly one.
    pub async fn run<P: SchedulingPolicy>(&self, mut policy: P) {
        loop {
            self.shared.liveness.store(PROCESSING, Ordering::Release);
            loop {
                if !self.schedule_pass(&mut policy) {
                    return;
                }
                if self
                    .shared
                    .liveness
                    .compare_exchange(PROCESSING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
                // Work arrived during the pass; claim it and go again.
                self.shared.liveness.store(PROCESSING, Ordering::Release);
            }
            self.shared.wake.notified().await;
        }
    }

    /// One scheduling pass. Returns false once the scheduler is closed.
    fn schedule_pass<P: SchedulingPolicy>(&self, policy: &mut P) -> bool {
        let now = Instant::now();
        let mut state = self.shared.lock();
        if state.closed.is_some() {
            return false;
        }
        if state.queue.is_empty() || state.readers.is_empty() {
            return true;
        }

        // Describe every reader to the policy under a dense step index.
        policy.new_step(state.queued_tokens);
        let reader_ids: Vec<usize> = state.readers.keys().copied().collect();
        for (index, id) in reader_ids.iter().enumerate() {
            let slot = &state.readers[id];
            let delivery = slot.rate.delivery_data(now);
            policy.add_channel(ChannelInfo {
                index,
                ready: slot.batch_sender.is_some(),
                start_offset: delivery.start_offset,
                bytes_per_second: delivery.bytes_per_second,
            });
        }
        policy.make_plan();

        // Pop frames in FIFO order onto the chosen readers.
        let mut batches: Vec<Vec<QueuedFrame>> = (0..reader_ids.len()).map(|_| Vec::new()).collect();
        while let Some(frame) = state.queue.front() {
            let Some(index) = policy.allocate_message(frame.tokens) else {
                break;
            };
            if index >= reader_ids.len() {
                debug_assert!(false, "policy returned out-of-range channel index");
                break;
            }
            let frame = state.queue.pop_front().expect("front frame exists");
            state.queued_tokens -= frame.tokens;
            batches[index].push(frame);
        }

        // Hand out completed batches, waking each reader and clearing its
        // ready flag. A reader that vanished mid-assignment gets its frames
        // pushed back to the queue head.
        for (index, batch) in batches.into_iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let id = reader_ids[index];
            let Some(slot) = state.readers.get_mut(&id) else {
                restore_front(&mut state, batch);
                continue;
            };
            let Some(sender) = slot.batch_sender.take() else {
                restore_front(&mut state, batch);
                continue;
            };
            trace!(reader = id, "dispatching scheduler batch");
            if let Err(batch) = sender.send(batch) {
                restore_front(&mut state, batch);
            }
        }
        true
    }

    /// Close the scheduler: fail parked readers and refuse future writes.
    /// Frames still queued are dropped with the transport.
    pub fn close(&self, status: CloseStatus) {
        let readers = {
            let mut state = self.shared.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(status.or_closed());
            std::mem::take(&mut state.readers)
        };
        // Dropping the senders wakes every parked reader with the closed
        // status.
        drop(readers);
        self.shared.signal_work();
    }

    /// Read-only snapshot for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let now = Instant::now();
        let state = self.shared.lock();
        let mut readers: Vec<ReaderSnapshot> = state
            .readers
            .iter()
            .map(|(id, slot)| ReaderSnapshot {
                id: *id,
                reading: slot.batch_sender.is_some(),
                rate: slot.rate.snapshot(now),
            })
            .collect();
        readers.sort_by_key(|reader| reader.id);
        SchedulerSnapshot {
            queued_frames: state.queue.len(),
            queued_tokens: state.queued_tokens,
            readers,
        }
    }
}

fn restore_front(state: &mut SchedState, batch: Vec<QueuedFrame>) {
    for frame in batch.into_iter().rev() {
        state.queued_tokens += frame.tokens;
        state.queue.push_front(frame);
    }
}

/// One data connection's demand for outgoing work.
#[derive(Debug)]
pub struct Reader {
    id: usize,
    shared: Arc<SchedulerShared>,
    rate: SharedSendRate,
}

impl Reader {
    /// Scheduler-assigned reader id, stable for the reader's lifetime.
    #[must_use]
    pub const fn id(&self) -> usize { self.id }

    /// The rate estimate this reader's connection reports into.
    #[must_use]
    pub const fn rate(&self) -> &SharedSendRate { &self.rate }

    /// Mark this reader ready and suspend until the scheduler assigns it a
    /// batch.
    ///
    /// Cancel-safe: dropping the future returns an already-dispatched batch
    /// to the head of the shared queue.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the scheduler shuts down.
    pub async fn next(&mut self) -> Result<Vec<QueuedFrame>> {
        let receiver = {
            let (sender, receiver) = oneshot::channel();
            let mut state = self.shared.lock();
            if let Some(status) = &state.closed {
                return Err(TransportError::Closed(status.clone()));
            }
            let Some(slot) = state.readers.get_mut(&self.id) else {
                return Err(TransportError::closed());
            };
            slot.batch_sender = Some(sender);
            receiver
        };
        // Becoming ready may unblock queued work.
        self.shared.signal_work();

        let mut guard = BatchRecovery {
            receiver: Some(receiver),
            shared: &self.shared,
        };
        let outcome = guard
            .receiver
            .as_mut()
            .expect("receiver installed above")
            .await;
        guard.receiver = None;
        match outcome {
            Ok(batch) => Ok(batch),
            Err(_) => {
                let status = self
                    .shared
                    .lock()
                    .closed
                    .clone()
                    .unwrap_or_else(|| CloseStatus::ok().or_closed());
                Err(TransportError::Closed(status))
            }
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.readers.remove(&self.id);
    }
}

/// Returns a dispatched-but-unclaimed batch to the queue when a
/// [`Reader::next`] future is dropped mid-assignment.
struct BatchRecovery<'a> {
    receiver: Option<oneshot::Receiver<Vec<QueuedFrame>>>,
    shared: &'a Arc<SchedulerShared>,
}

impl Drop for BatchRecovery<'_> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if let Ok(batch) = receiver.try_recv() {
                self.shared.requeue_front(batch);
                self.shared.signal_work();
            }
        }
    }
}

#[cfg(test)]
mod tests;
