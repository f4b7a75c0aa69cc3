//! Control-channel endpoint: a buffered, backpressured sink plus a
//! passthrough reader over one byte stream.
//!
//! Writers queue encoded bytes into a shared pending buffer; a single flush
//! loop repeatedly takes the whole buffer and issues one physical write, so
//! at most one write is ever in flight and new bytes batch up for the next
//! flush. The buffer is capped: once non-empty and full, producers suspend
//! until the loop drains it. Send order is preserved.
//!
//! The read side has no buffering of its own; [`ControlReader`] passes
//! caller-sized reads straight through to the underlying stream.

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Notify,
};
use tracing::{debug, trace};

use crate::error::{CloseStatus, Result, TransportError};

/// Cap on buffered control-channel bytes before producers suspend.
pub const CONTROL_BUFFER_CAP: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct SinkState {
    pending: BytesMut,
    closed: Option<CloseStatus>,
}

#[derive(Debug, Default)]
struct SinkShared {
    state: std::sync::Mutex<SinkState>,
    /// Signals the flush loop that bytes are pending (or the sink closed).
    work: Notify,
    /// Broadcast to suspended producers after each drain.
    drained: Notify,
}

impl SinkShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Cloneable producer handle for the control-channel sink.
#[derive(Clone, Debug, Default)]
pub struct ControlSink {
    shared: std::sync::Arc<SinkShared>,
}

impl ControlSink {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append `bytes` to the pending buffer, suspending while the buffer is
    /// non-empty and the append would push it over [`CONTROL_BUFFER_CAP`].
    ///
    /// An oversized write into an empty buffer is accepted whole; the cap
    /// bounds accumulation, not individual frames.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the sink is closed.
    pub async fn queue(&self, bytes: Bytes) -> Result<()> {
        loop {
            // Register interest before re-checking the condition so a drain
            // that lands between the check and the await still wakes us.
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(status) = &state.closed {
                    return Err(TransportError::Closed(status.clone()));
                }
                if state.pending.is_empty()
                    || state.pending.len() + bytes.len() <= CONTROL_BUFFER_CAP
                {
                    state.pending.extend_from_slice(&bytes);
                    self.shared.work.notify_one();
                    return Ok(());
                }
            }

            trace!(len = bytes.len(), "control buffer full; producer suspending");
            drained.await;
        }
    }

    /// Drive the flush loop over `writer` until the sink closes or the
    /// stream fails. Spawn exactly one per sink.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that terminated the stream; producers observe
    /// it as a closed sink.
    pub async fn run_flush_loop<W>(&self, mut writer: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let batch = loop {
                let work = self.shared.work.notified();
                tokio::pin!(work);
                work.as_mut().enable();

                {
                    let mut state = self.shared.lock();
                    if !state.pending.is_empty() {
                        // Take everything; later arrivals batch for the
                        // next flush.
                        break state.pending.split().freeze();
                    }
                    if state.closed.is_some() {
                        return Ok(());
                    }
                }
                work.await;
            };

            debug!(len = batch.len(), "flushing control batch");
            if let Err(error) = write_batch(&mut writer, &batch).await {
                self.close(CloseStatus::failed(error.to_string()));
                return Err(error.into());
            }
            self.shared.drained.notify_waiters();
        }
    }

    /// Close the sink: fail future producers and stop the flush loop once
    /// drained.
    pub fn close(&self, status: CloseStatus) {
        {
            let mut state = self.shared.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(status.or_closed());
        }
        self.shared.work.notify_one();
        self.shared.drained.notify_waiters();
    }

    /// Bytes currently awaiting flush, for diagnostics.
    #[must_use]
    pub fn pending_bytes(&self) -> usize { self.shared.lock().pending.len() }
}

async fn write_batch<W>(writer: &mut W, batch: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(batch).await?;
    writer.flush().await
}

/// Unbuffered passthrough over the control channel's read half.
#[derive(Debug)]
pub struct ControlReader<R> {
    inner: R,
}

impl<R> ControlReader<R>
where
    R: AsyncRead + Unpin,
{
    pub const fn new(inner: R) -> Self { Self { inner } }

    /// Fill `buf` exactly from the stream.
    ///
    /// # Errors
    ///
    /// Propagates the underlying stream error; any failure here is fatal to
    /// the transport.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf).await.map(|_| ())
    }

    /// Read exactly `len` bytes into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Propagates the underlying stream error.
    pub async fn read_bytes(&mut self, len: usize) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        self.inner.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn queued_bytes_flush_in_order() {
        let sink = ControlSink::new();
        sink.queue(Bytes::from_static(b"alpha")).await.expect("queue");
        sink.queue(Bytes::from_static(b"beta")).await.expect("queue");

        let (mut read_half, write_half) = tokio::io::duplex(1024);
        let flusher = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.run_flush_loop(write_half).await })
        };

        let mut buf = vec![0u8; 9];
        read_half.read_exact(&mut buf).await.expect("read batch");
        assert_eq!(buf, b"alphabeta");

        sink.close(CloseStatus::ok());
        flusher.await.expect("join").expect("clean exit");
    }

    #[tokio::test]
    async fn full_buffer_suspends_producer_until_drained() {
        let sink = ControlSink::new();
        let chunk = Bytes::from(vec![0u8; 600 * 1024]);

        // First append fits; the second would exceed the cap and suspends.
        sink.queue(chunk.clone()).await.expect("first chunk");
        let suspended = {
            let sink = sink.clone();
            let chunk = chunk.clone();
            tokio::spawn(async move { sink.queue(chunk).await })
        };
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert!(!suspended.is_finished(), "producer must wait for a drain");
        assert_eq!(sink.pending_bytes(), 600 * 1024);

        // Draining unblocks the producer.
        let (mut read_half, write_half) = tokio::io::duplex(2 * 1024 * 1024);
        let flusher = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.run_flush_loop(write_half).await })
        };
        let mut sunk = vec![0u8; 2 * 600 * 1024];
        read_half.read_exact(&mut sunk).await.expect("both chunks");
        suspended.await.expect("join").expect("queued after drain");

        sink.close(CloseStatus::ok());
        flusher.await.expect("join").expect("clean exit");
    }

    #[tokio::test]
    async fn oversized_write_into_empty_buffer_is_accepted() {
        let sink = ControlSink::new();
        sink.queue(Bytes::from(vec![0u8; CONTROL_BUFFER_CAP + 1]))
            .await
            .expect("oversized frame");
        assert_eq!(sink.pending_bytes(), CONTROL_BUFFER_CAP + 1);
    }

    #[tokio::test]
    async fn close_fails_suspended_producers() {
        let sink = ControlSink::new();
        sink.queue(Bytes::from(vec![0u8; CONTROL_BUFFER_CAP]))
            .await
            .expect("fill");
        let suspended = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.queue(Bytes::from_static(b"late")).await })
        };
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        sink.close(CloseStatus::failed("shutdown"));
        let error = suspended.await.expect("join").expect_err("failed by close");
        assert!(matches!(error, TransportError::Closed(_)));
    }
}
