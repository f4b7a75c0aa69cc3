//! Top-level frame transport: routes outgoing frames, drives the endpoint
//! loops, and reassembles incoming frames.
//!
//! Outgoing frames take one of two paths. Small payloads (at or under the
//! inline threshold), settings frames, and everything sent while no data
//! connection exists ride the control channel directly behind a tag-0
//! header. Larger payloads get the next monotonic tag: the control header
//! goes to the control sink while the payload is submitted to the output
//! scheduler, and the write completes only when both are accepted. Writing
//! the header alongside the submission guarantees a tag's header is
//! observable at or before its payload becomes readable.
//!
//! Incoming frames mirror this: the control read loop parses one header at a
//! time; a tag-0 header's payload is read inline immediately, while a tagged
//! header produces an [`IncomingFrame`] that resolves lazily through the
//! input queue, so a slow data payload never head-of-line blocks the control
//! channel.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

use crate::{
    chunker::MessageChunker,
    config::TransportOptions,
    control::{ControlReader, ControlSink},
    endpoint::{self, SecurityFrameHandler, queued_frame},
    error::{CloseStatus, ProtocolError, Result, TransportError},
    frame::{Frame, FrameType, IncomingFrame},
    input_queue::{InputQueue, InputQueueDepths},
    rate::SharedSendRate,
    scheduler::{OutputScheduler, SchedulerSnapshot, WeightedFairPolicy},
    wire::{CONTROL_HEADER_LEN, ControlHeader, PayloadTag},
};

/// Frames buffered between the control read loop and the consumer.
const INCOMING_FRAME_BUFFER: usize = 16;

/// Security side-channel depth per data connection.
const SECURITY_FRAME_BUFFER: usize = 4;

/// Read-only view of transport state for observability tooling.
#[derive(Clone, Debug)]
pub struct TransportDiagnostics {
    /// Control-channel bytes awaiting flush.
    pub control_pending_bytes: usize,
    /// Output scheduler queue and reader states.
    pub scheduler: SchedulerSnapshot,
    /// Input queue correlation depths.
    pub input_queue: InputQueueDepths,
    /// Live data connections.
    pub data_connections: usize,
}

/// Per-data-connection handle returned by
/// [`FrameTransport::add_data_connection`].
#[derive(Clone, Debug)]
pub struct DataConnectionHandle {
    rate: SharedSendRate,
    security: mpsc::Sender<Bytes>,
}

impl DataConnectionHandle {
    /// The connection's rate estimate, for feeding external telemetry
    /// (RTT samples, congestion metrics) into scheduling.
    #[must_use]
    pub const fn rate(&self) -> &SharedSendRate { &self.rate }

    /// Send an out-of-band security frame on this connection's reserved
    /// tag 0. Never surfaced to the peer's input queue.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the connection's write loop
    /// has stopped.
    pub async fn send_security_frame(&self, payload: Bytes) -> Result<()> {
        self.security
            .send(payload)
            .await
            .map_err(|_| TransportError::closed())
    }
}

struct TransportShared {
    options: TransportOptions,
    control: ControlSink,
    scheduler: OutputScheduler,
    input_queue: Arc<InputQueue>,
    security_handler: Arc<dyn SecurityFrameHandler>,
    next_tag: AtomicU64,
    data_connections: AtomicUsize,
    epoch: Instant,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TransportShared {
    /// Tear everything down with `status`. Idempotent; the first caller's
    /// status wins because every component ignores a second close.
    fn initiate_close(&self, status: CloseStatus) {
        if self.shutdown.is_cancelled() {
            return;
        }
        debug!(%status, "closing transport");
        self.shutdown.cancel();
        self.control.close(status.clone());
        self.scheduler.close(status.clone());
        self.input_queue.set_closed(status);
    }

    fn fail(&self, error: &TransportError) {
        error!(%error, "transport loop failed");
        self.initiate_close(CloseStatus::from(error));
    }
}

/// Multiplexed frame transport over one control stream and any number of
/// data streams.
#[derive(Clone)]
pub struct FrameTransport {
    shared: Arc<TransportShared>,
}

impl FrameTransport {
    /// Build a transport over the control channel's two halves and start its
    /// loops. Returns the transport and the stream of reassembled incoming
    /// frames.
    ///
    /// `options` must already be negotiated; the settings payload format is
    /// the caller's concern and settings frames pass through like any other
    /// inline frame.
    pub fn new<R, W>(
        control_read: R,
        control_write: W,
        options: TransportOptions,
        security_handler: Arc<dyn SecurityFrameHandler>,
    ) -> (Self, IncomingFrames)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(TransportShared {
            options,
            control: ControlSink::new(),
            scheduler: OutputScheduler::new(),
            input_queue: Arc::new(InputQueue::new()),
            security_handler,
            next_tag: AtomicU64::new(1),
            data_connections: AtomicUsize::new(0),
            epoch: Instant::now(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        let transport = Self {
            shared: Arc::clone(&shared),
        };

        // Control flush loop.
        transport.spawn_io_loop({
            let shared = Arc::clone(&shared);
            async move { shared.control.run_flush_loop(control_write).await }
        });

        // Scheduling loop.
        shared.tracker.spawn({
            let scheduler = shared.scheduler.clone();
            async move { scheduler.run(WeightedFairPolicy::new()).await }
        });

        // Control read loop feeding the incoming-frame stream.
        let (frames_tx, frames_rx) = mpsc::channel(INCOMING_FRAME_BUFFER);
        transport.spawn_io_loop({
            let shared = Arc::clone(&shared);
            async move { run_control_read_loop(control_read, &shared, frames_tx).await }
        });

        (transport, IncomingFrames { receiver: frames_rx })
    }

    /// Spawn a loop whose failure closes the whole transport.
    fn spawn_loop<F>(&self, future: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared.tracker.spawn(async move {
            if let Err(error) = future.await {
                shared.fail(&error);
            }
        });
    }

    /// Spawn an I/O loop, racing it against shutdown so a stream wedged
    /// mid-read or mid-write cannot stall [`close`](Self::close).
    fn spawn_io_loop<F>(&self, future: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let shutdown = self.shared.shutdown.clone();
        self.spawn_loop(async move {
            tokio::select! {
                () = shutdown.cancelled() => Ok(()),
                result = future => result,
            }
        });
    }

    /// Attach one physical data connection and start its loops.
    ///
    /// The returned handle feeds telemetry into scheduling and carries the
    /// reserved tag-0 security side channel.
    pub fn add_data_connection<R, W>(&self, read_half: R, write_half: W) -> DataConnectionHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = &self.shared;
        let rate = SharedSendRate::new();
        let reader = shared.scheduler.register_reader(rate.clone());
        let (security_tx, security_rx) = mpsc::channel(SECURITY_FRAME_BUFFER);
        shared.data_connections.fetch_add(1, Ordering::AcqRel);

        let connections = Arc::clone(shared);
        let shutdown = shared.shutdown.clone();
        let write_loop = endpoint::run_write_loop(
            write_half,
            reader,
            security_rx,
            shared.epoch,
            shared.options.encode_alignment,
            shared.shutdown.clone(),
        );
        self.spawn_loop(async move {
            let result = tokio::select! {
                () = shutdown.cancelled() => Ok(()),
                result = write_loop => result,
            };
            connections.data_connections.fetch_sub(1, Ordering::AcqRel);
            result
        });

        self.spawn_io_loop(endpoint::run_read_loop(
            read_half,
            Arc::clone(&shared.input_queue),
            Arc::clone(&shared.security_handler),
            shared.options,
            shared.shutdown.clone(),
        ));

        DataConnectionHandle {
            rate,
            security: security_tx,
        }
    }

    /// Write one frame, completing when the transport has accepted it.
    ///
    /// Small payloads and settings frames ride the control channel inline;
    /// larger payloads are tagged and fanned out across the data
    /// connections. Acceptance may suspend on control-channel backpressure.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for malformed frames or
    /// [`TransportError::Closed`] after shutdown.
    pub async fn write_frame(&self, frame: Frame) -> Result<()> {
        let shared = &self.shared;
        let header = frame.header()?;
        let payload = frame.payload_bytes();

        let inline = header.frame_type == FrameType::Settings
            || shared.data_connections.load(Ordering::Acquire) == 0
            || payload.len() <= shared.options.inline_payload_threshold;

        if inline {
            let encoded = ControlHeader::inline(header).encode()?;
            let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + payload.len());
            buf.extend_from_slice(&encoded);
            buf.extend_from_slice(&payload);
            return shared.control.queue(buf.freeze()).await;
        }

        let tag = PayloadTag::new(shared.next_tag.fetch_add(1, Ordering::Relaxed));
        let encoded = ControlHeader {
            header,
            payload_tag: tag,
        }
        .encode()?;
        let queued = queued_frame(tag, payload, shared.options.encode_alignment);

        // Header and payload go out together; the write completes only when
        // both sides have accepted their half.
        let control = shared.control.queue(Bytes::copy_from_slice(&encoded));
        let scheduled = async { shared.scheduler.write(queued) };
        futures::future::try_join(control, scheduled).await?;
        Ok(())
    }

    /// Write one message, chunking it to the negotiated limits.
    ///
    /// Chunks are emitted strictly in order; transmission of each may
    /// suspend on downstream backpressure before the next is produced.
    ///
    /// # Errors
    ///
    /// Propagates the first failing [`write_frame`](Self::write_frame).
    pub async fn send_message(&self, stream_id: u32, message: Bytes) -> Result<()> {
        let chunker = MessageChunker::from_options(&self.shared.options);
        for frame in chunker.chunk(stream_id, message) {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    /// The negotiated options this transport runs with.
    #[must_use]
    pub fn options(&self) -> TransportOptions { self.shared.options }

    /// Read-only state snapshot for observability tooling.
    #[must_use]
    pub fn diagnostics(&self) -> TransportDiagnostics {
        TransportDiagnostics {
            control_pending_bytes: self.shared.control.pending_bytes(),
            scheduler: self.shared.scheduler.snapshot(),
            input_queue: self.shared.input_queue.depths(),
            data_connections: self.shared.data_connections.load(Ordering::Acquire),
        }
    }

    /// Close the transport, cancelling every loop and failing every blocked
    /// waiter with `status`, then wait for the loops to finish.
    pub async fn close(&self, status: CloseStatus) {
        self.shared.initiate_close(status);
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }
}

/// Parse control headers and surface incoming frames.
async fn run_control_read_loop<R>(
    control_read: R,
    shared: &Arc<TransportShared>,
    frames: mpsc::Sender<IncomingFrame>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = ControlReader::new(control_read);
    loop {
        let mut buf = [0u8; CONTROL_HEADER_LEN];
        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => return Ok(()),
            read = reader.read_exact(&mut buf) => { read?; }
        }
        let control = ControlHeader::decode(&buf)?;
        let declared = control.header.payload_len as usize;
        if !shared.options.accepts_recv_len(declared) {
            return Err(ProtocolError::PayloadTooLarge {
                len: declared,
                limit: shared.options.max_recv_chunk_size,
            }
            .into());
        }

        let incoming = if control.payload_tag.is_control() {
            // Inline payload: read it now, before the next header. Tagged
            // payloads resolve out of band, so this never blocks on them.
            let payload = reader.read_bytes(declared).await?;
            IncomingFrame::inline(control.header, payload)
        } else {
            let ticket = shared.input_queue.read(control.payload_tag)?;
            IncomingFrame::pending(control.header, ticket)
        };

        if frames.send(incoming).await.is_err() {
            warn!("incoming frame consumer dropped; stopping control read loop");
            return Ok(());
        }
    }
}

/// Lazy sequence of reassembled incoming frames.
#[derive(Debug)]
pub struct IncomingFrames {
    receiver: mpsc::Receiver<IncomingFrame>,
}

impl IncomingFrames {
    /// Receive the next incoming frame, or `None` once the transport's
    /// control read loop has stopped.
    pub async fn next_frame(&mut self) -> Option<IncomingFrame> { self.receiver.recv().await }
}

impl Stream for IncomingFrames {
    type Item = IncomingFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
