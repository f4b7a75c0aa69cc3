//! Read and write loops for one physical data connection.
//!
//! The write loop waits on its scheduler [`Reader`] for the next assigned
//! batch, racing a reserved tag-0 side channel carrying out-of-band security
//! frames. Every batch serializes into one buffer (data header, payload,
//! alignment padding per item) and goes out in a single physical write, with
//! the connection's [`SharedSendRate`] told what just started moving.
//!
//! The read loop decodes one data header at a time, refuses declared lengths
//! over the negotiated receive limit before allocating, reads exactly the
//! declared payload plus padding, strips the padding, and routes the payload
//! by tag: tag 0 to the [`SecurityFrameHandler`] extension point, everything
//! else to the [`InputQueue`]. Either loop failing is fatal to the whole
//! transport; the caller escalates.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::TransportOptions,
    error::{ProtocolError, Result},
    input_queue::InputQueue,
    scheduler::{QueuedFrame, Reader},
    wire::{DATA_HEADER_LEN, DataHeader, PayloadTag, checked_payload_len, padding},
};

/// Receives payloads arriving on a data connection's reserved tag 0.
///
/// Tag 0 is an out-of-band side channel (typically for security handshake
/// material) and is never surfaced to the input queue.
#[async_trait]
pub trait SecurityFrameHandler: Send + Sync + 'static {
    /// Handle one tag-0 payload.
    ///
    /// # Errors
    ///
    /// Any error is fatal to the transport.
    async fn handle(&self, payload: Bytes) -> Result<()>;
}

/// Default handler: logs and discards tag-0 payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreSecurityFrames;

#[async_trait]
impl SecurityFrameHandler for IgnoreSecurityFrames {
    async fn handle(&self, payload: Bytes) -> Result<()> {
        debug!(len = payload.len(), "discarding security frame");
        Ok(())
    }
}

/// Serialize one batch item: data header, payload, zero padding.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] when the payload exceeds the
/// wire's u32 length field.
fn encode_item(
    buf: &mut BytesMut,
    tag: PayloadTag,
    payload: &Bytes,
    now_ns: u64,
    align: usize,
) -> Result<(), ProtocolError> {
    let header = DataHeader {
        payload_tag: tag,
        send_timestamp_ns: now_ns,
        payload_len: checked_payload_len(payload.len())?,
    };
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.put_bytes(0, padding(payload.len(), align));
    Ok(())
}

/// Transport-clock nanoseconds since `epoch`.
fn timestamp_ns(epoch: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(epoch).as_nanos()).unwrap_or(u64::MAX)
}

/// Await the next out-of-band security payload, parking forever once the
/// channel closes so the surrounding select falls through to scheduler work.
async fn next_security_frame(channel: &mut Option<mpsc::Receiver<Bytes>>) -> Bytes {
    loop {
        match channel {
            Some(receiver) => match receiver.recv().await {
                Some(payload) => return payload,
                None => *channel = None,
            },
            None => std::future::pending::<()>().await,
        }
    }
}

/// Drive one data connection's write side until shutdown or stream failure.
///
/// # Errors
///
/// Returns the I/O error that killed the stream, or the scheduler's closed
/// status. Both escalate to closing the whole transport.
pub async fn run_write_loop<W>(
    mut writer: W,
    mut reader: Reader,
    security_frames: mpsc::Receiver<Bytes>,
    epoch: Instant,
    encode_alignment: usize,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut security_frames = Some(security_frames);
    loop {
        let mut buf = BytesMut::new();
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            payload = next_security_frame(&mut security_frames) => {
                let now = Instant::now();
                encode_item(
                    &mut buf,
                    PayloadTag::CONTROL,
                    &payload,
                    timestamp_ns(epoch, now),
                    encode_alignment,
                )?;
            }
            batch = reader.next() => {
                let batch = batch?;
                let now = Instant::now();
                let now_ns = timestamp_ns(epoch, now);
                for frame in &batch {
                    encode_item(&mut buf, frame.tag, &frame.payload, now_ns, encode_alignment)?;
                }
                reader.rate().with(|rate| rate.start_send(buf.len() as u64, now));
            }
        }

        trace!(reader = reader.id(), len = buf.len(), "writing data batch");
        let started = Instant::now();
        writer.write_all(&buf).await?;
        writer.flush().await?;
        record_write_rate(&reader, buf.len(), started);
    }
}

/// Fold the observed throughput of a completed write into the estimate.
fn record_write_rate(reader: &Reader, len: usize, started: Instant) {
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(started).as_secs_f64();
    if elapsed > 0.0 {
        #[expect(
            clippy::cast_precision_loss,
            reason = "batch sizes fit comfortably in f64"
        )]
        let rate = len as f64 / elapsed;
        reader.rate().with(|estimate| estimate.set_bytes_per_second(rate, now));
    }
}

/// Drive one data connection's read side until shutdown or stream failure.
///
/// # Errors
///
/// Returns the I/O error that killed the stream, a protocol error for a
/// declared length over the negotiated receive limit, or a failure from the
/// security handler. All escalate to closing the whole transport.
pub async fn run_read_loop<R>(
    mut read_half: R,
    input_queue: Arc<InputQueue>,
    security_handler: Arc<dyn SecurityFrameHandler>,
    options: TransportOptions,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header_buf = [0u8; DATA_HEADER_LEN];
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            read = read_half.read_exact(&mut header_buf) => { read?; }
        }
        let header = DataHeader::decode(&header_buf);
        let payload_len = header.payload_len as usize;
        if !options.accepts_recv_len(payload_len) {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len,
                limit: options.max_recv_chunk_size,
            }
            .into());
        }
        let padded_len = payload_len + padding(payload_len, options.decode_alignment);

        let mut payload = BytesMut::zeroed(padded_len);
        read_half.read_exact(&mut payload).await?;
        payload.truncate(payload_len);
        let payload = payload.freeze();

        if header.payload_tag.is_control() {
            security_handler.handle(payload).await?;
        } else {
            trace!(tag = %header.payload_tag, len = payload_len, "data payload received");
            input_queue.complete_read(header.payload_tag, payload);
        }
    }
}

/// Wire cost of one scheduled payload: header, payload, padding.
#[must_use]
pub fn frame_tokens(payload_len: usize, encode_alignment: usize) -> u64 {
    (DATA_HEADER_LEN + payload_len + padding(payload_len, encode_alignment)) as u64
}

/// Build a [`QueuedFrame`] with its token cost.
#[must_use]
pub fn queued_frame(tag: PayloadTag, payload: Bytes, encode_alignment: usize) -> QueuedFrame {
    let tokens = frame_tokens(payload.len(), encode_alignment);
    QueuedFrame {
        tag,
        payload,
        tokens,
    }
}
