//! Control-channel backpressure behaviour under a slow or absent peer.

use std::sync::Arc;

use bytes::Bytes;
use framemux::{
    CloseStatus, Frame, FrameTransport, IgnoreSecurityFrames, TransportError, TransportOptions,
};
use tokio::io::{AsyncReadExt, duplex, split};

/// Large enough that a handful of frames overruns the sink's buffer cap.
const BIG_FRAME_LEN: usize = 600 * 1024;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Yield until the flush loop has claimed everything queued so far.
async fn wait_for_flush_claim(transport: &FrameTransport) {
    while transport.diagnostics().control_pending_bytes > 0 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn unread_peer_suspends_the_producer_until_drained() {
    init_logging();
    // A tiny pipe keeps almost everything in the sink's pending buffer.
    let (local_end, mut peer_end) = duplex(4096);
    let (local_read, local_write) = split(local_end);
    let (transport, _incoming) = FrameTransport::new(
        local_read,
        local_write,
        TransportOptions::default(),
        Arc::new(IgnoreSecurityFrames),
    );

    let frame = Frame::Message {
        stream_id: 1,
        payload: Bytes::from(vec![0x5a; BIG_FRAME_LEN]),
    };
    // First write is handed to the flush loop (which stalls on the tiny
    // pipe), second sits in the buffer; the third would push the buffer past
    // its cap and must suspend.
    transport.write_frame(frame.clone()).await.expect("first");
    wait_for_flush_claim(&transport).await;
    transport.write_frame(frame.clone()).await.expect("second");
    let suspended = {
        let transport = transport.clone();
        let frame = frame.clone();
        tokio::spawn(async move { transport.write_frame(frame).await })
    };
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
    assert!(!suspended.is_finished(), "producer must wait for a drain");
    assert!(transport.diagnostics().control_pending_bytes > 0);

    // Reading the peer side drains the sink and releases the producer.
    let drain = tokio::spawn(async move {
        let mut sunk = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        while sunk < 3 * (24 + BIG_FRAME_LEN) as u64 {
            let n = peer_end.read(&mut buf).await.expect("peer read");
            assert!(n > 0, "stream ended early");
            sunk += n as u64;
        }
        peer_end
    });
    suspended
        .await
        .expect("join")
        .expect("accepted after drain");
    let peer_end = drain.await.expect("join");

    transport.close(CloseStatus::ok()).await;
    drop(peer_end);
}

#[tokio::test]
async fn close_fails_a_suspended_producer() {
    init_logging();
    let (local_end, peer_end) = duplex(4096);
    let (local_read, local_write) = split(local_end);
    let (transport, _incoming) = FrameTransport::new(
        local_read,
        local_write,
        TransportOptions::default(),
        Arc::new(IgnoreSecurityFrames),
    );

    let frame = Frame::Message {
        stream_id: 1,
        payload: Bytes::from(vec![0x5a; BIG_FRAME_LEN]),
    };
    transport.write_frame(frame.clone()).await.expect("first");
    wait_for_flush_claim(&transport).await;
    transport.write_frame(frame.clone()).await.expect("second");
    let suspended = {
        let transport = transport.clone();
        let frame = frame.clone();
        tokio::spawn(async move { transport.write_frame(frame).await })
    };
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
    assert!(!suspended.is_finished());

    transport.close(CloseStatus::failed("shutting down")).await;
    let error = suspended.await.expect("join").expect_err("failed by close");
    assert!(matches!(
        error,
        TransportError::Closed(status) if status == CloseStatus::failed("shutting down"),
    ));
    drop(peer_end);
}

#[tokio::test]
async fn slow_consumer_loses_no_frames() {
    init_logging();
    let (left_end, right_end) = duplex(64 * 1024);
    let (left_read, left_write) = split(left_end);
    let (right_read, right_write) = split(right_end);
    let (left, _left_in) = FrameTransport::new(
        left_read,
        left_write,
        TransportOptions::default(),
        Arc::new(IgnoreSecurityFrames),
    );
    let (right, mut right_in) = FrameTransport::new(
        right_read,
        right_write,
        TransportOptions::default(),
        Arc::new(IgnoreSecurityFrames),
    );

    let writer = {
        let left = left.clone();
        tokio::spawn(async move {
            for stream_id in 1..=50u32 {
                left.write_frame(Frame::Message {
                    stream_id,
                    payload: Bytes::from(vec![0u8; 256]),
                })
                .await?;
            }
            Ok::<_, TransportError>(())
        })
    };

    // Consume slowly; the bounded incoming channel must stall the reader
    // rather than drop frames.
    for expected in 1..=50u32 {
        tokio::task::yield_now().await;
        let frame = right_in
            .next_frame()
            .await
            .expect("frame arrives")
            .resolve()
            .await
            .expect("resolve");
        assert_eq!(frame.stream_id(), expected);
    }
    writer.await.expect("join").expect("all writes accepted");

    left.close(CloseStatus::ok()).await;
    right.close(CloseStatus::ok()).await;
}
