use bytes::Bytes;

use super::*;

fn frame(tag: u64, tokens: u64) -> QueuedFrame {
    QueuedFrame {
        tag: PayloadTag::new(tag),
        payload: Bytes::from(vec![0u8; usize::try_from(tokens).expect("small test sizes")]),
        tokens,
    }
}

fn spawn_loop(scheduler: &OutputScheduler) -> tokio::task::JoinHandle<()> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.run(WeightedFairPolicy::new()).await })
}

#[tokio::test]
async fn sole_ready_reader_drains_the_queue_in_order() {
    let scheduler = OutputScheduler::new();
    let mut reader = scheduler.register_reader(SharedSendRate::new());
    let loop_task = spawn_loop(&scheduler);

    for tag in 1..=5u64 {
        scheduler.write(frame(tag, 100)).expect("open queue");
    }

    let mut received = Vec::new();
    while received.len() < 5 {
        let batch = reader.next().await.expect("batch assigned");
        received.extend(batch.into_iter().map(|frame| frame.tag.get()));
    }
    assert_eq!(received, vec![1, 2, 3, 4, 5]);

    scheduler.close(CloseStatus::ok());
    loop_task.await.expect("loop exits");
}

#[tokio::test]
async fn work_written_before_reader_is_ready_still_arrives() {
    let scheduler = OutputScheduler::new();
    let mut reader = scheduler.register_reader(SharedSendRate::new());
    scheduler.write(frame(9, 64)).expect("open queue");
    let loop_task = spawn_loop(&scheduler);

    let batch = reader.next().await.expect("batch assigned");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].tag, PayloadTag::new(9));

    scheduler.close(CloseStatus::ok());
    loop_task.await.expect("loop exits");
}

#[tokio::test]
async fn tokens_track_queue_contents() {
    let scheduler = OutputScheduler::new();
    scheduler.write(frame(1, 128)).expect("open queue");
    scheduler.write(frame(2, 72)).expect("open queue");

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.queued_frames, 2);
    assert_eq!(snapshot.queued_tokens, 200);
}

#[tokio::test]
async fn dropped_reader_requeues_its_assignment() {
    let scheduler = OutputScheduler::new();
    let mut doomed = scheduler.register_reader(SharedSendRate::new());
    let loop_task = spawn_loop(&scheduler);

    // Cancel the next() future right away so any dispatched batch must be
    // recovered to the queue head.
    {
        let next = doomed.next();
        tokio::pin!(next);
        let _ = futures::poll!(next.as_mut());
    }
    scheduler.write(frame(1, 10)).expect("open queue");
    tokio::task::yield_now().await;
    drop(doomed);

    // A fresh reader must still receive the frame exactly once.
    let mut replacement = scheduler.register_reader(SharedSendRate::new());
    let batch = replacement.next().await.expect("batch assigned");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].tag, PayloadTag::new(1));

    scheduler.close(CloseStatus::ok());
    loop_task.await.expect("loop exits");
}

#[tokio::test]
async fn close_wakes_parked_readers() {
    let scheduler = OutputScheduler::new();
    let mut reader = scheduler.register_reader(SharedSendRate::new());
    let loop_task = spawn_loop(&scheduler);

    let waiter = tokio::spawn(async move { reader.next().await });
    tokio::task::yield_now().await;
    scheduler.close(CloseStatus::failed("going away"));

    let error = waiter.await.expect("join").expect_err("closed");
    assert!(matches!(error, TransportError::Closed(_)));
    assert!(matches!(
        scheduler.write(frame(1, 1)),
        Err(TransportError::Closed(_)),
    ));
    loop_task.await.expect("loop exits");
}

#[tokio::test]
async fn writes_fan_out_across_ready_readers() {
    let scheduler = OutputScheduler::new();
    let fast_rate = SharedSendRate::new();
    fast_rate.with(|rate| rate.set_bytes_per_second(1_000_000.0, tokio::time::Instant::now()));
    let slow_rate = SharedSendRate::new();
    slow_rate.with(|rate| rate.set_bytes_per_second(1000.0, tokio::time::Instant::now()));

    let mut fast = scheduler.register_reader(fast_rate);
    let mut slow = scheduler.register_reader(slow_rate);
    let loop_task = spawn_loop(&scheduler);

    let fast_task = tokio::spawn(async move {
        let mut total = 0usize;
        while let Ok(batch) = fast.next().await {
            total += batch.len();
        }
        total
    });
    let slow_task = tokio::spawn(async move {
        let mut total = 0usize;
        while let Ok(batch) = slow.next().await {
            total += batch.len();
        }
        total
    });
    tokio::task::yield_now().await;

    for tag in 1..=40u64 {
        scheduler.write(frame(tag, 1000)).expect("open queue");
        tokio::task::yield_now().await;
    }
    // Let the loop drain everything before closing.
    for _ in 0..64 {
        tokio::task::yield_now().await;
        if scheduler.snapshot().queued_frames == 0 {
            break;
        }
    }
    scheduler.close(CloseStatus::ok());

    let fast_total = fast_task.await.expect("join");
    let slow_total = slow_task.await.expect("join");
    assert_eq!(fast_total + slow_total, 40);
    assert!(
        fast_total >= slow_total,
        "fast reader should carry at least as much: fast={fast_total} slow={slow_total}"
    );
    loop_task.await.expect("loop exits");
}
