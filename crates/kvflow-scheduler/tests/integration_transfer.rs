//! Integration tests for KV-cache transfer back-pressure and failure
//! handling.

mod common;

use common::fixtures::{decode_seed, prefill_seed, StubKvTransport};
use common::{fast_config, TestScheduler};
use kvflow_scheduler::{InferenceRequest, SchedulerError};
use std::time::Duration;

#[tokio::test]
async fn single_slot_transfers_serialise_in_submission_order() {
    let mut config = fast_config();
    config.kv_transfer.max_concurrent = 1;
    let harness =
        TestScheduler::with_transport(config, StubKvTransport::new(Duration::from_millis(30)));
    harness.scheduler.register_worker(&prefill_seed("p1"));
    harness.scheduler.register_worker(&decode_seed("d1"));
    harness.scheduler.start();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            harness
                .scheduler
                .submit(InferenceRequest::new("test-model", "hi"))
                .unwrap()
        })
        .collect();
    let submitted: Vec<_> = handles.iter().map(|h| h.request_id().to_string()).collect();

    for handle in handles {
        handle.recv().await.unwrap();
    }

    // The cap held throughout.
    assert!(harness.transport.max_observed() <= 1);

    // transfer_completed events appear in submission order.
    let completed: Vec<_> = harness
        .scheduler
        .events(Some(1_000))
        .into_iter()
        .filter(|e| e.kind.label() == "transfer_completed")
        .map(|e| e.kind.request_id().unwrap().to_string())
        .collect();
    assert_eq!(completed, submitted);

    let metrics = harness.scheduler.metrics();
    assert_eq!(metrics.total_completed, 3);
    assert_eq!(metrics.active_transfers, 0);

    harness.scheduler.stop();
}

#[tokio::test]
async fn transfer_failure_fails_the_request() {
    let harness = TestScheduler::new();
    harness.scheduler.register_worker(&prefill_seed("p1"));
    harness.scheduler.register_worker(&decode_seed("d1"));
    harness
        .transport
        .fail
        .store(true, std::sync::atomic::Ordering::SeqCst);
    harness.scheduler.start();

    let handle = harness
        .scheduler
        .submit(InferenceRequest::new("test-model", "hi"))
        .unwrap();
    let request_id = handle.request_id().to_string();

    let result = handle.recv().await;
    match result {
        Err(SchedulerError::TransferFailed(reason)) => {
            assert!(reason.contains("stub transfer refused"));
        }
        other => panic!("expected TransferFailed, got {other:?}"),
    }

    let labels = harness.event_labels_for(&request_id);
    assert_eq!(
        labels,
        vec![
            "request_queued",
            "prefill_started",
            "prefill_completed",
            "transfer_started",
            "request_failed",
        ]
    );

    // No decode was attempted.
    assert!(harness.client.decode_calls.lock().is_empty());

    harness.scheduler.stop();
}

#[tokio::test]
async fn transfer_deadline_trips_to_failure() {
    let mut config = fast_config();
    config.kv_transfer.timeout = Duration::from_millis(10);
    let harness =
        TestScheduler::with_transport(config, StubKvTransport::new(Duration::from_millis(200)));
    harness.scheduler.register_worker(&prefill_seed("p1"));
    harness.scheduler.register_worker(&decode_seed("d1"));
    harness.scheduler.start();

    let handle = harness
        .scheduler
        .submit(InferenceRequest::new("test-model", "hi"))
        .unwrap();

    match handle.recv().await {
        Err(SchedulerError::TransferFailed(reason)) => {
            assert!(reason.contains("deadline"));
        }
        other => panic!("expected TransferFailed, got {other:?}"),
    }

    harness.scheduler.stop();
}
