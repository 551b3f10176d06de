//! Delivery envelope, ordering and publish spacing.

use super::harness::{TestHarness, TOPIC};
use crate::{DispatchReport, EVENT_ID_HEADER};
use dispatch_database::OutboxStatus;
use std::time::{Duration, Instant};

#[tokio::test]
async fn claimed_rows_are_published_and_marked_delivered() {
    let h = TestHarness::new().await;
    h.enqueue("e1", "tenant-a", "tenant-a").await;
    h.enqueue("e2", "tenant-b", "tenant-b").await;

    let report = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        report,
        DispatchReport {
            claimed: 2,
            delivered: 2,
            ..DispatchReport::default()
        }
    );

    for id in ["e1", "e2"] {
        let event = h.event(id).await;
        assert_eq!(event.status, OutboxStatus::Delivered);
        assert!(event.delivered_at.is_some());
        assert!(event.locked_by.is_none());
    }

    // Nothing left to do
    assert_eq!(h.dispatcher.run_once().await.unwrap(), DispatchReport::default());
    assert_eq!(h.broker.published().len(), 2);
}

#[tokio::test]
async fn envelope_carries_key_payload_and_headers() {
    let h = TestHarness::new().await;
    let event = h.enqueue("e1", "tenant-a", "order-17").await;

    h.dispatcher.run_once().await.unwrap();

    let published = h.broker.published_to(TOPIC);
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.key, "order-17");
    assert_eq!(message.payload, event.payload);
    assert_eq!(message.headers[EVENT_ID_HEADER], "e1");
    assert_eq!(message.headers["commandName"], "order.create");
    assert_eq!(message.headers["tenantId"], "tenant-a");
    assert_eq!(message.headers["requestId"], "e1");
}

#[tokio::test]
async fn same_partition_is_published_in_claim_order() {
    let h = TestHarness::new().await;
    for id in ["e1", "e2", "e3", "e4"] {
        h.enqueue(id, "tenant-a", "tenant-a").await;
    }

    h.dispatcher.run_once().await.unwrap();

    assert_eq!(h.published_ids(TOPIC), vec!["e1", "e2", "e3", "e4"]);
}

#[tokio::test]
async fn tenant_publishes_are_spaced() {
    let h = TestHarness::with_publish_spacing(40).await;
    for id in ["e1", "e2", "e3"] {
        h.enqueue(id, "tenant-a", id).await;
    }

    let started = Instant::now();
    let report = h.dispatcher.run_once().await.unwrap();

    assert_eq!(report.delivered, 3);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn failed_row_holds_back_the_rest_of_its_partition() {
    let h = TestHarness::new().await;
    h.enqueue("e1", "tenant-a", "order-1").await;
    h.enqueue("e2", "tenant-a", "order-1").await;
    h.enqueue("e3", "tenant-a", "order-2").await;
    h.broker.fail_next(1);

    let report = h.dispatcher.run_once().await.unwrap();
    assert_eq!(
        report,
        DispatchReport {
            claimed: 3,
            delivered: 1,
            retried: 1,
            released: 1,
            ..DispatchReport::default()
        }
    );
    assert_eq!(h.published_ids(TOPIC), vec!["e3"]);
    assert_eq!(h.status("e1").await, OutboxStatus::Retrying);
    let held = h.event("e2").await;
    assert_eq!(held.status, OutboxStatus::Pending);
    assert_eq!(held.retry_count, 0);

    // The retry goes out alone; its successor follows on the next pass
    assert_eq!(h.dispatcher.run_once().await.unwrap().delivered, 1);
    assert_eq!(h.dispatcher.run_once().await.unwrap().delivered, 1);
    assert_eq!(h.published_ids(TOPIC), vec!["e3", "e1", "e2"]);
}
