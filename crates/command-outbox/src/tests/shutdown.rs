//! Loop shutdown and claim release.

use super::harness::{test_config, TestHarness};
use crate::{Broker, BrokerMessage, BrokerResult, OutboxDispatcher, OutboxStore};
use async_trait::async_trait;
use command_throttle::{PublishThrottleConfig, TenantPublishThrottler};
use dispatch_database::{AsyncDatabase, OutboxStatus};
use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Broker whose first publish signals shutdown and takes the outbox table
/// away, so every later store call fails.
struct SabotagingBroker {
    db: AsyncDatabase,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl Broker for SabotagingBroker {
    async fn publish(&self, _message: &BrokerMessage) -> BrokerResult<String> {
        let sender = self.shutdown.lock().unwrap().take();
        if let Some(tx) = sender {
            tx.send(()).unwrap();
            self.db
                .call_sqlite(|conn| conn.execute_batch("DROP TABLE outbox_events"))
                .await
                .unwrap();
        }
        Ok("sabotaged-1".to_string())
    }

    fn name(&self) -> &'static str {
        "sabotaging"
    }
}

#[tokio::test]
async fn run_returns_after_shutdown_signal() {
    let h = TestHarness::new().await;
    h.enqueue("e1", "tenant-a", "p1").await;

    let (tx, rx) = oneshot::channel();
    let (_, ()) = tokio::join!(
        async {
            h.wait_for_status("e1", OutboxStatus::Delivered).await;
            tx.send(()).unwrap();
        },
        async {
            tokio::time::timeout(Duration::from_secs(2), h.dispatcher.run(rx))
                .await
                .expect("dispatcher did not stop");
        },
    );
}

#[tokio::test]
async fn dropped_sender_stops_the_loop() {
    let h = TestHarness::new().await;
    let (tx, rx) = oneshot::channel::<()>();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(2), h.dispatcher.run(rx))
        .await
        .expect("dispatcher did not stop");
}

#[tokio::test]
async fn stop_between_rows_releases_the_rest() {
    let h = TestHarness::new().await;
    for id in ["e1", "e2", "e3"] {
        h.enqueue(id, "tenant-a", id).await;
    }

    let events = h.store().claim_batch(10, 60_000).await.unwrap();
    assert_eq!(events.len(), 3);

    let checks = Cell::new(0);
    let (report, stopped) = h
        .dispatcher
        .process_batch(events, || {
            checks.set(checks.get() + 1);
            checks.get() > 1
        })
        .await
        .unwrap();

    assert!(stopped);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.released, 2);
    assert_eq!(h.status("e1").await, OutboxStatus::Delivered);
    assert_eq!(h.status("e2").await, OutboxStatus::Pending);
    assert_eq!(h.status("e3").await, OutboxStatus::Pending);

    // Released rows are immediately claimable again
    assert_eq!(h.dispatcher.run_once().await.unwrap().delivered, 2);
}

#[tokio::test]
async fn shutdown_during_failed_release_still_returns() {
    let h = TestHarness::new().await;
    for id in ["e1", "e2", "e3"] {
        h.enqueue(id, "tenant-a", id).await;
    }

    let (tx, rx) = oneshot::channel();
    let broker: Arc<dyn Broker> = Arc::new(SabotagingBroker {
        db: h.db.clone(),
        shutdown: Mutex::new(Some(tx)),
    });
    let dispatcher = OutboxDispatcher::new(
        OutboxStore::with_instance_id(h.db.clone(), "dispatcher-a"),
        broker,
        Arc::new(TenantPublishThrottler::new(PublishThrottleConfig::default())),
        test_config(),
    );

    tokio::time::timeout(Duration::from_secs(2), dispatcher.run(rx))
        .await
        .expect("dispatcher did not stop");
}
