//! Tests for the shard writer cache
//!
//! These tests verify writer ownership and background closing:
//! - One writer per shard id under concurrent opens
//! - Closes wait for in-flight adds
//! - A shard being closed is not reopened until the close finishes
//! - Shutdown drains in-flight adds and closes every writer
//! - Flush and sweep bookkeeping

mod common;

use common::*;
use shardwright::metadata::ShardStore;
use shardwright::shard::ShardStatus;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_status(h: &Harness, id: u64, status: ShardStatus) -> bool {
    for _ in 0..500 {
        if h.status(id).await == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// =========================================================================
// Ownership
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_share_one_writer() {
    let factory = MockWriterFactory::new().open_delay(Duration::from_millis(20));
    let log = factory.log.clone();
    let h = Arc::new(harness(Arc::new(factory)));
    h.index("idx", 1, 100);
    let id = h.shard("idx", MOCK_VERSION).await.id;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            h.node.writers().get_or_open_writer(id).await.unwrap()
        }));
    }
    let mut writers = Vec::new();
    for task in tasks {
        writers.push(task.await.unwrap().expect("writer available"));
    }

    assert!(writers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(log.opens_of(id), 1);
    assert_eq!(h.status(id).await, ShardStatus::Open);
}

#[tokio::test]
async fn test_reopen_after_close_gives_new_writer() {
    let factory = MockWriterFactory::new();
    let log = factory.log.clone();
    let h = harness(Arc::new(factory));
    h.index("idx", 1, 100);
    let id = h.shard("idx", MOCK_VERSION).await.id;

    let first = h.node.writers().get_or_open_writer(id).await.unwrap().unwrap();
    assert!(h.node.writers().close(id));
    assert!(wait_for_status(&h, id, ShardStatus::Closed).await);
    assert!(eventually(|| !h.node.writers().is_closing(id)).await);

    let second = h.node.writers().get_or_open_writer(id).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(log.opens_of(id), 2);
    assert_eq!(log.closes_of(id), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shard_being_closed_is_not_reopened() {
    let factory = MockWriterFactory::new();
    let log = factory.log.clone();
    log.hold_closes.store(true, Ordering::SeqCst);
    let h = harness(Arc::new(factory));
    h.index("idx", 1, 100);
    let id = h.shard("idx", MOCK_VERSION).await.id;

    h.node.writers().get_or_open_writer(id).await.unwrap().unwrap();
    assert!(h.node.writers().close(id));
    assert!(wait_for_status(&h, id, ShardStatus::Closing).await);

    assert!(h.node.writers().get_or_open_writer(id).await.unwrap().is_none());
    assert!(!h.node.writers().add_document(id, &doc(1)).await.unwrap());
    assert_eq!(log.opens_of(id), 1);

    log.release_closes(1);
    assert!(wait_for_status(&h, id, ShardStatus::Closed).await);
    assert!(eventually(|| !h.node.writers().is_closing(id)).await);
    assert!(h.node.writers().get_or_open_writer(id).await.unwrap().is_some());
}

// =========================================================================
// In-flight adds
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_waits_for_in_flight_add() {
    let factory = MockWriterFactory::new();
    let log = factory.log.clone();
    let h = Arc::new(harness(Arc::new(factory)));
    h.index("idx", 1, 100);
    let id = h.shard("idx", MOCK_VERSION).await.id;
    h.node.writers().get_or_open_writer(id).await.unwrap().unwrap();

    log.hold_adds.store(true, Ordering::SeqCst);
    let add = {
        let h = h.clone();
        tokio::spawn(async move { h.node.writers().add_document(id, &doc(1)).await })
    };
    assert!(eventually(|| log.adds_waiting.load(Ordering::SeqCst) == 1).await);

    assert!(h.node.writers().close(id));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(log.closes_of(id), 0, "close must wait for the add");

    log.release_adds(1);
    assert!(add.await.unwrap().unwrap());
    assert!(eventually(|| log.closes_of(id) == 1).await);
    assert!(wait_for_status(&h, id, ShardStatus::Closed).await);
    assert_eq!(h.load(id).await.document_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drains_in_flight_then_closes_all() {
    let factory = MockWriterFactory::new();
    let log = factory.log.clone();
    let h = Arc::new(harness(Arc::new(factory)));
    h.index("idx", 1, 100);

    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = h.shard("idx", MOCK_VERSION).await.id;
        h.node.writers().get_or_open_writer(id).await.unwrap().unwrap();
        ids.push(id);
    }

    log.hold_adds.store(true, Ordering::SeqCst);
    let add = {
        let h = h.clone();
        let id = ids[0];
        tokio::spawn(async move { h.node.writers().add_document(id, &doc(1)).await })
    };
    assert!(eventually(|| log.adds_waiting.load(Ordering::SeqCst) == 1).await);

    let shutdown = {
        let h = h.clone();
        tokio::spawn(async move { h.node.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!shutdown.is_finished(), "shutdown must wait for the in-flight add");
    assert!(log.closes.lock().is_empty());

    log.release_adds(1);
    shutdown.await.unwrap();
    assert!(add.await.unwrap().unwrap());

    assert_eq!(log.closes.lock().len(), 5);
    assert!(h.node.writers().is_empty());
    assert_eq!(h.load(ids[0]).await.document_count, 1);
    for id in ids {
        assert_eq!(h.status(id).await, ShardStatus::Closed, "shard {}", id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_waits_for_pending_open() {
    let factory = MockWriterFactory::new().open_delay(Duration::from_millis(300));
    let log = factory.log.clone();
    let h = Arc::new(harness(Arc::new(factory)));
    h.index("idx", 1, 100);
    let id = h.shard("idx", MOCK_VERSION).await.id;

    let add = {
        let h = h.clone();
        tokio::spawn(async move { h.node.writers().add_document(id, &doc(1)).await })
    };
    assert!(wait_for_status(&h, id, ShardStatus::Opening).await);

    h.node.shutdown().await;

    // The open finished after shutdown began, so its writer was never handed out
    assert_eq!(h.status(id).await, ShardStatus::Closed);
    assert!(h.node.writers().is_empty());
    assert!(!h.node.writers().is_closing(id));
    assert_eq!(log.opens_of(id), 1);
    assert_eq!(log.closes_of(id), 1);
    assert!(log.adds.lock().is_empty());
    assert!(add.await.unwrap().is_err());

    // Nothing opens once shut down
    let other = h.shard("idx", MOCK_VERSION).await.id;
    assert!(h.node.writers().add_document(other, &doc(2)).await.is_err());
    assert_eq!(h.status(other).await, ShardStatus::New);
}

// =========================================================================
// Flush and sweep
// =========================================================================

#[tokio::test]
async fn test_flush_all_commits_every_writer() {
    let factory = MockWriterFactory::new();
    let log = factory.log.clone();
    let h = harness(Arc::new(factory));
    h.index("idx", 1, 100);

    let mut ids = Vec::new();
    for n in 0..3 {
        let id = h.shard("idx", MOCK_VERSION).await.id;
        for i in 0..=n {
            assert!(h.node.writers().add_document(id, &doc(i)).await.unwrap());
        }
        ids.push(id);
    }

    assert_eq!(h.node.run_flush_all().await, 3);
    assert_eq!(log.flushes.lock().len(), 3);
    for (n, id) in ids.into_iter().enumerate() {
        let shard = h.load(id).await;
        assert_eq!(shard.document_count, n as u64 + 1);
        assert!(shard.commit_ms.is_some());
        assert_eq!(shard.status, ShardStatus::Open);
    }
}

#[tokio::test]
async fn test_sweep_closes_writers_past_lifetime() {
    let factory = MockWriterFactory::new();
    let log = factory.log.clone();
    let h = harness_with(Arc::new(factory), |config| {
        config.writer_cache.max_lifetime = Duration::from_millis(200);
    });
    h.index("idx", 1, 100);
    for _ in 0..3 {
        let id = h.shard("idx", MOCK_VERSION).await.id;
        h.node.writers().get_or_open_writer(id).await.unwrap().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(h.node.run_sweep(), 3);
    assert!(h.node.writers().is_empty());
    h.node.shutdown().await;
    assert_eq!(log.closes.lock().len(), 3);
}

#[tokio::test]
async fn test_failed_reopen_leaves_shard_closed() {
    let h = harness(Arc::new(MockWriterFactory::new().failing_open()));
    h.index("idx", 1, 100);
    let id = h.shard("idx", MOCK_VERSION).await.id;
    h.store.set_status(id, ShardStatus::Closed).await.unwrap();

    assert!(h.node.writers().get_or_open_writer(id).await.unwrap().is_none());
    assert_eq!(h.status(id).await, ShardStatus::Closed);
}
