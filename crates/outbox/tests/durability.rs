//! Restart tests for the file-backed request log.
//!
//! Test flow:
//! 1) Queue persisted requests in one "process" whose transport is offline,
//!    so nothing beyond the first dispatch attempt completes.
//! 2) Drop the queue and reopen the log directory from a fresh "process".
//! 3) Drain with a healthy transport and check every request is dispatched
//!    exactly in its original order and the log ends empty.

mod common;

use std::sync::Arc;

use common::{QueueHarness, ScriptedTransport};
use outbox::{AlwaysLeader, FileRequestLog, QueueConfig, RequestError, RequestLog};

#[tokio::test]
async fn pending_requests_survive_restart_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let transport = ScriptedTransport::new();
        transport.script("A", vec![Err(RequestError::Offline)]);
        let log = Arc::new(FileRequestLog::open_dir(dir.path()).expect("open log"));
        let h = QueueHarness::new(
            QueueConfig::for_tests(),
            log,
            Arc::new(AlwaysLeader),
            transport.clone(),
        )
        .await;
        for command in ["A", "B", "C"] {
            h.queue.push(h.request(command)).await.expect("push");
        }
        h.queue.flush().await;
        assert_eq!(transport.calls(), vec!["A"]);
        assert!(h.queue.is_paused());
        assert_eq!(h.logged_commands().await, vec!["A", "B", "C"]);
    }

    let transport = ScriptedTransport::new();
    let log = Arc::new(FileRequestLog::open_dir(dir.path()).expect("reopen log"));
    let h = QueueHarness::new(
        QueueConfig::for_tests(),
        log.clone(),
        Arc::new(AlwaysLeader),
        transport.clone(),
    )
    .await;
    assert_eq!(h.queue.len().await.expect("len"), 3);
    h.queue.flush().await;

    assert_eq!(transport.calls(), vec!["A", "B", "C"]);
    assert!(log.read_all().await.expect("read").is_empty());
}

#[tokio::test]
async fn optimistic_writes_are_not_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = FileRequestLog::open_dir(dir.path()).expect("open log");
    let transport = ScriptedTransport::new();
    let h = QueueHarness::new(
        QueueConfig::for_tests(),
        Arc::new(log.clone()),
        Arc::new(outbox::NeverLeader),
        transport,
    )
    .await;

    let options = outbox::RequestOptions {
        writes: outbox::StoreWrites {
            optimistic: vec![outbox::StoreUpdate::set("draft", serde_json::json!("hello"))],
            success: vec![outbox::StoreUpdate::remove("draft")],
            ..Default::default()
        },
        ..Default::default()
    };
    h.queue
        .push(h.request_with("AddComment", options))
        .await
        .expect("push");

    let reopened = FileRequestLog::open_dir(dir.path()).expect("reopen");
    let stored = reopened.read_all().await.expect("read");
    assert_eq!(stored.len(), 1);
    assert!(stored[0].writes.optimistic.is_empty());
    assert_eq!(stored[0].writes.success.len(), 1);
}
