//! End-to-end flows through the `Network` front door.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::ScriptedTransport;
use outbox::{
    keys, AlwaysLeader, MemoryRequestLog, MemoryStore, Network, Payload, QueueConfig,
    RequestError, RequestLog, RequestOptions, Store, StoreUpdate, StoreWrites,
};

fn network(transport: Arc<ScriptedTransport>, store: Arc<MemoryStore>, log: Arc<MemoryRequestLog>) -> Arc<Network> {
    Network::new(
        QueueConfig::for_tests(),
        transport,
        store,
        log,
        Arc::new(AlwaysLeader),
    )
}

fn payload(report_id: u64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("reportID".to_string(), json!(report_id));
    payload
}

#[tokio::test]
async fn start_drains_requests_left_from_a_previous_run() {
    let log = Arc::new(MemoryRequestLog::new());
    {
        let transport = ScriptedTransport::new();
        transport.script("Leftover", vec![Err(RequestError::Offline)]);
        let net = network(transport, Arc::new(MemoryStore::new()), log.clone());
        let handle = net.start().await;
        net.write("Leftover", payload(1), RequestOptions::default())
            .await
            .expect("write");
        net.sequential_queue().wait_for_idle().await;
        handle.shutdown();
    }
    assert_eq!(log.len().await.expect("len"), 1);

    let transport = ScriptedTransport::new();
    let net = network(transport.clone(), Arc::new(MemoryStore::new()), log.clone());
    let handle = net.start().await;
    assert_eq!(transport.calls(), vec!["Leftover"]);
    assert!(log.read_all().await.expect("read").is_empty());
    handle.shutdown();
}

#[tokio::test]
async fn write_applies_optimistic_then_success_updates() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let net = network(transport.clone(), store.clone(), Arc::new(MemoryRequestLog::new()));
    let handle = net.start().await;

    let options = RequestOptions {
        writes: StoreWrites {
            optimistic: vec![StoreUpdate::set("report_1", json!({ "pendingAction": "add" }))],
            success: vec![StoreUpdate::merge("report_1", json!({ "pendingAction": null }))],
            ..StoreWrites::default()
        },
        ..RequestOptions::default()
    };
    let request = net.write("AddReport", payload(1), options).await.expect("write");
    assert_eq!(
        store.get("report_1").await,
        Some(json!({ "pendingAction": "add" }))
    );

    assert!(request.wait().await.is_ok());
    net.sequential_queue().wait_for_idle().await;
    assert_eq!(store.get("report_1").await, Some(json!({})));
    handle.shutdown();
}

#[tokio::test]
async fn post_resolves_through_main_queue() {
    let transport = ScriptedTransport::new();
    let net = network(transport.clone(), Arc::new(MemoryStore::new()), Arc::new(MemoryRequestLog::new()));
    let handle = net.start().await;

    let response = net
        .post("GetReport", payload(7), RequestOptions::default())
        .wait()
        .await
        .expect("response");
    assert!(response.is_success());
    assert_eq!(transport.calls(), vec!["GetReport"]);
    handle.shutdown();
}

#[tokio::test]
async fn offline_mode_holds_writes_until_reconnect() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let net = network(transport.clone(), store.clone(), Arc::new(MemoryRequestLog::new()));
    let handle = net.start().await;

    net.set_is_offline(true, "lost connection").await;
    assert_eq!(store.get(keys::NETWORK).await, Some(json!({ "isOffline": true })));

    let first = net.write("First", payload(1), RequestOptions::default()).await.expect("write");
    let second = net.write("Second", payload(2), RequestOptions::default()).await.expect("write");
    net.sequential_queue().flush().await;
    assert!(transport.calls().is_empty());

    net.set_is_offline(false, "reconnected").await;
    assert!(first.wait().await.is_ok());
    assert!(second.wait().await.is_ok());
    assert_eq!(transport.calls(), vec!["First", "Second"]);
    assert_eq!(store.get(keys::NETWORK).await, Some(json!({ "isOffline": false })));
    handle.shutdown();
}

#[tokio::test]
async fn sign_out_cancels_cancelable_work() {
    let transport = ScriptedTransport::new();
    let net = network(transport.clone(), Arc::new(MemoryStore::new()), Arc::new(MemoryRequestLog::new()));
    let handle = net.start().await;
    net.set_is_offline(true, "lost connection").await;

    let queued = net.post(
        "Search",
        Payload::new(),
        RequestOptions {
            process_immediately: false,
            ..RequestOptions::default()
        },
    );
    let cancelable = net.write("OpenReport", payload(1), RequestOptions::default()).await.expect("write");
    let kept = net
        .write(
            "LogOut",
            Payload::new(),
            RequestOptions {
                cancelable: false,
                ..RequestOptions::default()
            },
        )
        .await
        .expect("write");

    assert_eq!(net.sign_out().await.expect("sign out"), 2);
    assert_eq!(queued.wait().await, Err(RequestError::Cancelled));
    assert_eq!(cancelable.wait().await, Err(RequestError::Cancelled));

    net.set_is_offline(false, "reconnected").await;
    assert!(kept.wait().await.is_ok());
    assert_eq!(transport.calls(), vec!["LogOut"]);
    handle.shutdown();
}

#[tokio::test]
async fn failing_all_requests_pauses_until_switched_back() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let log = Arc::new(MemoryRequestLog::new());
    let net = network(transport.clone(), store.clone(), log.clone());
    let handle = net.start().await;

    net.set_should_fail_all_requests(true).await;
    let request = net.write("AddComment", payload(1), RequestOptions::default()).await.expect("write");
    net.sequential_queue().wait_for_idle().await;

    // The request reached the server but its response was dropped.
    assert_eq!(transport.calls(), vec!["AddComment"]);
    assert!(net.connectivity().is_offline());
    assert!(net.sequential_queue().is_paused());
    assert_eq!(log.len().await.expect("len"), 1);
    assert_eq!(
        store.get(keys::NETWORK).await,
        Some(json!({ "shouldFailAllRequests": true, "isOffline": true }))
    );

    net.set_should_fail_all_requests(false).await;
    net.set_is_offline(false, "reconnected").await;
    assert!(request.wait().await.is_ok());
    assert_eq!(transport.calls(), vec!["AddComment", "AddComment"]);
    handle.shutdown();
}

#[tokio::test]
async fn forced_offline_rejects_one_shot_posts() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let net = network(transport.clone(), store.clone(), Arc::new(MemoryRequestLog::new()));
    let handle = net.start().await;

    net.set_should_force_offline(true).await;
    let one_shot = net.post(
        "Ping",
        Payload::new(),
        RequestOptions {
            retryable: false,
            ..RequestOptions::default()
        },
    );
    assert_eq!(one_shot.wait().await, Err(RequestError::Offline));
    assert!(net.connectivity().is_offline());

    net.set_time_skew(1_500).await;
    assert_eq!(net.connectivity().time_skew_ms(), 1_500);
    assert_eq!(
        store.get(keys::NETWORK).await,
        Some(json!({ "shouldForceOffline": true, "isOffline": true, "timeSkew": 1_500 }))
    );
    handle.shutdown();
}
