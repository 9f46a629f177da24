//! Two processes sharing one data directory.
//!
//! Both build a queue over the same request log and a file-lock election on
//! the same directory. Exactly one becomes leader; the follower's queue
//! stays idle while the leader drains everything either of them queued.

mod common;

use std::sync::Arc;

use common::{wait_until, QueueHarness, ScriptedTransport};
use outbox::{
    FileLockElection, FileRequestLog, Leadership, MemoryStore, Network, Payload, QueueConfig,
    QueueStatus, Request, RequestError, RequestFilter, RequestOptions,
};

#[tokio::test]
async fn exactly_one_process_drains_shared_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first_election = Arc::new(FileLockElection::new(dir.path()).expect("election"));
    let second_election = Arc::new(FileLockElection::new(dir.path()).expect("election"));

    let first_transport = ScriptedTransport::new();
    let second_transport = ScriptedTransport::new();
    let first = QueueHarness::new(
        QueueConfig::for_tests(),
        Arc::new(FileRequestLog::open_dir(dir.path()).expect("log")),
        first_election.clone(),
        first_transport.clone(),
    )
    .await;
    let second = QueueHarness::new(
        QueueConfig::for_tests(),
        Arc::new(FileRequestLog::open_dir(dir.path()).expect("log")),
        second_election.clone(),
        second_transport.clone(),
    )
    .await;

    assert!(first.leadership.is_leader());
    assert!(!second.leadership.is_leader());

    let from_follower = second.queue.push(second.request("FromFollower")).await.expect("push");
    assert_eq!(from_follower.wait().await, Err(RequestError::Deferred));
    assert_eq!(second.queue.pending_handles(), 0);
    assert_eq!(second.queue.status(), QueueStatus::Idle);
    first.queue.push(first.request("FromLeader")).await.expect("push");
    first.queue.flush().await;
    second.queue.flush().await;

    assert_eq!(first_transport.calls(), vec!["FromFollower", "FromLeader"]);
    assert!(second_transport.calls().is_empty());
    assert!(first.logged_commands().await.is_empty());
}

#[tokio::test]
async fn follower_takes_over_after_leader_resigns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let leader_election = Arc::new(FileLockElection::new(dir.path()).expect("election"));
    let follower_election = Arc::new(FileLockElection::new(dir.path()).expect("election"));

    let leader = Leadership::new(leader_election.clone());
    assert!(leader.is_ready().await);

    let transport = ScriptedTransport::new();
    let follower = QueueHarness::new(
        QueueConfig::for_tests(),
        Arc::new(FileRequestLog::open_dir(dir.path()).expect("log")),
        follower_election,
        transport.clone(),
    )
    .await;
    assert!(!follower.leadership.is_leader());
    follower.queue.push(follower.request("Pending")).await.expect("push");

    let heartbeat = follower
        .leadership
        .spawn_heartbeat(follower.cfg.leader_heartbeat);
    leader_election.resign();
    let leadership = follower.leadership.clone();
    wait_until("follower leadership", move || leadership.is_leader()).await;
    heartbeat.abort();

    follower.queue.flush().await;
    assert_eq!(transport.calls(), vec!["Pending"]);
}

#[tokio::test]
async fn leader_releases_handles_of_requests_removed_by_another_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = ScriptedTransport::new();
    let leader = QueueHarness::new(
        QueueConfig::for_tests(),
        Arc::new(FileRequestLog::open_dir(dir.path()).expect("log")),
        Arc::new(FileLockElection::new(dir.path()).expect("election")),
        transport.clone(),
    )
    .await;
    let follower = QueueHarness::new(
        QueueConfig::for_tests(),
        Arc::new(FileRequestLog::open_dir(dir.path()).expect("log")),
        Arc::new(FileLockElection::new(dir.path()).expect("election")),
        ScriptedTransport::new(),
    )
    .await;
    assert!(leader.leadership.is_leader());

    leader.queue.pause();
    let handle = leader.queue.push(leader.request("Doomed")).await.expect("push");
    assert_eq!(leader.queue.pending_handles(), 1);

    let everything: RequestFilter = Arc::new(|_: &Request| true);
    let removed = follower.queue.cancel(everything).await.expect("cancel");
    assert_eq!(removed.len(), 1);

    leader.queue.unpause();
    leader.queue.wait_for_idle().await;
    assert_eq!(handle.wait().await, Err(RequestError::Dropped));
    assert_eq!(leader.queue.pending_handles(), 0);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn started_follower_drains_once_it_gains_leadership() {
    let dir = tempfile::tempdir().expect("tempdir");
    let leader_election = Arc::new(FileLockElection::new(dir.path()).expect("election"));
    let leader = Leadership::new(leader_election.clone());
    assert!(leader.is_ready().await);

    let transport = ScriptedTransport::new();
    let follower = Network::new(
        QueueConfig::for_tests(),
        transport.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(FileRequestLog::open_dir(dir.path()).expect("log")),
        Arc::new(FileLockElection::new(dir.path()).expect("election")),
    );
    let handle = follower.start().await;
    assert!(!follower.leadership().is_leader());

    let pending = follower
        .write("Pending", Payload::new(), RequestOptions::default())
        .await
        .expect("write");
    assert_eq!(pending.wait().await, Err(RequestError::Deferred));
    assert!(transport.calls().is_empty());

    leader_election.resign();
    transport.wait_for_call("Pending").await;
    follower.sequential_queue().wait_for_idle().await;
    assert_eq!(follower.sequential_queue().len().await.expect("len"), 0);
    handle.shutdown();
}
