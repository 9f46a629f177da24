//! Leadership among processes sharing one data directory.
//!
//! Only the leader drains persisted requests. `FileLockElection` backs the
//! claim with a non-blocking exclusive lock on `leader.lock`; the OS drops the
//! lock when the holder exits, and a follower's next heartbeat claim wins it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::types::Election;

/// Lock file used for the leadership claim.
const LEADER_LOCK_FILE: &str = "leader.lock";

/// Leadership backed by an exclusive advisory file lock.
pub struct FileLockElection {
    lock_path: PathBuf,
    held: Mutex<Option<File>>,
}

impl FileLockElection {
    pub fn new(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).context("create leader lock dir")?;
        Ok(Self {
            lock_path: dir.join(LEADER_LOCK_FILE),
            held: Mutex::new(None),
        })
    }

    /// Give up leadership (closing the file releases the lock).
    pub fn resign(&self) {
        self.held.lock().expect("leader lock state").take();
    }
}

#[async_trait]
impl Election for FileLockElection {
    async fn claim(&self) -> anyhow::Result<bool> {
        if self.is_leader() {
            return Ok(true);
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("open leader lock {}", self.lock_path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                *self.held.lock().expect("leader lock state") = Some(file);
                Ok(true)
            }
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(err) => Err(err).context("claim leader lock"),
        }
    }

    fn is_leader(&self) -> bool {
        self.held.lock().expect("leader lock state").is_some()
    }
}

/// Test double that always grants leadership.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLeader;

#[async_trait]
impl Election for AlwaysLeader {
    async fn claim(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn is_leader(&self) -> bool {
        true
    }
}

/// Test double that never leads.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverLeader;

#[async_trait]
impl Election for NeverLeader {
    async fn claim(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn is_leader(&self) -> bool {
        false
    }
}

/// Tracks this process's leadership and exposes readiness to the queues.
pub struct Leadership {
    election: Arc<dyn Election>,
    ready: AtomicBool,
    leader_tx: watch::Sender<Option<bool>>,
}

impl Leadership {
    pub fn new(election: Arc<dyn Election>) -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            election,
            ready: AtomicBool::new(false),
            leader_tx,
        }
    }

    /// Resolve once this process knows whether it leads.
    ///
    /// The first caller performs the initial claim; a failing claim is logged
    /// and treated as "another process leads" so startup is never blocked.
    pub async fn is_ready(&self) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            self.refresh().await;
            self.ready.store(true, Ordering::Release);
        }
        self.is_leader()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Watch leadership changes (`None` until the first claim completes).
    pub fn subscribe(&self) -> watch::Receiver<Option<bool>> {
        self.leader_tx.subscribe()
    }

    /// Claim once and publish the outcome.
    pub async fn refresh(&self) -> bool {
        let leader = match self.election.claim().await {
            Ok(leader) => leader,
            Err(err) => {
                tracing::warn!(error = ?err, "leadership claim failed");
                false
            }
        };
        self.leader_tx.send_if_modified(|current| {
            if *current == Some(leader) {
                return false;
            }
            if leader {
                tracing::info!("this client is now the leader");
            } else if current.is_none() {
                tracing::info!("another client leads; deferring persisted requests");
            }
            *current = Some(leader);
            true
        });
        leader
    }

    /// Periodically re-claim so a follower takes over when the leader exits.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_lock_admits_one_leader_until_resign() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = FileLockElection::new(dir.path()).expect("first");
        let second = FileLockElection::new(dir.path()).expect("second");

        assert!(first.claim().await.expect("claim"));
        assert!(!second.claim().await.expect("claim"));
        assert!(first.claim().await.expect("reclaim is idempotent"));

        first.resign();
        assert!(!first.is_leader());
        assert!(second.claim().await.expect("takeover"));
        assert!(second.is_leader());
    }

    #[tokio::test]
    async fn readiness_publishes_first_claim() {
        let leadership = Leadership::new(Arc::new(NeverLeader));
        let rx = leadership.subscribe();
        assert_eq!(*rx.borrow(), None);
        assert!(!leadership.is_ready().await);
        assert_eq!(*rx.borrow(), Some(false));
    }
}
