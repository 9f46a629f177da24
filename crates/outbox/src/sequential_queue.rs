//! Durable, strictly ordered dispatcher for persisted requests.
//!
//! The queue drains the request log head by head with at most one request in
//! flight. Only the leader drains. Retryable failures keep the head in place
//! and back off; connectivity loss pauses the queue until it is unpaused.
//! Store updates produced during a drain cycle are buffered in the
//! reconciler and committed once the cycle ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::RequestError;
use crate::leader::Leadership;
use crate::reconciler::UpdateReconciler;
use crate::throttle::RequestThrottle;
use crate::types::{
    Request, RequestFilter, RequestHandle, RequestId, RequestLog, Responder, Response, StoreUpdate,
    Transport,
};

/// Externally visible queue state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Idle,
    Running,
    Paused,
}

/// Counters for logging and the workload report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retries: u64,
    pub pauses: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    pauses: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct State {
    running: bool,
    paused: bool,
    /// A push arrived while running; re-check the log before going idle.
    rerun: bool,
    current: Option<RequestId>,
    responders: HashMap<RequestId, Responder>,
}

/// What the drain loop does after handling one head.
enum Step {
    Advance,
    Retry(Duration),
    Stop,
}

pub struct SequentialQueue {
    cfg: QueueConfig,
    log: Arc<dyn RequestLog>,
    transport: Arc<dyn Transport>,
    leadership: Arc<Leadership>,
    reconciler: Arc<UpdateReconciler>,
    connectivity: Arc<Connectivity>,
    state: Mutex<State>,
    /// Serializes head selection against appends and cancellation.
    head_lock: tokio::sync::Mutex<()>,
    /// Wakes a backoff wait early (pause, unpause, shutdown).
    wake: Notify,
    idle_tx: watch::Sender<bool>,
    stats: Counters,
}

impl SequentialQueue {
    pub fn new(
        cfg: QueueConfig,
        log: Arc<dyn RequestLog>,
        transport: Arc<dyn Transport>,
        leadership: Arc<Leadership>,
        reconciler: Arc<UpdateReconciler>,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            cfg,
            log,
            transport,
            leadership,
            reconciler,
            connectivity,
            state: Mutex::new(State::default()),
            head_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            idle_tx,
            stats: Counters::default(),
        }
    }

    /// Persist a request and start draining if this process may.
    ///
    /// On the leader the caller's handle resolves once the request reaches a
    /// terminal outcome. A follower only persists: its handle resolves at
    /// once with `RequestError::Deferred` and the leading process dispatches
    /// the request. After a restart the request is replayed without a handle.
    pub async fn push(self: &Arc<Self>, request: Request) -> Result<RequestHandle, RequestError> {
        let id = request.id;
        let (tx, handle) = RequestHandle::channel(id);
        {
            // Held until the responder is registered so no drain sees the
            // new head without it.
            let _head = self.head_lock.lock().await;
            if let Err(err) = self.log.append(request.to_persisted()).await {
                tracing::error!(error = ?err, request = %id, command = %request.command, "persist request failed");
                return Err(RequestError::storage(&err));
            }
            if !self.leadership.is_leader() {
                tracing::debug!(request = %id, command = %request.command, "persisted request left for the leader");
                let _ = tx.send(Err(RequestError::Deferred));
                return Ok(handle);
            }
            self.lock_state().responders.insert(id, tx);
        }
        tracing::debug!(request = %id, command = %request.command, "persisted request queued");
        self.start_drain();
        Ok(handle)
    }

    /// Drain the log and resolve once the queue is idle (empty, paused, or
    /// not leader).
    pub async fn flush(self: &Arc<Self>) {
        self.start_drain();
        self.wait_for_idle().await;
    }

    pub async fn wait_for_idle(&self) {
        let mut rx = self.idle_tx.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Stop dispatching new heads; the log is left untouched.
    pub fn pause(&self) {
        let mut state = self.lock_state();
        if state.paused {
            return;
        }
        state.paused = true;
        drop(state);
        self.stats.pauses.fetch_add(1, Ordering::Relaxed);
        tracing::info!("sequential queue paused");
        self.wake.notify_waiters();
    }

    /// Resume from the current head.
    pub fn unpause(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if !state.paused {
                return;
            }
            state.paused = false;
        }
        tracing::info!("sequential queue unpaused");
        self.wake.notify_waiters();
        self.start_drain();
    }

    /// Remove queued requests matching `predicate` without dispatching them.
    ///
    /// The request currently in flight is never removed. Canceled callers
    /// receive `RequestError::Cancelled`.
    pub async fn cancel(&self, predicate: RequestFilter) -> anyhow::Result<Vec<Request>> {
        let _head = self.head_lock.lock().await;
        let current = self.lock_state().current;
        let keep: RequestFilter = Arc::new(move |r: &Request| Some(r.id) == current || !predicate(r));
        let removed = self.log.retain(keep).await?;
        if removed.is_empty() {
            return Ok(removed);
        }
        let responders: Vec<Responder> = {
            let mut state = self.lock_state();
            removed
                .iter()
                .filter_map(|r| state.responders.remove(&r.id))
                .collect()
        };
        for tx in responders {
            let _ = tx.send(Err(RequestError::Cancelled));
        }
        self.stats
            .cancelled
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        tracing::info!(count = removed.len(), "cancelled queued persisted requests");
        Ok(removed)
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock_state();
        if state.running {
            QueueStatus::Running
        } else if state.paused {
            QueueStatus::Paused
        } else {
            QueueStatus::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    pub fn is_paused(&self) -> bool {
        self.lock_state().paused
    }

    /// Id of the request currently in flight.
    pub fn current_request(&self) -> Option<RequestId> {
        self.lock_state().current
    }

    pub async fn len(&self) -> anyhow::Result<usize> {
        self.log.len().await
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    /// Wake any backoff wait so the drain re-evaluates its state.
    pub(crate) fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Buffer `updates` behind the running drain so they land after its
    /// responses. Hands them back when no drain is running.
    pub(crate) fn buffer_behind_drain(&self, updates: Vec<StoreUpdate>) -> Option<Vec<StoreUpdate>> {
        let state = self.lock_state();
        if !state.running {
            return Some(updates);
        }
        self.reconciler.queue(updates);
        None
    }

    /// Number of callers still waiting on a handle.
    pub fn pending_handles(&self) -> usize {
        self.lock_state().responders.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("sequential queue state lock")
    }

    /// Transition IDLE -> RUNNING and spawn the drain task when allowed.
    fn start_drain(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.paused || !self.leadership.is_leader() {
                return;
            }
            if state.running {
                state.rerun = true;
                return;
            }
            state.running = true;
            state.rerun = false;
            self.idle_tx.send_replace(false);
        }
        let this = self.clone();
        tokio::spawn(async move { this.drain().await });
    }

    /// Drive drain cycles until the queue can go idle.
    async fn drain(self: Arc<Self>) {
        loop {
            self.drain_cycle().await;
            self.release_settled_elsewhere().await;
            let committed = match self.reconciler.commit().await {
                Ok(0) => true,
                Ok(count) => {
                    tracing::debug!(count, "committed buffered store updates");
                    true
                }
                Err(err) => {
                    tracing::error!(error = ?err, "commit of buffered store updates failed");
                    false
                }
            };
            let again = {
                let mut state = self.lock_state();
                let resume = state.rerun && !state.paused && self.leadership.is_leader();
                // Main-queue writes buffered while the commit was in flight.
                let leftover = committed && !self.reconciler.is_empty();
                if resume || leftover {
                    state.rerun = false;
                    true
                } else {
                    state.running = false;
                    state.rerun = false;
                    state.current = None;
                    // Published under the lock so a racing push cannot be overtaken.
                    self.idle_tx.send_replace(true);
                    false
                }
            };
            if !again {
                break;
            }
        }
    }

    /// Process heads until the log is empty, the queue pauses, leadership is
    /// lost, or storage fails.
    async fn drain_cycle(&self) {
        let mut throttle = RequestThrottle::new(&self.cfg);
        loop {
            if self.is_paused() || !self.leadership.is_leader() {
                return;
            }
            let head = {
                let _head = self.head_lock.lock().await;
                match self.log.head().await {
                    Ok(Some(head)) => {
                        self.lock_state().current = Some(head.id);
                        head
                    }
                    Ok(None) => {
                        let rerun = std::mem::take(&mut self.lock_state().rerun);
                        if rerun {
                            continue;
                        }
                        return;
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, "read request log failed");
                        return;
                    }
                }
            };

            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            let outcome = self.transport.dispatch(&head).await;
            match self.handle_outcome(&head, outcome, &mut throttle).await {
                Step::Advance => {}
                Step::Retry(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Step::Stop => return,
            }
        }
    }

    /// Drop responders whose request is gone from the log. Another process
    /// sharing the log cancelled or settled it, so the handle resolves with
    /// `RequestError::Dropped`.
    async fn release_settled_elsewhere(&self) {
        let _head = self.head_lock.lock().await;
        let live: HashSet<RequestId> = match self.log.read_all().await {
            Ok(requests) => requests.iter().map(|r| r.id).collect(),
            Err(err) => {
                tracing::warn!(error = ?err, "read request log failed, keeping handles");
                return;
            }
        };
        let released: Vec<Responder> = {
            let mut state = self.lock_state();
            let gone: Vec<RequestId> = state
                .responders
                .keys()
                .filter(|id| !live.contains(id))
                .copied()
                .collect();
            gone.iter().filter_map(|id| state.responders.remove(id)).collect()
        };
        if !released.is_empty() {
            tracing::debug!(count = released.len(), "released handles of requests settled elsewhere");
        }
    }

    async fn handle_outcome(
        &self,
        head: &Request,
        outcome: Result<Response, RequestError>,
        throttle: &mut RequestThrottle,
    ) -> Step {
        match outcome {
            Ok(response) => {
                let mut updates = response.updates.clone();
                updates.extend(head.writes.after_response(&response));
                throttle.clear();
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                self.finish(head, updates, Ok(response)).await
            }
            Err(err) if err.is_connectivity() => {
                tracing::info!(request = %head.id, command = %head.command, "request failed to fetch, pausing");
                self.lock_state().current = None;
                self.pause();
                self.connectivity
                    .set_offline(true, "persisted request failed to fetch")
                    .await;
                Step::Stop
            }
            Err(err) if err.is_retryable() => {
                if throttle.is_exhausted() {
                    let attempts = throttle.retry_count().saturating_add(1);
                    tracing::warn!(
                        request = %head.id,
                        command = %head.command,
                        attempts,
                        last_error = %err,
                        "request retried too many times, dropping"
                    );
                    throttle.clear();
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    return self
                        .finish(
                            head,
                            head.writes.after_failure(),
                            Err(RequestError::RetriesExhausted { attempts }),
                        )
                        .await;
                }
                let wait = throttle.next_wait();
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    request = %head.id,
                    command = %head.command,
                    error = %err,
                    wait_ms = wait.as_millis() as u64,
                    "retrying request after backoff"
                );
                Step::Retry(wait)
            }
            Err(err) if err.completes_request() => {
                tracing::debug!(request = %head.id, command = %head.command, error = %err, "request already settled");
                throttle.clear();
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                self.finish(head, head.writes.finally.clone(), Err(err)).await
            }
            Err(err) => {
                tracing::warn!(request = %head.id, command = %head.command, error = %err, "request failed permanently");
                throttle.clear();
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.finish(head, head.writes.after_failure(), Err(err)).await
            }
        }
    }

    /// Remove a settled head from the log, then buffer its writes and
    /// resolve its caller.
    ///
    /// If the log cannot be updated the request stays durable and will be
    /// dispatched again on the next drain; its writes are not buffered.
    async fn finish(
        &self,
        head: &Request,
        updates: Vec<StoreUpdate>,
        result: Result<Response, RequestError>,
    ) -> Step {
        if let Err(err) = self.log.remove(head.id).await {
            tracing::error!(error = ?err, request = %head.id, "remove settled request from log failed");
            self.lock_state().current = None;
            return Step::Stop;
        }
        self.reconciler.queue(updates);
        let tx = {
            let mut state = self.lock_state();
            state.current = None;
            state.responders.remove(&head.id)
        };
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
        Step::Advance
    }
}
