//! In-memory queue for requests that need not survive a restart.
//!
//! Requests are dispatched concurrently. A run is skipped while a previous
//! run is still settling, and requests that cannot be made right now are
//! carried into the next run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::RequestError;
use crate::sequential_queue::SequentialQueue;
use crate::types::{Request, RequestHandle, Responder, Response, Store, StoreUpdate, Transport};

struct QueuedRequest {
    request: Request,
    force: bool,
    responder: Option<Responder>,
    attempts: u32,
}

impl QueuedRequest {
    fn resolve(mut self, result: Result<Response, RequestError>) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(result);
        }
    }
}

/// Holds the re-entrancy flag for one pass; dropping it releases the flag
/// even when the pass future is abandoned.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MainQueue {
    cfg: QueueConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    connectivity: Arc<Connectivity>,
    sequential: Arc<SequentialQueue>,
    queue: Mutex<Vec<QueuedRequest>>,
    processing: AtomicBool,
    dispatched: AtomicU64,
}

impl MainQueue {
    pub fn new(
        cfg: QueueConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        connectivity: Arc<Connectivity>,
        sequential: Arc<SequentialQueue>,
    ) -> Self {
        Self {
            cfg,
            transport,
            store,
            connectivity,
            sequential,
            queue: Mutex::new(Vec::new()),
            processing: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Queue a request. Forced requests skip the queue and go out at once.
    pub fn push(self: &Arc<Self>, request: Request, force: bool) -> RequestHandle {
        let (tx, handle) = RequestHandle::channel(request.id);
        let entry = QueuedRequest {
            request,
            force,
            responder: Some(tx),
            attempts: 0,
        };
        if force {
            let this = self.clone();
            tokio::spawn(async move {
                let (entry, outcome) = this.dispatch(entry).await;
                this.settle(entry, outcome).await;
            });
        } else {
            self.lock_queue().push(entry);
        }
        handle
    }

    /// Run one pass over the queue. Returns false when a pass was already
    /// in progress.
    pub async fn process(&self) -> bool {
        let Some(_pass) = ProcessingGuard::acquire(&self.processing) else {
            return false;
        };

        let pending = std::mem::take(&mut *self.lock_queue());
        let mut ready = Vec::new();
        let mut deferred = Vec::new();
        for entry in pending {
            if self.can_make_request(&entry) {
                ready.push(entry);
            } else if entry.request.retryable {
                deferred.push(entry);
            } else {
                tracing::debug!(
                    request = %entry.request.id,
                    command = %entry.request.command,
                    "dropping non-retryable request that cannot be made now"
                );
                let err = if self.connectivity.is_offline() {
                    RequestError::Offline
                } else {
                    RequestError::Cancelled
                };
                entry.resolve(Err(err));
            }
        }
        if !deferred.is_empty() {
            self.requeue_front(deferred);
        }

        let mut in_flight: FuturesUnordered<_> = ready.into_iter().map(|e| self.dispatch(e)).collect();
        while let Some((entry, outcome)) = in_flight.next().await {
            self.settle(entry, outcome).await;
        }
        true
    }

    /// Reject every queued request with `Cancelled`.
    pub fn clear(&self) -> usize {
        let pending = std::mem::take(&mut *self.lock_queue());
        let count = pending.len();
        for entry in pending {
            entry.resolve(Err(RequestError::Cancelled));
        }
        if count > 0 {
            tracing::info!(count, "cleared main queue");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Vec<QueuedRequest>> {
        self.queue.lock().expect("main queue lock")
    }

    fn can_make_request(&self, entry: &QueuedRequest) -> bool {
        entry.force || (!self.connectivity.is_offline() && !self.sequential.is_running())
    }

    /// Put deferred requests back ahead of anything pushed meanwhile.
    fn requeue_front(&self, mut entries: Vec<QueuedRequest>) {
        let mut queue = self.lock_queue();
        entries.append(&mut queue);
        *queue = entries;
    }

    async fn dispatch(&self, entry: QueuedRequest) -> (QueuedRequest, Result<Response, RequestError>) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let outcome = self.transport.dispatch(&entry.request).await;
        (entry, outcome)
    }

    async fn settle(&self, mut entry: QueuedRequest, outcome: Result<Response, RequestError>) {
        match outcome {
            Ok(response) => {
                let mut updates = response.updates.clone();
                updates.extend(entry.request.writes.after_response(&response));
                self.apply(updates).await;
                entry.resolve(Ok(response));
            }
            Err(err) if err.is_retryable() && entry.request.retryable => {
                if err.is_connectivity() {
                    self.connectivity
                        .set_offline(true, "main queue request failed to fetch")
                        .await;
                }
                entry.attempts = entry.attempts.saturating_add(1);
                let ceiling = self.cfg.max_request_retries;
                if ceiling > 0 && entry.attempts > ceiling {
                    tracing::warn!(
                        request = %entry.request.id,
                        command = %entry.request.command,
                        attempts = entry.attempts,
                        last_error = %err,
                        "request retried too many times, dropping"
                    );
                    self.apply(entry.request.writes.after_failure()).await;
                    let attempts = entry.attempts;
                    entry.resolve(Err(RequestError::RetriesExhausted { attempts }));
                    return;
                }
                tracing::debug!(
                    request = %entry.request.id,
                    command = %entry.request.command,
                    error = %err,
                    attempts = entry.attempts,
                    "re-queueing request"
                );
                self.lock_queue().push(entry);
            }
            Err(err) => {
                if err.is_connectivity() {
                    self.connectivity
                        .set_offline(true, "main queue request failed to fetch")
                        .await;
                }
                if err.completes_request() {
                    self.apply(entry.request.writes.finally.clone()).await;
                } else {
                    tracing::warn!(
                        request = %entry.request.id,
                        command = %entry.request.command,
                        error = %err,
                        "request failed"
                    );
                    self.apply(entry.request.writes.after_failure()).await;
                }
                entry.resolve(Err(err));
            }
        }
    }

    /// Route writes through the reconciler while a drain is in progress so
    /// they land after the drained responses.
    async fn apply(&self, updates: Vec<StoreUpdate>) {
        if updates.is_empty() {
            return;
        }
        let Some(updates) = self.sequential.buffer_behind_drain(updates) else {
            return;
        };
        if let Err(err) = self.store.update(updates).await {
            tracing::warn!(error = ?err, "apply main queue store writes failed");
        }
    }
}
