//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use outbox::{
    Connectivity, Election, Leadership, MemoryStore, QueueConfig, Request, RequestError,
    RequestIdAllocator, RequestLog, RequestOptions, Response, SequentialQueue, Store,
    StoreCallback, StoreUpdate, SubscriptionId, Transport, UpdateReconciler,
};

/// Upper bound for polling helpers.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport that records dispatch order and replays scripted outcomes.
///
/// Commands without a script (or whose script ran out) succeed with an empty
/// response.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<Response, RequestError>>>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue outcomes for successive dispatches of `command`.
    pub fn script(&self, command: &str, outcomes: Vec<Result<Response, RequestError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Hold dispatches of `command` until the returned notify fires.
    pub fn gate(&self, command: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(command.to_string(), gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    /// Poll until `command` has been dispatched at least once.
    pub async fn wait_for_call(&self, command: &str) {
        let start = Instant::now();
        while self.call_count(command) == 0 {
            assert!(
                start.elapsed() < WAIT_TIMEOUT,
                "timed out waiting for {command} dispatch; calls={:?}",
                self.calls()
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn dispatch(&self, request: &Request) -> Result<Response, RequestError> {
        self.calls.lock().unwrap().push(request.command.clone());
        let gate = self.gates.lock().unwrap().get(&request.command).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.command)
            .and_then(|outcomes| outcomes.pop_front());
        next.unwrap_or_else(|| Ok(Response::ok()))
    }
}

/// Store wrapper that records every update batch and can fail or stall on
/// demand.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    batches: Mutex<Vec<Vec<StoreUpdate>>>,
    fail_next: AtomicBool,
    update_delay: Mutex<Option<Duration>>,
    updating: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<Vec<StoreUpdate>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn fail_next_update(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Make every later update take `delay` before it lands.
    pub fn delay_updates(&self, delay: Duration) {
        *self.update_delay.lock().unwrap() = Some(delay);
    }

    /// Updates currently stalled by `delay_updates`.
    pub fn updates_in_flight(&self) -> usize {
        self.updating.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn update(&self, updates: Vec<StoreUpdate>) -> anyhow::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected store failure");
        }
        let delay = *self.update_delay.lock().unwrap();
        if let Some(delay) = delay {
            self.updating.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.updating.fetch_sub(1, Ordering::SeqCst);
        }
        self.batches.lock().unwrap().push(updates.clone());
        self.inner.update(updates).await
    }

    async fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).await
    }

    fn connect(&self, key: &str, callback: StoreCallback) -> SubscriptionId {
        self.inner.connect(key, callback)
    }

    fn disconnect(&self, id: SubscriptionId) {
        self.inner.disconnect(id)
    }
}

/// A sequential queue wired to in-process collaborators.
pub struct QueueHarness {
    pub cfg: QueueConfig,
    pub store: Arc<RecordingStore>,
    pub transport: Arc<ScriptedTransport>,
    pub log: Arc<dyn RequestLog>,
    pub leadership: Arc<Leadership>,
    pub connectivity: Arc<Connectivity>,
    pub reconciler: Arc<UpdateReconciler>,
    pub queue: Arc<SequentialQueue>,
    pub ids: RequestIdAllocator,
}

impl QueueHarness {
    /// Build the queue and settle leadership before returning.
    pub async fn new(
        cfg: QueueConfig,
        log: Arc<dyn RequestLog>,
        election: Arc<dyn Election>,
        transport: Arc<ScriptedTransport>,
    ) -> Self {
        let store = RecordingStore::new();
        let store_dyn: Arc<dyn Store> = store.clone();
        let leadership = Arc::new(Leadership::new(election));
        leadership.is_ready().await;
        let connectivity = Arc::new(Connectivity::new(store_dyn.clone()));
        let reconciler = Arc::new(UpdateReconciler::new(store_dyn, &cfg));
        let queue = Arc::new(SequentialQueue::new(
            cfg.clone(),
            log.clone(),
            transport.clone(),
            leadership.clone(),
            reconciler.clone(),
            connectivity.clone(),
        ));
        Self {
            cfg,
            store,
            transport,
            log,
            leadership,
            connectivity,
            reconciler,
            queue,
            ids: RequestIdAllocator::new(7),
        }
    }

    pub fn request(&self, command: &str) -> Request {
        self.request_with(command, RequestOptions::default())
    }

    pub fn request_with(&self, command: &str, options: RequestOptions) -> Request {
        Request::new(self.ids.next(), command, Default::default(), &options)
    }

    pub async fn logged_commands(&self) -> Vec<String> {
        self.log
            .read_all()
            .await
            .expect("read log")
            .into_iter()
            .map(|r| r.command)
            .collect()
    }
}

/// Poll `cond` until it holds or the wait times out.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < WAIT_TIMEOUT, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
