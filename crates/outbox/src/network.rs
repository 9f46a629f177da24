//! Front door wiring leadership, both queues and the reconciler together.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::connectivity::{Connectivity, SwitchedTransport};
use crate::error::RequestError;
use crate::leader::Leadership;
use crate::main_queue::MainQueue;
use crate::reconciler::UpdateReconciler;
use crate::sequential_queue::SequentialQueue;
use crate::types::{
    Election, Payload, Request, RequestFilter, RequestHandle, RequestIdAllocator, RequestLog,
    RequestOptions, Store, Transport,
};

pub struct Network {
    cfg: QueueConfig,
    ids: RequestIdAllocator,
    store: Arc<dyn Store>,
    log: Arc<dyn RequestLog>,
    leadership: Arc<Leadership>,
    connectivity: Arc<Connectivity>,
    reconciler: Arc<UpdateReconciler>,
    sequential: Arc<SequentialQueue>,
    main: Arc<MainQueue>,
}

/// Background tasks started by `Network::start`.
pub struct NetworkHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkHandle {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

impl Network {
    pub fn new(
        cfg: QueueConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        log: Arc<dyn RequestLog>,
        election: Arc<dyn Election>,
    ) -> Arc<Self> {
        let leadership = Arc::new(Leadership::new(election));
        let connectivity = Arc::new(Connectivity::new(store.clone()));
        let transport: Arc<dyn Transport> =
            Arc::new(SwitchedTransport::new(transport, connectivity.clone()));
        let reconciler = Arc::new(UpdateReconciler::new(store.clone(), &cfg));
        let sequential = Arc::new(SequentialQueue::new(
            cfg.clone(),
            log.clone(),
            transport.clone(),
            leadership.clone(),
            reconciler.clone(),
            connectivity.clone(),
        ));
        let main = Arc::new(MainQueue::new(
            cfg.clone(),
            transport,
            store.clone(),
            connectivity.clone(),
            sequential.clone(),
        ));
        Arc::new(Self {
            cfg,
            ids: RequestIdAllocator::random(),
            store,
            log,
            leadership,
            connectivity,
            reconciler,
            sequential,
            main,
        })
    }

    /// Wait for leadership to settle, drain persisted requests and start the
    /// background timers.
    pub async fn start(self: &Arc<Self>) -> NetworkHandle {
        let leader = self.leadership.is_ready().await;
        match self.log.len().await {
            Ok(pending) => tracing::info!(
                client = %format!("{:x}", self.ids.client_id()),
                leader,
                pending,
                "network started"
            ),
            Err(err) => tracing::warn!(error = ?err, "read request log at startup failed"),
        }
        self.sequential.flush().await;

        let mut tasks = Vec::new();

        let main = self.main.clone();
        let delay = self.cfg.process_request_delay;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                main.process().await;
            }
        }));

        tasks.push(self.leadership.spawn_heartbeat(self.cfg.leader_heartbeat));

        let this = self.clone();
        let mut leader_rx = self.leadership.subscribe();
        tasks.push(tokio::spawn(async move {
            while leader_rx.changed().await.is_ok() {
                let gained = *leader_rx.borrow_and_update() == Some(true);
                if gained {
                    this.sequential.flush().await;
                }
            }
        }));

        NetworkHandle { tasks }
    }

    /// Queue a request that is not persisted.
    pub fn post(self: &Arc<Self>, command: &str, payload: Payload, options: RequestOptions) -> RequestHandle {
        let request = Request::new(self.ids.next(), command, payload, &options);
        let handle = self.main.push(request, options.force_network_request);
        if options.process_immediately && !options.force_network_request {
            let main = self.main.clone();
            tokio::spawn(async move {
                main.process().await;
            });
        }
        handle
    }

    /// Persist a request and hand it to the sequential queue.
    ///
    /// Optimistic writes are applied to the store before the request is
    /// queued.
    pub async fn write(
        self: &Arc<Self>,
        command: &str,
        payload: Payload,
        options: RequestOptions,
    ) -> Result<RequestHandle, RequestError> {
        let request = Request::new(self.ids.next(), command, payload, &options);
        if !request.writes.optimistic.is_empty() {
            if let Err(err) = self.store.update(request.writes.optimistic.clone()).await {
                tracing::warn!(error = ?err, command, "apply optimistic writes failed");
            }
        }
        self.sequential.push(request).await
    }

    /// Switch between online and offline mode.
    pub async fn set_is_offline(self: &Arc<Self>, offline: bool, reason: &str) {
        self.connectivity.set_offline(offline, reason).await;
        if offline {
            self.sequential.pause();
            return;
        }
        self.sequential.unpause();
        let main = self.main.clone();
        tokio::spawn(async move {
            main.process().await;
        });
    }

    /// Make every dispatch report a fetch failure while `force` is set.
    pub async fn set_should_force_offline(&self, force: bool) {
        self.connectivity.set_should_force_offline(force).await;
    }

    /// Let requests reach the server but lose every response while `fail`
    /// is set.
    pub async fn set_should_fail_all_requests(&self, fail: bool) {
        self.connectivity.set_should_fail_all_requests(fail).await;
    }

    /// Record the measured server clock offset under the network key.
    pub async fn set_time_skew(&self, skew_ms: i64) {
        self.connectivity.set_time_skew(skew_ms).await;
    }

    /// Drop pending work that belongs to the signed-out session.
    pub async fn sign_out(&self) -> anyhow::Result<usize> {
        let cleared = self.main.clear();
        let cancelable: RequestFilter = Arc::new(|r: &Request| r.cancelable);
        let cancelled = self.sequential.cancel(cancelable).await?;
        tracing::info!(main = cleared, persisted = cancelled.len(), "signed out");
        Ok(cleared + cancelled.len())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn leadership(&self) -> &Arc<Leadership> {
        &self.leadership
    }

    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    pub fn reconciler(&self) -> &Arc<UpdateReconciler> {
        &self.reconciler
    }

    pub fn sequential_queue(&self) -> &Arc<SequentialQueue> {
        &self.sequential
    }

    pub fn main_queue(&self) -> &Arc<MainQueue> {
        &self.main
    }
}
