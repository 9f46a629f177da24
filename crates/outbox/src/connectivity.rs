//! Process-wide online/offline state, mirrored into the store.
//!
//! Besides the offline flag this holds two switches used to exercise
//! failure handling: `shouldForceOffline` and `shouldFailAllRequests`.
//! While either is set every dispatch that goes through
//! [`SwitchedTransport`] still reaches the remote authority but reports
//! `RequestError::Offline` to the queue, as if the response were lost.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::config::keys;
use crate::error::RequestError;
use crate::types::{Request, Response, Store, StoreUpdate, Transport};

pub struct Connectivity {
    store: Arc<dyn Store>,
    offline: AtomicBool,
    force_offline: AtomicBool,
    fail_all_requests: AtomicBool,
    time_skew_ms: AtomicI64,
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            store,
            offline: AtomicBool::new(false),
            force_offline: AtomicBool::new(false),
            fail_all_requests: AtomicBool::new(false),
            time_skew_ms: AtomicI64::new(0),
            tx,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Watch the offline flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Record a transition and merge `{isOffline}` into the network key.
    /// Returns whether the state changed.
    pub async fn set_offline(&self, offline: bool, reason: &str) -> bool {
        if self.offline.swap(offline, Ordering::AcqRel) == offline {
            return false;
        }
        if offline {
            tracing::info!(reason, "client is entering offline mode");
        } else {
            tracing::info!(reason, "client is back online");
        }
        self.tx.send_replace(offline);
        self.record(json!({ "isOffline": offline })).await;
        true
    }

    pub fn should_force_offline(&self) -> bool {
        self.force_offline.load(Ordering::Acquire)
    }

    pub fn should_fail_all_requests(&self) -> bool {
        self.fail_all_requests.load(Ordering::Acquire)
    }

    /// Whether dispatch results are currently replaced by a fetch failure.
    pub fn fails_requests(&self) -> bool {
        self.should_force_offline() || self.should_fail_all_requests()
    }

    /// Report every dispatch as a fetch failure until cleared.
    pub async fn set_should_force_offline(&self, force: bool) {
        if self.force_offline.swap(force, Ordering::AcqRel) != force {
            tracing::info!(force, "force offline switch changed");
        }
        self.record(json!({ "shouldForceOffline": force })).await;
    }

    /// Let every request reach the server but lose its response.
    pub async fn set_should_fail_all_requests(&self, fail: bool) {
        if self.fail_all_requests.swap(fail, Ordering::AcqRel) != fail {
            tracing::info!(fail, "fail all requests switch changed");
        }
        self.record(json!({ "shouldFailAllRequests": fail })).await;
    }

    /// Last measured offset of the server clock, in milliseconds.
    pub fn time_skew_ms(&self) -> i64 {
        self.time_skew_ms.load(Ordering::Acquire)
    }

    pub async fn set_time_skew(&self, skew_ms: i64) {
        self.time_skew_ms.store(skew_ms, Ordering::Release);
        self.record(json!({ "timeSkew": skew_ms })).await;
    }

    async fn record(&self, fields: Value) {
        let update = StoreUpdate::merge(keys::NETWORK, fields);
        if let Err(err) = self.store.update(vec![update]).await {
            tracing::warn!(error = ?err, "failed to record network state");
        }
    }
}

/// Transport wrapper honoring the connectivity switches.
pub struct SwitchedTransport {
    inner: Arc<dyn Transport>,
    connectivity: Arc<Connectivity>,
}

impl SwitchedTransport {
    pub fn new(inner: Arc<dyn Transport>, connectivity: Arc<Connectivity>) -> Self {
        Self {
            inner,
            connectivity,
        }
    }
}

#[async_trait]
impl Transport for SwitchedTransport {
    async fn dispatch(&self, request: &Request) -> Result<Response, RequestError> {
        let outcome = self.inner.dispatch(request).await;
        if self.connectivity.fails_requests() {
            tracing::debug!(request = %request.id, command = %request.command, "dropping response, requests are switched to fail");
            return Err(RequestError::Offline);
        }
        outcome
    }
}
