//! Buffering of store updates produced while the sequential queue drains.
//!
//! Updates are held in memory and committed to the store as one atomic
//! `update` call when the drain cycle ends. Without an identified session
//! (outside the test environment) only preserved keys survive the commit.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::config::{keys, QueueConfig};
use crate::types::{Store, StoreUpdate, SubscriptionId};

pub struct UpdateReconciler {
    store: Arc<dyn Store>,
    buffer: Mutex<Vec<StoreUpdate>>,
    session_active: Arc<AtomicBool>,
    preserved_keys: HashSet<String>,
    filter_enabled: bool,
    subscription: SubscriptionId,
}

impl UpdateReconciler {
    pub fn new(store: Arc<dyn Store>, cfg: &QueueConfig) -> Self {
        let session_active = Arc::new(AtomicBool::new(false));
        let flag = session_active.clone();
        let subscription = store.connect(
            keys::SESSION,
            Box::new(move |_, session| {
                flag.store(has_account_id(session), Ordering::Release);
            }),
        );
        Self {
            store,
            buffer: Mutex::new(Vec::new()),
            session_active,
            preserved_keys: cfg.preserved_keys.iter().cloned().collect(),
            filter_enabled: !cfg.is_test_env(),
            subscription,
        }
    }

    /// Append updates to the buffer; the store is not touched.
    pub fn queue(&self, updates: Vec<StoreUpdate>) {
        if updates.is_empty() {
            return;
        }
        self.buffer.lock().expect("reconciler lock").extend(updates);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().expect("reconciler lock").is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("reconciler lock").len()
    }

    pub fn has_active_session(&self) -> bool {
        self.session_active.load(Ordering::Acquire)
    }

    /// Apply the whole buffer as one store update and clear it.
    ///
    /// Returns the number of updates written. On failure the buffer is kept
    /// (ahead of anything queued meanwhile) for the next commit.
    pub async fn commit(&self) -> anyhow::Result<usize> {
        let mut batch = std::mem::take(&mut *self.buffer.lock().expect("reconciler lock"));
        if batch.is_empty() {
            return Ok(0);
        }
        if self.filter_enabled && !self.has_active_session() {
            let before = batch.len();
            batch.retain(|update| self.preserved_keys.contains(&update.key));
            tracing::debug!(
                kept = batch.len(),
                dropped = before - batch.len(),
                "no active session, committing preserved keys only"
            );
        }
        let count = batch.len();
        if count == 0 {
            return Ok(0);
        }
        if let Err(err) = self.store.update(batch.clone()).await {
            let mut buffer = self.buffer.lock().expect("reconciler lock");
            batch.extend(buffer.drain(..));
            *buffer = batch;
            return Err(err.context("commit buffered store updates"));
        }
        Ok(count)
    }
}

impl Drop for UpdateReconciler {
    fn drop(&mut self) {
        self.store.disconnect(self.subscription);
    }
}

fn has_account_id(session: Option<&Value>) -> bool {
    match session.and_then(|s| s.get("accountID")) {
        Some(Value::Number(n)) => n.as_u64().map_or(true, |id| id != 0),
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    }
}
