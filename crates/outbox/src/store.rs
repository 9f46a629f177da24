//! In-memory reactive key-value store.
//!
//! `MemoryStore` is the reference `Store` implementation: every `update`
//! call applies all of its mutations under one lock and only then notifies
//! subscribers, so an observer never sees part of a batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{Store, StoreCallback, StoreUpdate, SubscriptionId, UpdateKind};

type SharedCallback = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

struct Subscriber {
    key: String,
    callback: SharedCallback,
}

#[derive(Default)]
struct Inner {
    values: BTreeMap<String, Value>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_subscription: AtomicU64,
    update_count: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every key currently set.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.lock().expect("store lock").values.clone()
    }

    /// Number of `update` calls applied so far.
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn update(&self, updates: Vec<StoreUpdate>) -> anyhow::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let notifications = {
            let mut inner = self.inner.lock().expect("store lock");
            let mut touched = BTreeSet::new();
            for update in updates {
                touched.insert(update.key.clone());
                apply_update(&mut inner.values, update);
            }
            let mut out = Vec::new();
            for sub in inner.subscribers.values() {
                if touched.contains(&sub.key) {
                    out.push((
                        sub.callback.clone(),
                        sub.key.clone(),
                        inner.values.get(&sub.key).cloned(),
                    ));
                }
            }
            out
        };
        self.update_count.fetch_add(1, Ordering::Relaxed);
        // Notify outside the lock so callbacks may read the store.
        for (callback, key, value) in notifications {
            callback(&key, value.as_ref());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().expect("store lock").values.get(key).cloned()
    }

    fn connect(&self, key: &str, callback: StoreCallback) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let callback: SharedCallback = Arc::from(callback);
        let current = {
            let mut inner = self.inner.lock().expect("store lock");
            inner.subscribers.insert(
                id,
                Subscriber {
                    key: key.to_string(),
                    callback: callback.clone(),
                },
            );
            inner.values.get(key).cloned()
        };
        callback(key, current.as_ref());
        id
    }

    fn disconnect(&self, id: SubscriptionId) {
        self.inner
            .lock()
            .expect("store lock")
            .subscribers
            .remove(&id);
    }
}

/// Apply one mutation to a key map.
pub fn apply_update(values: &mut BTreeMap<String, Value>, update: StoreUpdate) {
    match update.kind {
        UpdateKind::Remove => {
            values.remove(&update.key);
        }
        UpdateKind::Set => match update.value {
            Some(Value::Null) | None => {
                values.remove(&update.key);
            }
            Some(value) => {
                values.insert(update.key, value);
            }
        },
        UpdateKind::Merge => {
            let Some(value) = update.value else {
                return;
            };
            if value.is_null() {
                values.remove(&update.key);
                return;
            }
            if let (Some(Value::Object(existing)), Value::Object(patch)) =
                (values.get_mut(&update.key), &value)
            {
                for (field, field_value) in patch {
                    if field_value.is_null() {
                        existing.remove(field);
                    } else {
                        existing.insert(field.clone(), field_value.clone());
                    }
                }
                return;
            }
            values.insert(update.key, value);
        }
    }
}
