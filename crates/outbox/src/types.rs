//! Shared types for the request queues.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both queues, the durable request log, and the transport/store
//! collaborators. The trait contracts for those collaborators live here too.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RequestError;

/// Random identifier of one cooperating process.
pub type ClientId = u64;
/// Command parameters sent to the remote authority.
pub type Payload = BTreeMap<String, Value>;
/// Handle returned by `Store::connect`.
pub type SubscriptionId = u64;
/// Subscriber callback: receives the key and its current value (if any).
pub type StoreCallback = Box<dyn Fn(&str, Option<&Value>) + Send + Sync>;
/// Predicate used by log retention and queue cancellation.
pub type RequestFilter = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// JSON code the remote authority uses for a successful command.
pub const JSON_CODE_OK: u32 = 200;

/// Sequence token of a request, scoped by client and a monotonically increasing counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub client_id: ClientId,
    pub counter: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{}", self.client_id, self.counter)
    }
}

/// Allocates request ids for one process.
///
/// The counter is seeded from wall-clock microseconds so ids keep increasing
/// across restarts of the same client.
#[derive(Debug)]
pub struct RequestIdAllocator {
    client_id: ClientId,
    next: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new(client_id: ClientId) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros()
            .min(u128::from(u64::MAX)) as u64;
        Self {
            client_id,
            next: AtomicU64::new(seed),
        }
    }

    /// Allocator with a random client id.
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn next(&self) -> RequestId {
        RequestId {
            client_id: self.client_id,
            counter: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Transport method used for a command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Get,
    #[default]
    Post,
}

/// Kind of store mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Set,
    /// Shallow merge into an existing object; non-objects are replaced.
    Merge,
    Remove,
}

/// One mutation of the key-value store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub kind: UpdateKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl StoreUpdate {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            kind: UpdateKind::Set,
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn merge(key: impl Into<String>, value: Value) -> Self {
        Self {
            kind: UpdateKind::Merge,
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::Remove,
            key: key.into(),
            value: None,
        }
    }
}

/// Store writes attached to a request.
///
/// `optimistic` is applied when the request is enqueued and is never
/// persisted. The remaining lists are applied once the request resolves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreWrites {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optimistic: Vec<StoreUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<StoreUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure: Vec<StoreUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finally: Vec<StoreUpdate>,
}

impl StoreWrites {
    /// Writes to apply after a resolved response (success or command-level failure).
    pub fn after_response(&self, response: &Response) -> Vec<StoreUpdate> {
        let mut out = if response.is_success() {
            self.success.clone()
        } else {
            self.failure.clone()
        };
        out.extend(self.finally.iter().cloned());
        out
    }

    /// Writes to apply after the request failed without a response.
    pub fn after_failure(&self) -> Vec<StoreUpdate> {
        let mut out = self.failure.clone();
        out.extend(self.finally.iter().cloned());
        out
    }
}

/// Caller-supplied options for a request. Defaults match a retryable,
/// cancelable POST that is processed immediately.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub method: Method,
    pub secure: bool,
    pub retryable: bool,
    pub cancelable: bool,
    /// Kick the main queue right after the push.
    pub process_immediately: bool,
    /// Bypass the main queue's gating and dispatch at once.
    pub force_network_request: bool,
    pub writes: StoreWrites,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::Post,
            secure: false,
            retryable: true,
            cancelable: true,
            process_immediately: true,
            force_network_request: false,
            writes: StoreWrites::default(),
        }
    }
}

/// A remote command and its retry/cancel metadata.
///
/// This is also the durable record written to the request log, so it only
/// carries data; resolution channels live in the queues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub command: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub secure: bool,
    pub retryable: bool,
    pub cancelable: bool,
    #[serde(default)]
    pub writes: StoreWrites,
}

impl Request {
    pub fn new(id: RequestId, command: impl Into<String>, payload: Payload, options: &RequestOptions) -> Self {
        Self {
            id,
            command: command.into(),
            payload,
            method: options.method,
            secure: options.secure,
            retryable: options.retryable,
            cancelable: options.cancelable,
            writes: options.writes.clone(),
        }
    }

    /// Copy suitable for durable storage (optimistic writes stripped).
    pub fn to_persisted(&self) -> Self {
        let mut out = self.clone();
        out.writes.optimistic.clear();
        out
    }
}

/// Structured response from the remote authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub json_code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Store updates the authority wants applied locally.
    #[serde(default, rename = "onyxData")]
    pub updates: Vec<StoreUpdate>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            json_code: JSON_CODE_OK,
            message: None,
            title: None,
            updates: Vec::new(),
        }
    }

    pub fn with_updates(updates: Vec<StoreUpdate>) -> Self {
        Self {
            updates,
            ..Self::ok()
        }
    }

    pub fn error(json_code: u32, message: impl Into<String>) -> Self {
        Self {
            json_code,
            message: Some(message.into()),
            title: None,
            updates: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.json_code == JSON_CODE_OK
    }
}

pub(crate) type Responder = oneshot::Sender<Result<Response, RequestError>>;

/// Caller-side handle to a queued request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    rx: oneshot::Receiver<Result<Response, RequestError>>,
}

impl RequestHandle {
    pub(crate) fn channel(id: RequestId) -> (Responder, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the request to resolve.
    pub async fn wait(self) -> Result<Response, RequestError> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(RequestError::Dropped),
        }
    }
}

/// Remote command executor.
///
/// Implementations classify their failures into `RequestError` so the queues
/// can decide between retrying, pausing and dropping.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dispatch(&self, request: &Request) -> Result<Response, RequestError>;
}

/// Reactive key-value store the queues reconcile into.
///
/// The queues never assume a write is visible synchronously.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Apply all updates as one atomic change.
    async fn update(&self, updates: Vec<StoreUpdate>) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> Option<Value>;

    /// Subscribe to a key. The callback fires immediately with the current value.
    fn connect(&self, key: &str, callback: StoreCallback) -> SubscriptionId;

    fn disconnect(&self, id: SubscriptionId);
}

/// Durable, ordered list of pending persisted requests.
///
/// Implementations must survive process restart and may be shared by
/// several cooperating processes.
#[async_trait]
pub trait RequestLog: Send + Sync + 'static {
    async fn append(&self, request: Request) -> anyhow::Result<()>;

    async fn read_all(&self) -> anyhow::Result<Vec<Request>>;

    /// Remove one request; returns false when it was not present.
    async fn remove(&self, id: RequestId) -> anyhow::Result<bool>;

    /// Keep only requests matching `keep`; returns the removed ones.
    async fn retain(&self, keep: RequestFilter) -> anyhow::Result<Vec<Request>>;

    async fn head(&self) -> anyhow::Result<Option<Request>> {
        Ok(self.read_all().await?.into_iter().next())
    }

    async fn remove_head(&self) -> anyhow::Result<Option<Request>> {
        let Some(head) = self.head().await? else {
            return Ok(None);
        };
        self.remove(head.id).await?;
        Ok(Some(head))
    }

    async fn len(&self) -> anyhow::Result<usize> {
        Ok(self.read_all().await?.len())
    }
}

/// Leader election strategy among processes sharing durable storage.
#[async_trait]
pub trait Election: Send + Sync + 'static {
    /// Attempt to become (or stay) leader. Returns whether this process leads.
    async fn claim(&self) -> anyhow::Result<bool>;

    fn is_leader(&self) -> bool;
}
