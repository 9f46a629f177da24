//! Offline-capable request queueing.
//!
//! `Network` is the entry point: it owns a non-persisted main queue and a
//! durable sequential queue backed by a `RequestLog`. Only the process that
//! holds leadership drains the durable queue. Responses reconcile into a
//! reactive `Store` through an update buffer committed once per drain cycle.
//! Higher layers supply a `Transport`, a `Store`, a `RequestLog` and an
//! `Election`.

pub mod config;
mod connectivity;
mod error;
pub mod http;
mod leader;
mod main_queue;
mod network;
mod reconciler;
mod request_log;
mod sequential_queue;
mod store;
mod throttle;
mod types;

pub use config::{keys, Environment, QueueConfig};
pub use connectivity::{Connectivity, SwitchedTransport};
pub use error::RequestError;
pub use http::HttpTransport;
pub use leader::{AlwaysLeader, FileLockElection, Leadership, NeverLeader};
pub use main_queue::MainQueue;
pub use network::{Network, NetworkHandle};
pub use reconciler::UpdateReconciler;
pub use request_log::{FileRequestLog, MemoryRequestLog};
pub use sequential_queue::{QueueStats, QueueStatus, SequentialQueue};
pub use store::{apply_update, MemoryStore};
pub use throttle::RequestThrottle;
pub use types::{
    ClientId, Election, Method, Payload, Request, RequestFilter, RequestHandle, RequestId,
    RequestIdAllocator, RequestLog, RequestOptions, Response, Store, StoreCallback, StoreUpdate,
    StoreWrites, SubscriptionId, Transport, UpdateKind, JSON_CODE_OK,
};
