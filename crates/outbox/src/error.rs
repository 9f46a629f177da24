//! Failure taxonomy surfaced by transports and queues.

/// Classified failure of a single request.
///
/// Transports map their own errors onto these variants; the queues use the
/// classification to decide whether to retry, pause, or drop the request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Transport unreachable. Always retryable and pauses the sequential queue.
    #[error("failed to fetch: remote authority unreachable")]
    Offline,
    #[error("request throttled by the remote authority")]
    Throttled,
    #[error("remote service interrupted (status {status})")]
    ServiceInterrupted { status: u16 },
    /// The command was already applied remotely (e.g. a replay after restart).
    #[error("duplicate record")]
    DuplicateRecord,
    #[error("request cancelled")]
    Cancelled,
    #[error("request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("retried too many times ({attempts} attempts)")]
    RetriesExhausted { attempts: u32 },
    #[error("request storage failure: {0}")]
    Storage(String),
    /// The queue holding the request went away before it resolved.
    #[error("request dropped before completion")]
    Dropped,
    /// Persisted, but another process leads the log and will dispatch it.
    #[error("request persisted for the leading client")]
    Deferred,
}

impl RequestError {
    /// Failures worth dispatching again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Offline | Self::Throttled | Self::ServiceInterrupted { .. }
        )
    }

    /// Connectivity loss: the sequential queue pauses instead of backing off.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Offline)
    }

    /// Terminal outcomes that still count as "done" for the queue.
    pub fn completes_request(&self) -> bool {
        matches!(self, Self::DuplicateRecord | Self::Cancelled)
    }

    pub fn storage(err: &anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}
