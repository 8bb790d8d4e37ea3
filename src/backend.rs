//! Component A: the backend driver contract.
//!
//! Every concrete store (native server-lease, CAS-document, set-NX) plugs in
//! here. The contract is deliberately narrow: acquire, renew, release, break.
//! See spec §4.1 for the per-operation guarantees each driver must uphold.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The duration requested for a lease. `Infinite` is only honoured by
/// drivers that document support for it (see each driver's module docs).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseDuration {
    Finite(Duration),
    Infinite,
}

impl LeaseDuration {
    pub fn as_std(&self) -> Option<Duration> {
        match self {
            LeaseDuration::Finite(d) => Some(*d),
            LeaseDuration::Infinite => None,
        }
    }

    pub fn as_chrono(&self) -> Option<chrono::Duration> {
        self.as_std()
            .and_then(|d| chrono::Duration::from_std(d).ok())
    }
}

/// Materials returned by a successful `acquire`. This is everything a
/// [`crate::handle::LeaseHandle`] needs to construct itself and later prove
/// ownership on renew/release.
#[derive(Clone, Debug)]
pub struct AcquiredLease {
    pub lease_id: Uuid,
    pub expires_at: DateTime<Utc>,
    /// Opaque, store-specific proof of the current write position (an entity
    /// tag, a resource version, a native lease token). `None` for stores
    /// that fence purely on `lease_id`.
    pub fencing_token: Option<String>,
}

/// Result of a successful `renew`.
#[derive(Clone, Debug)]
pub struct RenewedLease {
    pub expires_at: DateTime<Utc>,
    pub fencing_token: Option<String>,
}

/// The error taxonomy a driver raises across the trait boundary. Contention
/// is intentionally absent here — normal contention on acquire is `Ok(None)`,
/// never an `Err`.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// Renew/release found a different (or no) owner recorded at the store.
    #[error("lease ownership lost: {0}")]
    Lost(String),

    /// The store is reachable but temporarily unable to serve the request;
    /// retryable by the acquisition manager, fatal-after-retries in the
    /// renewal loop.
    #[error("store temporarily unavailable: {0}")]
    TransientUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Authorization, malformed input, or misconfiguration. Never retried.
    #[error("fatal backend error: {0}")]
    Fatal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Component A. Implemented once per concrete store; driven by the manager
/// (component C) on acquire and by the handle (component B) on renew/release.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Atomically bind `name` to a fresh lease id with the given duration,
    /// iff `name` is currently unbound or expired. `Ok(None)` means normal
    /// contention (already held by someone else).
    async fn acquire(
        &self,
        name: &str,
        duration: LeaseDuration,
    ) -> Result<Option<AcquiredLease>, BackendError>;

    /// Extend the expiry of `name`, iff the store still records `lease_id`
    /// as the current holder. `fencing_token` is whatever `acquire` (or the
    /// previous `renew`) last returned, and must be threaded through
    /// unmodified by the caller.
    async fn renew(
        &self,
        name: &str,
        lease_id: Uuid,
        fencing_token: Option<&str>,
    ) -> Result<RenewedLease, BackendError>;

    /// Remove the store record iff it still records `lease_id`. Idempotent:
    /// a missing record or one owned by someone else is success, not error.
    async fn release(
        &self,
        name: &str,
        lease_id: Uuid,
        fencing_token: Option<&str>,
    ) -> Result<(), BackendError>;

    /// Unconditionally forget any record for `name`. Administrative.
    async fn break_lease(&self, name: &str) -> Result<(), BackendError>;
}
