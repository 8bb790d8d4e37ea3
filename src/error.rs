use std::time::Duration;

use uuid::Uuid;

/// Caller-facing error taxonomy.
///
/// Drivers never raise these directly — see [`crate::backend::BackendError`]
/// for the boundary error type. The manager and the handle are the only two
/// places that translate a `BackendError` into one of these.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("timed out acquiring lease {name:?} after {elapsed:?}")]
    AcquisitionTimeout { name: String, elapsed: Duration },

    #[error("lease {name:?} (id {lease_id}) was lost: {reason}")]
    LeaseLost {
        name: String,
        lease_id: Uuid,
        reason: String,
    },

    #[error("lease store unavailable: {0}")]
    StoreUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid lease configuration: {0}")]
    Configuration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
