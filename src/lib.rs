//! A distributed lease library: many cooperating processes coordinate
//! exclusive access to named resources by acquiring time-bounded leases
//! backed by a shared, authoritative store.
//!
//! Callers obtain a [`handle::LeaseHandle`] through a [`manager::LeaseManager`],
//! hold it while doing critical work, optionally let it renew itself in the
//! background, and release it when done. Only one holder can own a given
//! lease name at a time; if a holder dies or is partitioned, the lease
//! expires at the store and becomes acquirable by others.
//!
//! Three concrete [`backend::LeaseBackend`] implementations ship behind
//! Cargo features: `native-lease` (server-side native lease, e.g. blob
//! storage), `cas-document` (optimistic-concurrency document store), and
//! `set-nx` (set-if-absent+TTL key-value store with Lua-scripted
//! compare-and-swap). Enable `full` to pull in all three.

pub mod backend;
pub mod credential;
pub mod drivers;
pub mod error;
pub mod events;
pub mod handle;
pub mod manager;
pub mod metrics;
pub mod options;

pub use backend::{AcquiredLease, BackendError, LeaseBackend, LeaseDuration, RenewedLease};
pub use credential::CredentialProvider;
pub use error::Error;
pub use events::LeaseEvent;
pub use handle::LeaseHandle;
pub use manager::LeaseManager;
pub use options::{LeaseOptions, LeaseOptionsBuilder};
