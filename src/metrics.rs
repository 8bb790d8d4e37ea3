//! Process-wide "active lease count" metric (spec §5, §9, SPEC_FULL §6.2).
//!
//! The only global mutable state in the crate: a monotonically-maintained
//! counter, not a registry. Incremented when a [`crate::handle::LeaseHandle`]
//! is constructed, decremented exactly once when it transitions to
//! `Released` or `Lost`.

use std::sync::atomic::{AtomicI64, Ordering};

static ACTIVE_LEASE_COUNT: AtomicI64 = AtomicI64::new(0);

pub(crate) fn lease_acquired() {
    ACTIVE_LEASE_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn lease_ended() {
    ACTIVE_LEASE_COUNT.fetch_sub(1, Ordering::Relaxed);
}

/// The number of currently-live handles in this process, for observability
/// dashboards. Not a substitute for querying the store.
pub fn active_lease_count() -> i64 {
    ACTIVE_LEASE_COUNT.load(Ordering::Relaxed)
}
