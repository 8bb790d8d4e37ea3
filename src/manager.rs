//! Component C: the acquisition manager. Wraps the driver's non-blocking
//! acquire into a blocking "wait up to T" (`acquire`) and a non-blocking
//! "try once" (`try_acquire`). See spec §4.3.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, LeaseBackend, LeaseDuration};
use crate::handle::LeaseHandle;
use crate::options::LeaseOptions;
use crate::Error;

/// Hard cap on `acquire`'s retry loop, independent of `timeout`. Protects
/// against a pathological store that returns `TransientUnavailable`
/// instantly forever (spec §4.3).
const ACQUIRE_SAFETY_CAP: u32 = 10_000;

pub struct LeaseManager {
    backend: Arc<dyn LeaseBackend>,
    options: LeaseOptions,
}

impl LeaseManager {
    pub fn new(backend: Arc<dyn LeaseBackend>, options: LeaseOptions) -> Self {
        Self { backend, options }
    }

    /// One-shot. Delegates to the driver exactly once. `Ok(None)` on normal
    /// contention. Raises on `Fatal`/`TransientUnavailable` (spec §4.3).
    pub async fn try_acquire(
        &self,
        name: &str,
        duration: Option<LeaseDuration>,
        cancel: CancellationToken,
    ) -> Result<Option<LeaseHandle>, Error> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("lease name must not be empty".into()));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let duration = duration.unwrap_or(self.options.default_duration);
        let acquire_call = self.backend.acquire(name, duration);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = acquire_call => res,
        };

        match result {
            Ok(Some(materials)) => Ok(Some(LeaseHandle::new(
                self.backend.clone(),
                name.to_string(),
                materials,
                self.options.clone(),
            ))),
            Ok(None) => Ok(None),
            Err(BackendError::TransientUnavailable(e)) => Err(Error::StoreUnavailable(e)),
            Err(BackendError::Fatal(e)) => Err(Error::Configuration(e.to_string())),
            Err(BackendError::Lost(reason)) => {
                // A driver should never report `Lost` from `acquire`; treat
                // it as a fatal surprise rather than silently retrying.
                Err(Error::Configuration(format!(
                    "backend reported Lost from acquire: {reason}"
                )))
            }
        }
    }

    /// Blocking. Repeatedly calls the driver with fixed
    /// `acquire_retry_interval` sleeps between attempts, until success,
    /// `timeout` expiry, or cancellation. `Contention` and
    /// `TransientUnavailable` are both silently retried; `Fatal`/
    /// `Configuration` abort immediately (spec §4.3, §7).
    ///
    /// No fairness is guaranteed between competing callers (spec §4.3).
    pub async fn acquire(
        &self,
        name: &str,
        duration: Option<LeaseDuration>,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<LeaseHandle, Error> {
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let mut iterations: u32 = 0;

        loop {
            iterations += 1;
            if iterations > ACQUIRE_SAFETY_CAP {
                return Err(Error::StoreUnavailable(
                    format!(
                        "acquire safety limit of {ACQUIRE_SAFETY_CAP} retry iterations exceeded for lease {name:?}"
                    )
                    .into(),
                ));
            }

            match self.try_acquire(name, duration, cancel.clone()).await {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {}
                Err(Error::StoreUnavailable(_)) => {
                    // Treated as contention for retry purposes.
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(other) => return Err(other),
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::AcquisitionTimeout {
                        name: name.to_string(),
                        elapsed: start.elapsed(),
                    });
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.options.acquire_retry_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_double::MemoryBackend;

    fn options(duration: Duration) -> LeaseOptions {
        LeaseOptions::builder(LeaseDuration::Finite(duration))
            .auto_renew(false)
            .acquire_retry_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn try_acquire_returns_none_on_contention() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LeaseManager::new(
            backend.clone() as Arc<dyn LeaseBackend>,
            options(Duration::from_secs(30)),
        );
        let _first = manager
            .try_acquire("inv-PROD-001", None, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        let second = manager
            .try_acquire("inv-PROD-001", None, CancellationToken::new())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn acquire_succeeds_after_release() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LeaseManager::new(
            backend.clone() as Arc<dyn LeaseBackend>,
            options(Duration::from_secs(30)),
        );
        let first = manager
            .try_acquire("inv-PROD-001", None, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let manager = Arc::new(manager);
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire(
                        "inv-PROD-001",
                        None,
                        Some(Duration::from_secs(5)),
                        CancellationToken::new(),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        first.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert!(second.is_acquired());
    }

    #[tokio::test]
    async fn acquire_times_out_when_never_released() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LeaseManager::new(
            backend.clone() as Arc<dyn LeaseBackend>,
            options(Duration::from_secs(30)),
        );
        let _first = manager
            .try_acquire("x", None, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let err = manager
            .acquire(
                "x",
                None,
                Some(Duration::from_millis(100)),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AcquisitionTimeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_during_acquire_unwinds_with_cancelled_not_timeout() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = LeaseManager::new(
            backend.clone() as Arc<dyn LeaseBackend>,
            options(Duration::from_secs(30)),
        );
        let _first = manager
            .try_acquire("x", None, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        let manager = Arc::new(manager);
        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager.acquire("x", None, None, cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    /// Mirrors the teacher's `concurrent_locks` test: many distinct lease
    /// names acquired concurrently, each holder observing exclusive access
    /// to a shared counter for the duration of its critical section (P1).
    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_acquisitions_are_mutually_exclusive_per_name() {
        use futures::stream::{FuturesUnordered, StreamExt};
        use rand::Rng;
        use std::sync::Arc;
        use taken::take;
        use tokio::sync::Mutex as AsyncMutex;

        let backend = Arc::new(MemoryBackend::new());
        let manager = Arc::new(LeaseManager::new(
            backend.clone() as Arc<dyn LeaseBackend>,
            options(Duration::from_secs(20)),
        ));
        let glob = Arc::new(AsyncMutex::new(0u32));

        (1..8u32)
            .map(|i| {
                let suffix: u32 = rand::thread_rng().gen();
                let lease_name = format!("concurrent-{i}-{suffix}");
                take!(&manager, &glob);
                async move {
                    let handle = manager
                        .acquire(
                            &lease_name,
                            None,
                            Some(Duration::from_secs(5)),
                            CancellationToken::new(),
                        )
                        .await
                        .unwrap();
                    *glob.lock().await = i;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    assert_eq!(*glob.lock().await, i);
                    handle.release().await.unwrap();
                }
            })
            .collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;
    }
}
