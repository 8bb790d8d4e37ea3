//! Component B: the lease handle and its auto-renewal loop — the heart of
//! the system. See spec §3 and §4.2.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{AcquiredLease, BackendError, LeaseBackend, LeaseDuration};
use crate::events::{EventCallback, EventDispatcher, LeaseEvent};
use crate::metrics;
use crate::options::LeaseOptions;
use crate::Error;

struct MutableState {
    lease_id: Uuid,
    expires_at: DateTime<Utc>,
    renewal_count: u64,
    last_successful_renewal: DateTime<Utc>,
    fencing_token: Option<String>,
    disposed: bool,
    lost: bool,
}

struct HandleInner {
    lease_name: String,
    backend: Arc<dyn LeaseBackend>,
    options: LeaseOptions,
    acquired_at: DateTime<Utc>,
    state: parking_lot::Mutex<MutableState>,
    /// Serialises renewal attempts end-to-end (invariant I3): a caller's
    /// synchronous `renew()` and the background renewer cannot overlap.
    renew_gate: tokio::sync::Mutex<()>,
    events: EventDispatcher,
    cancel: CancellationToken,
}

enum RenewOutcome {
    Success,
    Terminated,
}

/// Why an in-flight renewal attempt ([`HandleInner::try_renew_once`]) did
/// not produce a renewed lease. Distinct from [`BackendError`] because the
/// latter two outcomes never reach the driver at all — they pre-empt it.
enum RenewAttemptError {
    Backend(BackendError),
    /// The safety-threshold deadline fired while the driver call was still
    /// in flight (spec §4.2 step 3, scenario S4's hung-renew case).
    SafetyDeadline,
    /// The caller-supplied cancellation token fired while the driver call
    /// was still in flight (spec §5, §6: "cancellation during Renew...
    /// aborts the current driver call").
    Cancelled,
}

impl HandleInner {
    fn snapshot(&self) -> (bool, bool, Uuid, DateTime<Utc>) {
        let s = self.state.lock();
        (s.disposed, s.lost, s.lease_id, s.expires_at)
    }

    /// The instant beyond which the auto-renewal loop must declare the
    /// lease lost rather than risk a race with the store's own expiry
    /// (spec §4.2 step 3). `None` for infinite leases, which have no such
    /// deadline.
    fn safety_deadline(&self) -> Option<DateTime<Utc>> {
        let default_duration = match self.options.default_duration {
            LeaseDuration::Finite(d) => d,
            LeaseDuration::Infinite => return None,
        };
        let last_successful_renewal = self.state.lock().last_successful_renewal;
        let threshold = chrono_duration_from_std_saturating(
            default_duration.mul_f64(self.options.auto_renew_safety_threshold),
        );
        Some(last_successful_renewal + threshold)
    }

    fn transition_lost(&self, reason: &str, lease_id: Uuid) {
        let last_successful_renewal = {
            let mut state = self.state.lock();
            if state.lost || state.disposed {
                return;
            }
            state.lost = true;
            state.last_successful_renewal
        };
        self.cancel.cancel();
        metrics::lease_ended();
        log::warn!(
            "{}: lease (id {}) lost: {}",
            self.lease_name,
            lease_id,
            reason
        );
        self.events.dispatch(LeaseEvent::Lost {
            lease_name: self.lease_name.clone(),
            lease_id,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            last_successful_renewal,
        });
    }

    /// Issues one `renew` call against the driver, racing it against the
    /// safety-threshold deadline (if any) and an external cancellation
    /// token so a hung or stalled store call cannot block the handle past
    /// either boundary (spec §4.2 step 3, §5).
    ///
    /// `safety_deadline` is `None` for the explicit, caller-invoked
    /// `renew()` (which has no notion of a renewal interval to race
    /// against); the auto-renewal loop always supplies one.
    async fn try_renew_once(
        &self,
        lease_id: Uuid,
        safety_deadline: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<ChronoDuration, RenewAttemptError> {
        let _gate = self.renew_gate.lock().await;
        let (fencing_token, prev_expiry) = {
            let s = self.state.lock();
            (s.fencing_token.clone(), s.expires_at)
        };
        let renew_call = self
            .backend
            .renew(&self.lease_name, lease_id, fencing_token.as_deref());

        let deadline_wait = async {
            match safety_deadline {
                Some(deadline) => {
                    let remaining = (deadline - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
                    tokio::time::sleep(remaining).await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        let outcome: Result<_, RenewAttemptError> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RenewAttemptError::Cancelled),
            _ = self.cancel.cancelled() => Err(RenewAttemptError::Cancelled),
            _ = deadline_wait => Err(RenewAttemptError::SafetyDeadline),
            res = renew_call => res.map_err(RenewAttemptError::Backend),
        };
        let renewed = outcome?;

        let extension = renewed.expires_at - prev_expiry;
        let mut state = self.state.lock();
        state.expires_at = renewed.expires_at;
        state.fencing_token = renewed.fencing_token;
        state.renewal_count += 1;
        state.last_successful_renewal = Utc::now();
        Ok(extension)
    }

    /// Step 4 of the auto-renewal algorithm (spec §4.2): retry with
    /// exponential backoff, clamped to the safety-threshold window. Also
    /// covers step 3's interlock while a renewal is in flight: each attempt
    /// races the driver call against the same deadline the pre-attempt gate
    /// checks (scenario S4's hung-renew case).
    async fn renew_with_retry(&self, lease_id: Uuid) -> RenewOutcome {
        let max_attempts = self.options.auto_renew_max_retries + 1;
        let never_cancel = CancellationToken::new();
        let safety_deadline = self.safety_deadline();
        for attempt in 1..=max_attempts {
            match self
                .try_renew_once(lease_id, safety_deadline, &never_cancel)
                .await
            {
                Ok(extension) => {
                    let new_expires_at = self.state.lock().expires_at;
                    self.events.dispatch(LeaseEvent::Renewed {
                        lease_name: self.lease_name.clone(),
                        lease_id,
                        timestamp: Utc::now(),
                        new_expires_at,
                        observed_extension: extension,
                    });
                    return RenewOutcome::Success;
                }
                Err(RenewAttemptError::SafetyDeadline) => {
                    self.transition_lost("exceeded safety threshold", lease_id);
                    return RenewOutcome::Terminated;
                }
                Err(RenewAttemptError::Cancelled) => return RenewOutcome::Terminated,
                Err(RenewAttemptError::Backend(BackendError::Lost(reason))) => {
                    self.transition_lost(&format!("renewal failed: {reason}"), lease_id);
                    return RenewOutcome::Terminated;
                }
                Err(RenewAttemptError::Backend(other)) => {
                    let will_retry = attempt < max_attempts;
                    self.events.dispatch(LeaseEvent::RenewalFailed {
                        lease_name: self.lease_name.clone(),
                        lease_id,
                        timestamp: Utc::now(),
                        attempt_number: attempt,
                        error: other.to_string(),
                        will_retry,
                    });
                    if !will_retry {
                        self.transition_lost("renewal retries exhausted", lease_id);
                        return RenewOutcome::Terminated;
                    }

                    let Some(sleep_for) = self.clamped_backoff(attempt) else {
                        self.transition_lost("no time remaining for retry", lease_id);
                        return RenewOutcome::Terminated;
                    };
                    tokio::select! {
                        _ = self.cancel.cancelled() => return RenewOutcome::Terminated,
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                }
            }
        }
        unreachable!("loop always returns within max_attempts iterations")
    }

    /// `auto_renew_retry_interval * 2^(attempt-1)`, clamped so that
    /// `last_successful_renewal + default_duration * safety_threshold` is
    /// never crossed. `None` means the clamp yielded <= 0 (spec §4.2 step 4).
    fn clamped_backoff(&self, attempt: u32) -> Option<StdDuration> {
        let default_duration = match self.options.default_duration {
            LeaseDuration::Finite(d) => d,
            LeaseDuration::Infinite => return None,
        };
        let backoff =
            self.options
                .auto_renew_retry_interval
                .mul_f64(2f64.powi((attempt - 1) as i32));
        let last_successful_renewal = self.state.lock().last_successful_renewal;
        let threshold = chrono_duration_from_std_saturating(
            default_duration.mul_f64(self.options.auto_renew_safety_threshold),
        );
        let deadline = last_successful_renewal + threshold;
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
        let sleep_for = backoff.min(remaining);
        if sleep_for.is_zero() {
            None
        } else {
            Some(sleep_for)
        }
    }
}

fn chrono_duration_from_std_saturating(d: StdDuration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Component B. One per successful acquisition; not `Clone` — ownership is
/// exclusive to the caller that holds it (spec §3).
pub struct LeaseHandle {
    inner: Arc<HandleInner>,
    renewer: Option<tokio::task::JoinHandle<()>>,
}

impl LeaseHandle {
    pub(crate) fn new(
        backend: Arc<dyn LeaseBackend>,
        lease_name: String,
        materials: AcquiredLease,
        options: LeaseOptions,
    ) -> Self {
        let now = Utc::now();
        let inner = Arc::new(HandleInner {
            lease_name,
            backend,
            acquired_at: now,
            state: parking_lot::Mutex::new(MutableState {
                lease_id: materials.lease_id,
                expires_at: materials.expires_at,
                renewal_count: 0,
                last_successful_renewal: now,
                fencing_token: materials.fencing_token,
                disposed: false,
                lost: false,
            }),
            options,
            renew_gate: tokio::sync::Mutex::new(()),
            events: EventDispatcher::new(),
            cancel: CancellationToken::new(),
        });
        metrics::lease_acquired();

        let renewer = if inner.options.auto_renew
            && matches!(inner.options.default_duration, LeaseDuration::Finite(_))
        {
            Some(tokio::spawn(run_renewer(inner.clone())))
        } else {
            None
        };

        Self { inner, renewer }
    }

    pub fn lease_id(&self) -> Uuid {
        self.inner.state.lock().lease_id
    }

    pub fn lease_name(&self) -> &str {
        &self.inner.lease_name
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.inner.acquired_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.inner.state.lock().expires_at
    }

    pub fn renewal_count(&self) -> u64 {
        self.inner.state.lock().renewal_count
    }

    pub fn last_successful_renewal(&self) -> DateTime<Utc> {
        self.inner.state.lock().last_successful_renewal
    }

    /// Derived: `true` iff the handle is neither disposed/lost nor past its
    /// recorded expiry (spec §3).
    pub fn is_acquired(&self) -> bool {
        let s = self.inner.state.lock();
        !s.disposed && !s.lost && Utc::now() < s.expires_at
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LeaseEvent> {
        self.inner.events.subscribe()
    }

    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&LeaseEvent) + Send + Sync + 'static,
    {
        self.inner.events.register(Box::new(callback) as EventCallback);
    }

    /// Perform one synchronous renewal. Fails with `Error::LeaseLost` if the
    /// handle is already disposed/lost or past `expires_at` (spec §4.2).
    ///
    /// `cancel` lets the caller unwind a stuck driver call (spec §5:
    /// "cancellation during Renew/Release aborts the current driver call");
    /// `CancellationToken::new()` opts out and behaves as if `renew` took
    /// no token at all.
    pub async fn renew(&self, cancel: CancellationToken) -> Result<(), Error> {
        let (disposed, lost, lease_id, expires_at) = self.inner.snapshot();
        if disposed || lost || Utc::now() >= expires_at {
            return Err(Error::LeaseLost {
                name: self.inner.lease_name.clone(),
                lease_id,
                reason: "handle is already disposed, lost, or expired".into(),
            });
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match self.inner.try_renew_once(lease_id, None, &cancel).await {
            Ok(extension) => {
                let new_expires_at = self.inner.state.lock().expires_at;
                self.inner.events.dispatch(LeaseEvent::Renewed {
                    lease_name: self.inner.lease_name.clone(),
                    lease_id,
                    timestamp: Utc::now(),
                    new_expires_at,
                    observed_extension: extension,
                });
                Ok(())
            }
            Err(RenewAttemptError::Cancelled) => Err(Error::Cancelled),
            Err(RenewAttemptError::SafetyDeadline) => unreachable!(
                "try_renew_once never races a safety deadline when called with None"
            ),
            Err(RenewAttemptError::Backend(BackendError::Lost(reason))) => {
                self.inner
                    .transition_lost(&format!("renewal failed: {reason}"), lease_id);
                Err(Error::LeaseLost {
                    name: self.inner.lease_name.clone(),
                    lease_id,
                    reason,
                })
            }
            Err(RenewAttemptError::Backend(other)) => {
                self.inner.events.dispatch(LeaseEvent::RenewalFailed {
                    lease_name: self.inner.lease_name.clone(),
                    lease_id,
                    timestamp: Utc::now(),
                    attempt_number: 1,
                    error: other.to_string(),
                    will_retry: false,
                });
                Err(Error::StoreUnavailable(Box::new(other)))
            }
        }
    }

    /// Stop the renewer, call driver release best-effort, mark disposed.
    /// Does *not* emit `LeaseLost` — release is deliberate (spec §4.2).
    /// Idempotent (spec P5): calling this any positive number of times is
    /// equivalent to calling it once.
    ///
    /// Unlike `renew`, this takes no cancellation token: spec §5 states
    /// release "always tries the driver call once... regardless of the
    /// caller's context, using a short internal deadline", which this
    /// already honours via the 5s internal timeout below.
    pub async fn release(&self) -> Result<(), Error> {
        let (already_done, lease_id, fencing_token) = {
            let mut state = self.inner.state.lock();
            if state.disposed || state.lost {
                (true, state.lease_id, state.fencing_token.clone())
            } else {
                state.disposed = true;
                (false, state.lease_id, state.fencing_token.clone())
            }
        };
        if already_done {
            return Ok(());
        }

        self.inner.cancel.cancel();
        metrics::lease_ended();

        let release_call = self.inner.backend.release(
            &self.inner.lease_name,
            lease_id,
            fencing_token.as_deref(),
        );
        // Release always tries the driver call once, on a short internal
        // deadline, regardless of the caller's own context (spec §5).
        match tokio::time::timeout(StdDuration::from_secs(5), release_call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!(
                "{}: release({}) driver call failed (absorbed): {}",
                self.inner.lease_name,
                lease_id,
                e
            ),
            Err(_) => log::debug!(
                "{}: release({}) driver call timed out (absorbed)",
                self.inner.lease_name,
                lease_id
            ),
        }
        Ok(())
    }

    /// Same as [`LeaseHandle::release`], but never surfaces an error — used
    /// on cancellation-safe shutdown paths where there is no one left to
    /// observe a `Result`.
    pub async fn dispose(&self) {
        let _ = self.release().await;
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        // `renewer`'s cooperative loop observes `cancel` and exits on its
        // own; we don't forcibly abort it mid-critical-section.
        self.inner.cancel.cancel();
        if let Some(handle) = self.renewer.take() {
            drop(handle);
        }

        let inner = self.inner.clone();
        let already_done = {
            let mut state = inner.state.lock();
            if state.disposed || state.lost {
                true
            } else {
                state.disposed = true;
                false
            }
        };
        if already_done {
            return;
        }
        metrics::lease_ended();
        tokio::spawn(async move {
            let (lease_id, fencing_token) = {
                let s = inner.state.lock();
                (s.lease_id, s.fencing_token.clone())
            };
            let release_call =
                inner
                    .backend
                    .release(&inner.lease_name, lease_id, fencing_token.as_deref());
            if let Err(e) = tokio::time::timeout(StdDuration::from_secs(5), release_call).await {
                log::debug!(
                    "{}: best-effort release on drop timed out: {}",
                    inner.lease_name,
                    e
                );
            }
        });
    }
}

/// The auto-renewal loop (spec §4.2, steps 1-5).
async fn run_renewer(inner: Arc<HandleInner>) {
    let mut last_attempt = tokio::time::Instant::now();
    loop {
        let interval = inner.options.auto_renew_interval();
        let until_next = interval.saturating_sub(last_attempt.elapsed());
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(until_next) => {}
        }
        last_attempt = tokio::time::Instant::now();

        let (disposed, lost, lease_id, _) = inner.snapshot();
        if disposed || lost {
            return;
        }

        let default_duration = match inner.options.default_duration {
            LeaseDuration::Finite(d) => d,
            LeaseDuration::Infinite => return,
        };
        let last_successful_renewal = inner.state.lock().last_successful_renewal;
        let elapsed = Utc::now() - last_successful_renewal;
        let threshold = chrono_duration_from_std_saturating(
            default_duration.mul_f64(inner.options.auto_renew_safety_threshold),
        );
        if elapsed >= threshold {
            inner.transition_lost("exceeded safety threshold", lease_id);
            return;
        }

        match inner.renew_with_retry(lease_id).await {
            RenewOutcome::Success => continue,
            RenewOutcome::Terminated => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_double::MemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Once;

    static LOG_INIT: Once = Once::new();

    fn init_logging() {
        LOG_INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }

    fn options(duration: StdDuration) -> LeaseOptions {
        LeaseOptions::builder(LeaseDuration::Finite(duration))
            .auto_renew_interval(duration.mul_f64(2.0 / 3.0))
            .auto_renew_retry_interval(StdDuration::from_millis(50))
            .auto_renew_max_retries(2)
            .build()
            .unwrap()
    }

    fn no_auto_renew_options(duration: StdDuration) -> LeaseOptions {
        LeaseOptions::builder(LeaseDuration::Finite(duration))
            .auto_renew(false)
            .build()
            .unwrap()
    }

    /// Acquires with `opts.default_duration` — *not* an unrelated hardcoded
    /// duration — so a test's safety-threshold/expiry math is computed
    /// against the same duration the handle actually holds.
    async fn acquire(backend: &MemoryBackend, name: &str, opts: LeaseOptions) -> LeaseHandle {
        let backend: Arc<dyn LeaseBackend> = Arc::new(backend.clone());
        let materials = backend
            .acquire(name, opts.default_duration)
            .await
            .unwrap()
            .unwrap();
        LeaseHandle::new(backend, name.to_string(), materials, opts)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_renews_and_releases_cleanly() {
        init_logging();
        let backend = MemoryBackend::new();
        let handle = acquire(&backend, "inv-PROD-001", options(StdDuration::from_secs(3))).await;

        let lost = Arc::new(AtomicU32::new(0));
        {
            let lost = lost.clone();
            handle.on_event(move |ev| {
                if matches!(ev, LeaseEvent::Lost { .. }) {
                    lost.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::advance(StdDuration::from_secs(7)).await;
        tokio::task::yield_now().await;

        assert!(handle.renewal_count() >= 2);
        assert_eq!(lost.load(Ordering::SeqCst), 0);

        handle.release().await.unwrap();
        assert!(!handle.is_acquired());
        assert_eq!(backend.current_holder("inv-PROD-001"), None);
    }

    /// Scenario S4: the backend's `renew` call hangs forever from the first
    /// renewal attempt onward. The handle must declare the lease lost at or
    /// before `default_duration * safety_threshold` (here 30s * 0.9 = 27s)
    /// even though the driver call never returns — i.e. the in-flight call
    /// itself must race the safety deadline, not just the pre-attempt gate.
    #[tokio::test(start_paused = true)]
    async fn safety_threshold_breach_declares_lost() {
        let backend = MemoryBackend::new();
        let opts = LeaseOptions::builder(LeaseDuration::Finite(StdDuration::from_secs(30)))
            .auto_renew_interval(StdDuration::from_secs(20))
            .auto_renew_safety_threshold(0.9)
            .build()
            .unwrap();
        let handle = acquire(&backend, "job-reconcile", opts).await;
        backend.set_hang_renew(true);

        let lost_reason: Arc<std::sync::Mutex<Option<String>>> =
            Arc::new(std::sync::Mutex::new(None));
        {
            let lost_reason = lost_reason.clone();
            handle.on_event(move |ev| {
                if let LeaseEvent::Lost { reason, .. } = ev {
                    *lost_reason.lock().unwrap() = Some(reason.clone());
                }
            });
        }

        tokio::time::advance(StdDuration::from_secs(28)).await;
        tokio::task::yield_now().await;

        assert!(!handle.is_acquired());
        let reason = lost_reason
            .lock()
            .unwrap()
            .clone()
            .expect("LeaseLost was never fired despite the hung renew call");
        assert!(
            reason.contains("safety threshold"),
            "unexpected LeaseLost reason: {reason}"
        );
    }

    /// `renew`'s driver call must itself be cancellable (spec §5, §6):
    /// cancelling while a hung `renew` is in flight unwinds with
    /// `Error::Cancelled` rather than hanging forever.
    #[tokio::test(start_paused = true)]
    async fn renew_is_cancellable_while_driver_call_is_hung() {
        let backend = MemoryBackend::new();
        let handle = Arc::new(
            acquire(
                &backend,
                "hung-renew",
                no_auto_renew_options(StdDuration::from_secs(30)),
            )
            .await,
        );
        backend.set_hang_renew(true);

        let cancel = CancellationToken::new();
        let waiter = {
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handle.renew(cancel).await })
        };

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        tokio::task::yield_now().await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let backend = MemoryBackend::new();
        let handle = acquire(&backend, "idempotent", options(StdDuration::from_secs(3))).await;
        handle.release().await.unwrap();
        handle.release().await.unwrap();
        handle.release().await.unwrap();
        assert!(!handle.is_acquired());
    }

    #[tokio::test]
    async fn renew_on_disposed_handle_fails_with_lease_lost() {
        let backend = MemoryBackend::new();
        let handle = acquire(&backend, "disposed", options(StdDuration::from_secs(3))).await;
        handle.dispose().await;
        let err = handle.renew(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn break_during_renewal_is_eventually_declared_lost() {
        let backend = MemoryBackend::new();
        let handle = acquire(&backend, "job-reconcile", options(StdDuration::from_secs(3))).await;
        backend.break_externally("job-reconcile");

        tokio::time::advance(StdDuration::from_secs(3)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(StdDuration::from_secs(3)).await;
        tokio::task::yield_now().await;

        assert!(!handle.is_acquired());
    }
}
