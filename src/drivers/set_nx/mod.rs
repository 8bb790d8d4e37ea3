//! Set-NX driver (spec §4.5.3): one lease corresponds to one key, acquired
//! with `SET key value NX PX ttl_ms` and renewed/released through
//! Lua-scripted compare-and-extend/compare-and-delete so the check and the
//! mutation happen atomically on the server.
//!
//! The stored value concatenates the lease id with its TTL
//! (`"{lease_id}:{ttl_ms}"`) so a renew can recover the duration the lease
//! was acquired with without a side channel. Validity is clock-drift
//! adjusted per the multi-instance set-NX algorithm before it is ever
//! trusted (spec §4.5.3).

pub mod options;

use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::backend::{AcquiredLease, BackendError, LeaseBackend, LeaseDuration, RenewedLease};

pub use options::{SetNxOptions, SetNxOptionsBuilder};

const COMPARE_AND_EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

pub struct SetNxBackend {
    client: redis::Client,
    options: SetNxOptions,
}

impl SetNxBackend {
    pub fn new(options: SetNxOptions) -> Result<Self, BackendError> {
        let client = redis::Client::open(options.connection_string.as_str())
            .map_err(|e| BackendError::Fatal(Box::new(e)))?;
        Ok(Self { client, options })
    }

    fn key_for(&self, name: &str) -> String {
        format!("{}{name}", self.options.key_prefix)
    }

    fn token_for(lease_id: Uuid, ttl_ms: i64) -> String {
        format!("{lease_id}:{ttl_ms}")
    }

    fn ttl_from_token(token: &str) -> i64 {
        token
            .rsplit_once(':')
            .and_then(|(_, ttl)| ttl.parse().ok())
            .unwrap_or(30_000)
    }

    fn connect_failure(&self, reason: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> BackendError {
        if self.options.abort_on_connect_fail {
            BackendError::Fatal(reason.into())
        } else {
            BackendError::TransientUnavailable(reason.into())
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BackendError> {
        let mut conn = tokio::time::timeout(
            self.options.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| self.connect_failure("redis connect timed out"))?
        .map_err(|e| self.connect_failure(e))?;

        if let Some(index) = self.options.database_index {
            redis::cmd("SELECT")
                .arg(index)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| self.connect_failure(e))?;
        }
        Ok(conn)
    }

    /// Runs a command future under `sync_timeout`, as distinct from the
    /// connection-establishment budget in [`Self::connection`].
    async fn with_sync_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, BackendError> {
        tokio::time::timeout(self.options.sync_timeout, fut)
            .await
            .map_err(|_| BackendError::TransientUnavailable("redis command timed out".into()))?
            .map_err(|e| BackendError::TransientUnavailable(Box::new(e)))
    }

    /// Clock-drift-adjusted validity window per the multi-instance set-NX
    /// algorithm: shave off both an absolute drift budget, a proportional
    /// factor of the requested TTL, and (on acquire) the wall-clock time the
    /// round-trip to the store actually took, before trusting it.
    fn adjusted_validity(
        &self,
        requested: std::time::Duration,
        elapsed: std::time::Duration,
    ) -> std::time::Duration {
        let drift =
            requested.mul_f64(self.options.clock_drift_factor) + std::time::Duration::from_millis(2);
        requested.saturating_sub(drift).saturating_sub(elapsed)
    }
}

#[async_trait::async_trait]
impl LeaseBackend for SetNxBackend {
    async fn acquire(
        &self,
        name: &str,
        duration: LeaseDuration,
    ) -> Result<Option<AcquiredLease>, BackendError> {
        let requested = duration.as_std().ok_or_else(|| {
            BackendError::Fatal("the set-nx driver does not support infinite durations".into())
        })?;

        let key = self.key_for(name);
        let lease_id = Uuid::new_v4();
        let ttl_ms = requested.as_millis() as i64;
        let token = Self::token_for(lease_id, ttl_ms);

        let start = tokio::time::Instant::now();
        let mut conn = self.connection().await?;
        let acquired: bool = self.with_sync_timeout(conn.set_nx(&key, &token)).await?;

        if !acquired {
            return Ok(None);
        }

        self.with_sync_timeout(conn.pexpire::<_, ()>(&key, ttl_ms))
            .await?;

        // Validity only accounts for the round-trip's actual latency once
        // the round-trip is over. A degenerately slow acquire is ordinary
        // contention, not a fatal error: release what we just took and
        // report it the same way (`Ok(None)`).
        let elapsed = start.elapsed();
        let validity = self.adjusted_validity(requested, elapsed);
        if validity < self.options.minimum_validity {
            let script = redis::Script::new(COMPARE_AND_DELETE_SCRIPT);
            let _: Result<i32, _> = script.key(&key).arg(&token).invoke_async(&mut conn).await;
            return Ok(None);
        }

        let expires_at =
            Utc::now() + chrono::Duration::from_std(validity).unwrap_or(chrono::Duration::zero());
        Ok(Some(AcquiredLease {
            lease_id,
            expires_at,
            fencing_token: Some(token),
        }))
    }

    async fn renew(
        &self,
        name: &str,
        lease_id: Uuid,
        fencing_token: Option<&str>,
    ) -> Result<RenewedLease, BackendError> {
        let token = fencing_token
            .map(str::to_string)
            .unwrap_or_else(|| Self::token_for(lease_id, 30_000));
        let ttl_ms = Self::ttl_from_token(&token);
        let key = self.key_for(name);

        let mut conn = self.connection().await?;
        let script = redis::Script::new(COMPARE_AND_EXTEND_SCRIPT);
        let renewed: i32 = self
            .with_sync_timeout(script.key(&key).arg(&token).arg(ttl_ms).invoke_async(&mut conn))
            .await?;

        if renewed == 0 {
            return Err(BackendError::Lost(
                "set-nx key no longer holds our token".into(),
            ));
        }

        let validity = self.adjusted_validity(
            std::time::Duration::from_millis(ttl_ms as u64),
            std::time::Duration::ZERO,
        );
        let expires_at =
            Utc::now() + chrono::Duration::from_std(validity).unwrap_or(chrono::Duration::zero());
        Ok(RenewedLease {
            expires_at,
            fencing_token: Some(token),
        })
    }

    async fn release(
        &self,
        name: &str,
        lease_id: Uuid,
        fencing_token: Option<&str>,
    ) -> Result<(), BackendError> {
        let token = fencing_token
            .map(str::to_string)
            .unwrap_or_else(|| Self::token_for(lease_id, 30_000));
        let key = self.key_for(name);

        let Ok(mut conn) = self.connection().await else {
            return Ok(());
        };
        let script = redis::Script::new(COMPARE_AND_DELETE_SCRIPT);
        let _: Result<i32, _> = script.key(&key).arg(&token).invoke_async(&mut conn).await;
        Ok(())
    }

    async fn break_lease(&self, name: &str) -> Result<(), BackendError> {
        let key = self.key_for(name);
        if let Ok(mut conn) = self.connection().await {
            let _: Result<i32, _> = conn.del(&key).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SetNxOptions {
        SetNxOptions::builder("redis://127.0.0.1:6379/")
            .build()
            .unwrap()
    }

    #[test]
    fn rejects_durations_too_thin_after_drift_compensation() {
        let backend = SetNxBackend::new(options()).unwrap();
        let validity = backend.adjusted_validity(
            std::time::Duration::from_millis(50),
            std::time::Duration::ZERO,
        );
        assert!(validity < backend.options.minimum_validity);
    }

    #[test]
    fn adjusted_validity_leaves_headroom_for_typical_durations() {
        let backend = SetNxBackend::new(options()).unwrap();
        let validity = backend.adjusted_validity(
            std::time::Duration::from_secs(30),
            std::time::Duration::ZERO,
        );
        assert!(validity < std::time::Duration::from_secs(30));
        assert!(validity > std::time::Duration::from_secs(29));
    }

    #[test]
    fn elapsed_round_trip_time_further_reduces_validity() {
        let backend = SetNxBackend::new(options()).unwrap();
        let validity = backend.adjusted_validity(
            std::time::Duration::from_secs(30),
            std::time::Duration::from_millis(29_950),
        );
        assert!(validity < std::time::Duration::from_millis(100));
    }

    #[test]
    fn token_round_trips_its_ttl() {
        let lease_id = Uuid::new_v4();
        let token = SetNxBackend::token_for(lease_id, 45_000);
        assert_eq!(SetNxBackend::ttl_from_token(&token), 45_000);
    }
}
