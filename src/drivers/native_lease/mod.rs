//! Native server-lease driver (spec §4.5.1): one lease corresponds to one
//! empty object in a container, carrying the store's own native
//! server-side lease primitive (modelled on the Azure Blob Storage lease
//! REST surface: `x-ms-lease-*` headers, 409/412 status semantics).
//!
//! Acquire is a conditional create followed by a lease-acquire call; 409
//! means someone else holds it, 404 means the container vanished under us.
//! Renew and release thread the lease id (and, where the store assigns
//! one, a fencing token) back through every call.

pub mod options;

use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use uuid::Uuid;

use crate::backend::{AcquiredLease, BackendError, LeaseBackend, LeaseDuration, RenewedLease};

pub use options::{NativeLeaseOptions, NativeLeaseOptionsBuilder};

const LEASE_ACTION_HEADER: &str = "x-ms-lease-action";
const LEASE_DURATION_HEADER: &str = "x-ms-lease-duration";
const LEASE_ID_HEADER: &str = "x-ms-lease-id";
const PROPOSED_LEASE_ID_HEADER: &str = "x-ms-proposed-lease-id";
const LEASE_BREAK_PERIOD_HEADER: &str = "x-ms-lease-break-period";

pub struct NativeLeaseBackend {
    client: reqwest::Client,
    options: NativeLeaseOptions,
    container_ready: tokio::sync::OnceCell<()>,
}

impl NativeLeaseBackend {
    pub fn new(options: NativeLeaseOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            options,
            container_ready: tokio::sync::OnceCell::new(),
        }
    }

    fn container_url(&self) -> String {
        format!("{}/{}", self.options.endpoint, self.options.container_name)
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/{}{}",
            self.container_url(),
            self.options.blob_prefix,
            name
        )
    }

    /// Ensures the container exists, created lazily under a single-entry
    /// gate on first use (spec §4.5.1). A `tokio::sync::OnceCell` gives
    /// exactly that "first caller does the work, the rest wait" shape
    /// without a bespoke mutex.
    async fn ensure_container(&self) -> Result<(), BackendError> {
        if !self.options.create_container_if_not_exists {
            return Ok(());
        }
        self.container_ready
            .get_or_try_init(|| async {
                let resp = self
                    .client
                    .put(self.container_url())
                    .query(&[("restype", "container")])
                    .send()
                    .await
                    .map_err(transient)?;
                match resp.status() {
                    StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
                    other => Err(classify_status(other, "creating container")),
                }
            })
            .await
            .map(|_| ())
    }

    fn validate_duration(&self, duration: LeaseDuration) -> Result<i64, BackendError> {
        match duration {
            LeaseDuration::Infinite => Err(BackendError::Fatal(
                "the native-lease driver does not support infinite durations; the server's \
                 native lease primitive enforces a hard 15-60s cap"
                    .into(),
            )),
            LeaseDuration::Finite(d) => {
                if d < self.options.min_lease_duration || d > self.options.max_lease_duration {
                    return Err(BackendError::Fatal(
                        format!(
                            "requested duration {d:?} outside allowed range [{:?}, {:?}]",
                            self.options.min_lease_duration, self.options.max_lease_duration
                        )
                        .into(),
                    ));
                }
                Ok(d.as_secs() as i64)
            }
        }
    }
}

/// The driver is stateless between calls — nothing but what `acquire`
/// returns is threaded back through `renew`/`release` — so the
/// originally-requested duration (needed to estimate the next expiry on
/// renew; see `renew` below) rides along inside the fencing token, next to
/// the lease id the server actually checks.
fn encode_fencing_token(lease_id: Uuid, duration_secs: i64) -> String {
    format!("{lease_id}|{duration_secs}")
}

fn decode_fencing_token(token: &str) -> Result<(&str, i64), BackendError> {
    let (lease_id, duration_secs) = token
        .split_once('|')
        .ok_or_else(|| BackendError::Fatal("malformed native-lease fencing token".into()))?;
    let duration_secs: i64 = duration_secs
        .parse()
        .map_err(|_| BackendError::Fatal("malformed native-lease fencing token duration".into()))?;
    Ok((lease_id, duration_secs))
}

fn transient(e: reqwest::Error) -> BackendError {
    BackendError::TransientUnavailable(Box::new(e))
}

fn classify_status(status: StatusCode, context: &str) -> BackendError {
    if status.is_client_error() {
        BackendError::Fatal(format!("{context}: unexpected status {status}").into())
    } else {
        BackendError::TransientUnavailable(format!("{context}: unexpected status {status}").into())
    }
}

#[async_trait::async_trait]
impl LeaseBackend for NativeLeaseBackend {
    async fn acquire(
        &self,
        name: &str,
        duration: LeaseDuration,
    ) -> Result<Option<AcquiredLease>, BackendError> {
        let duration_secs = self.validate_duration(duration)?;
        self.ensure_container().await?;

        let object_url = self.object_url(name);
        let created_at = Utc::now();

        let create_resp = self
            .client
            .put(&object_url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-meta-leaseName", name)
            .header("x-ms-meta-createdAt", created_at.to_rfc3339())
            .body(Vec::<u8>::new())
            .send()
            .await
            .map_err(transient)?;

        match create_resp.status() {
            StatusCode::CREATED | StatusCode::CONFLICT => {}
            StatusCode::NOT_FOUND => {
                return Err(BackendError::TransientUnavailable(
                    "container was deleted concurrently".into(),
                ))
            }
            other => return Err(classify_status(other, "creating lease object")),
        }

        let lease_id = Uuid::new_v4();
        let lease_resp = self
            .client
            .put(&object_url)
            .query(&[("comp", "lease")])
            .header(LEASE_ACTION_HEADER, "acquire")
            .header(LEASE_DURATION_HEADER, duration_secs.to_string())
            .header(PROPOSED_LEASE_ID_HEADER, lease_id.to_string())
            .send()
            .await
            .map_err(transient)?;

        match lease_resp.status() {
            StatusCode::CREATED => {
                let expires_at = Utc::now() + chrono::Duration::seconds(duration_secs);
                Ok(Some(AcquiredLease {
                    lease_id,
                    expires_at,
                    fencing_token: Some(encode_fencing_token(lease_id, duration_secs)),
                }))
            }
            StatusCode::CONFLICT => Ok(None),
            StatusCode::NOT_FOUND => Err(BackendError::TransientUnavailable(
                "lease object was deleted concurrently".into(),
            )),
            other => Err(classify_status(other, "acquiring native lease")),
        }
    }

    async fn renew(
        &self,
        name: &str,
        _lease_id: Uuid,
        fencing_token: Option<&str>,
    ) -> Result<RenewedLease, BackendError> {
        let token = fencing_token.ok_or_else(|| {
            BackendError::Fatal("renew called without a fencing token".into())
        })?;
        let (lease_id_header, duration_secs) = decode_fencing_token(token)?;
        let object_url = self.object_url(name);

        let resp = self
            .client
            .put(&object_url)
            .query(&[("comp", "lease")])
            .header(LEASE_ACTION_HEADER, "renew")
            .header(LEASE_ID_HEADER, lease_id_header)
            .send()
            .await
            .map_err(transient)?;

        match resp.status() {
            StatusCode::OK => {
                // The server renews for the same duration the lease was
                // acquired with (carried in the fencing token, since this
                // driver is otherwise stateless between calls); we shave
                // off a small clock-drift/round-trip budget rather than
                // trust our own clock verbatim (spec §4.1 "clock accounting").
                let reported_duration = Duration::from_secs(duration_secs.max(0) as u64);
                let safe_duration = reported_duration.saturating_sub(Duration::from_millis(500));
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(safe_duration).unwrap_or(chrono::Duration::zero());
                Ok(RenewedLease {
                    expires_at,
                    fencing_token: Some(token.to_string()),
                })
            }
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                Err(BackendError::Lost("lease id no longer matches the store".into()))
            }
            StatusCode::NOT_FOUND => Err(BackendError::Lost("lease object no longer exists".into())),
            other => Err(classify_status(other, "renewing native lease")),
        }
    }

    async fn release(
        &self,
        name: &str,
        _lease_id: Uuid,
        fencing_token: Option<&str>,
    ) -> Result<(), BackendError> {
        let Some(token) = fencing_token else {
            return Ok(());
        };
        let Ok((lease_id_header, _)) = decode_fencing_token(token) else {
            return Ok(());
        };
        let object_url = self.object_url(name);
        let resp = self
            .client
            .put(&object_url)
            .query(&[("comp", "lease")])
            .header(LEASE_ACTION_HEADER, "release")
            .header(LEASE_ID_HEADER, lease_id_header)
            .send()
            .await;

        match resp {
            Ok(r) if matches!(r.status(), StatusCode::OK | StatusCode::NOT_FOUND | StatusCode::CONFLICT) => {
                Ok(())
            }
            Ok(_) | Err(_) => Ok(()), // release is best-effort and must never raise
        }
    }

    async fn break_lease(&self, name: &str) -> Result<(), BackendError> {
        let object_url = self.object_url(name);
        let _ = self
            .client
            .put(&object_url)
            .query(&[("comp", "lease")])
            .header(LEASE_ACTION_HEADER, "break")
            .header(LEASE_BREAK_PERIOD_HEADER, "0")
            .send()
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> NativeLeaseBackend {
        let options = NativeLeaseOptions::builder(server.uri(), "leases")
            .create_container_if_not_exists(false)
            .build()
            .unwrap();
        NativeLeaseBackend::new(options)
    }

    #[tokio::test]
    async fn acquire_returns_none_on_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "lease"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let backend = backend(&server).await;
        let result = backend
            .acquire("inv-PROD-001", LeaseDuration::Finite(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn acquire_rejects_infinite_duration() {
        let server = MockServer::start().await;
        let backend = backend(&server).await;
        let err = backend
            .acquire("x", LeaseDuration::Infinite)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Fatal(_)));
    }

    #[tokio::test]
    async fn renew_maps_precondition_failed_to_lost() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "lease"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let backend = backend(&server).await;
        let err = backend
            .renew("x", Uuid::new_v4(), Some("stale-lease-id|30"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Lost(_)));
    }

    #[tokio::test]
    async fn renew_derives_expiry_from_the_originally_requested_duration() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "lease"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let backend = backend(&server).await;
        let lease_id = Uuid::new_v4();
        let token = encode_fencing_token(lease_id, 15);
        let before = Utc::now();
        let renewed = backend
            .renew("x", lease_id, Some(&token))
            .await
            .unwrap();

        // Bound by the 15s duration carried in the fencing token, not the
        // driver's 60s max cap.
        assert!(renewed.expires_at <= before + chrono::Duration::seconds(15));
        assert!(renewed.expires_at > before + chrono::Duration::seconds(13));
        assert_eq!(renewed.fencing_token.as_deref(), Some(token.as_str()));
    }
}
