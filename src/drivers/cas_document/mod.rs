//! CAS-document driver (spec §4.5.2): one lease corresponds to one JSON
//! document, fenced by the store's entity tag (ETag) under optimistic
//! concurrency — `If-None-Match: *` to create, `If-Match: <etag>` to
//! replace or delete.
//!
//! Every write reads the current document first and only proceeds if the
//! ETag it observed still matches at write time; a mismatch means someone
//! else won the race, surfaced as contention on acquire or `Lost` on
//! renew.

pub mod options;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{AcquiredLease, BackendError, LeaseBackend, LeaseDuration, RenewedLease};

pub use options::{CasDocumentOptions, CasDocumentOptionsBuilder, ConsistencyLevel};

#[derive(Serialize, Deserialize, Clone, Debug)]
struct LeaseDocument {
    id: String,
    #[serde(rename = "leaseId")]
    lease_id: Uuid,
    #[serde(rename = "acquiredAt")]
    acquired_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    expires_at: DateTime<Utc>,
    #[serde(rename = "renewalCount")]
    renewal_count: u64,
    #[serde(rename = "lastRenewedAt")]
    last_renewed_at: DateTime<Utc>,
    /// Store-side TTL in seconds, set generously (>= 2x duration) so
    /// abandoned leases are garbage-collected by the store even if no
    /// process ever calls `release` (spec §4.5.2).
    ttl: i64,
}

pub struct CasDocumentBackend {
    client: reqwest::Client,
    options: CasDocumentOptions,
}

impl CasDocumentBackend {
    pub fn new(options: CasDocumentOptions) -> Self {
        Self {
            client: reqwest::Client::new(),
            options,
        }
    }

    fn document_url(&self, name: &str) -> String {
        format!(
            "{}/dbs/{}/colls/{}/docs/{}",
            self.options.endpoint, self.options.database_name, self.options.container_name, name
        )
    }

    /// Seconds to attach as the document's store-side TTL: at least twice
    /// the requested lease duration, floored at `default_time_to_live`
    /// (spec §4.5.2).
    fn document_ttl_secs(&self, duration: LeaseDuration) -> i64 {
        let from_duration = duration.as_std().map(|d| d.as_secs() as i64 * 2).unwrap_or(0);
        from_duration.max(self.options.default_time_to_live.as_secs() as i64)
    }

    async fn fetch(&self, name: &str) -> Result<Option<(LeaseDocument, String)>, BackendError> {
        let resp = self
            .client
            .get(self.document_url(name))
            .header("x-ms-consistency-level", self.options.consistency_level.as_header())
            .send()
            .await
            .map_err(transient)?;

        match resp.status() {
            StatusCode::OK => {
                let etag = etag_of(&resp)?;
                let doc: LeaseDocument = resp.json().await.map_err(transient)?;
                Ok(Some((doc, etag)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(classify_status(other, "fetching lease document")),
        }
    }
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

fn etag_of(resp: &reqwest::Response) -> Result<String, BackendError> {
    resp.headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| BackendError::Fatal("document response missing an ETag".into()))
}

#[async_trait::async_trait]
impl LeaseBackend for CasDocumentBackend {
    async fn acquire(
        &self,
        name: &str,
        duration: LeaseDuration,
    ) -> Result<Option<AcquiredLease>, BackendError> {
        let now = Utc::now();
        let existing = self.fetch(name).await?;

        if let Some((doc, _etag)) = &existing {
            if doc.expires_at > now {
                return Ok(None);
            }
        }

        let expires_at = match duration {
            LeaseDuration::Finite(d) => {
                now + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
            }
            LeaseDuration::Infinite => DateTime::<Utc>::MAX_UTC,
        };
        let lease_id = Uuid::new_v4();
        let new_doc = LeaseDocument {
            id: name.to_string(),
            lease_id,
            acquired_at: now,
            expires_at,
            renewal_count: 0,
            last_renewed_at: now,
            ttl: self.document_ttl_secs(duration),
        };

        let mut req = self
            .client
            .put(self.document_url(name))
            .header("x-ms-consistency-level", self.options.consistency_level.as_header())
            .json(&new_doc);
        if let Some(throughput) = self.options.provisioned_throughput {
            req = req.header("x-ms-offer-throughput", throughput.to_string());
        }
        req = match &existing {
            Some((_, etag)) => req.header(reqwest::header::IF_MATCH, etag.clone()),
            None => req.header(reqwest::header::IF_NONE_MATCH, "*"),
        };
        let resp = req.send().await.map_err(transient)?;

        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let fencing_token = etag_of(&resp).ok();
                Ok(Some(AcquiredLease {
                    lease_id,
                    expires_at,
                    fencing_token,
                }))
            }
            StatusCode::PRECONDITION_FAILED => Ok(None),
            other => Err(classify_status(other, "writing lease document")),
        }
    }

    async fn renew(
        &self,
        name: &str,
        lease_id: Uuid,
        _fencing_token: Option<&str>,
    ) -> Result<RenewedLease, BackendError> {
        let Some((mut doc, etag)) = self.fetch(name).await? else {
            return Err(BackendError::Lost("lease document no longer exists".into()));
        };
        if doc.lease_id != lease_id {
            return Err(BackendError::Lost(
                "lease document is now held by a different lease id".into(),
            ));
        }

        let now = Utc::now();
        let duration_since_acquire = doc.expires_at - doc.acquired_at;
        doc.expires_at = now + duration_since_acquire;
        doc.renewal_count += 1;
        doc.last_renewed_at = now;
        if let Ok(as_std) = duration_since_acquire.to_std() {
            doc.ttl = self.document_ttl_secs(LeaseDuration::Finite(as_std));
        }

        let resp = self
            .client
            .put(self.document_url(name))
            .header("x-ms-consistency-level", self.options.consistency_level.as_header())
            .header(reqwest::header::IF_MATCH, etag)
            .json(&doc)
            .send()
            .await
            .map_err(transient)?;

        match resp.status() {
            StatusCode::OK => Ok(RenewedLease {
                expires_at: doc.expires_at,
                fencing_token: etag_of(&resp).ok(),
            }),
            StatusCode::PRECONDITION_FAILED => {
                Err(BackendError::Lost("lease document changed concurrently".into()))
            }
            StatusCode::NOT_FOUND => Err(BackendError::Lost("lease document no longer exists".into())),
            other => Err(classify_status(other, "renewing lease document")),
        }
    }

    async fn release(
        &self,
        name: &str,
        lease_id: Uuid,
        _fencing_token: Option<&str>,
    ) -> Result<(), BackendError> {
        let Some((doc, etag)) = self.fetch(name).await? else {
            return Ok(());
        };
        if doc.lease_id != lease_id {
            return Ok(());
        }
        let _ = self
            .client
            .delete(self.document_url(name))
            .header(reqwest::header::IF_MATCH, etag)
            .send()
            .await;
        Ok(())
    }

    async fn break_lease(&self, name: &str) -> Result<(), BackendError> {
        let _ = self.client.delete(self.document_url(name)).send().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> CasDocumentBackend {
        let options = CasDocumentOptions::builder(server.uri(), "coordination", "leases")
            .build()
            .unwrap();
        CasDocumentBackend::new(options)
    }

    #[tokio::test]
    async fn acquire_creates_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201).insert_header("etag", "\"v1\""))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let result = backend
            .acquire(
                "quarterly-close",
                LeaseDuration::Finite(std::time::Duration::from_secs(30)),
            )
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn acquire_returns_none_on_precondition_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let result = backend
            .acquire("x", LeaseDuration::Finite(std::time::Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn renew_fails_lost_when_document_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let err = backend
            .renew("x", Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Lost(_)));
    }
}
