//! The opaque credential interface every concrete driver depends on (spec
//! §1, §6). The core never sees a concrete secret type or refresh policy —
//! it only asks the provider for a secret when it needs one.

use async_trait::async_trait;

use crate::backend::BackendError;

/// Yields a secret (connection string, key, or bearer token) on demand.
/// Implementations are responsible for their own caching/refresh; the core
/// copes with whatever transport-level retry the provider performs
/// internally by treating a failed `get_secret` as `BackendError::Fatal`.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_secret(&self) -> Result<String, BackendError>;
}

/// A credential that never changes. Useful for tests and for deployments
/// that rotate secrets out-of-band (e.g. a mounted secret file re-read on
/// process restart).
pub struct StaticCredential(String);

impl StaticCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn get_secret(&self) -> Result<String, BackendError> {
        Ok(self.0.clone())
    }
}
