use std::sync::Arc;
use std::time::Duration;

use crate::credential::CredentialProvider;
use crate::Error;

/// Read/write consistency requested on every document request, mirroring
/// the store's session-vs-strong tradeoff (spec §6). Session-equivalent is
/// the default: a single writer never observes its own write go backwards,
/// without paying for a cluster-wide quorum read on every renewal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    ConsistentPrefix,
    Eventual,
}

impl ConsistencyLevel {
    pub(crate) fn as_header(&self) -> &'static str {
        match self {
            ConsistencyLevel::Strong => "Strong",
            ConsistencyLevel::BoundedStaleness => "BoundedStaleness",
            ConsistencyLevel::Session => "Session",
            ConsistencyLevel::ConsistentPrefix => "ConsistentPrefix",
            ConsistencyLevel::Eventual => "Eventual",
        }
    }
}

/// Configuration for [`super::CasDocumentBackend`] (spec §6).
#[derive(Clone)]
pub struct CasDocumentOptions {
    pub endpoint: String,
    pub connection_string: Option<String>,
    pub credential: Option<Arc<dyn CredentialProvider>>,
    pub database_name: String,
    pub container_name: String,
    pub partition_key_path: String,
    pub provisioned_throughput: Option<u32>,
    pub default_time_to_live: Duration,
    pub consistency_level: ConsistencyLevel,
}

impl CasDocumentOptions {
    pub fn builder(
        endpoint: impl Into<String>,
        database_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> CasDocumentOptionsBuilder {
        CasDocumentOptionsBuilder::new(endpoint, database_name, container_name)
    }
}

#[derive(Clone)]
pub struct CasDocumentOptionsBuilder {
    endpoint: String,
    connection_string: Option<String>,
    credential: Option<Arc<dyn CredentialProvider>>,
    database_name: String,
    container_name: String,
    partition_key_path: String,
    provisioned_throughput: Option<u32>,
    default_time_to_live: Duration,
    consistency_level: ConsistencyLevel,
}

impl CasDocumentOptionsBuilder {
    pub fn new(
        endpoint: impl Into<String>,
        database_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            connection_string: None,
            credential: None,
            database_name: database_name.into(),
            container_name: container_name.into(),
            partition_key_path: "/id".to_string(),
            provisioned_throughput: None,
            default_time_to_live: Duration::from_secs(300),
            consistency_level: ConsistencyLevel::Session,
        }
    }

    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn credential(mut self, credential: Arc<dyn CredentialProvider>) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn partition_key_path(mut self, path: impl Into<String>) -> Self {
        self.partition_key_path = path.into();
        self
    }

    pub fn provisioned_throughput(mut self, ru_per_sec: u32) -> Self {
        self.provisioned_throughput = Some(ru_per_sec);
        self
    }

    pub fn default_time_to_live(mut self, ttl: Duration) -> Self {
        self.default_time_to_live = ttl;
        self
    }

    pub fn consistency_level(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = level;
        self
    }

    pub fn build(self) -> Result<CasDocumentOptions, Error> {
        if self.endpoint.is_empty() {
            return Err(Error::Configuration("endpoint must not be empty".into()));
        }
        if self.database_name.is_empty() {
            return Err(Error::Configuration(
                "database_name must not be empty".into(),
            ));
        }
        if self.container_name.is_empty() {
            return Err(Error::Configuration(
                "container_name must not be empty".into(),
            ));
        }
        if !self.partition_key_path.starts_with('/') {
            return Err(Error::Configuration(
                "partition_key_path must start with '/'".into(),
            ));
        }
        Ok(CasDocumentOptions {
            endpoint: self.endpoint,
            connection_string: self.connection_string,
            credential: self.credential,
            database_name: self.database_name,
            container_name: self.container_name,
            partition_key_path: self.partition_key_path,
            provisioned_throughput: self.provisioned_throughput,
            default_time_to_live: self.default_time_to_live,
            consistency_level: self.consistency_level,
        })
    }
}
