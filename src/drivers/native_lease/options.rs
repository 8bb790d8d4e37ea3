use std::sync::Arc;
use std::time::Duration;

use crate::credential::CredentialProvider;
use crate::Error;

/// Configuration for [`super::NativeLeaseBackend`] (spec §6).
#[derive(Clone)]
pub struct NativeLeaseOptions {
    pub endpoint: String,
    pub connection_string: Option<String>,
    pub credential: Option<Arc<dyn CredentialProvider>>,
    pub container_name: String,
    pub blob_prefix: String,
    pub create_container_if_not_exists: bool,
    pub min_lease_duration: Duration,
    pub max_lease_duration: Duration,
}

impl NativeLeaseOptions {
    pub fn builder(
        endpoint: impl Into<String>,
        container_name: impl Into<String>,
    ) -> NativeLeaseOptionsBuilder {
        NativeLeaseOptionsBuilder::new(endpoint, container_name)
    }
}

#[derive(Clone)]
pub struct NativeLeaseOptionsBuilder {
    endpoint: String,
    connection_string: Option<String>,
    credential: Option<Arc<dyn CredentialProvider>>,
    container_name: String,
    blob_prefix: String,
    create_container_if_not_exists: bool,
    min_lease_duration: Duration,
    max_lease_duration: Duration,
}

impl NativeLeaseOptionsBuilder {
    pub fn new(endpoint: impl Into<String>, container_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connection_string: None,
            credential: None,
            container_name: container_name.into(),
            blob_prefix: "lease-".to_string(),
            create_container_if_not_exists: true,
            min_lease_duration: Duration::from_secs(15),
            max_lease_duration: Duration::from_secs(60),
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

    pub fn blob_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.blob_prefix = prefix.into();
        self
    }

    pub fn create_container_if_not_exists(mut self, create: bool) -> Self {
        self.create_container_if_not_exists = create;
        self
    }

    pub fn min_lease_duration(mut self, d: Duration) -> Self {
        self.min_lease_duration = d;
        self
    }

    pub fn max_lease_duration(mut self, d: Duration) -> Self {
        self.max_lease_duration = d;
        self
    }

    pub fn build(self) -> Result<NativeLeaseOptions, Error> {
        if self.endpoint.is_empty() {
            return Err(Error::Configuration("endpoint must not be empty".into()));
        }
        if self.container_name.is_empty() {
            return Err(Error::Configuration(
                "container_name must not be empty".into(),
            ));
        }
        if self.min_lease_duration > self.max_lease_duration {
            return Err(Error::Configuration(format!(
                "min_lease_duration ({:?}) must not exceed max_lease_duration ({:?})",
                self.min_lease_duration, self.max_lease_duration
            )));
        }
        Ok(NativeLeaseOptions {
            endpoint: self.endpoint,
            connection_string: self.connection_string,
            credential: self.credential,
            container_name: self.container_name,
            blob_prefix: self.blob_prefix,
            create_container_if_not_exists: self.create_container_if_not_exists,
            min_lease_duration: self.min_lease_duration,
            max_lease_duration: self.max_lease_duration,
        })
    }
}
