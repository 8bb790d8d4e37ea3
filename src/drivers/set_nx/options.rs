use std::time::Duration;

use crate::Error;

/// Configuration for [`super::SetNxBackend`] (spec §6).
#[derive(Clone)]
pub struct SetNxOptions {
    pub connection_string: String,
    pub key_prefix: String,
    pub database_index: Option<i64>,
    pub connect_timeout: Duration,
    /// Timeout applied to each individual command/script round-trip, as
    /// distinct from `connect_timeout`'s initial-handshake budget.
    pub sync_timeout: Duration,
    /// When `true`, a connection failure is classified `Fatal` (abort
    /// immediately) rather than `TransientUnavailable` (retryable).
    pub abort_on_connect_fail: bool,
    /// Clock-drift compensation factor applied to the requested duration
    /// before checking minimum validity, matching the multi-instance
    /// set-NX algorithm's standard safety margin.
    pub clock_drift_factor: f64,
    pub minimum_validity: Duration,
}

impl SetNxOptions {
    pub fn builder(connection_string: impl Into<String>) -> SetNxOptionsBuilder {
        SetNxOptionsBuilder::new(connection_string)
    }

    /// Build from discrete host/port/ssl coordinates instead of a URL, per
    /// spec §6's `(host, port, ssl)` alternative connection form.
    pub fn builder_from_host_port(host: impl AsRef<str>, port: u16, ssl: bool) -> SetNxOptionsBuilder {
        let scheme = if ssl { "rediss" } else { "redis" };
        SetNxOptionsBuilder::new(format!("{scheme}://{}:{port}", host.as_ref()))
    }
}

#[derive(Clone)]
pub struct SetNxOptionsBuilder {
    connection_string: String,
    key_prefix: String,
    database_index: Option<i64>,
    connect_timeout: Duration,
    sync_timeout: Duration,
    abort_on_connect_fail: bool,
    clock_drift_factor: f64,
    minimum_validity: Duration,
}

impl SetNxOptionsBuilder {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            key_prefix: "lease:".to_string(),
            database_index: None,
            connect_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            abort_on_connect_fail: false,
            clock_drift_factor: 0.01,
            minimum_validity: Duration::from_millis(100),
        }
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn database_index(mut self, index: i64) -> Self {
        self.database_index = Some(index);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn abort_on_connect_fail(mut self, abort: bool) -> Self {
        self.abort_on_connect_fail = abort;
        self
    }

    pub fn clock_drift_factor(mut self, factor: f64) -> Self {
        self.clock_drift_factor = factor;
        self
    }

    pub fn minimum_validity(mut self, validity: Duration) -> Self {
        self.minimum_validity = validity;
        self
    }

    pub fn build(self) -> Result<SetNxOptions, Error> {
        if self.connection_string.is_empty() {
            return Err(Error::Configuration(
                "connection_string must not be empty".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.clock_drift_factor) {
            return Err(Error::Configuration(
                "clock_drift_factor must be in [0.0, 1.0)".into(),
            ));
        }
        Ok(SetNxOptions {
            connection_string: self.connection_string,
            key_prefix: self.key_prefix,
            database_index: self.database_index,
            connect_timeout: self.connect_timeout,
            sync_timeout: self.sync_timeout,
            abort_on_connect_fail: self.abort_on_connect_fail,
            clock_drift_factor: self.clock_drift_factor,
            minimum_validity: self.minimum_validity,
        })
    }
}
