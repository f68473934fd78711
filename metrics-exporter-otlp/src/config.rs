use std::time::Duration;

use crate::error::ConfigError;
use crate::exporter::Endpoint;
use crate::retry::RetryPolicy;

/// Collector endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:4317";

/// Collection interval used when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Time budget of a single export attempt used when none is configured.
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time budget of a single gauge callback invocation used when none is configured.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Scope name used by [`initialize`][crate::initialize] and when none is configured.
pub const DEFAULT_SCOPE_NAME: &str = env!("CARGO_PKG_NAME");

/// Configuration of a complete metrics pipeline.
///
/// Consumed by [`initialize_with_config`][crate::initialize_with_config]. Where the values come from (files,
/// environment variables, command-line flags) is up to the application.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    endpoint: String,
    interval: Duration,
    export_timeout: Duration,
    callback_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    scope_name: String,
    service_name: Option<String>,
}

impl MetricsConfig {
    /// Creates a configuration pushing to `endpoint`, with every other setting at its default.
    ///
    /// The endpoint is only validated by [`validate`][MetricsConfig::validate], or when the pipeline is built.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            interval: DEFAULT_INTERVAL,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            callback_timeout: Some(DEFAULT_CALLBACK_TIMEOUT),
            retry_policy: RetryPolicy::default(),
            scope_name: DEFAULT_SCOPE_NAME.to_owned(),
            service_name: None,
        }
    }

    /// Set the collection interval.
    ///
    /// Defaults to 60 seconds.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the time budget of a single export attempt.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// Set the time budget of a single gauge callback invocation.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    /// Run gauge callbacks on the collection thread without a time budget.
    #[must_use]
    pub fn without_callback_timeout(mut self) -> Self {
        self.callback_timeout = None;
        self
    }

    /// Set the retry policy for failed exports.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the name of the scope the returned registry is bound to.
    ///
    /// Defaults to `metrics-exporter-otlp`.
    #[must_use]
    pub fn with_scope_name(mut self, scope_name: impl Into<String>) -> Self {
        self.scope_name = scope_name.into();
        self
    }

    /// Set the `service.name` resource attribute.
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Returns the configured endpoint, as given.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the collection interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the time budget of a single export attempt.
    pub fn export_timeout(&self) -> Duration {
        self.export_timeout
    }

    /// Returns the time budget of a single gauge callback invocation, if any.
    pub fn callback_timeout(&self) -> Option<Duration> {
        self.callback_timeout
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns the scope name.
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// Returns the `service.name` resource attribute, if set.
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Checks the configuration without building anything.
    ///
    /// # Errors
    ///
    /// If the endpoint is invalid, or the interval, export timeout or callback timeout is zero, an error will be
    /// returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Endpoint::parse(&self.endpoint)?;

        if self.interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval);
        }
        if self.export_timeout.is_zero() {
            return Err(ConfigError::NonPositiveExportTimeout);
        }
        if self.callback_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::NonPositiveCallbackTimeout);
        }

        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}
