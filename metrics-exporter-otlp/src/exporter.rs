//! OTLP exporter construction.

use std::{
    fmt,
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use hyper::Uri;
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::Temporality;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::config::{DEFAULT_ENDPOINT, DEFAULT_EXPORT_TIMEOUT};
use crate::error::ConfigError;
use crate::retry::{RetryPolicy, RetryingExporter};

/// A validated collector endpoint.
///
/// Endpoints must be absolute `http` or `https` URIs with a host, such as `http://localhost:4317`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    raw: String,
    uri: Uri,
}

impl Endpoint {
    /// Parses an endpoint.
    ///
    /// Surrounding whitespace is ignored. An empty string yields the default endpoint, `http://localhost:4317`.
    ///
    /// # Errors
    ///
    /// If the endpoint is not a valid URI, does not use the `http` or `https` scheme, or has no host, an error will be
    /// returned.
    pub fn parse(endpoint: &str) -> Result<Self, ConfigError> {
        let raw = match endpoint.trim() {
            "" => DEFAULT_ENDPOINT,
            trimmed => trimmed,
        };
        let invalid = |reason: String| ConfigError::InvalidEndpoint { endpoint: endpoint.to_owned(), reason };

        let uri = Uri::try_from(raw).map_err(|e| invalid(e.to_string()))?;
        match uri.scheme_str() {
            Some("http" | "https") => {}
            Some(other) => return Err(invalid(format!("unsupported scheme '{other}', expected 'http' or 'https'"))),
            None => return Err(invalid("missing scheme, expected 'http://' or 'https://'".to_owned())),
        }
        if uri.host().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_owned()));
        }

        Ok(Self { raw: raw.to_owned(), uri })
    }

    /// Returns the endpoint as given, minus surrounding whitespace.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the parsed URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Returns the scheme, either `http` or `https`.
    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or_default()
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or_default()
    }

    /// Returns the port, if one was given explicitly.
    pub fn port(&self) -> Option<u16> {
        self.uri.port_u16()
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self { raw: DEFAULT_ENDPOINT.to_owned(), uri: Uri::from_static(DEFAULT_ENDPOINT) }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Builds OTLP exporters.
///
/// Exporters push over gRPC and never connect eagerly: the channel to the collector is only established on the first
/// export.
#[derive(Clone, Debug)]
pub struct ExporterFactory {
    export_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ExporterFactory {
    /// Creates a factory with the default export timeout and retry policy.
    pub fn new() -> Self {
        Self { export_timeout: DEFAULT_EXPORT_TIMEOUT, retry_policy: RetryPolicy::default() }
    }

    /// Set the time budget of a single export attempt.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// Set the retry policy for failed export attempts.
    ///
    /// Defaults to [`RetryPolicy::default`].
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Builds an exporter targeting `endpoint`.
    ///
    /// The exporter owns a single-worker Tokio runtime that drives its transport, so this works whether or not the
    /// caller is itself running within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the endpoint is invalid, the export timeout is zero, or the transport cannot be set up, an error will be
    /// returned.
    pub fn build(&self, endpoint: &str) -> Result<OtlpExporter, ConfigError> {
        let endpoint = Endpoint::parse(endpoint)?;
        if self.export_timeout.is_zero() {
            return Err(ConfigError::NonPositiveExportTimeout);
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("metrics-exporter-otlp-transport")
            .enable_all()
            .build()
            .map_err(ConfigError::Runtime)?;

        // The gRPC channel binds to the runtime that is current when it is created.
        let built = {
            let _guard = runtime.enter();
            MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint.as_str())
                .with_timeout(self.export_timeout)
                .build()
        };
        let exporter = match built {
            Ok(exporter) => exporter,
            Err(e) => {
                runtime.shutdown_background();
                return Err(ConfigError::Exporter(e.to_string()));
            }
        };

        debug!(%endpoint, export_timeout = ?self.export_timeout, "Built OTLP exporter.");

        let inner = RetryingExporter::new(exporter, self.retry_policy.clone(), runtime.handle().clone());
        Ok(OtlpExporter { endpoint, inner, runtime: Mutex::new(Some(runtime)) })
    }
}

impl Default for ExporterFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// An OTLP/gRPC exporter bound to one collector endpoint.
///
/// Failed exports are retried according to the factory's [`RetryPolicy`], and batches that still fail are dropped
/// and logged.
pub struct OtlpExporter {
    endpoint: Endpoint,
    inner: RetryingExporter<MetricExporter>,
    runtime: Mutex<Option<Runtime>>,
}

impl OtlpExporter {
    /// Returns the endpoint this exporter pushes to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the retry policy used for failed exports.
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.inner.policy()
    }

    fn release_runtime(&self) {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(runtime) = runtime {
            // Does not block, so may run within an asynchronous context.
            runtime.shutdown_background();
        }
    }
}

impl PushMetricExporter for OtlpExporter {
    fn export(&self, metrics: &ResourceMetrics) -> impl Future<Output = OTelSdkResult> + Send {
        self.inner.export(metrics)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.inner.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        let result = {
            let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            let _guard = runtime.as_ref().map(Runtime::enter);
            self.inner.shutdown_with_timeout(timeout)
        };
        self.release_runtime();

        debug!(endpoint = %self.endpoint, "OTLP exporter shut down.");
        result
    }

    fn temporality(&self) -> Temporality {
        self.inner.temporality()
    }
}

impl Drop for OtlpExporter {
    fn drop(&mut self) {
        self.release_runtime();
    }
}

impl fmt::Debug for OtlpExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtlpExporter")
            .field("endpoint", &self.endpoint)
            .field("retry_policy", self.inner.policy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::{Endpoint, ExporterFactory};
    use crate::error::ConfigError;

    #[test]
    fn test_empty_endpoint_uses_default() {
        for input in ["", "   ", "\t\n"] {
            let endpoint = Endpoint::parse(input).unwrap();
            assert_eq!(endpoint, Endpoint::default());
            assert_eq!(endpoint.as_str(), "http://localhost:4317");
            assert_eq!(endpoint.scheme(), "http");
            assert_eq!(endpoint.host(), "localhost");
            assert_eq!(endpoint.port(), Some(4317));
        }
    }

    #[test]
    fn test_endpoint_is_trimmed() {
        let endpoint = Endpoint::parse("  https://collector.internal:4317 ").unwrap();
        assert_eq!(endpoint.as_str(), "https://collector.internal:4317");
        assert_eq!(endpoint.to_string(), "https://collector.internal:4317");
    }

    #[test]
    fn test_invalid_endpoints() {
        let cases = [
            "localhost:4317",
            "ftp://localhost:4317",
            "http://bad host:4317",
            "http://",
            "/v1/metrics",
            "not a uri",
        ];

        for input in cases {
            match Endpoint::parse(input) {
                Err(ConfigError::InvalidEndpoint { endpoint, reason }) => {
                    assert_eq!(endpoint, input);
                    assert!(!reason.is_empty());
                }
                other => panic!("expected invalid endpoint for '{input}', got {other:?}"),
            }
        }
    }

    #[test]
    fn test_build_outside_of_runtime() {
        let exporter = ExporterFactory::new().build("http://127.0.0.1:4317").unwrap();
        assert_eq!(exporter.endpoint().as_str(), "http://127.0.0.1:4317");
        assert_eq!(exporter.retry_policy().max_attempts(), 5);
    }

    #[test]
    fn test_build_rejects_zero_export_timeout() {
        let result = ExporterFactory::new().with_export_timeout(Duration::ZERO).build("");
        assert!(matches!(result, Err(ConfigError::NonPositiveExportTimeout)));
    }

    fn arb_valid_endpoint() -> impl Strategy<Value = String> {
        (
            "[a-z][a-z0-9-]{0,15}(\\.[a-z][a-z0-9-]{0,15}){0,2}",
            proptest::option::of(1u16..),
        )
            .prop_map(|(host, port)| match port {
                Some(port) => format!("http://{host}:{port}"),
                None => format!("http://{host}"),
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_valid_endpoints_build(input in arb_valid_endpoint()) {
            let exporter = ExporterFactory::new().build(&input).unwrap();
            prop_assert_eq!(exporter.endpoint().as_str(), input.as_str());
        }

        #[test]
        fn test_schemeless_endpoints_rejected(host in "[a-z][a-z0-9]{0,15}", port in 1u16..) {
            let input = format!("{host}:{port}");
            let result = ExporterFactory::new().build(&input);
            prop_assert!(matches!(result, Err(ConfigError::InvalidEndpoint { .. })), "accepted '{}'", input);
        }

        #[test]
        fn test_endpoints_with_whitespace_rejected(left in "[a-z]{1,8}", right in "[a-z]{1,8}") {
            let input = format!("http://{left} {right}:4317");
            let rejected = matches!(Endpoint::parse(&input), Err(ConfigError::InvalidEndpoint { .. }));
            prop_assert!(rejected);
        }
    }
}
