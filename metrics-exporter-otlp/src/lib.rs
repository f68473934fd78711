#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![deny(missing_docs)]

mod callback;
mod config;
mod error;
mod exporter;
mod instruments;
mod provider;
mod registry;
mod retry;

use std::time::Duration;

use tracing::debug;

pub use self::callback::Observations;
pub use self::config::{
    MetricsConfig, DEFAULT_CALLBACK_TIMEOUT, DEFAULT_ENDPOINT, DEFAULT_EXPORT_TIMEOUT,
    DEFAULT_INTERVAL, DEFAULT_SCOPE_NAME,
};
pub use self::error::{CallbackFailure, ConfigError, DuplicateInstrumentError, Error, ExportError};
pub use self::exporter::{Endpoint, ExporterFactory, OtlpExporter};
pub use self::instruments::{
    Counter, GaugeValue, Histogram, InstrumentDescriptor, InstrumentKind, ObservableGauge,
    UpDownCounter,
};
pub use self::provider::{LifecycleState, MetricsProvider, ProviderBuilder};
pub use self::registry::Registry;
pub use self::retry::{RetryPolicy, RetryingExporter};

pub use metrics::Unit;
pub use opentelemetry::KeyValue;

/// Builds and starts a pipeline pushing to `endpoint` every `interval`, and binds a registry to it.
///
/// An empty `endpoint` targets `http://localhost:4317`. Every other setting is left at its default, see
/// [`MetricsConfig`].
///
/// The returned provider must be shut down explicitly once the application is done recording; dropping the registry
/// has no effect on the pipeline.
///
/// # Errors
///
/// If the endpoint is invalid, or `interval` is zero, an error will be returned.
pub fn initialize(endpoint: &str, interval: Duration) -> Result<(Registry, MetricsProvider), Error> {
    initialize_with_config(MetricsConfig::new(endpoint).with_interval(interval))
}

/// Builds and starts a pipeline from `config`, and binds a registry to it.
///
/// # Errors
///
/// If the configuration is invalid, or the exporter transport cannot be set up, an error will be returned.
pub fn initialize_with_config(config: MetricsConfig) -> Result<(Registry, MetricsProvider), Error> {
    config.validate()?;

    let exporter = ExporterFactory::new()
        .with_export_timeout(config.export_timeout())
        .with_retry_policy(config.retry_policy().clone())
        .build(config.endpoint())?;
    let endpoint = exporter.endpoint().clone();

    let mut builder = MetricsProvider::builder(exporter).with_interval(config.interval());
    builder = match config.callback_timeout() {
        Some(timeout) => builder.with_callback_timeout(timeout),
        None => builder.without_callback_timeout(),
    };
    if let Some(service_name) = config.service_name() {
        builder = builder.with_service_name(service_name);
    }
    let provider = builder.start()?;

    let registry = Registry::scope(&provider, config.scope_name());
    debug!(%endpoint, scope = config.scope_name(), interval = ?config.interval(), "Metrics initialized.");

    Ok((registry, provider))
}
