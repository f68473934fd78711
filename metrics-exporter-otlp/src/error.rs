use std::{io, time::Duration};

use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;

use crate::instruments::InstrumentDescriptor;

/// Errors that could occur while configuring the export pipeline.
///
/// These are only ever returned synchronously, while building an exporter or starting a provider, and are never
/// retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The collector endpoint could not be parsed.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The endpoint as given by the caller.
        endpoint: String,

        /// Details about the parsing failure.
        reason: String,
    },

    /// The collection interval was zero.
    #[error("collection interval must be greater than zero")]
    NonPositiveInterval,

    /// The export timeout was zero.
    #[error("export timeout must be greater than zero")]
    NonPositiveExportTimeout,

    /// The gauge callback timeout was zero.
    #[error("gauge callback timeout must be greater than zero")]
    NonPositiveCallbackTimeout,

    /// Failed to create the runtime driving the exporter transport.
    #[error("failed to create transport runtime for exporter: {0}")]
    Runtime(#[source] io::Error),

    /// Failed to build the OTLP exporter itself.
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),
}

/// An instrument name was reused with different metadata.
///
/// Instrument names are unique within a scope. Creating an instrument whose name is already taken only succeeds if the
/// description, unit and kind all match the existing instrument, in which case the existing instrument is returned.
#[derive(Debug, Error)]
#[error("instrument '{name}' is already registered as {existing}, refusing to redefine it as {requested}")]
pub struct DuplicateInstrumentError {
    name: String,
    existing: InstrumentDescriptor,
    requested: InstrumentDescriptor,
}

impl DuplicateInstrumentError {
    pub(crate) fn new(existing: InstrumentDescriptor, requested: InstrumentDescriptor) -> Self {
        Self { name: existing.name().to_owned(), existing, requested }
    }

    /// Returns the name both instruments share.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the descriptor of the instrument already registered under this name.
    pub fn existing(&self) -> &InstrumentDescriptor {
        &self.existing
    }

    /// Returns the descriptor that was rejected.
    pub fn requested(&self) -> &InstrumentDescriptor {
        &self.requested
    }
}

/// A failed attempt at delivering a batch to the collector.
///
/// Export errors never reach callers: they are retried by [`RetryingExporter`][crate::RetryingExporter] and logged.
#[derive(Debug, Error)]
pub enum ExportError {
    /// A single attempt failed and will be retried.
    #[error("export attempt {attempt} of {max_attempts} failed: {source}")]
    Attempt {
        /// The attempt that failed, starting at 1.
        attempt: u32,

        /// The total number of attempts allowed for the batch.
        max_attempts: u32,

        /// The underlying exporter error.
        source: OTelSdkError,
    },

    /// Every attempt failed and the batch was dropped.
    #[error("giving up on batch after {attempts} failed export attempts: {source}")]
    Exhausted {
        /// The number of attempts made.
        attempts: u32,

        /// The error from the last attempt.
        source: OTelSdkError,
    },
}

/// A gauge callback that did not produce any data for a collection pass.
///
/// Callback failures are isolated to the gauge and the pass they happened in, and are only ever logged.
#[derive(Debug, Error)]
pub enum CallbackFailure {
    /// The callback panicked.
    #[error("callback panicked: {message}")]
    Panicked {
        /// The panic message, if it carried one.
        message: String,
    },

    /// The callback did not finish within its time budget.
    #[error("callback did not complete within {0:?}")]
    TimedOut(Duration),

    /// The callback was still running from an earlier collection pass.
    #[error("callback is still running from an earlier collection pass")]
    Busy,

    /// The provider's sampler has been stopped.
    #[error("gauge sampler thread is no longer running")]
    Disconnected,
}

/// Errors returned by the composition root and the provider.
#[derive(Debug, Error)]
pub enum Error {
    /// The pipeline could not be configured.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An instrument name was reused with different metadata.
    #[error(transparent)]
    DuplicateInstrument(#[from] DuplicateInstrumentError),

    /// The underlying pipeline reported a failure while flushing or shutting down.
    #[error("metrics pipeline failure: {0}")]
    Pipeline(#[from] OTelSdkError),
}
