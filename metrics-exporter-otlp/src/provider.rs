use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::InstrumentationScope;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::Resource;
use scc::HashMap;
use tracing::{debug, warn};

use crate::callback::SamplerPool;
use crate::config::{DEFAULT_CALLBACK_TIMEOUT, DEFAULT_INTERVAL};
use crate::error::{ConfigError, Error};
use crate::registry::Scope;

/// Lifecycle state of a metrics pipeline.
///
/// A pipeline only ever moves forward through these states: `Uninitialized → Running → ShuttingDown → ShutDown`.
///
/// A [`MetricsProvider`] is only handed out once its pipeline is fully assembled, so it is never observed in the
/// `Uninitialized` state.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// The pipeline is being assembled and has not started collecting yet.
    Uninitialized = 0,

    /// The pipeline is collecting and exporting on its schedule.
    Running = 1,

    /// A shutdown is in progress: the final collection pass is being flushed.
    ShuttingDown = 2,

    /// The pipeline has been flushed and its exporter released.
    ShutDown = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Running,
            2 => LifecycleState::ShuttingDown,
            _ => LifecycleState::ShutDown,
        }
    }
}

/// Builder for a [`MetricsProvider`].
pub struct ProviderBuilder<E> {
    exporter: E,
    interval: Duration,
    callback_timeout: Option<Duration>,
    service_name: Option<String>,
}

impl<E> ProviderBuilder<E>
where
    E: PushMetricExporter,
{
    /// Set the collection interval.
    ///
    /// Every interval, all instruments are sampled once and handed to the exporter as a single batch.
    ///
    /// Defaults to 60 seconds.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the time budget for a single gauge callback invocation.
    ///
    /// Gauge callbacks run on a sampler thread shared by the whole provider, and the collection pass waits at most this
    /// long for each callback before moving on without a data point for it. A callback that overruns is left to finish
    /// on its own while a fresh sampler thread serves the remaining gauges.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    /// Run gauge callbacks directly on the collection thread, without a time budget.
    ///
    /// Panics are still caught, but a callback that hangs will stall the collection pass.
    #[must_use]
    pub fn without_callback_timeout(mut self) -> Self {
        self.callback_timeout = None;
        self
    }

    /// Set the `service.name` resource attribute attached to every exported batch.
    ///
    /// Defaults to the OpenTelemetry SDK default resource.
    #[must_use]
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Starts the pipeline.
    ///
    /// A periodic reader is created around the exporter and begins collecting on its schedule immediately.
    ///
    /// # Errors
    ///
    /// If the interval or the callback timeout is zero, an error will be returned.
    pub fn start(self) -> Result<MetricsProvider, ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval);
        }
        if self.callback_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::NonPositiveCallbackTimeout);
        }

        let reader = PeriodicReader::builder(self.exporter).with_interval(self.interval).build();
        let mut builder = SdkMeterProvider::builder().with_reader(reader);
        if let Some(service_name) = self.service_name {
            builder =
                builder.with_resource(Resource::builder().with_service_name(service_name).build());
        }

        let shared = ProviderShared {
            sdk: builder.build(),
            state: AtomicU8::new(LifecycleState::Running as u8),
            scopes: HashMap::new(),
            interval: self.interval,
            sampler: self.callback_timeout.map(|timeout| Arc::new(SamplerPool::new(timeout))),
        };

        debug!(interval = ?self.interval, callback_timeout = ?self.callback_timeout, "Metrics pipeline running.");

        Ok(MetricsProvider { shared: Arc::new(shared) })
    }
}

pub(crate) struct ProviderShared {
    sdk: SdkMeterProvider,
    state: AtomicU8,
    scopes: HashMap<String, Arc<Scope>>,
    interval: Duration,
    sampler: Option<Arc<SamplerPool>>,
}

impl ProviderShared {
    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn stop_sampler(&self) {
        if let Some(sampler) = &self.sampler {
            sampler.stop();
        }
    }
}

impl Drop for ProviderShared {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Running {
            debug!("Metrics provider dropped without an explicit shutdown, shutting pipeline down.");
            if let Err(e) = self.sdk.shutdown() {
                debug!(error = %e, "Metrics pipeline did not shut down cleanly on drop.");
            }
        }

        // Registries may outlive the provider and keep their scopes alive, but never the sampler thread.
        self.stop_sampler();
    }
}

/// The running export pipeline.
///
/// Owns the periodic reader and its exporter. Clones are shallow and refer to the same pipeline.
///
/// Shutting the pipeline down is explicit: call [`shutdown`][MetricsProvider::shutdown] once the application no
/// longer records measurements. Registries bound to the provider never shut it down on their own.
#[derive(Clone)]
pub struct MetricsProvider {
    shared: Arc<ProviderShared>,
}

impl MetricsProvider {
    /// Creates a [`ProviderBuilder`] around `exporter`.
    pub fn builder<E>(exporter: E) -> ProviderBuilder<E>
    where
        E: PushMetricExporter,
    {
        ProviderBuilder {
            exporter,
            interval: DEFAULT_INTERVAL,
            callback_timeout: Some(DEFAULT_CALLBACK_TIMEOUT),
            service_name: None,
        }
    }

    /// Starts a pipeline collecting every `interval` and pushing each batch through `exporter`.
    ///
    /// # Errors
    ///
    /// If `interval` is zero, an error will be returned.
    pub fn start<E>(exporter: E, interval: Duration) -> Result<Self, ConfigError>
    where
        E: PushMetricExporter,
    {
        Self::builder(exporter).with_interval(interval).start()
    }

    pub(crate) fn from_shared(shared: Arc<ProviderShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProviderShared> {
        Arc::downgrade(&self.shared)
    }

    /// Returns the scope named `name`, creating it on first use.
    pub(crate) fn scope(&self, name: String) -> Arc<Scope> {
        let shared = &self.shared;
        let entry = shared.scopes.entry(name.clone()).or_insert_with(|| {
            let meter = shared.sdk.meter_with_scope(InstrumentationScope::builder(name.clone()).build());
            Arc::new(Scope::new(name, meter, shared.sampler.clone()))
        });
        Arc::clone(entry.get())
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Returns the collection interval.
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Runs a collection pass immediately, outside of the regular schedule.
    ///
    /// Does nothing once the provider is shutting down or shut down. Export failures are retried and logged by the
    /// exporter and are not reported here.
    ///
    /// # Errors
    ///
    /// If the underlying pipeline fails to run the pass, an error will be returned.
    pub fn force_flush(&self) -> Result<(), Error> {
        if self.state() != LifecycleState::Running {
            debug!(state = ?self.state(), "Skipping flush, metrics pipeline is not running.");
            return Ok(());
        }

        match self.shared.sdk.force_flush() {
            Ok(()) | Err(OTelSdkError::AlreadyShutdown) => Ok(()),
            Err(OTelSdkError::Timeout(timeout)) => {
                warn!(?timeout, "Timed out waiting for collection pass to complete.");
                Ok(())
            }
            Err(e) => Err(Error::Pipeline(e)),
        }
    }

    /// Shuts the pipeline down.
    ///
    /// Runs one final collection pass, waits for in-flight exports to complete or time out, then releases the exporter
    /// and stops the gauge sampler thread. Blocks until all of that is done.
    ///
    /// Calling this again, or concurrently, while the provider is shutting down or already shut down does nothing and
    /// succeeds.
    ///
    /// # Errors
    ///
    /// If the underlying pipeline fails to shut down for a reason other than timing out, an error will be returned.
    /// The provider is considered shut down either way.
    pub fn shutdown(&self) -> Result<(), Error> {
        let transition = self.shared.state.compare_exchange(
            LifecycleState::Running as u8,
            LifecycleState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(current) = transition {
            debug!(state = ?LifecycleState::from_u8(current), "Metrics pipeline already shutting down.");
            return Ok(());
        }

        debug!("Shutting down metrics pipeline.");
        let result = self.shared.sdk.shutdown();
        self.shared.stop_sampler();
        self.shared.state.store(LifecycleState::ShutDown as u8, Ordering::Release);

        match result {
            Ok(()) | Err(OTelSdkError::AlreadyShutdown) => {
                debug!("Metrics pipeline shut down.");
                Ok(())
            }
            Err(OTelSdkError::Timeout(timeout)) => {
                warn!(?timeout, "Timed out waiting for in-flight exports during shutdown, remaining data was dropped.");
                Ok(())
            }
            Err(e) => Err(Error::Pipeline(e)),
        }
    }
}

impl fmt::Debug for MetricsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsProvider")
            .field("state", &self.state())
            .field("interval", &self.shared.interval)
            .finish()
    }
}
