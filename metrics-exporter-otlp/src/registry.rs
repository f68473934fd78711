use std::{
    fmt,
    sync::{Arc, Weak},
};

use metrics::Unit;
use opentelemetry::metrics::Meter;
use scc::hash_map::Entry;
use scc::HashMap;
use tracing::debug;

use crate::callback::{GaugeCallback, Observations, SamplerPool};
use crate::error::DuplicateInstrumentError;
use crate::instruments::{
    Counter, GaugeValue, Histogram, InstrumentDescriptor, InstrumentKind, ObservableGauge,
    UpDownCounter, DIMENSIONLESS_UNIT,
};
use crate::provider::{LifecycleState, MetricsProvider, ProviderShared};

/// An instrument as stored in a scope's instrument table.
pub(crate) enum InstrumentHandle {
    Counter(Counter),
    UpDownCounter(UpDownCounter),
    Histogram(Histogram),
    Gauge(ObservableGauge<i64>),
    F64Gauge(ObservableGauge<f64>),
}

impl InstrumentHandle {
    fn descriptor(&self) -> &InstrumentDescriptor {
        match self {
            InstrumentHandle::Counter(c) => c.descriptor(),
            InstrumentHandle::UpDownCounter(c) => c.descriptor(),
            InstrumentHandle::Histogram(h) => h.descriptor(),
            InstrumentHandle::Gauge(g) => g.descriptor(),
            InstrumentHandle::F64Gauge(g) => g.descriptor(),
        }
    }
}

/// Conversion between typed instruments and table entries.
pub(crate) trait Instrument: Clone {
    fn into_handle(self) -> InstrumentHandle;

    fn from_handle(handle: &InstrumentHandle) -> Option<Self>;
}

impl Instrument for Counter {
    fn into_handle(self) -> InstrumentHandle {
        InstrumentHandle::Counter(self)
    }

    fn from_handle(handle: &InstrumentHandle) -> Option<Self> {
        match handle {
            InstrumentHandle::Counter(c) => Some(c.clone()),
            _ => None,
        }
    }
}

impl Instrument for UpDownCounter {
    fn into_handle(self) -> InstrumentHandle {
        InstrumentHandle::UpDownCounter(self)
    }

    fn from_handle(handle: &InstrumentHandle) -> Option<Self> {
        match handle {
            InstrumentHandle::UpDownCounter(c) => Some(c.clone()),
            _ => None,
        }
    }
}

impl Instrument for Histogram {
    fn into_handle(self) -> InstrumentHandle {
        InstrumentHandle::Histogram(self)
    }

    fn from_handle(handle: &InstrumentHandle) -> Option<Self> {
        match handle {
            InstrumentHandle::Histogram(h) => Some(h.clone()),
            _ => None,
        }
    }
}

impl Instrument for ObservableGauge<i64> {
    fn into_handle(self) -> InstrumentHandle {
        InstrumentHandle::Gauge(self)
    }

    fn from_handle(handle: &InstrumentHandle) -> Option<Self> {
        match handle {
            InstrumentHandle::Gauge(g) => Some(g.clone()),
            _ => None,
        }
    }
}

impl Instrument for ObservableGauge<f64> {
    fn into_handle(self) -> InstrumentHandle {
        InstrumentHandle::F64Gauge(self)
    }

    fn from_handle(handle: &InstrumentHandle) -> Option<Self> {
        match handle {
            InstrumentHandle::F64Gauge(g) => Some(g.clone()),
            _ => None,
        }
    }
}

/// A named measurement scope and the instruments created through it.
///
/// Scopes are owned by the provider, so every [`Registry`] bound to the same scope name shares one instrument table.
pub(crate) struct Scope {
    name: String,
    meter: Meter,
    instruments: HashMap<String, InstrumentHandle>,
    sampler: Option<Arc<SamplerPool>>,
}

impl Scope {
    pub(crate) fn new(name: String, meter: Meter, sampler: Option<Arc<SamplerPool>>) -> Self {
        Self { name, meter, instruments: HashMap::new(), sampler }
    }

    /// Returns the instrument registered under the requested name, creating it if the name is free.
    ///
    /// The table entry stays locked while `create` runs, so concurrent callers racing on the same new name observe
    /// exactly one creation.
    fn get_or_create<I, F>(
        &self,
        requested: InstrumentDescriptor,
        create: F,
    ) -> Result<I, DuplicateInstrumentError>
    where
        I: Instrument,
        F: FnOnce(&Meter, InstrumentDescriptor) -> I,
    {
        match self.instruments.entry(requested.name().to_owned()) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                match I::from_handle(existing) {
                    Some(instrument) if existing.descriptor() == &requested => Ok(instrument),
                    _ => Err(DuplicateInstrumentError::new(existing.descriptor().clone(), requested)),
                }
            }
            Entry::Vacant(entry) => {
                debug!(
                    scope = %self.name,
                    instrument = requested.name(),
                    kind = %requested.kind(),
                    "Registering instrument."
                );
                let instrument = create(&self.meter, requested);
                entry.insert_entry(instrument.clone().into_handle());
                Ok(instrument)
            }
        }
    }

    fn descriptors(&self) -> Vec<InstrumentDescriptor> {
        let mut descriptors = Vec::with_capacity(self.instruments.len());
        self.instruments.scan(|_, handle| descriptors.push(handle.descriptor().clone()));
        descriptors
    }
}

/// Typed, idempotent instrument factories over a single measurement scope.
///
/// A `Registry` only holds a weak reference to the [`MetricsProvider`] it was created from: dropping it never shuts
/// the pipeline down, and shutting the pipeline down is always left to whoever owns the provider.
///
/// Every factory may be called concurrently from any number of threads. Creating an instrument whose name already
/// exists in the scope returns the existing instrument when its description, unit and kind all match, and fails with
/// [`DuplicateInstrumentError`] otherwise.
#[derive(Clone)]
pub struct Registry {
    scope: Arc<Scope>,
    provider: Weak<ProviderShared>,
}

impl Registry {
    /// Binds the scope named `scope_name` on `provider`.
    ///
    /// Binding the same scope name twice on the same provider is legal, and both registries share the same
    /// instruments.
    pub fn scope(provider: &MetricsProvider, scope_name: impl Into<String>) -> Self {
        Self { scope: provider.scope(scope_name.into()), provider: provider.downgrade() }
    }

    /// Returns the name of the bound scope.
    pub fn scope_name(&self) -> &str {
        &self.scope.name
    }

    /// Returns the provider this registry was bound on, if it is still alive.
    pub fn provider(&self) -> Option<MetricsProvider> {
        self.provider.upgrade().map(MetricsProvider::from_shared)
    }

    /// Creates a monotonic counter.
    ///
    /// Counters are dimensionless, and exported with the unit `1`.
    ///
    /// # Errors
    ///
    /// If `name` is already registered in this scope with a different description or kind, an error is returned.
    pub fn create_counter(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Counter, DuplicateInstrumentError> {
        let descriptor = InstrumentDescriptor::new(
            name.into(),
            description.into(),
            DIMENSIONLESS_UNIT,
            InstrumentKind::Counter,
        );
        self.check_running(&descriptor);
        self.scope.get_or_create(descriptor, Counter::new)
    }

    /// Creates a counter that accepts negative deltas.
    ///
    /// # Errors
    ///
    /// If `name` is already registered in this scope with a different description or kind, an error is returned.
    pub fn create_up_down_counter(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<UpDownCounter, DuplicateInstrumentError> {
        let descriptor = InstrumentDescriptor::new(
            name.into(),
            description.into(),
            DIMENSIONLESS_UNIT,
            InstrumentKind::UpDownCounter,
        );
        self.check_running(&descriptor);
        self.scope.get_or_create(descriptor, UpDownCounter::new)
    }

    /// Creates a histogram recording values in `unit`.
    ///
    /// The unit is exported by its canonical label, e.g. `ms` for [`Unit::Milliseconds`] or `B` for [`Unit::Bytes`].
    /// [`Unit::Count`] has no label of its own and is exported as the dimensionless unit `1`.
    ///
    /// # Errors
    ///
    /// If `name` is already registered in this scope with a different description, unit or kind, an error is returned.
    pub fn create_histogram(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        unit: Unit,
    ) -> Result<Histogram, DuplicateInstrumentError> {
        let unit = match unit {
            Unit::Count => DIMENSIONLESS_UNIT,
            other => other.as_canonical_label(),
        };
        let descriptor =
            InstrumentDescriptor::new(name.into(), description.into(), unit, InstrumentKind::Histogram);
        self.check_running(&descriptor);
        self.scope.get_or_create(descriptor, Histogram::new)
    }

    /// Creates an integer gauge whose value is produced by `callback`.
    ///
    /// The callback is invoked by the pipeline once per collection pass, and reports the current value (or values, one
    /// per attribute set) through the [`Observations`] handle it is given. A callback that panics, or that exceeds the
    /// provider's callback timeout, reports nothing for that pass.
    ///
    /// If an identical gauge already exists, it is returned and `callback` is discarded: the callback bound first stays
    /// in effect.
    ///
    /// # Errors
    ///
    /// If `name` is already registered in this scope with a different description or kind, an error is returned.
    pub fn create_gauge<F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        callback: F,
    ) -> Result<ObservableGauge<i64>, DuplicateInstrumentError>
    where
        F: Fn(&Observations<i64>) + Send + Sync + 'static,
    {
        self.create_observable_gauge(name.into(), description.into(), Arc::new(callback))
    }

    /// Creates a floating-point gauge whose value is produced by `callback`.
    ///
    /// Behaves exactly like [`create_gauge`][Registry::create_gauge], but reports `f64` values. Integer and
    /// floating-point gauges are different kinds, so they cannot share a name.
    ///
    /// # Errors
    ///
    /// If `name` is already registered in this scope with a different description or kind, an error is returned.
    pub fn create_f64_gauge<F>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        callback: F,
    ) -> Result<ObservableGauge<f64>, DuplicateInstrumentError>
    where
        F: Fn(&Observations<f64>) + Send + Sync + 'static,
    {
        self.create_observable_gauge(name.into(), description.into(), Arc::new(callback))
    }

    fn create_observable_gauge<T>(
        &self,
        name: String,
        description: String,
        callback: Arc<GaugeCallback<T>>,
    ) -> Result<ObservableGauge<T>, DuplicateInstrumentError>
    where
        T: GaugeValue,
        ObservableGauge<T>: Instrument,
    {
        let descriptor = InstrumentDescriptor::new(name, description, DIMENSIONLESS_UNIT, T::KIND);
        self.check_running(&descriptor);

        let sampler = self.scope.sampler.clone();
        self.scope.get_or_create(descriptor, move |meter, descriptor| {
            ObservableGauge::new(meter, descriptor, callback, sampler)
        })
    }

    /// Returns the descriptors of every instrument registered in the scope.
    ///
    /// The order of the descriptors is unspecified.
    pub fn descriptors(&self) -> Vec<InstrumentDescriptor> {
        self.scope.descriptors()
    }

    fn check_running(&self, descriptor: &InstrumentDescriptor) {
        let running = self
            .provider
            .upgrade()
            .is_some_and(|shared| shared.state() == LifecycleState::Running);
        if !running {
            debug!(
                scope = %self.scope.name,
                instrument = descriptor.name(),
                "Creating instrument while the metrics pipeline is not running, its measurements will not be exported."
            );
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("scope", &self.scope.name)
            .field("instruments", &self.scope.instruments.len())
            .finish()
    }
}
