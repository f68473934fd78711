//! Instrument handles handed out by the registry.

use std::{fmt, sync::Arc};

use opentelemetry::metrics::{AsyncInstrument, Meter};
use opentelemetry::KeyValue;

use crate::callback::{GaugeCallback, GaugeSampler, SamplerPool};

/// Unit used by instruments that count things.
pub(crate) const DIMENSIONLESS_UNIT: &str = "1";

/// The kind of an instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    /// A monotonic, non-negative accumulator.
    Counter,

    /// A signed accumulator.
    UpDownCounter,

    /// A distribution of recorded values.
    Histogram,

    /// An integer gauge whose value is produced by a callback.
    ObservableGauge,

    /// A floating-point gauge whose value is produced by a callback.
    F64ObservableGauge,
}

impl InstrumentKind {
    /// Gets the string form of this `InstrumentKind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::UpDownCounter => "up_down_counter",
            InstrumentKind::Histogram => "histogram",
            InstrumentKind::ObservableGauge => "observable_gauge",
            InstrumentKind::F64ObservableGauge => "f64_observable_gauge",
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of an instrument within its scope.
///
/// Two instruments with the same name are only considered the same instrument when every field matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstrumentDescriptor {
    name: String,
    description: String,
    unit: String,
    kind: InstrumentKind,
}

impl InstrumentDescriptor {
    pub(crate) fn new(
        name: String,
        description: String,
        unit: impl Into<String>,
        kind: InstrumentKind,
    ) -> Self {
        Self { name, description, unit: unit.into(), kind }
    }

    /// Returns the instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instrument description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the unit the instrument is exported with.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Returns the instrument kind.
    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }
}

impl fmt::Display for InstrumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (unit: '{}', description: '{}')",
            self.kind, self.unit, self.description
        )
    }
}

/// A monotonic counter.
///
/// Clones are shallow and feed the same underlying instrument.
#[derive(Clone)]
pub struct Counter {
    inner: opentelemetry::metrics::Counter<u64>,
    descriptor: Arc<InstrumentDescriptor>,
}

impl Counter {
    pub(crate) fn new(meter: &Meter, descriptor: InstrumentDescriptor) -> Self {
        let inner = meter
            .u64_counter(descriptor.name().to_owned())
            .with_description(descriptor.description().to_owned())
            .with_unit(descriptor.unit().to_owned())
            .build();
        Self { inner, descriptor: Arc::new(descriptor) }
    }

    /// Adds `delta` to the counter.
    pub fn add(&self, delta: u64) {
        self.inner.add(delta, &[]);
    }

    /// Adds `delta` to the series identified by `attributes`.
    pub fn add_with(&self, delta: u64, attributes: &[KeyValue]) {
        self.inner.add(delta, attributes);
    }

    /// Returns the descriptor of this counter.
    pub fn descriptor(&self) -> &InstrumentDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter").field("descriptor", &self.descriptor).finish()
    }
}

/// A counter that can go up and down.
#[derive(Clone)]
pub struct UpDownCounter {
    inner: opentelemetry::metrics::UpDownCounter<i64>,
    descriptor: Arc<InstrumentDescriptor>,
}

impl UpDownCounter {
    pub(crate) fn new(meter: &Meter, descriptor: InstrumentDescriptor) -> Self {
        let inner = meter
            .i64_up_down_counter(descriptor.name().to_owned())
            .with_description(descriptor.description().to_owned())
            .with_unit(descriptor.unit().to_owned())
            .build();
        Self { inner, descriptor: Arc::new(descriptor) }
    }

    /// Adds `delta`, which may be negative, to the counter.
    pub fn add(&self, delta: i64) {
        self.inner.add(delta, &[]);
    }

    /// Adds `delta` to the series identified by `attributes`.
    pub fn add_with(&self, delta: i64, attributes: &[KeyValue]) {
        self.inner.add(delta, attributes);
    }

    /// Returns the descriptor of this counter.
    pub fn descriptor(&self) -> &InstrumentDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for UpDownCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpDownCounter").field("descriptor", &self.descriptor).finish()
    }
}

/// A histogram of recorded values.
#[derive(Clone)]
pub struct Histogram {
    inner: opentelemetry::metrics::Histogram<f64>,
    descriptor: Arc<InstrumentDescriptor>,
}

impl Histogram {
    pub(crate) fn new(meter: &Meter, descriptor: InstrumentDescriptor) -> Self {
        let inner = meter
            .f64_histogram(descriptor.name().to_owned())
            .with_description(descriptor.description().to_owned())
            .with_unit(descriptor.unit().to_owned())
            .build();
        Self { inner, descriptor: Arc::new(descriptor) }
    }

    /// Records a value.
    pub fn record(&self, value: f64) {
        self.inner.record(value, &[]);
    }

    /// Records a value in the series identified by `attributes`.
    pub fn record_with(&self, value: f64, attributes: &[KeyValue]) {
        self.inner.record(value, attributes);
    }

    /// Returns the descriptor of this histogram.
    pub fn descriptor(&self) -> &InstrumentDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram").field("descriptor", &self.descriptor).finish()
    }
}

mod private {
    pub trait Sealed {}

    impl Sealed for i64 {}
    impl Sealed for f64 {}
}

/// A value type an [`ObservableGauge`] can report.
///
/// Implemented for `i64` and `f64`.
pub trait GaugeValue: private::Sealed + Copy + Send + Sync + 'static {
    /// The instrument kind gauges of this value type are registered as.
    const KIND: InstrumentKind;

    #[doc(hidden)]
    fn register<F>(
        meter: &Meter,
        descriptor: &InstrumentDescriptor,
        callback: F,
    ) -> opentelemetry::metrics::ObservableGauge<Self>
    where
        F: Fn(&dyn AsyncInstrument<Self>) + Send + Sync + 'static;
}

impl GaugeValue for i64 {
    const KIND: InstrumentKind = InstrumentKind::ObservableGauge;

    fn register<F>(
        meter: &Meter,
        descriptor: &InstrumentDescriptor,
        callback: F,
    ) -> opentelemetry::metrics::ObservableGauge<Self>
    where
        F: Fn(&dyn AsyncInstrument<Self>) + Send + Sync + 'static,
    {
        meter
            .i64_observable_gauge(descriptor.name().to_owned())
            .with_description(descriptor.description().to_owned())
            .with_unit(descriptor.unit().to_owned())
            .with_callback(callback)
            .build()
    }
}

impl GaugeValue for f64 {
    const KIND: InstrumentKind = InstrumentKind::F64ObservableGauge;

    fn register<F>(
        meter: &Meter,
        descriptor: &InstrumentDescriptor,
        callback: F,
    ) -> opentelemetry::metrics::ObservableGauge<Self>
    where
        F: Fn(&dyn AsyncInstrument<Self>) + Send + Sync + 'static,
    {
        meter
            .f64_observable_gauge(descriptor.name().to_owned())
            .with_description(descriptor.description().to_owned())
            .with_unit(descriptor.unit().to_owned())
            .with_callback(callback)
            .build()
    }
}

/// A gauge whose value is produced on demand by a callback.
///
/// There is no record operation: the callback bound at creation time is invoked once per collection pass and reports
/// through an [`Observations`][crate::Observations] handle.
#[derive(Clone)]
pub struct ObservableGauge<T: GaugeValue> {
    #[allow(dead_code)] // held for the lifetime of the gauge
    inner: Arc<opentelemetry::metrics::ObservableGauge<T>>,
    descriptor: Arc<InstrumentDescriptor>,
}

impl<T: GaugeValue> ObservableGauge<T> {
    pub(crate) fn new(
        meter: &Meter,
        descriptor: InstrumentDescriptor,
        callback: Arc<GaugeCallback<T>>,
        pool: Option<Arc<SamplerPool>>,
    ) -> Self {
        let sampler = Arc::new(GaugeSampler::new(descriptor.name(), callback, pool));
        let inner = T::register(meter, &descriptor, move |observer: &dyn AsyncInstrument<T>| {
            sampler.sample_into(observer);
        });
        Self { inner: Arc::new(inner), descriptor: Arc::new(descriptor) }
    }

    /// Returns the descriptor of this gauge.
    pub fn descriptor(&self) -> &InstrumentDescriptor {
        &self.descriptor
    }
}

impl<T: GaugeValue> fmt::Debug for ObservableGauge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableGauge").field("descriptor", &self.descriptor).finish()
    }
}
