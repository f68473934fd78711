#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, Metric, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, Temporality};
use tokio::runtime::{Builder, Runtime};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Fails the first `failures` exports, then hands batches to an in-memory exporter.
///
/// Every export attempt takes at least `delay`, which keeps a collection pass in flight for that long.
#[derive(Clone)]
pub struct FlakyExporter {
    pub failures: usize,
    pub delay: Duration,
    pub attempts: Arc<AtomicUsize>,
    pub delegate: InMemoryMetricExporter,
}

impl FlakyExporter {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            delay: Duration::ZERO,
            attempts: Arc::new(AtomicUsize::new(0)),
            delegate: InMemoryMetricExporter::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PushMetricExporter for FlakyExporter {
    async fn export(&self, metrics: &ResourceMetrics) -> OTelSdkResult {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        // Always sleep through Tokio, so the export fails loudly without a runtime context.
        tokio::time::sleep(self.delay.max(Duration::from_millis(1))).await;
        if attempt < self.failures {
            return Err(OTelSdkError::InternalFailure("collector unavailable".to_owned()));
        }
        self.delegate.export(metrics).await
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        Temporality::Cumulative
    }
}

/// A small runtime standing in for the transport runtime of the OTLP exporter.
pub fn transport_runtime() -> Runtime {
    Builder::new_multi_thread().worker_threads(1).enable_all().build().unwrap()
}

/// Polls `condition` until it holds, for at most `timeout`.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Finds the metric named `name` in a single exported batch.
pub fn find_metric<'a>(batch: &'a ResourceMetrics, name: &str) -> Option<&'a Metric> {
    batch.scope_metrics().flat_map(|sm| sm.metrics()).find(|m| m.name() == name)
}

/// Applies `inspect` to the metric named `name` in the most recent batch held by `exporter`.
pub fn latest_metric<T>(
    exporter: &InMemoryMetricExporter,
    name: &str,
    inspect: impl FnOnce(&Metric) -> T,
) -> Option<T> {
    let batches = exporter.get_finished_metrics().expect("in-memory exporter should be readable");
    batches.last().and_then(|batch| find_metric(batch, name)).map(inspect)
}

/// Waits until `exporter` holds a batch containing `name`, for at most `timeout`, and applies `inspect` to the most
/// recent occurrence.
pub fn wait_for_metric<T>(
    exporter: &InMemoryMetricExporter,
    name: &str,
    timeout: Duration,
    inspect: impl Fn(&Metric) -> T,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        let batches = exporter.get_finished_metrics().expect("in-memory exporter should be readable");
        if let Some(metric) = batches.iter().rev().find_map(|batch| find_metric(batch, name)) {
            return Some(inspect(metric));
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn batch_count(exporter: &InMemoryMetricExporter) -> usize {
    exporter.get_finished_metrics().expect("in-memory exporter should be readable").len()
}

pub fn u64_sum_points(metric: &Metric) -> Vec<u64> {
    let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() else {
        panic!("{} should be a u64 sum", metric.name());
    };
    sum.data_points().map(|dp| dp.value()).collect()
}

pub fn i64_sum_points(metric: &Metric) -> Vec<i64> {
    let AggregatedMetrics::I64(MetricData::Sum(sum)) = metric.data() else {
        panic!("{} should be an i64 sum", metric.name());
    };
    sum.data_points().map(|dp| dp.value()).collect()
}

pub fn i64_gauge_points(metric: &Metric) -> Vec<i64> {
    let AggregatedMetrics::I64(MetricData::Gauge(gauge)) = metric.data() else {
        panic!("{} should be an i64 gauge", metric.name());
    };
    gauge.data_points().map(|dp| dp.value()).collect()
}

pub fn f64_gauge_points(metric: &Metric) -> Vec<f64> {
    let AggregatedMetrics::F64(MetricData::Gauge(gauge)) = metric.data() else {
        panic!("{} should be an f64 gauge", metric.name());
    };
    gauge.data_points().map(|dp| dp.value()).collect()
}
