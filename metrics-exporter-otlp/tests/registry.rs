mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use metrics_exporter_otlp::{InstrumentKind, MetricsProvider, Registry, Unit};
use opentelemetry_sdk::metrics::InMemoryMetricExporter;

use common::{i64_gauge_points, init_tracing, latest_metric, u64_sum_points};

fn start(exporter: &InMemoryMetricExporter) -> MetricsProvider {
    init_tracing();
    MetricsProvider::start(exporter.clone(), Duration::from_secs(60)).expect("provider should start")
}

#[test]
fn test_counter_creation_is_idempotent() {
    // Given: a registry with a counter created twice with identical metadata
    let exporter = InMemoryMetricExporter::default();
    let provider = start(&exporter);
    let registry = Registry::scope(&provider, "registry-tests");

    let first = registry.create_counter("requests_total", "Requests handled").unwrap();
    let second = registry.create_counter("requests_total", "Requests handled").unwrap();
    assert_eq!(first.descriptor(), second.descriptor());

    // When: both handles are used
    first.add(2);
    second.add(3);
    provider.force_flush().unwrap();

    // Then: they feed one series
    let points = latest_metric(&exporter, "requests_total", u64_sum_points).unwrap();
    assert_eq!(points, vec![5]);
    assert_eq!(registry.descriptors().len(), 1);

    provider.shutdown().unwrap();
}

#[test]
fn test_name_reuse_with_another_kind_fails() {
    // Given: a registry with a counter
    let exporter = InMemoryMetricExporter::default();
    let provider = start(&exporter);
    let registry = Registry::scope(&provider, "registry-tests");
    let counter = registry.create_counter("payload", "Payloads sent").unwrap();

    // When: the same name is requested as a histogram
    let err = registry.create_histogram("payload", "Payload sizes", Unit::Bytes).unwrap_err();

    // Then: creation fails and the counter is untouched
    assert_eq!(err.name(), "payload");
    assert_eq!(err.existing().kind(), InstrumentKind::Counter);
    assert_eq!(err.requested().kind(), InstrumentKind::Histogram);
    assert_eq!(err.requested().unit(), "B");

    counter.add(1);
    provider.force_flush().unwrap();
    let points = latest_metric(&exporter, "payload", u64_sum_points).unwrap();
    assert_eq!(points, vec![1]);

    let descriptors = registry.descriptors();
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].kind(), InstrumentKind::Counter);

    provider.shutdown().unwrap();
}

#[test]
fn test_name_reuse_with_another_description_fails() {
    let exporter = InMemoryMetricExporter::default();
    let provider = start(&exporter);
    let registry = Registry::scope(&provider, "registry-tests");

    registry.create_up_down_counter("connections", "Open connections").unwrap();
    let err = registry.create_up_down_counter("connections", "Connections").unwrap_err();

    assert_eq!(err.existing().description(), "Open connections");
    assert_eq!(err.requested().description(), "Connections");
    assert!(err.to_string().contains("'connections'"));

    provider.shutdown().unwrap();
}

#[test]
fn test_registries_on_the_same_scope_share_instruments() {
    // Given: two registries bound to the same scope, and one bound to another scope
    let exporter = InMemoryMetricExporter::default();
    let provider = start(&exporter);
    let billing = Registry::scope(&provider, "billing");
    let billing_again = Registry::scope(&provider, "billing");
    let shipping = Registry::scope(&provider, "shipping");

    // When: the same instrument is created through both billing registries
    let a = billing.create_counter("invoices_total", "Invoices issued").unwrap();
    let b = billing_again.create_counter("invoices_total", "Invoices issued").unwrap();
    a.add(1);
    b.add(1);

    // Then: they share identity, while another scope is free to reuse the name differently
    assert!(billing_again.create_histogram("invoices_total", "", Unit::Count).is_err());
    shipping.create_histogram("invoices_total", "Invoice sizes", Unit::Count).unwrap();

    assert_eq!(billing.scope_name(), "billing");
    assert_eq!(billing.descriptors(), billing_again.descriptors());

    provider.force_flush().unwrap();
    let batches = exporter.get_finished_metrics().unwrap();
    let batch = batches.last().unwrap();
    let billing_scope = batch
        .scope_metrics()
        .find(|sm| sm.scope().name() == "billing")
        .expect("billing scope should be exported");
    let invoices = billing_scope
        .metrics()
        .find(|m| m.name() == "invoices_total")
        .expect("invoices_total should be exported");
    assert_eq!(u64_sum_points(invoices), vec![2]);

    provider.shutdown().unwrap();
}

#[test]
fn test_gauge_keeps_first_callback() {
    // Given: a gauge created twice with identical metadata but different callbacks
    let exporter = InMemoryMetricExporter::default();
    let provider = start(&exporter);
    let registry = Registry::scope(&provider, "registry-tests");

    let second_called = Arc::new(AtomicBool::new(false));
    let second_called_moved = Arc::clone(&second_called);
    registry.create_gauge("workers", "Busy workers", |o| o.observe(1)).unwrap();
    registry
        .create_gauge("workers", "Busy workers", move |o| {
            second_called_moved.store(true, Ordering::SeqCst);
            o.observe(2);
        })
        .unwrap();

    // When: a collection pass runs
    provider.force_flush().unwrap();

    // Then: only the first callback is in effect
    let points = latest_metric(&exporter, "workers", i64_gauge_points).unwrap();
    assert_eq!(points, vec![1]);
    assert!(!second_called.load(Ordering::SeqCst));

    provider.shutdown().unwrap();
}

#[test]
fn test_gauge_callback_runs_once_per_pass_under_concurrent_creation() {
    // Given: a gauge counting its invocations
    let exporter = InMemoryMetricExporter::default();
    let provider = start(&exporter);
    let registry = Registry::scope(&provider, "registry-tests");

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_moved = Arc::clone(&invocations);
    registry
        .create_gauge("watched", "Gauge under observation", move |o| {
            invocations_moved.fetch_add(1, Ordering::SeqCst);
            o.observe(1);
        })
        .unwrap();

    // When: other threads keep creating unrelated gauges while passes run
    const THREADS: usize = 4;
    const GAUGES_PER_THREAD: usize = 10;
    const PASSES: usize = 5;

    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let creators: Vec<_> = (0..THREADS)
        .map(|t| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..GAUGES_PER_THREAD {
                    registry
                        .create_gauge(format!("unrelated_{t}_{i}"), "Noise", |o| o.observe(0))
                        .unwrap();
                }
            })
        })
        .collect();

    barrier.wait();
    for _ in 0..PASSES {
        provider.force_flush().unwrap();
    }
    for creator in creators {
        creator.join().unwrap();
    }

    // Then: the watched gauge ran exactly once per pass
    assert_eq!(invocations.load(Ordering::SeqCst), PASSES);
    assert_eq!(registry.descriptors().len(), 1 + THREADS * GAUGES_PER_THREAD);

    provider.shutdown().unwrap();
}

#[test]
fn test_registry_does_not_own_provider() {
    // Given: a registry bound to a provider
    let exporter = InMemoryMetricExporter::default();
    let provider = start(&exporter);
    let registry = Registry::scope(&provider, "registry-tests");
    let counter = registry.create_counter("orders_total", "Orders placed").unwrap();
    counter.add(4);

    // When: the registry is dropped
    drop(registry);

    // Then: the pipeline keeps running and still exports through the provider
    assert!(provider.force_flush().is_ok());
    let points = latest_metric(&exporter, "orders_total", u64_sum_points).unwrap();
    assert_eq!(points, vec![4]);

    provider.shutdown().unwrap();
}
