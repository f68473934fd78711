use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use metrics_exporter_otlp::{initialize_with_config, KeyValue, MetricsConfig, Unit};

fn main() {
    tracing_subscriber::fmt::init();

    // Point this at a running collector, e.g. `docker run -p 4317:4317 otel/opentelemetry-collector`.
    let config = MetricsConfig::new("http://localhost:4317")
        .with_interval(Duration::from_secs(2))
        .with_service_name("basic-example");
    let (registry, provider) = initialize_with_config(config).expect("failed to initialize metrics");

    let requests = registry
        .create_counter("requests_total", "Total HTTP requests")
        .expect("failed to create counter");
    let in_flight = registry
        .create_up_down_counter("requests_in_flight", "HTTP requests currently being handled")
        .expect("failed to create up/down counter");
    let latency = registry
        .create_histogram("response_time", "Response time distribution", Unit::Seconds)
        .expect("failed to create histogram");

    let queue_depth = Arc::new(AtomicI64::new(0));
    let observed_depth = Arc::clone(&queue_depth);
    let _queue = registry
        .create_gauge("queue_depth", "Jobs waiting in the queue", move |observations| {
            observations.observe(observed_depth.load(Ordering::Relaxed));
        })
        .expect("failed to create gauge");

    for i in 0..10 {
        in_flight.add(1);
        requests.add_with(1, &[KeyValue::new("method", "GET"), KeyValue::new("status", "200")]);
        latency.record(0.1 + (i as f64 * 0.01));
        queue_depth.store(i % 4, Ordering::Relaxed);
        in_flight.add(-1);

        println!("Recorded metrics iteration {}", i + 1);
        thread::sleep(Duration::from_millis(500));
    }

    provider.shutdown().expect("failed to shut down metrics");
    println!("Example completed");
}
