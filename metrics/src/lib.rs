use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Installs the global meter provider. Metrics are pushed over OTLP when an
/// endpoint is configured and kept in-process otherwise.
pub fn init_provider(enable_export: bool, endpoint: Option<&str>) -> Result<SdkMeterProvider> {
    let mut provider = SdkMeterProvider::builder();
    if enable_export {
        let mut exporter = MetricExporter::builder().with_tonic();
        if let Some(endpoint) = endpoint {
            exporter = exporter.with_endpoint(endpoint.to_string());
        }
        provider = provider.with_periodic_exporter(exporter.build()?);
    }
    let provider = provider.build();
    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(provider)
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between its creation and its drop into `metric`.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod health_manager {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use opentelemetry::{
        metrics::{Counter, Histogram, ObservableGauge},
        KeyValue,
    };

    /// Instance totals of the last completed analysis pass.
    #[derive(Debug, Default)]
    pub struct PassTotals {
        pub running: AtomicU64,
        pub down: AtomicU64,
        pub flapping: AtomicU64,
    }

    impl PassTotals {
        pub fn set(&self, running: u64, down: u64, flapping: u64) {
            self.running.store(running, Ordering::Relaxed);
            self.down.store(down, Ordering::Relaxed);
            self.flapping.store(flapping, Ordering::Relaxed);
        }
    }

    #[derive(Debug)]
    pub struct Metrics {
        pub totals: Arc<PassTotals>,
        pub instances: ObservableGauge<u64>,
        pub heartbeats: Counter<u64>,
        pub exits: Counter<u64>,
        pub dropped_messages: Counter<u64>,
        pub analysis_duration: Histogram<f64>,
        pub analysis_skipped: Counter<u64>,
        pub requests_queued: Counter<u64>,
        pub requests_published: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("health_manager");
            let totals = Arc::new(PassTotals::default());
            let instances = meter
                .u64_observable_gauge("health_manager.instances")
                .with_callback({
                    let totals = totals.clone();
                    move |observer| {
                        observer.observe(
                            totals.running.load(Ordering::Relaxed),
                            &[KeyValue::new("state", "running")],
                        );
                        observer.observe(
                            totals.down.load(Ordering::Relaxed),
                            &[KeyValue::new("state", "down")],
                        );
                        observer.observe(
                            totals.flapping.load(Ordering::Relaxed),
                            &[KeyValue::new("state", "flapping")],
                        );
                    }
                })
                .with_description("instances by state as of the last analysis pass")
                .build();
            let heartbeats = meter
                .u64_counter("health_manager.heartbeats")
                .with_description("number of instance reports ingested from heartbeats")
                .build();
            let exits = meter
                .u64_counter("health_manager.exits")
                .with_description("number of exit notifications ingested")
                .build();
            let dropped_messages = meter
                .u64_counter("health_manager.dropped_messages")
                .with_description("number of inbound messages dropped, by reason")
                .build();
            let analysis_duration = meter
                .f64_histogram("health_manager.analysis_duration")
                .with_description("full analysis pass latencies in seconds")
                .build();
            let analysis_skipped = meter
                .u64_counter("health_manager.analysis_skipped")
                .with_description("analysis passes skipped because a previous one was draining")
                .build();
            let requests_queued = meter
                .u64_counter("health_manager.requests_queued")
                .with_description("corrective requests queued, by op")
                .build();
            let requests_published = meter
                .u64_counter("health_manager.requests_published")
                .with_description("corrective requests drained to the controller, by op")
                .build();
            Metrics {
                totals,
                instances,
                heartbeats,
                exits,
                dropped_messages,
                analysis_duration,
                analysis_skipped,
                requests_queued,
                requests_published,
            }
        }
    }
}

pub mod placement {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub instances_started: Counter<u64>,
        pub placement_failures: Counter<u64>,
        pub placement_latency: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("placement");
            let instances_started = meter
                .u64_counter("placement.instances_started")
                .with_description("start messages published to hosts")
                .build();
            let placement_failures = meter
                .u64_counter("placement.failures")
                .with_description("starts abandoned because no host was available")
                .build();
            let placement_latency = meter
                .f64_histogram("placement.latency")
                .with_description("host resolution latencies in seconds")
                .build();
            Metrics {
                instances_started,
                placement_failures,
                placement_latency,
            }
        }
    }
}
