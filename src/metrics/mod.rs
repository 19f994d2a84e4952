use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    // Meters stay no-op unless a provider is installed.
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "chunkyard"))
        .with_attribute(KeyValue::new("service.name", "chunkyard-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "chunkyard.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub mod api_io_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    use super::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub chunks: Counter<u64>,
        pub chunk_bytes: Counter<u64>,
        pub merges: Counter<u64>,
        pub merge_duration: Histogram<f64>,
        pub missing_chunks: Counter<u64>,
        pub swept_chunks: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("chunkyard-server");
            let chunks = meter
                .u64_counter("chunkyard.chunks")
                .with_description("number of chunks ingested")
                .build();
            let chunk_bytes = meter
                .u64_counter("chunkyard.chunk_bytes")
                .with_description("number of bytes ingested as chunks")
                .build();
            let merges = meter
                .u64_counter("chunkyard.merges")
                .with_description("number of merges, labeled by outcome")
                .build();
            let merge_duration = meter
                .f64_histogram("chunkyard.merge_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("merge latencies in seconds")
                .build();
            let missing_chunks = meter
                .u64_counter("chunkyard.missing_chunks")
                .with_description("chunk indices found missing at merge time")
                .build();
            let swept_chunks = meter
                .u64_counter("chunkyard.swept_chunks")
                .with_description("orphaned chunks removed by the sweeper")
                .build();
            Metrics {
                chunks,
                chunk_bytes,
                merges,
                merge_duration,
                missing_chunks,
                swept_chunks,
            }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
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

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorded(Mutex<Vec<Duration>>);

    impl TimerUpdate for Recorded {
        fn add(&self, duration: Duration, _labels: &[KeyValue]) {
            self.0.lock().unwrap().push(duration);
        }
    }

    #[test]
    fn test_timer_records_on_drop() {
        let recorded = Recorded(Mutex::new(vec![]));
        {
            let _timer = Timer::start(&recorded);
            assert!(recorded.0.lock().unwrap().is_empty());
        }
        assert_eq!(recorded.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_provider_is_noop() {
        init_provider(false, None, Duration::from_secs(10), "test", "0.0.0").unwrap();
        let metrics = api_io_stats::Metrics::new();
        metrics.chunks.increment(&[]);
    }
}
