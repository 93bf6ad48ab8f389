//! OpenTelemetry instruments, exported through the Prometheus
//! default registry.
//!
//! Instruments are created from the global meter; until
//! [`initialize_metrics`] runs they are no-ops, so tests and embedders
//! that don't care about metrics pay nothing.

use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::metrics::Meter;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;

use crate::errors::Result;
use crate::errors::VigilError;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Only the first call does anything; later calls return its result.
/// Instruments created before the first call stay no-ops.
pub fn initialize_metrics() -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| install_meter_provider().map_err(|err| err.to_string()))
        .clone()
        .map_err(VigilError::Telemetry)
}

fn install_meter_provider() -> Result<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("vigil")
        .build()
        .map_err(|err| VigilError::Telemetry(err.to_string()))?;

    // Create a global MeterProvider
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0, 30.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| VigilError::Telemetry(err.to_string()))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Render everything in the Prometheus default registry in the text
/// exposition format.
pub fn render_prometheus() -> Result<String> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&default_registry().gather(), &mut buf)
        .map_err(|err| VigilError::Telemetry(err.to_string()))?;
    String::from_utf8(buf).map_err(|err| VigilError::Telemetry(err.to_string()))
}

fn meter() -> Meter {
    global::meter("vigil")
}

#[derive(Clone)]
pub(crate) struct MonitorMetrics {
    pub(crate) probe_count: Counter<u64>,
    pub(crate) probe_failure_count: Counter<u64>,
    pub(crate) future_failed_count: Counter<u64>,
    pub(crate) probe_duration: Histogram<f64>,
}

impl MonitorMetrics {
    pub(crate) fn new() -> Self {
        let meter = meter();
        Self {
            probe_count: meter
                .u64_counter("probe_count")
                .with_description("number of liveness probes sent to updater bodies")
                .init(),
            probe_failure_count: meter
                .u64_counter("probe_failure_count")
                .with_description("number of probes answered DEAD or failed in transport")
                .init(),
            future_failed_count: meter
                .u64_counter("future_failed_count")
                .with_description("number of futures resolved with an updater failure")
                .init(),
            probe_duration: meter
                .f64_histogram("probe_duration_seconds")
                .with_description("liveness probe round trip duration in seconds")
                .init(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct RecoveryMetrics {
    pub(crate) recovery_started_count: Counter<u64>,
    pub(crate) recovery_duplicate_count: Counter<u64>,
    pub(crate) recovery_job_failed_count: Counter<u64>,
    pub(crate) resume_duration: Histogram<f64>,
}

impl RecoveryMetrics {
    pub(crate) fn new() -> Self {
        let meter = meter();
        Self {
            recovery_started_count: meter
                .u64_counter("recovery_started_count")
                .with_description("number of bodies moved from RUNNING to RECOVERING")
                .init(),
            recovery_duplicate_count: meter
                .u64_counter("recovery_duplicate_count")
                .with_description("number of failure signals absorbed while already RECOVERING")
                .init(),
            recovery_job_failed_count: meter
                .u64_counter("recovery_job_failed_count")
                .with_description("number of recovery jobs whose resume call failed")
                .init(),
            resume_duration: meter
                .f64_histogram("resume_duration_seconds")
                .with_description("resume call duration in seconds")
                .init(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct PoolMetrics {
    pub(crate) job_count: Counter<u64>,
    pub(crate) job_panic_count: Counter<u64>,
}

impl PoolMetrics {
    pub(crate) fn new() -> Self {
        let meter = meter();
        Self {
            job_count: meter
                .u64_counter("job_count")
                .with_description("number of jobs executed by pool workers")
                .init(),
            job_panic_count: meter
                .u64_counter("job_panic_count")
                .with_description("number of jobs that panicked on a pool worker")
                .init(),
        }
    }
}

#[test]
fn initialize_is_idempotent() {
    initialize_metrics().unwrap();
    initialize_metrics().unwrap();
    let metrics = MonitorMetrics::new();
    metrics.probe_count.add(1, &[]);
    let text = render_prometheus().unwrap();
    assert!(text.contains("vigil_probe_count"), "{text}");
}
