//! Internal code for tracing/logging.
//!
//! This module is used to configure both tracing and logging.
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! Span export over OTLP can be configured, by default it is disabled.
//!
//! The log filter can be overridden with the "VIGIL_LOG" env var,
//! using tracing-subscriber's `EnvFilter` syntax, e.g.
//!     $ VIGIL_LOG="vigil=debug,error" ./supervisor
use opentelemetry::sdk::trace::Tracer;
use tokio::runtime::EnterGuard;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::Reraise;
use crate::errors::Result;
use crate::errors::VigilError;

mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

/// Trait that all the tracing config should implement.
/// This function should just return the proper `Tracer` for the backend.
trait TracerBuilder {
    fn build(&self) -> Result<Tracer>;
}

/// Parse a log level name, case-insensitively.
pub fn get_log_level(level: &str) -> Result<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        level => Err(VigilError::Config {
            key: "log_level".into(),
            msg: format!("wrong log level: {level}"),
        }),
    }
}

/// Filter for the stdout log layer.
///
/// "VIGIL_LOG" wins if set and valid; otherwise this crate logs at
/// `log_level` and everything else at ERROR.
fn log_filter(log_level: LevelFilter) -> EnvFilter {
    EnvFilter::try_from_env("VIGIL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("vigil={log_level},error")))
}

/// Utility class used to handle tracing.
///
/// It keeps a tokio runtime that is alive as long as the struct itself.
pub struct VigilTracer {
    rt: tokio::runtime::Runtime,
}

impl VigilTracer {
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("vigil-tracing")
            .build()
            .reraise("error starting tracing runtime")?;
        Ok(Self { rt })
    }

    /// Call this with an optional OTLP config to configure tracing.
    /// Returns a guard that you have to keep in scope for the
    /// whole execution of the code you want to trace.
    pub fn setup(
        &self,
        otlp: Option<OtlpTracingConfig>,
        log_level: Option<&str>,
    ) -> Result<EnterGuard<'_>> {
        let guard = self.rt.enter();

        let log_level = log_level
            .map(get_log_level)
            .transpose()?
            .unwrap_or(LevelFilter::ERROR);

        // We need an async block to properly initialize the tracing runtime.
        let initializer = async move {
            // Prepare the log layer
            let logs = tracing_subscriber::fmt::Layer::default()
                .compact()
                // Show source file
                .with_file(true)
                // Display source code line numbers
                .with_line_number(true)
                // Display the thread ID an event was recorded on
                .with_thread_ids(true)
                .with_filter(log_filter(log_level));

            // If the conf was not none, setup the global subscriber with both log and
            // telemetry layer, otherwise just setup logging.
            if let Some(conf) = otlp {
                let tracer = conf.build()?;
                let telemetry = tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    // Send all traces from vigil
                    .with_filter(Targets::new().with_target("vigil", LevelFilter::TRACE));
                set_global_subscriber(Registry::default().with(logs).with(telemetry));
            } else {
                set_global_subscriber(Registry::default().with(logs));
            };
            Ok::<(), VigilError>(())
        };
        self.rt
            .block_on(self.rt.spawn(initializer))
            .map_err(|err| VigilError::Telemetry(format!("tracing setup task failed: {err}")))??;
        Ok(guard)
    }
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which currently
    // happens in all tests, and also if the supervisor is started more
    // than once in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_level_names() {
    assert_eq!(get_log_level("DEBUG").unwrap(), LevelFilter::DEBUG);
    assert_eq!(get_log_level("warn").unwrap(), LevelFilter::WARN);
    assert!(matches!(
        get_log_level("verbose"),
        Err(VigilError::Config { key, .. }) if key == "log_level"
    ));
}

#[test]
fn setup_twice_is_not_fatal() {
    let tracer = VigilTracer::new().unwrap();
    {
        let _guard = tracer.setup(None, Some("info")).unwrap();
    }
    let _guard = tracer.setup(None, None).unwrap();
    assert!(tracer.setup(None, Some("chatty")).is_err());
}
