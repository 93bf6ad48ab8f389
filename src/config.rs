//! Settings read once at startup.

use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Reraise;
use crate::errors::Result;
use crate::errors::VigilError;
use crate::tracing::get_log_level;
use crate::tracing::OtlpTracingConfig;

const DEFAULT_MONITORING_INTERVAL_MS: i64 = 15_000;
const DEFAULT_MAX_WORKERS: usize = 50;
const DEFAULT_FAULT_DETECTION_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pause between liveness probes. Zero or negative disables future
    /// monitoring.
    pub monitoring_interval_ms: i64,
    pub max_workers: usize,
    pub fault_tolerance: bool,
    pub fault_detection_interval_ms: u64,
    pub checkpoint_db: Option<PathBuf>,
    pub api_port: Option<u16>,
    pub log_level: Option<String>,
    /// Export spans to this OTLP collector when set.
    pub otlp_url: Option<String>,
    pub service_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: DEFAULT_MONITORING_INTERVAL_MS,
            max_workers: DEFAULT_MAX_WORKERS,
            fault_tolerance: false,
            fault_detection_interval_ms: DEFAULT_FAULT_DETECTION_INTERVAL_MS,
            checkpoint_db: None,
            api_port: None,
            log_level: None,
            otlp_url: None,
            service_name: "vigil".to_string(),
        }
    }
}

fn parse<T>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|raw| {
        raw.trim().parse().map_err(|err| VigilError::Config {
            key: key.to_string(),
            msg: format!("{raw:?} is not valid: {err}"),
        })
    })
    .transpose()
}

impl Config {
    /// Read `VIGIL_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; keys are the `VIGIL_*` variable
    /// names. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse(
            "VIGIL_MONITORING_INTERVAL_MS",
            lookup("VIGIL_MONITORING_INTERVAL_MS"),
        )? {
            config.monitoring_interval_ms = v;
        }
        if let Some(v) = parse("VIGIL_MAX_WORKERS", lookup("VIGIL_MAX_WORKERS"))? {
            config.max_workers = v;
        }
        if let Some(v) = parse("VIGIL_FT_ENABLED", lookup("VIGIL_FT_ENABLED"))? {
            config.fault_tolerance = v;
        }
        if let Some(v) = parse(
            "VIGIL_FT_DETECTION_INTERVAL_MS",
            lookup("VIGIL_FT_DETECTION_INTERVAL_MS"),
        )? {
            config.fault_detection_interval_ms = v;
        }
        config.checkpoint_db = lookup("VIGIL_CHECKPOINT_DB").map(PathBuf::from);
        config.api_port = parse("VIGIL_API_PORT", lookup("VIGIL_API_PORT"))?;
        config.log_level = lookup("VIGIL_LOG_LEVEL");
        config.otlp_url = lookup("VIGIL_OTLP_URL");
        if let Some(name) = lookup("VIGIL_SERVICE_NAME") {
            config.service_name = name;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .reraise(&format!("error reading config file {path:?}"))?;
        let config: Self = serde_json::from_str(&text)
            .reraise(&format!("error parsing config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(VigilError::Config {
                key: "max_workers".into(),
                msg: "must be at least 1".into(),
            });
        }
        if self.fault_tolerance && self.fault_detection_interval_ms == 0 {
            return Err(VigilError::Config {
                key: "fault_detection_interval_ms".into(),
                msg: "must be positive when fault tolerance is enabled".into(),
            });
        }
        if let Some(level) = &self.log_level {
            get_log_level(level)?;
        }
        Ok(())
    }

    /// `None` when future monitoring is disabled.
    pub fn monitoring_interval(&self) -> Option<Duration> {
        u64::try_from(self.monitoring_interval_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn fault_detection_interval(&self) -> Duration {
        Duration::from_millis(self.fault_detection_interval_ms)
    }

    /// Span export settings, if an OTLP collector is configured.
    pub fn otlp(&self) -> Option<OtlpTracingConfig> {
        self.otlp_url
            .as_ref()
            .map(|url| OtlpTracingConfig::new(self.service_name.clone(), Some(url.clone())))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| env.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.monitoring_interval(), Some(Duration::from_secs(15)));
        assert_eq!(config.max_workers, 50);
        assert_eq!(config.otlp(), None);
    }

    #[test]
    fn reads_every_key() {
        let config = Config::from_lookup(lookup(&[
            ("VIGIL_MONITORING_INTERVAL_MS", "250"),
            ("VIGIL_MAX_WORKERS", "4"),
            ("VIGIL_FT_ENABLED", "true"),
            ("VIGIL_FT_DETECTION_INTERVAL_MS", "1000"),
            ("VIGIL_CHECKPOINT_DB", "/tmp/ckpts.sqlite3"),
            ("VIGIL_API_PORT", "3030"),
            ("VIGIL_LOG_LEVEL", "debug"),
            ("VIGIL_OTLP_URL", "grpc://collector:4317"),
            ("VIGIL_SERVICE_NAME", "supervisor-7"),
        ]))
        .unwrap();
        assert_eq!(config.monitoring_interval(), Some(Duration::from_millis(250)));
        assert_eq!(config.max_workers, 4);
        assert!(config.fault_tolerance);
        assert_eq!(config.fault_detection_interval(), Duration::from_secs(1));
        assert_eq!(
            config.checkpoint_db,
            Some(PathBuf::from("/tmp/ckpts.sqlite3"))
        );
        assert_eq!(config.api_port, Some(3030));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        let otlp = config.otlp().unwrap();
        assert_eq!(otlp.service_name, "supervisor-7");
        assert_eq!(otlp.url.as_deref(), Some("grpc://collector:4317"));
    }

    #[test]
    fn non_positive_interval_disables_monitoring() {
        for raw in ["0", "-5"] {
            let config =
                Config::from_lookup(lookup(&[("VIGIL_MONITORING_INTERVAL_MS", raw)])).unwrap();
            assert_eq!(config.monitoring_interval(), None);
        }
    }

    #[test]
    fn malformed_values_fail_fast() {
        for (key, raw) in [
            ("VIGIL_MONITORING_INTERVAL_MS", "soon"),
            ("VIGIL_MAX_WORKERS", "0"),
            ("VIGIL_FT_ENABLED", "maybe"),
            ("VIGIL_API_PORT", "99999"),
            ("VIGIL_LOG_LEVEL", "loud"),
        ] {
            let res = Config::from_lookup(lookup(&[(key, raw)]));
            assert!(
                matches!(res, Err(VigilError::Config { .. })),
                "{key}={raw} was accepted"
            );
        }
        let res = Config::from_lookup(lookup(&[
            ("VIGIL_FT_ENABLED", "true"),
            ("VIGIL_FT_DETECTION_INTERVAL_MS", "0"),
        ]));
        assert!(matches!(
            res,
            Err(VigilError::Config { key, .. }) if key == "fault_detection_interval_ms"
        ));
    }

    #[test]
    fn json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.json");
        std::fs::write(&path, r#"{"max_workers": 3, "api_port": 8080}"#).unwrap();
        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.api_port, Some(8080));
        assert_eq!(config.monitoring_interval_ms, 15_000);
    }
}
