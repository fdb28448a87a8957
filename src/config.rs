use crate::alerts::ThresholdDefaults;
use crate::ingest::IngestSettings;
use crate::rollup::RollupSettings;
use crate::time::SensorZone;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8088";

fn setup_config_path() -> Option<PathBuf> {
    env::var("FOOTFALL_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    trigger_secret: Option<String>,
    #[serde(default)]
    listen_addr: Option<String>,
    #[serde(default)]
    lookback_minutes: Option<i64>,
    #[serde(default)]
    retention_minutes: Option<i64>,
    #[serde(default)]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    run_deadline_secs: Option<u64>,
    #[serde(default)]
    max_concurrent_sensors: Option<usize>,
    #[serde(default)]
    default_timezone: Option<String>,
    #[serde(default)]
    rollup_lookback_hours: Option<i64>,
    #[serde(default)]
    chain_rollup: Option<bool>,
    #[serde(default)]
    schedule_interval_secs: Option<u64>,
    #[serde(default)]
    min_capture_rate: Option<f64>,
    #[serde(default)]
    default_store_capacity: Option<i64>,
    #[serde(default)]
    max_queue_length: Option<i64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match parse_setup_overrides(contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn parse_setup_overrides(contents: String) -> Result<SetupConfigOverrides, simd_json::Error> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

fn env_allows(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_none()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Explicitly set env vars win; the setup file only fills what env left at default.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    if env_allows("FOOTFALL_TRIGGER_SECRET") {
        if let Some(secret) = non_empty(overrides.trigger_secret.as_deref()) {
            config.trigger_secret = Some(secret);
        }
    }
    if env_allows("FOOTFALL_LISTEN_ADDR") {
        if let Some(addr) = non_empty(overrides.listen_addr.as_deref()) {
            config.listen_addr = addr;
        }
    }
    if env_allows("FOOTFALL_LOOKBACK_MINUTES") {
        if let Some(value) = overrides.lookback_minutes.filter(|v| *v > 0) {
            config.lookback_minutes = value;
        }
    }
    if env_allows("FOOTFALL_RETENTION_MINUTES") {
        if let Some(value) = overrides.retention_minutes.filter(|v| *v > 0) {
            config.retention_minutes = value;
        }
    }
    if env_allows("FOOTFALL_REQUEST_TIMEOUT_SECS") {
        if let Some(value) = overrides.request_timeout_secs.filter(|v| *v != 0) {
            config.request_timeout_secs = value;
        }
    }
    if env_allows("FOOTFALL_RUN_DEADLINE_SECS") {
        if let Some(value) = overrides.run_deadline_secs.filter(|v| *v != 0) {
            config.run_deadline_secs = value;
        }
    }
    if env_allows("FOOTFALL_MAX_CONCURRENT_SENSORS") {
        if let Some(value) = overrides.max_concurrent_sensors.filter(|v| *v != 0) {
            config.max_concurrent_sensors = value;
        }
    }
    if env_allows("FOOTFALL_DEFAULT_TIMEZONE") {
        if let Some(zone) = non_empty(overrides.default_timezone.as_deref()) {
            config.default_timezone = zone;
        }
    }
    if env_allows("FOOTFALL_ROLLUP_LOOKBACK_HOURS") {
        if let Some(value) = overrides.rollup_lookback_hours.filter(|v| *v > 0) {
            config.rollup_lookback_hours = value;
        }
    }
    if env_allows("FOOTFALL_CHAIN_ROLLUP") {
        if let Some(value) = overrides.chain_rollup {
            config.chain_rollup = value;
        }
    }
    if env_allows("FOOTFALL_SCHEDULE_INTERVAL_SECS") {
        if let Some(value) = overrides.schedule_interval_secs {
            config.schedule_interval_secs = value;
        }
    }
    if env_allows("FOOTFALL_MIN_CAPTURE_RATE") {
        if let Some(value) = overrides.min_capture_rate.filter(|v| v.is_finite()) {
            config.min_capture_rate = value;
        }
    }
    if env_allows("FOOTFALL_DEFAULT_STORE_CAPACITY") {
        if let Some(value) = overrides.default_store_capacity {
            config.default_store_capacity = value;
        }
    }
    if env_allows("FOOTFALL_MAX_QUEUE_LENGTH") {
        if let Some(value) = overrides.max_queue_length {
            config.max_queue_length = value;
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub trigger_secret: Option<String>,
    pub listen_addr: String,
    pub lookback_minutes: i64,
    pub retention_minutes: i64,
    pub request_timeout_secs: u64,
    pub run_deadline_secs: u64,
    pub max_concurrent_sensors: usize,
    pub default_timezone: String,
    pub rollup_lookback_hours: i64,
    pub chain_rollup: bool,
    pub schedule_interval_secs: u64,
    pub min_capture_rate: f64,
    pub default_store_capacity: i64,
    pub max_queue_length: i64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env::var("FOOTFALL_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.database_url.as_deref()))
            })
            .context("FOOTFALL_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("FOOTFALL_DB_POOL_SIZE", 10),
            trigger_secret: non_empty(env::var("FOOTFALL_TRIGGER_SECRET").ok().as_deref()),
            listen_addr: env::var("FOOTFALL_LISTEN_ADDR")
                .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string()),
            lookback_minutes: env_parse("FOOTFALL_LOOKBACK_MINUTES", 120),
            retention_minutes: env_parse("FOOTFALL_RETENTION_MINUTES", 120),
            request_timeout_secs: env_parse("FOOTFALL_REQUEST_TIMEOUT_SECS", 25),
            run_deadline_secs: env_parse("FOOTFALL_RUN_DEADLINE_SECS", 60),
            max_concurrent_sensors: env_parse("FOOTFALL_MAX_CONCURRENT_SENSORS", 8),
            default_timezone: env::var("FOOTFALL_DEFAULT_TIMEZONE")
                .unwrap_or_else(|_| "UTC".to_string()),
            rollup_lookback_hours: env_parse("FOOTFALL_ROLLUP_LOOKBACK_HOURS", 48),
            chain_rollup: env_flag("FOOTFALL_CHAIN_ROLLUP", true),
            schedule_interval_secs: env_parse("FOOTFALL_SCHEDULE_INTERVAL_SECS", 0),
            min_capture_rate: env_parse("FOOTFALL_MIN_CAPTURE_RATE", 0.05),
            default_store_capacity: env_parse("FOOTFALL_DEFAULT_STORE_CAPACITY", 200),
            max_queue_length: env_parse("FOOTFALL_MAX_QUEUE_LENGTH", 8),
            otlp_endpoint: non_empty(env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().as_deref()),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }

        Ok(config)
    }

    pub fn require_trigger_secret(&self) -> Result<String> {
        self.trigger_secret
            .clone()
            .context("FOOTFALL_TRIGGER_SECRET is required to serve the trigger endpoints")
    }

    pub fn default_zone(&self) -> Result<SensorZone> {
        SensorZone::parse(&self.default_timezone).with_context(|| {
            format!(
                "FOOTFALL_DEFAULT_TIMEZONE is not a known zone or offset: {}",
                self.default_timezone
            )
        })
    }

    pub fn ingest_settings(&self) -> Result<IngestSettings> {
        Ok(IngestSettings {
            lookback: chrono::Duration::minutes(self.lookback_minutes.max(1)),
            retention: chrono::Duration::minutes(self.retention_minutes.max(1)),
            run_deadline: Duration::from_secs(self.run_deadline_secs.max(1)),
            max_concurrency: self.max_concurrent_sensors.max(1),
            default_zone: self.default_zone()?,
        })
    }

    pub fn rollup_settings(&self) -> RollupSettings {
        RollupSettings {
            lookback: chrono::Duration::hours(self.rollup_lookback_hours.max(1)),
            max_concurrency: self.max_concurrent_sensors.max(1),
        }
    }

    pub fn threshold_defaults(&self) -> ThresholdDefaults {
        ThresholdDefaults {
            capacity: self.default_store_capacity,
            min_capture_rate: self.min_capture_rate,
            max_queue_length: self.max_queue_length,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// `None` when scheduling is left to an external trigger.
    pub fn schedule_interval(&self) -> Option<Duration> {
        (self.schedule_interval_secs > 0).then(|| Duration::from_secs(self.schedule_interval_secs))
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            database_url: "postgresql://localhost/footfall".to_string(),
            db_pool_size: 10,
            trigger_secret: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            lookback_minutes: 120,
            retention_minutes: 120,
            request_timeout_secs: 25,
            run_deadline_secs: 60,
            max_concurrent_sensors: 8,
            default_timezone: "UTC".to_string(),
            rollup_lookback_hours: 48,
            chain_rollup: true,
            schedule_interval_secs: 0,
            min_capture_rate: 0.05,
            default_store_capacity: 200,
            max_queue_length: 8,
            otlp_endpoint: None,
        }
    }

    #[test]
    fn strips_sqlalchemy_driver_prefixes() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg://u:p@db/footfall".to_string()),
            "postgresql://u:p@db/footfall"
        );
        assert_eq!(
            normalize_database_url("postgres://db/footfall".to_string()),
            "postgres://db/footfall"
        );
    }

    #[test]
    fn setup_file_fills_unset_options() {
        let overrides = parse_setup_overrides(
            r#"{"trigger_secret":" s3cret ","max_concurrent_sensors":3,"chain_rollup":false,"default_timezone":"Asia/Tokyo","unknown":1}"#
                .to_string(),
        )
        .unwrap();
        let mut config = base();
        apply_setup_overrides(&mut config, &overrides);

        assert_eq!(config.trigger_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.max_concurrent_sensors, 3);
        assert!(!config.chain_rollup);
        assert!(config.default_zone().is_ok());
        assert_eq!(config.lookback_minutes, 120);
    }

    #[test]
    fn zero_values_in_setup_file_are_ignored() {
        let overrides =
            parse_setup_overrides(r#"{"run_deadline_secs":0,"lookback_minutes":-5}"#.to_string())
                .unwrap();
        let mut config = base();
        apply_setup_overrides(&mut config, &overrides);
        assert_eq!(config.run_deadline_secs, 60);
        assert_eq!(config.lookback_minutes, 120);
    }

    #[test]
    fn derived_settings_follow_config() {
        let mut config = base();
        config.schedule_interval_secs = 300;
        config.default_timezone = "+09:00".to_string();

        let ingest = config.ingest_settings().unwrap();
        assert_eq!(ingest.lookback, chrono::Duration::minutes(120));
        assert_eq!(ingest.run_deadline, Duration::from_secs(60));
        assert_eq!(config.schedule_interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.threshold_defaults().capacity, 200);
        assert_eq!(config.rollup_settings().lookback, chrono::Duration::hours(48));
    }

    #[test]
    fn unknown_default_zone_is_a_config_error() {
        let mut config = base();
        config.default_timezone = "Mars/Olympus".to_string();
        assert!(config.ingest_settings().is_err());
        assert_eq!(base().schedule_interval(), None);
    }
}
