use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{collections::HashMap, fmt, fs, str::FromStr, time::Duration};

pub const DEFAULT_BATCH_READ_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_SEQUENTIAL_READ_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_UPLOAD_CRON: &str = "0 */15 * * * *";
pub const DEFAULT_REMOTE_SYNC_CRON: &str = "0 0 * * * *";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 200;

// Built-in expressions are covered by `builtin_schedules_parse`.
static DEFAULT_UPLOAD_SCHEDULE: Lazy<CronSchedule> = Lazy::new(|| builtin(DEFAULT_UPLOAD_CRON));
static DEFAULT_REMOTE_SYNC_SCHEDULE: Lazy<CronSchedule> =
    Lazy::new(|| builtin(DEFAULT_REMOTE_SYNC_CRON));

fn builtin(expr: &str) -> CronSchedule {
    CronSchedule::parse(expr).expect("built-in cron expression is valid")
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key}: legacy interval of {minutes} minutes approximated as '{expression}'")]
    Approximated {
        key: &'static str,
        minutes: u64,
        expression: String,
    },
}

/// Where a resolved setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    Legacy,
    Override,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::Legacy => "legacy",
            Self::Override => "override",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ConfigSource,
}

/// A validated cron expression (seconds field included).
#[derive(Debug, Clone)]
pub struct CronSchedule {
    pub expression: String,
    pub schedule: cron::Schedule,
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl CronSchedule {
    /// Parse a 5-, 6- or 7-field expression. Five-field expressions get a
    /// leading `0` seconds field.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let trimmed = expr.trim();
        let expression = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule = cron::Schedule::from_str(&expression).map_err(|e| e.to_string())?;
        Ok(Self {
            expression,
            schedule,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSizePolicy {
    /// Every meter starts each cycle at the configured batch size.
    #[default]
    PerMeter,
    /// A worker carries the degraded size to its next meter within a cycle.
    PerCycle,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CollectionFileConfig {
    pub interval_seconds: Option<u64>,
    /// Legacy setting, superseded by `interval_seconds`.
    pub interval_minutes: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_shrink_attempts: Option<u32>,
    pub workers: Option<usize>,
    pub batch_size_policy: BatchSizePolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutFileConfig {
    pub batch_read_ms: Option<u64>,
    pub sequential_read_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionFileConfig {
    pub idle_timeout_seconds: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub connect_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CronJobFileConfig {
    pub cron: Option<String>,
    /// Legacy setting, superseded by `cron`.
    pub interval_minutes: Option<u64>,
    pub url: Option<String>,
    pub batch_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub database: DatabaseConfig,
    pub collection: CollectionFileConfig,
    pub timeouts: TimeoutFileConfig,
    pub connection: ConnectionFileConfig,
    pub upload: CronJobFileConfig,
    pub remote_sync: CronJobFileConfig,
    pub persistence: PersistenceConfig,
    pub metrics: Option<MetricsConfig>,
}

impl FileConfig {
    /// Read the file named by `COLLECTOR_CONFIG` (default
    /// `collector-config.toml`). A missing file yields an empty config.
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path =
            env::var("COLLECTOR_CONFIG").unwrap_or_else(|_| "collector-config.toml".to_string());
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path, "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let cfg: FileConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}

/// Environment settings captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    vars: HashMap<String, String>,
}

const ENV_KEYS: &[&str] = &[
    "DATABASE_URL",
    "COLLECTION_INTERVAL_SECONDS",
    "COLLECTION_INTERVAL_MINUTES",
    "UPLOAD_CRON",
    "UPLOAD_INTERVAL_MINUTES",
    "REMOTE_SYNC_CRON",
    "REMOTE_SYNC_INTERVAL_MINUTES",
    "BATCH_READ_TIMEOUT_MS",
    "SEQUENTIAL_READ_TIMEOUT_MS",
];

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| ENV_KEYS.contains(&k.as_str()) && !v.trim().is_empty())
            .collect();
        Self { vars }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSettings {
    pub batch_size: usize,
    pub max_shrink_attempts: u32,
    pub workers: usize,
    pub batch_size_policy: BatchSizePolicy,
    pub batch_timeout_ms: u64,
    pub sequential_timeout_ms: u64,
}

impl CollectorSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn sequential_timeout(&self) -> Duration {
        Duration::from_millis(self.sequential_timeout_ms)
    }
}

/// Number of halvings needed to bring `batch_size` down to one, plus one.
pub fn default_shrink_attempts(batch_size: usize) -> u32 {
    usize::BITS - batch_size.max(1).leading_zeros()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub idle_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub schedule: Resolved<CronSchedule>,
    pub url: Option<String>,
    pub batch_limit: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSettings {
    pub collection_interval: Resolved<Duration>,
    pub upload: JobSettings,
    pub remote_sync: JobSettings,
}

/// Immutable configuration for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_uri: Option<String>,
    pub max_connections: u32,
    pub collector: CollectorSettings,
    pub batch_timeout_source: ConfigSource,
    pub sequential_timeout_source: ConfigSource,
    pub connection: ConnectionSettings,
    pub schedule: ScheduleSettings,
    pub persistence: PersistenceConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    /// Load the file and environment, resolve, and log every warning and the
    /// source of each schedule/timeout setting.
    pub fn load() -> anyhow::Result<Self> {
        let file = FileConfig::load()?;
        let env = EnvOverrides::from_env();
        let (cfg, warnings) = resolve(&file, &env);
        for w in &warnings {
            tracing::warn!(warning = %w, "configuration value ignored");
        }
        cfg.log_sources();
        Ok(cfg)
    }

    pub fn log_sources(&self) {
        let s = &self.schedule;
        tracing::info!(
            interval_secs = s.collection_interval.value.as_secs(),
            source = %s.collection_interval.source,
            "collection schedule resolved"
        );
        tracing::info!(
            cron = %s.upload.schedule.value.expression,
            source = %s.upload.schedule.source,
            "upload schedule resolved"
        );
        tracing::info!(
            cron = %s.remote_sync.schedule.value.expression,
            source = %s.remote_sync.schedule.source,
            "remote sync schedule resolved"
        );
        tracing::info!(
            batch_timeout_ms = self.collector.batch_timeout_ms,
            batch_source = %self.batch_timeout_source,
            sequential_timeout_ms = self.collector.sequential_timeout_ms,
            sequential_source = %self.sequential_timeout_source,
            "read timeouts resolved"
        );
    }
}

/// Pure precedence function. Invalid candidates are reported as warnings
/// and the next candidate in precedence order is used.
pub fn resolve(file: &FileConfig, env: &EnvOverrides) -> (AppConfig, Vec<ConfigError>) {
    let mut warnings = Vec::new();

    let collection_interval = resolve_interval(file, env, &mut warnings);
    let upload = resolve_job(
        "upload",
        &file.upload,
        env.get("UPLOAD_CRON"),
        env.get("UPLOAD_INTERVAL_MINUTES"),
        &DEFAULT_UPLOAD_SCHEDULE,
        &mut warnings,
    );
    let remote_sync = resolve_job(
        "remote_sync",
        &file.remote_sync,
        env.get("REMOTE_SYNC_CRON"),
        env.get("REMOTE_SYNC_INTERVAL_MINUTES"),
        &DEFAULT_REMOTE_SYNC_SCHEDULE,
        &mut warnings,
    );

    let batch_timeout = resolve_positive(
        "batch_read_timeout_ms",
        env.get("BATCH_READ_TIMEOUT_MS"),
        file.timeouts.batch_read_ms,
        DEFAULT_BATCH_READ_TIMEOUT_MS,
        &mut warnings,
    );
    let sequential_timeout = resolve_positive(
        "sequential_read_timeout_ms",
        env.get("SEQUENTIAL_READ_TIMEOUT_MS"),
        file.timeouts.sequential_read_ms,
        DEFAULT_SEQUENTIAL_READ_TIMEOUT_MS,
        &mut warnings,
    );

    let batch_size = positive_or_default(
        "collection.batch_size",
        file.collection.batch_size,
        DEFAULT_BATCH_SIZE,
        &mut warnings,
    );
    let max_shrink_attempts = match file.collection.max_shrink_attempts {
        Some(0) => {
            warnings.push(invalid("collection.max_shrink_attempts", 0, "must be positive"));
            default_shrink_attempts(batch_size)
        }
        Some(k) => k,
        None => default_shrink_attempts(batch_size),
    };
    let workers = positive_or_default(
        "collection.workers",
        file.collection.workers,
        DEFAULT_WORKERS,
        &mut warnings,
    );

    let connection = ConnectionSettings {
        idle_timeout: Duration::from_secs(positive_or_default(
            "connection.idle_timeout_seconds",
            file.connection.idle_timeout_seconds,
            DEFAULT_IDLE_TIMEOUT_SECS,
            &mut warnings,
        )),
        connect_attempts: positive_or_default(
            "connection.connect_attempts",
            file.connection.connect_attempts,
            DEFAULT_CONNECT_ATTEMPTS,
            &mut warnings,
        ),
        connect_backoff: Duration::from_millis(
            file.connection
                .connect_backoff_ms
                .unwrap_or(DEFAULT_CONNECT_BACKOFF_MS),
        ),
    };

    let database_uri = env
        .get("DATABASE_URL")
        .map(str::to_string)
        .or_else(|| file.database.uri.clone());

    let cfg = AppConfig {
        database_uri,
        max_connections: file.database.max_connections.max(1),
        collector: CollectorSettings {
            batch_size,
            max_shrink_attempts,
            workers,
            batch_size_policy: file.collection.batch_size_policy,
            batch_timeout_ms: batch_timeout.value,
            sequential_timeout_ms: sequential_timeout.value,
        },
        batch_timeout_source: batch_timeout.source,
        sequential_timeout_source: sequential_timeout.source,
        connection,
        schedule: ScheduleSettings {
            collection_interval,
            upload,
            remote_sync,
        },
        persistence: file.persistence.clone(),
        metrics: file.metrics.clone(),
    };

    (cfg, warnings)
}

fn invalid(key: &'static str, value: impl ToString, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_env_u64(key: &'static str, raw: &str, warnings: &mut Vec<ConfigError>) -> Option<u64> {
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warnings.push(invalid(key, raw, "must be positive"));
            None
        }
        Ok(v) => Some(v),
        Err(e) => {
            warnings.push(invalid(key, raw, e));
            None
        }
    }
}

fn positive_or_default<T>(
    key: &'static str,
    value: Option<T>,
    default: T,
    warnings: &mut Vec<ConfigError>,
) -> T
where
    T: Copy + PartialEq + Default + ToString,
{
    match value {
        Some(v) if v == T::default() => {
            warnings.push(invalid(key, v, "must be positive"));
            default
        }
        Some(v) => v,
        None => default,
    }
}

fn resolve_positive(
    key: &'static str,
    env_value: Option<&str>,
    file_value: Option<u64>,
    default: u64,
    warnings: &mut Vec<ConfigError>,
) -> Resolved<u64> {
    if let Some(v) = env_value.and_then(|raw| parse_env_u64(key, raw, warnings)) {
        return Resolved {
            value: v,
            source: ConfigSource::Override,
        };
    }
    match file_value {
        Some(0) => warnings.push(invalid(key, 0, "must be positive")),
        Some(v) => {
            return Resolved {
                value: v,
                source: ConfigSource::Override,
            }
        }
        None => {}
    }
    Resolved {
        value: default,
        source: ConfigSource::Default,
    }
}

fn resolve_interval(
    file: &FileConfig,
    env: &EnvOverrides,
    warnings: &mut Vec<ConfigError>,
) -> Resolved<Duration> {
    const KEY: &str = "collection_interval_seconds";
    const LEGACY_KEY: &str = "collection_interval_minutes";

    let overrides = [
        env.get("COLLECTION_INTERVAL_SECONDS")
            .and_then(|raw| parse_env_u64(KEY, raw, warnings)),
        file.collection.interval_seconds.filter(|v| {
            if *v == 0 {
                warnings.push(invalid(KEY, v, "must be positive"));
            }
            *v > 0
        }),
    ];
    if let Some(secs) = overrides.into_iter().flatten().next() {
        return Resolved {
            value: Duration::from_secs(secs),
            source: ConfigSource::Override,
        };
    }

    let legacy = [
        env.get("COLLECTION_INTERVAL_MINUTES")
            .and_then(|raw| parse_env_u64(LEGACY_KEY, raw, warnings)),
        file.collection.interval_minutes.filter(|v| {
            if *v == 0 {
                warnings.push(invalid(LEGACY_KEY, v, "must be positive"));
            }
            *v > 0
        }),
    ];
    for minutes in legacy.into_iter().flatten() {
        match minutes.checked_mul(60) {
            Some(secs) => {
                return Resolved {
                    value: Duration::from_secs(secs),
                    source: ConfigSource::Legacy,
                }
            }
            None => warnings.push(invalid(LEGACY_KEY, minutes, "interval too large")),
        }
    }

    Resolved {
        value: Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS),
        source: ConfigSource::Default,
    }
}

fn resolve_job(
    key: &'static str,
    file: &CronJobFileConfig,
    env_cron: Option<&str>,
    env_minutes: Option<&str>,
    default: &CronSchedule,
    warnings: &mut Vec<ConfigError>,
) -> JobSettings {
    let schedule = resolve_cron(key, file, env_cron, env_minutes, default, warnings);
    JobSettings {
        schedule,
        url: file.url.clone().filter(|u| !u.trim().is_empty()),
        batch_limit: file.batch_limit.filter(|l| *l > 0).unwrap_or(5000),
    }
}

fn resolve_cron(
    key: &'static str,
    file: &CronJobFileConfig,
    env_cron: Option<&str>,
    env_minutes: Option<&str>,
    default: &CronSchedule,
    warnings: &mut Vec<ConfigError>,
) -> Resolved<CronSchedule> {
    for expr in [env_cron, file.cron.as_deref()].into_iter().flatten() {
        match CronSchedule::parse(expr) {
            Ok(value) => {
                return Resolved {
                    value,
                    source: ConfigSource::Override,
                }
            }
            Err(e) => warnings.push(invalid(key, expr, e)),
        }
    }

    let env_minutes = env_minutes.and_then(|raw| parse_env_u64(key, raw, warnings));
    for minutes in [env_minutes, file.interval_minutes].into_iter().flatten() {
        match minutes_to_cron(minutes) {
            Ok(conversion) => {
                if conversion.approximated {
                    warnings.push(ConfigError::Approximated {
                        key,
                        minutes,
                        expression: conversion.expression.clone(),
                    });
                }
                if let Ok(value) = CronSchedule::parse(&conversion.expression) {
                    return Resolved {
                        value,
                        source: ConfigSource::Legacy,
                    };
                }
            }
            Err(e) => warnings.push(invalid(key, minutes, e)),
        }
    }

    Resolved {
        value: default.clone(),
        source: ConfigSource::Default,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyConversion {
    pub expression: String,
    /// The interval could not be expressed exactly and was rounded.
    pub approximated: bool,
}

/// Convert a legacy minute interval to an equivalent cron expression.
pub fn minutes_to_cron(minutes: u64) -> Result<LegacyConversion, String> {
    let exact = |expression: String| LegacyConversion {
        expression,
        approximated: false,
    };

    match minutes {
        0 => Err("interval must be positive".to_string()),
        m if m < 60 && 60 % m == 0 => Ok(exact(format!("0 */{m} * * * *"))),
        m if m < 60 => Ok(LegacyConversion {
            expression: format!("0 */{m} * * * *"),
            // `*/m` restarts at each hour boundary when m does not divide 60
            approximated: true,
        }),
        m if m % 60 == 0 && m / 60 < 24 && 24 % (m / 60) == 0 => {
            Ok(exact(format!("0 0 */{} * * *", m / 60)))
        }
        1440 => Ok(exact("0 0 0 * * *".to_string())),
        m => {
            let hours = ((m as f64 / 60.0).round() as u64).clamp(1, 24);
            let expression = if hours >= 24 {
                "0 0 0 * * *".to_string()
            } else {
                format!("0 0 */{hours} * * *")
            };
            Ok(LegacyConversion {
                expression,
                approximated: true,
            })
        }
    }
}
