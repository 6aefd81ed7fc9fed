//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "optimist";
const ENV_PREFIX: &str = "OPTIMIST";
const DEFAULT_STALE_TIME_SECS: u64 = 5 * 60;
const DEFAULT_REFETCH_QUEUE_LIMIT: u64 = 1024;
const DEFAULT_REFETCH_BATCH_LIMIT: u64 = 100;
const DEFAULT_MUTATION_MAX_RETRIES: u32 = 1;
const DEFAULT_QUERY_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_DEMO_LATENCY_MS: u64 = 250;

/// Command-line arguments for the optimist binary.
#[derive(Debug, Parser)]
#[command(name = "optimist", version, about = "Optimistic mutation cache demo")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "OPTIMIST_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Replay a mutation scenario against an in-memory fake remote.
    Demo(DemoArgs),
    /// Print the resolved settings and exit.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// One mutation that the server accepts.
    Success,
    /// One mutation that the server rejects.
    Failure,
    /// Two overlapping mutations; the older one fails after the newer commits.
    Race,
    /// Optimistic removal of a list element, accepted then rejected.
    ListRemoval,
    /// Every scenario in order.
    All,
}

#[derive(Debug, Args, Clone)]
pub struct DemoArgs {
    /// Scenario to replay.
    #[arg(value_enum, default_value_t = Scenario::All)]
    pub scenario: Scenario,

    #[command(flatten)]
    pub overrides: RuntimeOverrides,

    /// Override the fake remote's latency.
    #[arg(long = "latency-ms", value_name = "MILLIS")]
    pub latency_ms: Option<u64>,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            scenario: Scenario::All,
            overrides: RuntimeOverrides::default(),
            latency_ms: None,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,
}

/// Overrides shared by every subcommand.
#[derive(Debug, Args, Default, Clone)]
pub struct RuntimeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how long fetched data counts as fresh.
    #[arg(long = "stale-time-seconds", value_name = "SECONDS")]
    pub stale_time_seconds: Option<u64>,

    /// Override the refetch queue capacity.
    #[arg(long = "refetch-queue-limit", value_name = "COUNT")]
    pub refetch_queue_limit: Option<u64>,

    /// Override how many refetch requests one consumption drains.
    #[arg(long = "refetch-batch-limit", value_name = "COUNT")]
    pub refetch_batch_limit: Option<u64>,

    /// Toggle immediate refetch of invalidated keys with live subscribers.
    #[arg(
        long = "refetch-active-on-invalidate",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub refetch_active_on_invalidate: Option<bool>,

    /// Override the number of retries for remote writes.
    #[arg(long = "mutation-max-retries", value_name = "COUNT")]
    pub mutation_max_retries: Option<u32>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub demo: DemoSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub stale_time: Duration,
    pub refetch_queue_limit: NonZeroUsize,
    pub refetch_batch_limit: NonZeroUsize,
    pub refetch_active_on_invalidate: bool,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub mutation_max_retries: u32,
    pub query_max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetrySettings {
    pub fn mutation_policy(&self) -> crate::cache::RetryPolicy {
        self.policy(self.mutation_max_retries)
    }

    pub fn query_policy(&self) -> crate::cache::RetryPolicy {
        self.policy(self.query_max_retries)
    }

    fn policy(&self, max_retries: u32) -> crate::cache::RetryPolicy {
        crate::cache::RetryPolicy {
            max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            ..crate::cache::RetryPolicy::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DemoSettings {
    pub latency: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Demo(args)) => {
            raw.apply_runtime_overrides(&args.overrides);
            if let Some(latency) = args.latency_ms {
                raw.demo.latency_ms = Some(latency);
            }
        }
        Some(Command::CheckConfig(args)) => raw.apply_runtime_overrides(&args.overrides),
        None => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    retry: RawRetrySettings,
    demo: RawDemoSettings,
}

impl RawSettings {
    fn apply_runtime_overrides(&mut self, overrides: &RuntimeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.stale_time_seconds {
            self.cache.stale_time_seconds = Some(seconds);
        }
        if let Some(limit) = overrides.refetch_queue_limit {
            self.cache.refetch_queue_limit = Some(limit);
        }
        if let Some(limit) = overrides.refetch_batch_limit {
            self.cache.refetch_batch_limit = Some(limit);
        }
        if let Some(enabled) = overrides.refetch_active_on_invalidate {
            self.cache.refetch_active_on_invalidate = Some(enabled);
        }
        if let Some(retries) = overrides.mutation_max_retries {
            self.retry.mutation_max_retries = Some(retries);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            retry,
            demo,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let retry = build_retry_settings(retry)?;
        let demo = build_demo_settings(demo);

        Ok(Self {
            logging,
            cache,
            retry,
            demo,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let stale_time =
        Duration::from_secs(cache.stale_time_seconds.unwrap_or(DEFAULT_STALE_TIME_SECS));
    let refetch_queue_limit = non_zero_usize(
        cache
            .refetch_queue_limit
            .unwrap_or(DEFAULT_REFETCH_QUEUE_LIMIT),
        "cache.refetch_queue_limit",
    )?;
    let refetch_batch_limit = non_zero_usize(
        cache
            .refetch_batch_limit
            .unwrap_or(DEFAULT_REFETCH_BATCH_LIMIT),
        "cache.refetch_batch_limit",
    )?;

    Ok(CacheSettings {
        stale_time,
        refetch_queue_limit,
        refetch_batch_limit,
        refetch_active_on_invalidate: cache.refetch_active_on_invalidate.unwrap_or(true),
    })
}

fn build_retry_settings(retry: RawRetrySettings) -> Result<RetrySettings, LoadError> {
    let base_delay_ms = retry.base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);
    let max_delay_ms = retry.max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS);
    if max_delay_ms < base_delay_ms {
        return Err(LoadError::invalid(
            "retry.max_delay_ms",
            format!("must be at least retry.base_delay_ms ({base_delay_ms})"),
        ));
    }

    Ok(RetrySettings {
        mutation_max_retries: retry
            .mutation_max_retries
            .unwrap_or(DEFAULT_MUTATION_MAX_RETRIES),
        query_max_retries: retry.query_max_retries.unwrap_or(DEFAULT_QUERY_MAX_RETRIES),
        base_delay: Duration::from_millis(base_delay_ms),
        max_delay: Duration::from_millis(max_delay_ms),
    })
}

fn build_demo_settings(demo: RawDemoSettings) -> DemoSettings {
    DemoSettings {
        latency: Duration::from_millis(demo.latency_ms.unwrap_or(DEFAULT_DEMO_LATENCY_MS)),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    stale_time_seconds: Option<u64>,
    refetch_queue_limit: Option<u64>,
    refetch_batch_limit: Option<u64>,
    refetch_active_on_invalidate: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetrySettings {
    mutation_max_retries: Option<u32>,
    query_max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDemoSettings {
    latency_ms: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
