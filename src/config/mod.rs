//! Configuration layer: typed settings with layered precedence (file → env → CLI).
//!
//! Settings are resolved once at process start and passed into component
//! constructors; nothing re-reads the environment at runtime.

use std::{collections::BTreeMap, num::NonZeroU32, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "refolo";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_QUEUE_BATCH_SIZE: usize = 5;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_BATCH_DEADLINE_SECS: u64 = 30;
const DEFAULT_ORIGIN_SCHEME: &str = "https";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_FRAGMENT_SUFFIX: &str = "frag";
const DEFAULT_DATA_PREFIX: &str = "_data";

/// Command-line arguments for the refolo binary.
#[derive(Debug, Parser)]
#[command(name = "refolo", version, about = "refolo revalidation pipeline")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "REFOLO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the regeneration and CDN-purge workers.
    Serve(Box<ServeArgs>),
    /// Trigger a one-shot revalidation for a path or a tag.
    Revalidate(RevalidateArgs),
    /// Run pending database migrations and exit.
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
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

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the queue receive batch size.
    #[arg(long = "queue-batch-size", value_name = "COUNT")]
    pub queue_batch_size: Option<usize>,

    /// Override the queue visibility timeout.
    #[arg(long = "queue-visibility-timeout-seconds", value_name = "SECONDS")]
    pub queue_visibility_timeout_seconds: Option<u64>,

    /// Override the receive budget before dead-lettering.
    #[arg(long = "queue-max-receive-count", value_name = "COUNT")]
    pub queue_max_receive_count: Option<u32>,

    /// Override the idle poll interval.
    #[arg(long = "queue-poll-interval-ms", value_name = "MILLIS")]
    pub queue_poll_interval_ms: Option<u64>,

    /// Override the per-batch processing deadline.
    #[arg(long = "queue-batch-deadline-seconds", value_name = "SECONDS")]
    pub queue_batch_deadline_seconds: Option<u64>,

    /// Override the origin scheme used for regeneration requests.
    #[arg(long = "regeneration-origin-scheme", value_name = "SCHEME")]
    pub regeneration_origin_scheme: Option<String>,

    /// Override the default freshness window.
    #[arg(long = "regeneration-default-ttl-seconds", value_name = "SECONDS")]
    pub regeneration_default_ttl_seconds: Option<u64>,

    /// Override the CDN control-plane endpoint.
    #[arg(long = "cdn-endpoint", value_name = "URL")]
    pub cdn_endpoint: Option<String>,

    /// Override the CDN distribution identifier.
    #[arg(long = "cdn-distribution-id", value_name = "ID")]
    pub cdn_distribution_id: Option<String>,

    /// Override the CDN control-plane region.
    #[arg(long = "cdn-region", value_name = "REGION")]
    pub cdn_region: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct RevalidateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Origin host that owns the paths being revalidated.
    #[arg(long, value_name = "HOST")]
    pub host: String,

    /// Logical path to revalidate.
    #[arg(long, value_name = "PATH")]
    pub path: Option<String>,

    /// Tag to revalidate; with --path it overrides the derived tag, alone it
    /// fans out across every path sharing the tag.
    #[arg(long, value_name = "TAG")]
    pub tag: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub queue: QueueSettings,
    pub regeneration: RegenerationSettings,
    pub cdn: CdnSettings,
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
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub poll_interval: Duration,
    pub batch_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct RegenerationSettings {
    pub origin_scheme: String,
    pub request_timeout: Duration,
    pub default_ttl: Duration,
    pub route_ttls: BTreeMap<String, Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeFailureMode {
    WholeBatch,
    PerMessage,
}

#[derive(Debug, Clone)]
pub struct CdnSettings {
    pub endpoint: Option<Url>,
    pub distribution_id: Option<String>,
    pub region: Option<String>,
    pub request_timeout: Duration,
    pub fragment_suffix: String,
    pub data_prefix: String,
    pub failure_mode: PurgeFailureMode,
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

/// Parse CLI arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("REFOLO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Revalidate(args)) => raw.apply_database_override(&args.database),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    queue: RawQueueSettings,
    regeneration: RawRegenerationSettings,
    cdn: RawCdnSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    batch_size: Option<usize>,
    visibility_timeout_seconds: Option<u64>,
    max_receive_count: Option<u32>,
    poll_interval_ms: Option<u64>,
    batch_deadline_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRegenerationSettings {
    origin_scheme: Option<String>,
    request_timeout_seconds: Option<u64>,
    default_ttl_seconds: Option<u64>,
    route_ttls: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCdnSettings {
    endpoint: Option<String>,
    distribution_id: Option<String>,
    region: Option<String>,
    request_timeout_seconds: Option<u64>,
    fragment_suffix: Option<String>,
    data_prefix: Option<String>,
    failure_mode: Option<String>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(size) = overrides.queue_batch_size {
            self.queue.batch_size = Some(size);
        }
        if let Some(seconds) = overrides.queue_visibility_timeout_seconds {
            self.queue.visibility_timeout_seconds = Some(seconds);
        }
        if let Some(count) = overrides.queue_max_receive_count {
            self.queue.max_receive_count = Some(count);
        }
        if let Some(millis) = overrides.queue_poll_interval_ms {
            self.queue.poll_interval_ms = Some(millis);
        }
        if let Some(seconds) = overrides.queue_batch_deadline_seconds {
            self.queue.batch_deadline_seconds = Some(seconds);
        }
        if let Some(scheme) = overrides.regeneration_origin_scheme.as_ref() {
            self.regeneration.origin_scheme = Some(scheme.clone());
        }
        if let Some(seconds) = overrides.regeneration_default_ttl_seconds {
            self.regeneration.default_ttl_seconds = Some(seconds);
        }
        if let Some(endpoint) = overrides.cdn_endpoint.as_ref() {
            self.cdn.endpoint = Some(endpoint.clone());
        }
        if let Some(id) = overrides.cdn_distribution_id.as_ref() {
            self.cdn.distribution_id = Some(id.clone());
        }
        if let Some(region) = overrides.cdn_region.as_ref() {
            self.cdn.region = Some(region.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            queue,
            regeneration,
            cdn,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            queue: build_queue_settings(queue)?,
            regeneration: build_regeneration_settings(regeneration)?,
            cdn: build_cdn_settings(cdn)?,
        })
    }
}

fn build_logging_settings(raw: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match raw.level.as_deref() {
        None => LevelFilter::INFO,
        Some(raw_level) => raw_level
            .parse::<LevelFilter>()
            .map_err(|err| LoadError::invalid("logging.level", err.to_string()))?,
    };
    let format = if raw.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    Ok(LoggingSettings { level, format })
}

fn build_database_settings(raw: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let max_connections = raw.max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = NonZeroU32::new(max_connections).ok_or_else(|| {
        LoadError::invalid(
            "database.max_connections",
            "pool size must be greater than zero",
        )
    })?;
    Ok(DatabaseSettings {
        url: raw.url,
        max_connections,
    })
}

fn build_queue_settings(raw: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let batch_size = raw.batch_size.unwrap_or(DEFAULT_QUEUE_BATCH_SIZE);
    if batch_size == 0 {
        return Err(LoadError::invalid(
            "queue.batch_size",
            "batch size must be greater than zero",
        ));
    }
    let visibility = raw
        .visibility_timeout_seconds
        .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS);
    if visibility == 0 {
        return Err(LoadError::invalid(
            "queue.visibility_timeout_seconds",
            "visibility timeout must be greater than zero",
        ));
    }
    let max_receive_count = raw.max_receive_count.unwrap_or(DEFAULT_MAX_RECEIVE_COUNT);
    if max_receive_count == 0 {
        return Err(LoadError::invalid(
            "queue.max_receive_count",
            "receive budget must be greater than zero",
        ));
    }

    Ok(QueueSettings {
        batch_size,
        visibility_timeout: Duration::from_secs(visibility),
        max_receive_count,
        poll_interval: Duration::from_millis(
            raw.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        ),
        batch_deadline: Duration::from_secs(
            raw.batch_deadline_seconds
                .unwrap_or(DEFAULT_BATCH_DEADLINE_SECS),
        ),
    })
}

fn build_regeneration_settings(
    raw: RawRegenerationSettings,
) -> Result<RegenerationSettings, LoadError> {
    let route_ttls = raw
        .route_ttls
        .unwrap_or_default()
        .into_iter()
        .map(|(prefix, seconds)| {
            if prefix.starts_with('/') {
                Ok((prefix, Duration::from_secs(seconds)))
            } else {
                Err(LoadError::invalid(
                    "regeneration.route_ttls",
                    format!("route prefix `{prefix}` must start with `/`"),
                ))
            }
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(RegenerationSettings {
        origin_scheme: raw
            .origin_scheme
            .unwrap_or_else(|| DEFAULT_ORIGIN_SCHEME.to_string()),
        request_timeout: Duration::from_secs(
            raw.request_timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        ),
        default_ttl: Duration::from_secs(raw.default_ttl_seconds.unwrap_or(DEFAULT_TTL_SECS)),
        route_ttls,
    })
}

fn build_cdn_settings(raw: RawCdnSettings) -> Result<CdnSettings, LoadError> {
    let endpoint = raw
        .endpoint
        .map(|endpoint| {
            Url::parse(&endpoint).map_err(|err| LoadError::invalid("cdn.endpoint", err.to_string()))
        })
        .transpose()?;

    let failure_mode = match raw.failure_mode.as_deref() {
        None | Some("whole_batch") => PurgeFailureMode::WholeBatch,
        Some("per_message") => PurgeFailureMode::PerMessage,
        Some(other) => {
            return Err(LoadError::invalid(
                "cdn.failure_mode",
                format!("expected `whole_batch` or `per_message`, got `{other}`"),
            ));
        }
    };

    Ok(CdnSettings {
        endpoint,
        distribution_id: raw.distribution_id,
        region: raw.region,
        request_timeout: Duration::from_secs(
            raw.request_timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        ),
        fragment_suffix: raw
            .fragment_suffix
            .unwrap_or_else(|| DEFAULT_FRAGMENT_SUFFIX.to_string()),
        data_prefix: raw
            .data_prefix
            .unwrap_or_else(|| DEFAULT_DATA_PREFIX.to_string()),
        failure_mode,
    })
}

#[cfg(test)]
mod tests;
