//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::browser::PoolSettings;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "platen";
const ENV_PREFIX: &str = "PLATEN";

const DEFAULT_POOL_MIN_SIZE: usize = 1;
const DEFAULT_POOL_MAX_SIZE: usize = 4;
const DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POOL_MAX_RENDERS_PER_INSTANCE: u32 = 100;
const DEFAULT_QUEUE_BOOTSTRAP_SERVERS: &str = "localhost:9092";
const DEFAULT_QUEUE_CONSUMER_GROUP: &str = "platen-renderers";
const DEFAULT_QUEUE_REQUEST_TOPIC: &str = "render.requests";
const DEFAULT_QUEUE_RESULT_TOPIC: &str = "render.results";
const DEFAULT_QUEUE_DEAD_LETTER_TOPIC: &str = "render.deadletter";
const DEFAULT_QUEUE_MAX_RETRIES: u32 = 3;
const DEFAULT_QUEUE_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_QUEUE_POLL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_QUEUE_MAX_CONCURRENT_RENDERS: usize = 4;
const DEFAULT_PDF_OUTPUT_DIR: &str = "rendered";
const DEFAULT_TEMPLATES_DIR: &str = "templates";
const DEFAULT_FILES_CONCURRENCY: usize = 4;

/// Command-line arguments for the platen binary.
#[derive(Debug, Parser)]
#[command(name = "platen", version, about = "Document render service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PLATEN_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Consume render requests from the message broker.
    Serve(Box<ServeArgs>),
    /// Render every template JSON under a directory.
    #[command(name = "render-dir")]
    RenderDir(RenderDirArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PoolOverrides {
    /// Override the number of warm browsers kept during reaping.
    #[arg(long = "pool-min-size", value_name = "COUNT")]
    pub min_size: Option<usize>,

    /// Override the browser pool capacity.
    #[arg(long = "pool-max-size", value_name = "COUNT")]
    pub max_size: Option<usize>,

    /// Override the lease acquire timeout.
    #[arg(long = "pool-acquire-timeout-seconds", value_name = "SECONDS")]
    pub acquire_timeout_seconds: Option<u64>,

    /// Override the idle reap age; 0 disables the reaper.
    #[arg(long = "pool-idle-timeout-seconds", value_name = "SECONDS")]
    pub idle_timeout_seconds: Option<u64>,

    /// Override the per-browser render budget; 0 disables recycling.
    #[arg(long = "pool-max-renders-per-instance", value_name = "COUNT")]
    pub max_renders_per_instance: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub pool: PoolOverrides,

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

    /// Override the broker bootstrap servers.
    #[arg(long = "queue-bootstrap-servers", value_name = "SERVERS")]
    pub queue_bootstrap_servers: Option<String>,

    /// Override the consumer group id.
    #[arg(long = "queue-consumer-group-id", value_name = "GROUP")]
    pub queue_consumer_group_id: Option<String>,

    /// Override the number of concurrent renders.
    #[arg(long = "queue-max-concurrent-renders", value_name = "COUNT")]
    pub queue_max_concurrent_renders: Option<usize>,

    /// Override the directory used for non-inline PDF replies.
    #[arg(long = "queue-pdf-output-path", value_name = "PATH")]
    pub queue_pdf_output_path: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderDirArgs {
    #[command(flatten)]
    pub pool: PoolOverrides,

    /// Directory scanned recursively for template JSON files.
    #[arg(value_name = "TEMPLATES_DIR", value_hint = ValueHint::DirPath)]
    pub templates_dir: Option<PathBuf>,

    /// Directory receiving the rendered PDFs.
    #[arg(long = "output-dir", value_name = "PATH")]
    pub output_dir: Option<PathBuf>,

    /// Maximum number of templates rendered at once.
    #[arg(long, value_name = "COUNT")]
    pub concurrency: Option<usize>,
}

/// Fully-resolved deployment settings after precedence resolution and
/// validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub browser_pool: PoolSettings,
    pub queue: QueueSettings,
    pub files: FileSettings,
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
pub struct QueueSettings {
    pub bootstrap_servers: String,
    pub consumer_group_id: String,
    pub request_topic: String,
    pub result_topic: String,
    pub dead_letter_topic: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub poll_timeout: Duration,
    pub max_concurrent_renders: usize,
    pub pdf_output_path: PathBuf,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: DEFAULT_QUEUE_BOOTSTRAP_SERVERS.to_string(),
            consumer_group_id: DEFAULT_QUEUE_CONSUMER_GROUP.to_string(),
            request_topic: DEFAULT_QUEUE_REQUEST_TOPIC.to_string(),
            result_topic: DEFAULT_QUEUE_RESULT_TOPIC.to_string(),
            dead_letter_topic: DEFAULT_QUEUE_DEAD_LETTER_TOPIC.to_string(),
            max_retries: DEFAULT_QUEUE_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_QUEUE_RETRY_DELAY_MS),
            poll_timeout: Duration::from_millis(DEFAULT_QUEUE_POLL_TIMEOUT_MS),
            max_concurrent_renders: DEFAULT_QUEUE_MAX_CONCURRENT_RENDERS,
            pdf_output_path: PathBuf::from(DEFAULT_PDF_OUTPUT_DIR),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileSettings {
    pub templates_dir: PathBuf,
    pub output_dir: PathBuf,
    pub concurrency: usize,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from(DEFAULT_TEMPLATES_DIR),
            output_dir: PathBuf::from(DEFAULT_PDF_OUTPUT_DIR),
            concurrency: DEFAULT_FILES_CONCURRENCY,
        }
    }
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
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::RenderDir(args)) => raw.apply_render_dir_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both
/// for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    browser_pool: RawBrowserPoolSettings,
    queue: RawQueueSettings,
    files: RawFileSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(servers) = overrides.queue_bootstrap_servers.as_ref() {
            self.queue.bootstrap_servers = Some(servers.clone());
        }
        if let Some(group) = overrides.queue_consumer_group_id.as_ref() {
            self.queue.consumer_group_id = Some(group.clone());
        }
        if let Some(limit) = overrides.queue_max_concurrent_renders {
            self.queue.max_concurrent_renders = Some(limit);
        }
        if let Some(path) = overrides.queue_pdf_output_path.as_ref() {
            self.queue.pdf_output_path = Some(path.clone());
        }
        self.apply_pool_overrides(&overrides.pool);
    }

    fn apply_render_dir_overrides(&mut self, args: &RenderDirArgs) {
        if let Some(directory) = args.templates_dir.as_ref() {
            self.files.templates_dir = Some(directory.clone());
        }
        if let Some(directory) = args.output_dir.as_ref() {
            self.files.output_dir = Some(directory.clone());
        }
        if let Some(limit) = args.concurrency {
            self.files.concurrency = Some(limit);
        }
        self.apply_pool_overrides(&args.pool);
    }

    fn apply_pool_overrides(&mut self, overrides: &PoolOverrides) {
        if let Some(size) = overrides.min_size {
            self.browser_pool.min_size = Some(size);
        }
        if let Some(size) = overrides.max_size {
            self.browser_pool.max_size = Some(size);
        }
        if let Some(seconds) = overrides.acquire_timeout_seconds {
            self.browser_pool.acquire_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.idle_timeout_seconds {
            self.browser_pool.idle_timeout_seconds = Some(seconds);
        }
        if let Some(budget) = overrides.max_renders_per_instance {
            self.browser_pool.max_renders_per_instance = Some(budget);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            browser_pool,
            queue,
            files,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            browser_pool: build_pool_settings(browser_pool)?,
            queue: build_queue_settings(queue)?,
            files: build_file_settings(files)?,
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

fn build_pool_settings(pool: RawBrowserPoolSettings) -> Result<PoolSettings, LoadError> {
    let min_size = pool.min_size.unwrap_or(DEFAULT_POOL_MIN_SIZE);
    let max_size = pool.max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE);
    if max_size == 0 {
        return Err(LoadError::invalid(
            "browser_pool.max_size",
            "must be greater than zero",
        ));
    }
    if min_size > max_size {
        return Err(LoadError::invalid(
            "browser_pool.min_size",
            format!("must not exceed max_size ({max_size})"),
        ));
    }

    let acquire_seconds = pool
        .acquire_timeout_seconds
        .unwrap_or(DEFAULT_POOL_ACQUIRE_TIMEOUT_SECS);
    if acquire_seconds == 0 {
        return Err(LoadError::invalid(
            "browser_pool.acquire_timeout_seconds",
            "must be greater than zero",
        ));
    }

    // Zero disables the idle reaper.
    let idle_seconds = pool
        .idle_timeout_seconds
        .unwrap_or(DEFAULT_POOL_IDLE_TIMEOUT_SECS);
    let idle_timeout = (idle_seconds > 0).then(|| Duration::from_secs(idle_seconds));

    Ok(PoolSettings {
        min_size,
        max_size,
        acquire_timeout: Duration::from_secs(acquire_seconds),
        idle_timeout,
        max_renders_per_instance: pool
            .max_renders_per_instance
            .unwrap_or(DEFAULT_POOL_MAX_RENDERS_PER_INSTANCE),
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let max_concurrent_renders = queue
        .max_concurrent_renders
        .unwrap_or(DEFAULT_QUEUE_MAX_CONCURRENT_RENDERS);
    if max_concurrent_renders == 0 {
        return Err(LoadError::invalid(
            "queue.max_concurrent_renders",
            "must be greater than zero",
        ));
    }

    let defaults = QueueSettings::default();
    Ok(QueueSettings {
        bootstrap_servers: queue
            .bootstrap_servers
            .unwrap_or(defaults.bootstrap_servers),
        consumer_group_id: queue
            .consumer_group_id
            .unwrap_or(defaults.consumer_group_id),
        request_topic: queue.request_topic.unwrap_or(defaults.request_topic),
        result_topic: queue.result_topic.unwrap_or(defaults.result_topic),
        dead_letter_topic: queue
            .dead_letter_topic
            .unwrap_or(defaults.dead_letter_topic),
        max_retries: queue.max_retries.unwrap_or(DEFAULT_QUEUE_MAX_RETRIES),
        retry_delay: Duration::from_millis(
            queue.retry_delay_ms.unwrap_or(DEFAULT_QUEUE_RETRY_DELAY_MS),
        ),
        poll_timeout: Duration::from_millis(
            queue
                .poll_timeout_ms
                .unwrap_or(DEFAULT_QUEUE_POLL_TIMEOUT_MS),
        ),
        max_concurrent_renders,
        pdf_output_path: queue.pdf_output_path.unwrap_or(defaults.pdf_output_path),
        security_protocol: queue.security_protocol,
        sasl_mechanism: queue.sasl_mechanism,
        sasl_username: queue.sasl_username,
        sasl_password: queue.sasl_password,
    })
}

fn build_file_settings(files: RawFileSettings) -> Result<FileSettings, LoadError> {
    let concurrency = files.concurrency.unwrap_or(DEFAULT_FILES_CONCURRENCY);
    if concurrency == 0 {
        return Err(LoadError::invalid(
            "files.concurrency",
            "must be greater than zero",
        ));
    }

    let defaults = FileSettings::default();
    Ok(FileSettings {
        templates_dir: files.templates_dir.unwrap_or(defaults.templates_dir),
        output_dir: files.output_dir.unwrap_or(defaults.output_dir),
        concurrency,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBrowserPoolSettings {
    min_size: Option<usize>,
    max_size: Option<usize>,
    acquire_timeout_seconds: Option<u64>,
    idle_timeout_seconds: Option<u64>,
    max_renders_per_instance: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    bootstrap_servers: Option<String>,
    consumer_group_id: Option<String>,
    request_topic: Option<String>,
    result_topic: Option<String>,
    dead_letter_topic: Option<String>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
    max_concurrent_renders: Option<usize>,
    pdf_output_path: Option<PathBuf>,
    security_protocol: Option<String>,
    sasl_mechanism: Option<String>,
    sasl_username: Option<String>,
    sasl_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFileSettings {
    templates_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    concurrency: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.browser_pool.min_size, 1);
        assert_eq!(settings.browser_pool.max_size, 4);
        assert_eq!(settings.browser_pool.acquire_timeout, Duration::from_secs(30));
        assert_eq!(
            settings.browser_pool.idle_timeout,
            Some(Duration::from_secs(300))
        );
        assert_eq!(settings.browser_pool.max_renders_per_instance, 100);
        assert_eq!(settings.queue.max_retries, 3);
        assert_eq!(settings.queue.max_concurrent_renders, 4);
        assert_eq!(settings.files.concurrency, 4);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.browser_pool.max_size = Some(8);
        raw.logging.level = Some("info".to_string());

        let overrides = ServeOverrides {
            pool: PoolOverrides {
                max_size: Some(2),
                ..PoolOverrides::default()
            },
            log_level: Some("debug".to_string()),
            ..ServeOverrides::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.browser_pool.max_size, 2);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn zero_idle_timeout_disables_the_reaper() {
        let mut raw = RawSettings::default();
        raw.browser_pool.idle_timeout_seconds = Some(0);

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.browser_pool.idle_timeout, None);
    }

    #[test]
    fn zero_pool_capacity_is_rejected() {
        let mut raw = RawSettings::default();
        raw.browser_pool.max_size = Some(0);

        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key: "browser_pool.max_size", .. })
        ));
    }

    #[test]
    fn min_size_may_not_exceed_max_size() {
        let mut raw = RawSettings::default();
        raw.browser_pool.min_size = Some(5);
        raw.browser_pool.max_size = Some(2);

        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..ServeOverrides::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["platen"]);
        assert!(args.command.is_none());
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "platen",
            "serve",
            "--queue-bootstrap-servers",
            "broker-1:9092,broker-2:9092",
            "--pool-max-size",
            "6",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(
                    serve.overrides.queue_bootstrap_servers.as_deref(),
                    Some("broker-1:9092,broker-2:9092")
                );
                assert_eq!(serve.overrides.pool.max_size, Some(6));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_render_dir_arguments() {
        let args = CliArgs::parse_from([
            "platen",
            "render-dir",
            "/srv/templates",
            "--output-dir",
            "/srv/out",
            "--concurrency",
            "8",
        ]);

        match args.command.expect("render-dir command") {
            Command::RenderDir(render) => {
                assert_eq!(
                    render.templates_dir,
                    Some(PathBuf::from("/srv/templates"))
                );
                assert_eq!(render.output_dir, Some(PathBuf::from("/srv/out")));
                assert_eq!(render.concurrency, Some(8));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn render_dir_overrides_apply_to_file_settings() {
        let mut raw = RawSettings::default();
        let args = CliArgs::parse_from(["platen", "render-dir", "/srv/templates"]);
        let Some(Command::RenderDir(render)) = args.command else {
            panic!("wrong command parsed");
        };

        raw.apply_render_dir_overrides(&render);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.files.templates_dir, PathBuf::from("/srv/templates"));
        assert_eq!(settings.files.output_dir, PathBuf::from(DEFAULT_PDF_OUTPUT_DIR));
    }
}
