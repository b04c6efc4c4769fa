use serde::Deserialize;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_KODIK_BASE_URL: &str = "https://kodikapi.com";
const DEFAULT_TELEGRAM_API_BASE: &str = "http://127.0.0.1:8081";
const DEFAULT_UPLOAD_CHAT_ID: &str = "me";
const DEFAULT_TEMP_DIR: &str = "/tmp/animirror";
const DEFAULT_MIN_FILE_SIZE_BYTES: u64 = 100 * 1024;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Toml(toml::de::Error),
    InvalidValue(String),
    MissingValue(&'static str),
    MissingConfigFile(PathBuf),
    Logger(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Toml(err) => write!(f, "config parse error: {}", err),
            ConfigError::InvalidValue(message) => write!(f, "config invalid value: {}", message),
            ConfigError::MissingValue(field) => write!(f, "config missing value: {}", field),
            ConfigError::MissingConfigFile(path) => {
                write!(f, "config file not found: {}", path.display())
            }
            ConfigError::Logger(message) => write!(f, "logging init error: {}", message),
        }
    }
}

impl Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::Toml(err)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbConfig,
    pub kodik: KodikConfig,
    pub telegram: TelegramConfig,
    pub redis: RedisConfig,
    pub downloader: DownloaderConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub dsn: Option<String>,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct KodikConfig {
    pub token: Option<String>,
    pub rps_limit: u32,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub api_base: String,
    pub upload_chat_id: String,
    pub proxy_url: Option<String>,
    pub user_api_id: Option<i64>,
    pub user_api_hash: Option<String>,
    pub user_api_session_string: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub cache_ttl_secs: u64,
    pub search_cache_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub temp_dir: PathBuf,
    pub timeout_secs: u64,
    pub min_file_size_bytes: u64,
    pub max_file_size_mb: u64,
    pub ffmpeg_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkersConfig {
    pub sync_interval_secs: u64,
    pub lookback_hours: u64,
    pub ingest_batch_size: usize,
    pub concurrency: usize,
    pub upload_poll_interval_secs: u64,
    pub publish_batch_size: i64,
    pub max_download_retries: u32,
    pub queue_capacity: usize,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db: DbConfig {
                dsn: None,
                pool_size: 5,
                max_overflow: 10,
                pool_timeout_secs: 30,
            },
            kodik: KodikConfig {
                token: None,
                rps_limit: 90,
                base_url: DEFAULT_KODIK_BASE_URL.to_string(),
            },
            telegram: TelegramConfig {
                bot_token: None,
                api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
                upload_chat_id: DEFAULT_UPLOAD_CHAT_ID.to_string(),
                proxy_url: None,
                user_api_id: None,
                user_api_hash: None,
                user_api_session_string: None,
            },
            redis: RedisConfig {
                url: None,
                cache_ttl_secs: 300,
                search_cache_enabled: false,
            },
            downloader: DownloaderConfig {
                temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
                timeout_secs: 600,
                min_file_size_bytes: DEFAULT_MIN_FILE_SIZE_BYTES,
                max_file_size_mb: 2000,
                ffmpeg_path: PathBuf::from("ffmpeg"),
            },
            workers: WorkersConfig {
                sync_interval_secs: 3600,
                lookback_hours: 24,
                ingest_batch_size: 100,
                concurrency: 3,
                upload_poll_interval_secs: 5,
                publish_batch_size: 10,
                max_download_retries: 3,
                queue_capacity: 32,
                shutdown_timeout_secs: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                json: false,
            },
        }
    }
}

impl DbConfig {
    pub fn require_dsn(&self) -> Result<String, ConfigError> {
        self.dsn.clone().ok_or(ConfigError::MissingValue("POSTGRES_DSN"))
    }

    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow).max(1)
    }
}

impl TelegramConfig {
    /// The publish pipeline uploads through a user-API session; all three
    /// USER_API_* values are required. BOT_TOKEN is only for the bot
    /// front-end and is never enough here.
    pub fn require_user_session(&self) -> Result<(i64, String, String), ConfigError> {
        let api_id = self
            .user_api_id
            .ok_or(ConfigError::MissingValue("USER_API_ID"))?;
        let api_hash = self
            .user_api_hash
            .clone()
            .ok_or(ConfigError::MissingValue("USER_API_HASH"))?;
        let session_string = self
            .user_api_session_string
            .clone()
            .ok_or(ConfigError::MissingValue("USER_API_SESSION_STRING"))?;
        Ok((api_id, api_hash, session_string))
    }
}

impl AppConfig {
    pub fn load(config_override: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_from_env = env::var("ANIMIRROR_CONFIG").ok().map(PathBuf::from);
        let explicit_config = config_override.or(config_from_env);
        let explicit_requested = explicit_config.is_some();

        let config_path = if let Some(path) = explicit_config {
            Some(expand_tilde(&path))
        } else {
            let local = PathBuf::from("config.toml");
            if local.exists() { Some(local) } else { None }
        };

        if explicit_requested {
            let path = config_path
                .as_ref()
                .ok_or(ConfigError::MissingValue("ANIMIRROR_CONFIG or --config"))?;
            if !path.exists() {
                return Err(ConfigError::MissingConfigFile(path.clone()));
            }
        }

        let mut config = AppConfig::default();
        if let Some(path) = &config_path {
            let raw = fs::read_to_string(path)?;
            let file_config: FileConfig = toml::from_str(&raw)?;
            let base_dir = path.parent();
            config.apply_file(file_config, base_dir);
        }

        config.apply_env()?;
        config.validate()?;

        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig, base_dir: Option<&Path>) {
        if let Some(db) = file.db {
            if let Some(dsn) = db.dsn {
                self.db.dsn = Some(dsn);
            }
            if let Some(pool_size) = db.pool_size {
                self.db.pool_size = pool_size;
            }
            if let Some(max_overflow) = db.max_overflow {
                self.db.max_overflow = max_overflow;
            }
            if let Some(pool_timeout_secs) = db.pool_timeout_secs {
                self.db.pool_timeout_secs = pool_timeout_secs;
            }
        }

        if let Some(kodik) = file.kodik {
            if let Some(token) = kodik.token {
                self.kodik.token = Some(token);
            }
            if let Some(rps_limit) = kodik.rps_limit {
                self.kodik.rps_limit = rps_limit;
            }
            if let Some(base_url) = kodik.base_url {
                self.kodik.base_url = base_url;
            }
        }

        if let Some(telegram) = file.telegram {
            if let Some(bot_token) = telegram.bot_token {
                self.telegram.bot_token = Some(bot_token);
            }
            if let Some(api_base) = telegram.api_base {
                self.telegram.api_base = api_base;
            }
            if let Some(upload_chat_id) = telegram.upload_chat_id {
                self.telegram.upload_chat_id = upload_chat_id;
            }
            if let Some(proxy_url) = telegram.proxy_url {
                self.telegram.proxy_url = Some(proxy_url);
            }
            if let Some(user_api_id) = telegram.user_api_id {
                self.telegram.user_api_id = Some(user_api_id);
            }
            if let Some(user_api_hash) = telegram.user_api_hash {
                self.telegram.user_api_hash = Some(user_api_hash);
            }
            if let Some(session) = telegram.user_api_session_string {
                self.telegram.user_api_session_string = Some(session);
            }
        }

        if let Some(redis) = file.redis {
            if let Some(url) = redis.url {
                self.redis.url = Some(url);
            }
            if let Some(cache_ttl_secs) = redis.cache_ttl_secs {
                self.redis.cache_ttl_secs = cache_ttl_secs;
            }
            if let Some(enabled) = redis.search_cache_enabled {
                self.redis.search_cache_enabled = enabled;
            }
        }

        if let Some(downloader) = file.downloader {
            if let Some(temp_dir) = downloader.temp_dir {
                self.downloader.temp_dir = resolve_path(base_dir, &temp_dir);
            }
            if let Some(timeout_secs) = downloader.timeout_secs {
                self.downloader.timeout_secs = timeout_secs;
            }
            if let Some(min_file_size_bytes) = downloader.min_file_size_bytes {
                self.downloader.min_file_size_bytes = min_file_size_bytes;
            }
            if let Some(max_file_size_mb) = downloader.max_file_size_mb {
                self.downloader.max_file_size_mb = max_file_size_mb;
            }
            if let Some(ffmpeg_path) = downloader.ffmpeg_path {
                self.downloader.ffmpeg_path = ffmpeg_path;
            }
        }

        if let Some(workers) = file.workers {
            if let Some(sync_interval_secs) = workers.sync_interval_secs {
                self.workers.sync_interval_secs = sync_interval_secs;
            }
            if let Some(lookback_hours) = workers.lookback_hours {
                self.workers.lookback_hours = lookback_hours;
            }
            if let Some(ingest_batch_size) = workers.ingest_batch_size {
                self.workers.ingest_batch_size = ingest_batch_size;
            }
            if let Some(concurrency) = workers.concurrency {
                self.workers.concurrency = concurrency;
            }
            if let Some(upload_poll_interval_secs) = workers.upload_poll_interval_secs {
                self.workers.upload_poll_interval_secs = upload_poll_interval_secs;
            }
            if let Some(publish_batch_size) = workers.publish_batch_size {
                self.workers.publish_batch_size = publish_batch_size;
            }
            if let Some(max_download_retries) = workers.max_download_retries {
                self.workers.max_download_retries = max_download_retries;
            }
            if let Some(queue_capacity) = workers.queue_capacity {
                self.workers.queue_capacity = queue_capacity;
            }
            if let Some(shutdown_timeout_secs) = workers.shutdown_timeout_secs {
                self.workers.shutdown_timeout_secs = shutdown_timeout_secs;
            }
        }

        if let Some(logging) = file.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(file) = logging.file {
                self.logging.file = Some(resolve_path(base_dir, &file));
            }
            if let Some(json) = logging.json {
                self.logging.json = json;
            }
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        let cwd = env::current_dir().ok();

        if let Some(value) = env_var("POSTGRES_DSN") {
            self.db.dsn = Some(value);
        }
        if let Some(value) = env_var("DB_POOL_SIZE") {
            self.db.pool_size = parse_u32("DB_POOL_SIZE", &value)?;
        }
        if let Some(value) = env_var("DB_MAX_OVERFLOW") {
            self.db.max_overflow = parse_u32("DB_MAX_OVERFLOW", &value)?;
        }
        if let Some(value) = env_var("DB_POOL_TIMEOUT") {
            self.db.pool_timeout_secs = parse_u64("DB_POOL_TIMEOUT", &value)?;
        }

        if let Some(value) = env_var("KODIK_TOKEN") {
            self.kodik.token = Some(value);
        }
        if let Some(value) = env_var("KODIK_RPS_LIMIT") {
            self.kodik.rps_limit = parse_u32("KODIK_RPS_LIMIT", &value)?;
        }

        if let Some(value) = env_var("BOT_TOKEN") {
            self.telegram.bot_token = Some(value);
        }
        if let Some(value) = env_var("UPLOAD_CHAT_ID") {
            self.telegram.upload_chat_id = value;
        }
        if let Some(value) = env_var("TELEGRAM_PROXY_URL") {
            self.telegram.proxy_url = Some(value);
        }
        if let Some(value) = env_var("USER_API_ID") {
            self.telegram.user_api_id = Some(parse_i64("USER_API_ID", &value)?);
        }
        if let Some(value) = env_var("USER_API_HASH") {
            self.telegram.user_api_hash = Some(value);
        }
        if let Some(value) = env_var("USER_API_SESSION_STRING") {
            self.telegram.user_api_session_string = Some(value);
        }

        if let Some(value) = env_var("REDIS_URL") {
            self.redis.url = Some(value);
        }
        if let Some(value) = env_var("REDIS_CACHE_TTL") {
            self.redis.cache_ttl_secs = parse_u64("REDIS_CACHE_TTL", &value)?;
        }
        if let Some(value) = env_var("SEARCH_CACHE_ENABLED") {
            self.redis.search_cache_enabled = parse_bool("SEARCH_CACHE_ENABLED", &value)?;
        }

        if let Some(value) = env_var("TEMP_DIR") {
            self.downloader.temp_dir = resolve_path(cwd.as_deref(), &PathBuf::from(value));
        }
        if let Some(value) = env_var("DOWNLOAD_TIMEOUT_SECONDS") {
            self.downloader.timeout_secs = parse_u64("DOWNLOAD_TIMEOUT_SECONDS", &value)?;
        }
        if let Some(value) = env_var("MAX_FILE_SIZE_MB") {
            self.downloader.max_file_size_mb = parse_u64("MAX_FILE_SIZE_MB", &value)?;
        }

        if let Some(value) = env_var("UPLOAD_POLL_INTERVAL") {
            self.workers.upload_poll_interval_secs = parse_u64("UPLOAD_POLL_INTERVAL", &value)?;
        }
        if let Some(value) = env_var("WORKER_CONCURRENCY") {
            self.workers.concurrency = parse_u64("WORKER_CONCURRENCY", &value)? as usize;
        }
        if let Some(value) = env_var("INGEST_BATCH_SIZE") {
            self.workers.ingest_batch_size = parse_u64("INGEST_BATCH_SIZE", &value)? as usize;
        }

        if let Some(value) = env_var("LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = env_var("LOG_FILE") {
            self.logging.file = Some(resolve_path(cwd.as_deref(), &PathBuf::from(value)));
        }
        if let Some(value) = env_var("LOG_JSON") {
            self.logging.json = parse_bool("LOG_JSON", &value)?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.db.pool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "DB_POOL_SIZE must be > 0".to_string(),
            ));
        }
        if self.kodik.rps_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "KODIK_RPS_LIMIT must be > 0".to_string(),
            ));
        }
        if self.downloader.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "DOWNLOAD_TIMEOUT_SECONDS must be > 0".to_string(),
            ));
        }
        if self.workers.ingest_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "INGEST_BATCH_SIZE must be > 0".to_string(),
            ));
        }
        if self.workers.concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "WORKER_CONCURRENCY must be > 0".to_string(),
            ));
        }
        if self.workers.publish_batch_size <= 0 {
            return Err(ConfigError::InvalidValue(
                "workers.publish_batch_size must be > 0".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "workers.queue_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    db: Option<DbConfigFile>,
    kodik: Option<KodikConfigFile>,
    telegram: Option<TelegramConfigFile>,
    redis: Option<RedisConfigFile>,
    downloader: Option<DownloaderConfigFile>,
    workers: Option<WorkersConfigFile>,
    logging: Option<LoggingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DbConfigFile {
    dsn: Option<String>,
    pool_size: Option<u32>,
    max_overflow: Option<u32>,
    pool_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct KodikConfigFile {
    token: Option<String>,
    rps_limit: Option<u32>,
    base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TelegramConfigFile {
    bot_token: Option<String>,
    api_base: Option<String>,
    upload_chat_id: Option<String>,
    proxy_url: Option<String>,
    user_api_id: Option<i64>,
    user_api_hash: Option<String>,
    user_api_session_string: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RedisConfigFile {
    url: Option<String>,
    cache_ttl_secs: Option<u64>,
    search_cache_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DownloaderConfigFile {
    temp_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
    min_file_size_bytes: Option<u64>,
    max_file_size_mb: Option<u64>,
    ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkersConfigFile {
    sync_interval_secs: Option<u64>,
    lookback_hours: Option<u64>,
    ingest_batch_size: Option<usize>,
    concurrency: Option<usize>,
    upload_poll_interval_secs: Option<u64>,
    publish_batch_size: Option<i64>,
    max_download_retries: Option<u32>,
    queue_capacity: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfigFile {
    level: Option<String>,
    file: Option<PathBuf>,
    json: Option<bool>,
}

pub fn split_config_args<I>(args: I) -> Result<(Option<PathBuf>, Vec<String>), ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter.next().ok_or_else(|| {
                ConfigError::InvalidValue("missing value for --config".to_string())
            })?;
            if value.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "missing value for --config".to_string(),
                ));
            }
            config_path = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            if value.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "missing value for --config".to_string(),
                ));
            }
            config_path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    Ok((config_path, rest))
}

pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|err| ConfigError::InvalidValue(format!("invalid LOG_LEVEL: {}", err)))?;

    match &config.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .ok_or_else(|| ConfigError::InvalidValue("invalid LOG_FILE".to_string()))?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            let result = if config.json {
                tracing::subscriber::set_global_default(builder.json().finish())
            } else {
                tracing::subscriber::set_global_default(builder.finish())
            };
            result.map_err(|err| ConfigError::Logger(err.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr);
            let result = if config.json {
                tracing::subscriber::set_global_default(builder.json().finish())
            } else {
                tracing::subscriber::set_global_default(builder.finish())
            };
            result.map_err(|err| ConfigError::Logger(err.to_string()))?;
            Ok(None)
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    let normalized = value.trim().to_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!(
            "invalid {}: {}",
            key, value
        ))),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidValue(format!("invalid {}: {}", key, value)))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue(format!("invalid {}: {}", key, value)))
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| ConfigError::InvalidValue(format!("invalid {}: {}", key, value)))
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn resolve_path(base_dir: Option<&Path>, path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_relative() {
        if let Some(base) = base_dir {
            base.join(expanded)
        } else {
            expanded
        }
    } else {
        expanded
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" {
        return home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
