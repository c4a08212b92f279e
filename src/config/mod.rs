//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{
    AssetManifest, DEFAULT_ASSETS, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_GENERATION,
    DEFAULT_INSTALL_ATTEMPTS, DEFAULT_INSTALL_CONCURRENCY, DEFAULT_INSTALL_RETRY_BACKOFF_MS,
    DEFAULT_ORIGIN, GenerationId,
};

mod cli;

pub use cli::{
    CacheOverrides, CliArgs, Command, CommonArgs, FetchArgs, GenerationArgs, LoggingOverrides,
    ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pantry";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4173;
const DEFAULT_STORE_DIR: &str = ".pantry/store";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
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
    pub generation: GenerationId,
    pub origin: Url,
    pub manifest: AssetManifest,
    /// `None` keeps generations in memory.
    pub store_dir: Option<PathBuf>,
    pub install_concurrency: NonZeroUsize,
    pub install_attempts: NonZeroU32,
    pub install_retry_backoff: Duration,
    pub fetch_timeout: Duration,
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

    builder = builder.add_source(Environment::with_prefix("PANTRY").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Install(args)) | Some(Command::Activate(args)) => {
            raw.apply_common_overrides(&args.common);
            if let Some(generation) = args.generation.as_ref() {
                raw.cache.generation = Some(generation.clone());
            }
        }
        Some(Command::Fetch(args)) => raw.apply_common_overrides(&args.common),
        Some(Command::Generations(args)) => raw.apply_common_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }

        self.apply_common_overrides(&overrides.common);
    }

    fn apply_common_overrides(&mut self, overrides: &CommonArgs) {
        self.apply_logging_overrides(&overrides.logging);
        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(origin) = overrides.origin.as_ref() {
            self.cache.origin = Some(origin.clone());
        }
        if let Some(dir) = overrides.store_dir.as_ref() {
            self.cache.store_dir = Some(dir.clone());
        }
        if overrides.memory_store {
            self.cache.memory_store = Some(true);
        }
        if let Some(attempts) = overrides.install_attempts {
            self.cache.install_attempts = Some(attempts);
        }
        if let Some(seconds) = overrides.fetch_timeout_seconds {
            self.cache.fetch_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            server,
            logging,
            cache,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    Ok(ServerSettings { addr })
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
    let generation = cache
        .generation
        .unwrap_or_else(|| DEFAULT_GENERATION.to_string());
    let generation = GenerationId::new(generation.trim())
        .map_err(|err| LoadError::invalid("cache.generation", err.to_string()))?;

    let origin = parse_origin(cache.origin.as_deref().unwrap_or(DEFAULT_ORIGIN))
        .map_err(|reason| LoadError::invalid("cache.origin", reason))?;

    let manifest = match cache.manifest {
        Some(paths) => {
            if paths.is_empty() {
                return Err(LoadError::invalid(
                    "cache.manifest",
                    "manifest must list at least one asset",
                ));
            }
            AssetManifest::from_paths(&origin, paths.iter())
        }
        None => AssetManifest::from_paths(&origin, DEFAULT_ASSETS.iter().copied()),
    }
    .map_err(|err| LoadError::invalid("cache.manifest", err.to_string()))?;

    let store_dir = if cache.memory_store.unwrap_or(false) {
        None
    } else {
        let dir = cache
            .store_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
        if dir.as_os_str().is_empty() {
            return Err(LoadError::invalid(
                "cache.store_dir",
                "path must not be empty",
            ));
        }
        Some(dir)
    };

    let concurrency = cache
        .install_concurrency
        .unwrap_or(DEFAULT_INSTALL_CONCURRENCY);
    let install_concurrency = NonZeroUsize::new(concurrency).ok_or_else(|| {
        LoadError::invalid("cache.install_concurrency", "must be greater than zero")
    })?;

    let attempts = cache.install_attempts.unwrap_or(DEFAULT_INSTALL_ATTEMPTS);
    let install_attempts = non_zero_u32(attempts.into(), "cache.install_attempts")?;

    let install_retry_backoff = Duration::from_millis(
        cache
            .install_retry_backoff_ms
            .unwrap_or(DEFAULT_INSTALL_RETRY_BACKOFF_MS),
    );

    let timeout_secs = cache
        .fetch_timeout_seconds
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "cache.fetch_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        generation,
        origin,
        manifest,
        store_dir,
        install_concurrency,
        install_attempts,
        install_retry_backoff,
        fetch_timeout: Duration::from_secs(timeout_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
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
    generation: Option<String>,
    origin: Option<String>,
    manifest: Option<Vec<String>>,
    store_dir: Option<PathBuf>,
    memory_store: Option<bool>,
    install_concurrency: Option<usize>,
    install_attempts: Option<u32>,
    install_retry_backoff_ms: Option<u64>,
    fetch_timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Parse an http(s) origin; the path always ends with `/` so relative
/// manifest entries resolve beneath it.
fn parse_origin(value: &str) -> Result<Url, String> {
    let mut url =
        Url::parse(value.trim()).map_err(|err| format!("invalid url `{value}`: {err}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme `{}`", url.scheme()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
