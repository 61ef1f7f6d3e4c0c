//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::RouteRule;

mod cli;

pub use cli::{CacheOverrides, CliArgs, Command, PurgeArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "isr";
const ENV_PREFIX: &str = "ISR";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_DIR: &str = ".isr-cache";
const DEFAULT_MAX_WORKERS: usize = 2;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 60;
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_CONTENT_DIR: &str = "content";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
    pub directory: PathBuf,
    pub max_workers: NonZeroUsize,
    pub purge_interval: Duration,
    pub default_ttl: Duration,
    pub routes: Vec<RouteRule>,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub content_dir: PathBuf,
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
        Some(Command::Purge(args)) => raw.apply_purge_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.content_dir.as_ref() {
            self.render.content_dir = Some(dir.clone());
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(directory) = overrides.directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(workers) = overrides.max_workers {
            self.cache.max_workers = Some(workers);
        }
        if let Some(seconds) = overrides.purge_interval_seconds {
            self.cache.purge_interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.default_ttl_seconds {
            self.cache.default_ttl_seconds = Some(seconds);
        }
    }

    fn apply_purge_overrides(&mut self, args: &PurgeArgs) {
        if let Some(directory) = args.directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            render,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            render: build_render_settings(render)?,
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

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = positive_seconds(graceful_secs, "server.graceful_shutdown_seconds")?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
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
    let directory = non_empty_path(cache.directory, DEFAULT_CACHE_DIR, "cache.directory")?;

    let max_workers = NonZeroUsize::new(cache.max_workers.unwrap_or(DEFAULT_MAX_WORKERS))
        .ok_or_else(|| LoadError::invalid("cache.max_workers", "must be greater than zero"))?;

    let purge_interval = positive_seconds(
        cache
            .purge_interval_seconds
            .unwrap_or(DEFAULT_PURGE_INTERVAL_SECS),
        "cache.purge_interval_seconds",
    )?;
    let default_ttl = positive_seconds(
        cache.default_ttl_seconds.unwrap_or(DEFAULT_TTL_SECS),
        "cache.default_ttl_seconds",
    )?;

    let routes = cache
        .routes
        .unwrap_or_default()
        .into_iter()
        .map(build_route_rule)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CacheSettings {
        directory,
        max_workers,
        purge_interval,
        default_ttl,
        routes,
    })
}

fn build_route_rule(rule: RouteRule) -> Result<RouteRule, LoadError> {
    if !rule.prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "cache.routes.prefix",
            format!("`{}` must start with `/`", rule.prefix),
        ));
    }
    if rule.ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.routes.ttl_seconds",
            format!("rule for `{}` must be greater than zero", rule.prefix),
        ));
    }
    Ok(rule)
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let content_dir = non_empty_path(render.content_dir, DEFAULT_CONTENT_DIR, "render.content_dir")?;
    Ok(RenderSettings { content_dir })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
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
    directory: Option<PathBuf>,
    max_workers: Option<usize>,
    purge_interval_seconds: Option<u64>,
    default_ttl_seconds: Option<u64>,
    routes: Option<Vec<RouteRule>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    content_dir: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    match value {
        Some(path) if path.as_os_str().is_empty() => {
            Err(LoadError::invalid(key, "path must not be empty"))
        }
        Some(path) => Ok(path),
        None => Ok(PathBuf::from(default)),
    }
}

#[cfg(test)]
mod tests;
