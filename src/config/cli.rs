use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the `isr` binary.
#[derive(Debug, Parser)]
#[command(name = "isr", version, about = "Stale-while-revalidate page server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ISR_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve pages through the regenerating cache.
    Serve(Box<ServeArgs>),
    /// Remove expired and unreadable cache records once, then exit.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the directory holding cache records.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub directory: Option<PathBuf>,

    /// Override the number of concurrent regeneration workers.
    #[arg(long = "cache-max-workers", value_name = "COUNT")]
    pub max_workers: Option<usize>,

    /// Override the interval between expired-record sweeps.
    #[arg(long = "cache-purge-interval-seconds", value_name = "SECONDS")]
    pub purge_interval_seconds: Option<u64>,

    /// Override the TTL for routes without a matching rule.
    #[arg(long = "cache-default-ttl-seconds", value_name = "SECONDS")]
    pub default_ttl_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

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

    /// Override the directory pages are rendered from.
    #[arg(long = "render-content-dir", value_name = "PATH")]
    pub content_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    /// Override the directory holding cache records.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub directory: Option<PathBuf>,
}
