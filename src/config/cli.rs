use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the pantry binary.
#[derive(Debug, Parser)]
#[command(
    name = "pantry",
    version,
    about = "Offline-first asset cache for the dairy storefront"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PANTRY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Install and activate the configured generation, then serve the offline proxy.
    Serve(Box<ServeArgs>),
    /// Fetch the asset manifest into a generation without activating it.
    Install(GenerationArgs),
    /// Promote a generation and delete every other stored generation.
    Activate(GenerationArgs),
    /// Run one fetch through the cache and report where it was served from.
    Fetch(FetchArgs),
    /// List stored generations.
    Generations(CommonArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
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
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the storefront origin assets are fetched from.
    #[arg(long = "origin", value_name = "URL", value_hint = ValueHint::Url)]
    pub origin: Option<String>,

    /// Override the directory holding persisted generations.
    #[arg(long = "store-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub store_dir: Option<PathBuf>,

    /// Keep generations in memory only.
    #[arg(long = "memory-store", action = clap::ArgAction::SetTrue)]
    pub memory_store: bool,

    /// Override the number of install attempts.
    #[arg(long = "install-attempts", value_name = "COUNT")]
    pub install_attempts: Option<u32>,

    /// Override the network request timeout.
    #[arg(long = "fetch-timeout-seconds", value_name = "SECONDS")]
    pub fetch_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CommonArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    #[command(flatten)]
    pub logging: LoggingOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GenerationArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Generation to operate on; defaults to the configured generation.
    #[arg(long = "generation", value_name = "ID")]
    pub generation: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Path or absolute URL to fetch.
    #[arg(value_name = "PATH")]
    pub path: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Override the proxy listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the proxy listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,
}
