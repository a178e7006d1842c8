use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::cache::{CspMode, EtagStrategy};

/// Command-line arguments for the Kessel binary.
#[derive(Debug, Parser)]
#[command(name = "kessel", version, about = "Kessel asset and data cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "KESSEL_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the asset root through the cache decorator.
    Serve(Box<ServeArgs>),
    /// Integrity manifest utilities.
    #[command(name = "manifest")]
    Manifest(ManifestArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
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

    /// Override the directory served as the asset root.
    #[arg(long = "assets-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub assets_root: Option<PathBuf>,

    /// Override the integrity manifest path.
    #[arg(long = "assets-manifest", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub assets_manifest: Option<PathBuf>,

    /// Toggle ETag generation.
    #[arg(
        long = "cache-enable-etag",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enable_etag: Option<bool>,

    /// Toggle integrity digests.
    #[arg(
        long = "cache-enable-sri",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enable_sri: Option<bool>,

    /// Override the validator strategy (strong|weak|hybrid).
    #[arg(long = "cache-etag-strategy", value_name = "STRATEGY")]
    pub cache_etag_strategy: Option<EtagStrategy>,

    /// Override the CSP delivery mode (header|report-only|meta|disabled).
    #[arg(long = "cache-csp-mode", value_name = "MODE")]
    pub cache_csp_mode: Option<CspMode>,

    /// Override the telemetry sample rate.
    #[arg(long = "cache-sample-rate", value_name = "RATE")]
    pub cache_sample_rate: Option<f64>,

    /// Override the invalidation batch size.
    #[arg(long = "cache-max-invalidation-batch", value_name = "COUNT")]
    pub cache_max_invalidation_batch: Option<usize>,

    /// Override the predictive warming confidence threshold.
    #[arg(long = "cache-predictive-threshold", value_name = "RATIO")]
    pub cache_predictive_threshold: Option<f64>,

    /// Override the warming concurrency.
    #[arg(long = "cache-max-concurrent-requests", value_name = "COUNT")]
    pub cache_max_concurrent_requests: Option<usize>,

    /// POST telemetry reports to this URL on every aggregation tick.
    #[arg(long = "cache-export-endpoint", value_name = "URL")]
    pub cache_export_endpoint: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ManifestArgs {
    #[command(subcommand)]
    pub command: ManifestCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ManifestCommand {
    /// Hash every file under a directory and write the manifest.
    #[command(name = "build")]
    Build(ManifestBuildArgs),
    /// Compare a directory against an existing manifest.
    #[command(name = "verify")]
    Verify(ManifestVerifyArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ManifestBuildArgs {
    /// Directory to hash.
    #[arg(value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub dir: PathBuf,

    /// Manifest file to write.
    #[arg(value_name = "OUT", value_hint = ValueHint::FilePath)]
    pub out: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct ManifestVerifyArgs {
    /// Directory to check.
    #[arg(value_name = "DIR", value_hint = ValueHint::DirPath)]
    pub dir: PathBuf,

    /// Manifest file to compare against.
    #[arg(value_name = "MANIFEST", value_hint = ValueHint::FilePath)]
    pub manifest: PathBuf,
}
