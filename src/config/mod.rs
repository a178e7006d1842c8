//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

pub use cli::{
    CliArgs, Command, ManifestArgs, ManifestBuildArgs, ManifestCommand, ManifestVerifyArgs,
    ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "kessel";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ASSET_ROOT: &str = "public";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub assets: AssetSettings,
    pub cache: CacheConfig,
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
pub struct AssetSettings {
    pub root: PathBuf,
    pub manifest_path: Option<PathBuf>,
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

    pub fn code(&self) -> &'static str {
        match self {
            Self::Build(_) => "CONFIG_BUILD",
            Self::Invalid { .. } => "CONFIG_INVALID",
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

    builder = builder.add_source(Environment::with_prefix("KESSEL").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Manifest(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    assets: RawAssetSettings,
    cache: CacheConfig,
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
        if let Some(root) = overrides.assets_root.as_ref() {
            self.assets.root = Some(root.clone());
        }
        if let Some(path) = overrides.assets_manifest.as_ref() {
            self.assets.manifest_path = Some(path.clone());
        }

        self.apply_cache_overrides(overrides);
    }

    fn apply_cache_overrides(&mut self, overrides: &ServeOverrides) {
        let cache = &mut self.cache;
        if let Some(enabled) = overrides.cache_enable_etag {
            cache.enable_etag = enabled;
        }
        if let Some(enabled) = overrides.cache_enable_sri {
            cache.enable_sri = enabled;
        }
        if let Some(strategy) = overrides.cache_etag_strategy {
            cache.etag_strategy = strategy;
        }
        if let Some(mode) = overrides.cache_csp_mode {
            cache.csp_mode = mode;
        }
        if let Some(rate) = overrides.cache_sample_rate {
            cache.sample_rate = rate;
        }
        if let Some(batch) = overrides.cache_max_invalidation_batch {
            cache.max_invalidation_batch = batch;
        }
        if let Some(threshold) = overrides.cache_predictive_threshold {
            cache.predictive_threshold = threshold;
        }
        if let Some(max) = overrides.cache_max_concurrent_requests {
            cache.max_concurrent_requests = max;
        }
        if let Some(endpoint) = overrides.cache_export_endpoint.as_ref() {
            cache.export_endpoint = Some(endpoint.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            assets,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let assets = build_asset_settings(assets);
        let cache = validate_cache_settings(cache)?;

        Ok(Self {
            server,
            logging,
            assets,
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

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_asset_settings(assets: RawAssetSettings) -> AssetSettings {
    AssetSettings {
        root: assets
            .root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSET_ROOT)),
        manifest_path: assets.manifest_path,
    }
}

fn validate_cache_settings(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    unit_interval(cache.sample_rate, "cache.sample_rate")?;
    unit_interval(cache.predictive_threshold, "cache.predictive_threshold")?;
    if !(cache.cleanup_threshold > 0.0 && cache.cleanup_threshold <= 1.0) {
        return Err(LoadError::invalid(
            "cache.cleanup_threshold",
            "must be within (0, 1]",
        ));
    }
    for (key, value) in [
        ("cache.aggregation_interval_ms", cache.aggregation_interval_ms),
        ("cache.cleanup_interval_ms", cache.cleanup_interval_ms),
        ("cache.ttl_sweep_interval_ms", cache.ttl_sweep_interval_ms),
        ("cache.max_cache_size", cache.max_cache_size),
    ] {
        if value == 0 {
            return Err(LoadError::invalid(key, "must be greater than zero"));
        }
    }
    for (key, value) in [
        ("cache.max_invalidation_batch", cache.max_invalidation_batch),
        ("cache.invalidation_queue_limit", cache.invalidation_queue_limit),
        ("cache.max_concurrent_requests", cache.max_concurrent_requests),
        ("cache.max_etag_cache_size", cache.max_etag_cache_size),
    ] {
        if value == 0 {
            return Err(LoadError::invalid(key, "must be greater than zero"));
        }
    }
    if let Some(endpoint) = cache.export_endpoint.as_deref() {
        url::Url::parse(endpoint).map_err(|err| {
            LoadError::invalid("cache.export_endpoint", format!("invalid url: {err}"))
        })?;
    }
    Ok(cache)
}

fn unit_interval(value: f64, key: &'static str) -> Result<(), LoadError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(LoadError::invalid(key, "must be within [0, 1]"))
    }
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
struct RawAssetSettings {
    root: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
