//! Configuration loading and parsing.
//!
//! Defines the server config schema and resolves defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::assets::STATE_DIR_NAME;

const GIB: u64 = 1024 * 1024 * 1024;

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// Bind address (host:port).
    pub bind: Option<String>,
    /// Permanent asset directory.
    pub asset_dir: Option<String>,
    /// Optional full path to the SQLite asset DB file.
    pub db_path: Option<String>,
    /// Public base URL receivers use to fetch asset streams.
    pub public_base_url: Option<String>,
    /// External resolver command.
    pub resolver: Option<ResolverConfig>,
    /// Session timing and acquisition limits.
    pub sessions: Option<SessionsConfig>,
    /// Retention and quota settings.
    pub storage: Option<StorageConfig>,
    /// Receiver transport tuning.
    pub transport: Option<TransportConfig>,
}

/// Resolver command from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ResolverConfig {
    /// Program to run, e.g. `python3`.
    pub program: Option<String>,
    /// Arguments placed before the query.
    pub args: Option<Vec<String>>,
    /// Working directory; relative output paths resolve against it.
    pub working_dir: Option<String>,
    /// Kill the resolver after this many seconds (default: 300).
    pub timeout_secs: Option<u64>,
}

/// Session settings from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct SessionsConfig {
    /// Concurrent acquisitions across all sessions (default: 3).
    pub max_concurrent_acquisitions: Option<usize>,
    /// Seconds to wait for a new connection to become ready (default: 15).
    pub join_timeout_secs: Option<u64>,
    /// Seconds to wait for a dropped connection to recover (default: 5).
    pub reconnect_timeout_secs: Option<u64>,
}

/// Storage settings from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// Retention window for scheduled sweeps in days (default: 7).
    pub retention_days: Option<u32>,
    /// Storage quota in bytes (default: 180 GiB).
    pub quota_bytes: Option<u64>,
    /// Fraction of the quota that triggers a quota sweep (default: 0.85).
    pub quota_warning_fraction: Option<f64>,
    /// Retention window used when evicting for quota (default: 1).
    pub quota_retention_days: Option<u32>,
    /// Run the scheduled sweep (default: true).
    pub sweep_enabled: Option<bool>,
    /// Hours between scheduled sweeps (default: 24).
    pub sweep_interval_hours: Option<u64>,
    /// Seconds between quota checks (default: 900).
    pub quota_check_interval_secs: Option<u64>,
}

/// Transport settings from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct TransportConfig {
    /// Receiver status poll interval in milliseconds (default: 500).
    pub poll_interval_ms: Option<u64>,
    /// Per-request timeout in milliseconds (default: 2000).
    pub request_timeout_ms: Option<u64>,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Resolved resolver command.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

/// Resolved session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_concurrent_acquisitions: usize,
    pub join_timeout: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_concurrent_acquisitions: 3,
            join_timeout: Duration::from_secs(15),
            reconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// Resolved storage policy settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub retention_days: u32,
    pub quota_bytes: u64,
    pub quota_warning_fraction: f64,
    pub quota_retention_days: u32,
    pub sweep_enabled: bool,
    pub sweep_interval: Duration,
    pub quota_check_interval: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            retention_days: 7,
            quota_bytes: 180 * GIB,
            quota_warning_fraction: 0.85,
            quota_retention_days: 1,
            sweep_enabled: true,
            sweep_interval: Duration::from_secs(24 * 3600),
            quota_check_interval: Duration::from_secs(900),
        }
    }
}

impl StorageSettings {
    /// Usage above which a quota sweep runs.
    pub fn threshold_bytes(&self) -> u64 {
        (self.quota_bytes as f64 * self.quota_warning_fraction) as u64
    }
}

/// Resolved transport settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_millis(2000),
        }
    }
}

/// Parse an optional bind address from config.
pub fn bind_from_config(cfg: &ServerConfig) -> Result<Option<SocketAddr>> {
    let Some(bind) = cfg.bind.as_deref() else {
        return Ok(None);
    };
    let addr = bind.parse().with_context(|| format!("parse bind {bind}"))?;
    Ok(Some(addr))
}

/// Extract the asset directory from config.
pub fn asset_dir_from_config(cfg: &ServerConfig) -> Result<PathBuf> {
    let dir = cfg
        .asset_dir
        .as_deref()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .ok_or_else(|| anyhow::anyhow!("asset_dir is required in config"))?;
    Ok(PathBuf::from(dir))
}

/// DB path from config, defaulting to `.music-hub/assets.sqlite` beside the
/// asset directory so the database never lands among streamable assets.
pub fn db_path_from_config(cfg: &ServerConfig, asset_dir: &Path) -> PathBuf {
    cfg.db_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let base = asset_dir.parent().unwrap_or(asset_dir);
            base.join(STATE_DIR_NAME).join("assets.sqlite")
        })
}

/// Derive public base URL from config or bind address.
pub fn public_base_url_from_config(cfg: &ServerConfig, bind: SocketAddr) -> Result<String> {
    if let Some(url) = cfg.public_base_url.as_ref() {
        return Ok(url.trim_end_matches('/').to_string());
    }

    if bind.ip().is_unspecified() {
        return Err(anyhow::anyhow!(
            "public_base_url is required when bind is 0.0.0.0"
        ));
    }

    Ok(format!("http://{}", bind))
}

/// Resolve the resolver command.
pub fn resolver_from_config(cfg: &ServerConfig) -> Result<ResolverSettings> {
    let resolver = cfg
        .resolver
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("[resolver] section is required in config"))?;
    let program = resolver
        .program
        .as_deref()
        .map(str::trim)
        .filter(|program| !program.is_empty())
        .ok_or_else(|| anyhow::anyhow!("resolver.program is required in config"))?;
    Ok(ResolverSettings {
        program: program.to_string(),
        args: resolver.args.clone().unwrap_or_default(),
        working_dir: resolver.working_dir.as_deref().map(PathBuf::from),
        timeout: Duration::from_secs(resolver.timeout_secs.unwrap_or(300)),
    })
}

/// Resolve session settings, validating limits.
pub fn sessions_from_config(cfg: &ServerConfig) -> Result<SessionSettings> {
    let defaults = SessionSettings::default();
    let Some(sessions) = cfg.sessions.as_ref() else {
        return Ok(defaults);
    };
    let max = sessions
        .max_concurrent_acquisitions
        .unwrap_or(defaults.max_concurrent_acquisitions);
    if max == 0 {
        return Err(anyhow::anyhow!(
            "sessions.max_concurrent_acquisitions must be at least 1"
        ));
    }
    Ok(SessionSettings {
        max_concurrent_acquisitions: max,
        join_timeout: sessions
            .join_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.join_timeout),
        reconnect_timeout: sessions
            .reconnect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconnect_timeout),
    })
}

/// Resolve storage settings, validating quota values.
pub fn storage_from_config(cfg: &ServerConfig) -> Result<StorageSettings> {
    let defaults = StorageSettings::default();
    let Some(storage) = cfg.storage.as_ref() else {
        return Ok(defaults);
    };
    let fraction = storage
        .quota_warning_fraction
        .unwrap_or(defaults.quota_warning_fraction);
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(anyhow::anyhow!(
            "storage.quota_warning_fraction must be in (0, 1], got {fraction}"
        ));
    }
    let quota_bytes = storage.quota_bytes.unwrap_or(defaults.quota_bytes);
    if quota_bytes == 0 {
        return Err(anyhow::anyhow!("storage.quota_bytes must be positive"));
    }
    Ok(StorageSettings {
        retention_days: storage.retention_days.unwrap_or(defaults.retention_days),
        quota_bytes,
        quota_warning_fraction: fraction,
        quota_retention_days: storage
            .quota_retention_days
            .unwrap_or(defaults.quota_retention_days),
        sweep_enabled: storage.sweep_enabled.unwrap_or(defaults.sweep_enabled),
        sweep_interval: storage
            .sweep_interval_hours
            .map(|hours| Duration::from_secs(hours.max(1) * 3600))
            .unwrap_or(defaults.sweep_interval),
        quota_check_interval: storage
            .quota_check_interval_secs
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.quota_check_interval),
    })
}

/// Resolve transport settings.
pub fn transport_from_config(cfg: &ServerConfig) -> TransportSettings {
    let defaults = TransportSettings::default();
    let Some(transport) = cfg.transport.as_ref() else {
        return defaults;
    };
    TransportSettings {
        poll_interval: transport
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval),
        request_timeout: transport
            .request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout),
    }
}
