//! Load config: defaults, then file, then environment, then command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::warn;

use hmlink_core::config::{DEFAULT_HOST, DEFAULT_PORT};
use hmlink_core::{BackoffConfig, BridgeConfig, PeripheralAddress};

use crate::cli::Cli;

/// File config. Path: ~/.config/hmlink/config.toml or /etc/hmlink/config.toml.
/// Env overrides: HMLINK_HOST, HMLINK_PORT, HMLINK_RECONNECT, HMLINK_KEEP_CONNECTED.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Characteristic object path.
    #[serde(default)]
    pub characteristic: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default)]
    pub keep_connected: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Reconnect backoff ceiling; floor and step stay at one second.
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
    /// Marker sent to the client after a wake-triggered reconnect.
    #[serde(default)]
    pub wake_notice: Option<String>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_backoff_ceiling_ms() -> u64 {
    5000
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            characteristic: None,
            device: None,
            host: default_host(),
            port: default_port(),
            reconnect: false,
            keep_connected: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            wake_notice: None,
        }
    }
}

/// Load the file layer. An explicit path must exist and parse; the search path is best-effort.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<FileConfig> {
    if let Some(p) = explicit {
        let s = std::fs::read_to_string(p)
            .with_context(|| format!("cannot read config {}", p.display()))?;
        return toml::from_str(&s).with_context(|| format!("invalid config {}", p.display()));
    }
    Ok(load_file().unwrap_or_default())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hmlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/hmlink/config.toml"));
    out
}

fn load_file() -> Option<FileConfig> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    let s = match std::fs::read_to_string(&p) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %p.display(), error = %e, "config file unreadable; using defaults");
            return None;
        }
    };
    match toml::from_str::<FileConfig>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %p.display(), error = %e, "config file invalid; using defaults");
            None
        }
    }
}

/// Apply HMLINK_* overrides from the process environment.
pub fn apply_env(c: FileConfig) -> FileConfig {
    apply_env_from(c, |key| std::env::var(key).ok())
}

fn apply_env_from(mut c: FileConfig, var: impl Fn(&str) -> Option<String>) -> FileConfig {
    if let Some(s) = var("HMLINK_HOST") {
        c.host = s;
    }
    if let Some(s) = var("HMLINK_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring HMLINK_PORT"),
        }
    }
    if let Some(b) = var("HMLINK_RECONNECT").and_then(|s| parse_flag("HMLINK_RECONNECT", &s)) {
        c.reconnect = b;
    }
    if let Some(b) =
        var("HMLINK_KEEP_CONNECTED").and_then(|s| parse_flag("HMLINK_KEEP_CONNECTED", &s))
    {
        c.keep_connected = b;
    }
    c
}

fn parse_flag(key: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value, "ignoring non-boolean value");
            None
        }
    }
}

/// Apply the command line on top and validate into the bridge configuration.
pub fn resolve(file: FileConfig, cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let characteristic = cli
        .characteristic
        .clone()
        .or(file.characteristic)
        .context("no characteristic path given (use -c/--char)")?;
    let device = cli.device.clone().or(file.device);
    let address = match device {
        Some(dev) => PeripheralAddress::with_device(&characteristic, &dev),
        None => PeripheralAddress::from_channel(&characteristic),
    }
    .with_context(|| format!("invalid characteristic path {characteristic}"))?;

    let port = cli.port.unwrap_or(file.port);
    if !(1..=65534).contains(&port) {
        bail!("port {port} out of range 1..=65534");
    }

    let mut config = BridgeConfig::new(address);
    config.host = cli.host.clone().unwrap_or(file.host);
    config.port = port;
    config.reconnect = cli.reconnect || file.reconnect;
    config.keep_connected = cli.keep_connected || file.keep_connected;
    config.connect_timeout = Duration::from_millis(file.connect_timeout_ms);
    config.settle_delay = Duration::from_millis(file.settle_delay_ms);
    let ceiling = Duration::from_millis(file.backoff_ceiling_ms);
    let defaults = BackoffConfig::default();
    if ceiling < defaults.floor {
        bail!(
            "backoff_ceiling_ms {} is below the {} ms floor",
            file.backoff_ceiling_ms,
            defaults.floor.as_millis()
        );
    }
    config.reconnect_backoff = BackoffConfig::new(defaults.floor, defaults.step, ceiling);
    config.acquire_backoff = config.reconnect_backoff;
    if let Some(notice) = file.wake_notice {
        config.wake_notice = notice.into_bytes();
    }
    Ok(config)
}
