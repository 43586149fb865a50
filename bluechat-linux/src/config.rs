//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use bluechat_core::SessionConfig;
use serde::Deserialize;

/// Host configuration. File: ~/.config/bluechat/config.toml or /etc/bluechat/config.toml.
/// Env overrides: BLUECHAT_SCAN_TIMEOUT_MS, BLUECHAT_CONNECT_TIMEOUT_MS,
/// BLUECHAT_READY_DELAY_MS, BLUECHAT_MTU, BLUECHAT_DISPLAY_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Scan auto-stop (default 30000 ms).
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Connection confirmation deadline (default 10000 ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Responder Connected -> Ready pause (default 500 ms).
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
    /// Link MTU (default 517).
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Name this node advertises.
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

fn default_scan_timeout_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_ready_delay_ms() -> u64 {
    500
}
fn default_mtu() -> usize {
    bluechat_core::protocol::DEFAULT_MTU
}
fn default_display_name() -> String {
    "bluechat".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ready_delay_ms: default_ready_delay_ms(),
            mtu: default_mtu(),
            display_name: default_display_name(),
        }
    }
}

impl Config {
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ready_delay: Duration::from_millis(self.ready_delay_ms),
            mtu: self.mtu,
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("BLUECHAT_SCAN_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.scan_timeout_ms = v;
        }
        if let Some(v) = var("BLUECHAT_CONNECT_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = var("BLUECHAT_READY_DELAY_MS").and_then(|s| s.parse().ok()) {
            self.ready_delay_ms = v;
        }
        if let Some(v) = var("BLUECHAT_MTU").and_then(|s| s.parse().ok()) {
            self.mtu = v;
        }
        if let Some(v) = var("BLUECHAT_DISPLAY_NAME") {
            self.display_name = v;
        }
    }
}

/// Load config: merge default, then the first config file present, then env vars.
/// A file that exists but does not parse is an error.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bluechat/config.toml"));
    }
    out.push(PathBuf::from("/etc/bluechat/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
