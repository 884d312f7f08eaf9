use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::models::SPEED_KEY;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PanelConfig {
    #[serde(default = "default_gate")]
    pub gate: TargetConfig,
    #[serde(default = "default_services")]
    pub services: Vec<TargetConfig>,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub display: DisplaySettings,
    #[serde(default)]
    pub speed_test: SpeedTestConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    pub address: String,
    /// Absent means a plain reachability probe, present means a TCP port probe.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    #[default]
    Terminal,
    Log,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DisplaySettings {
    #[serde(default)]
    pub renderer: RendererKind,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_shift_interval")]
    pub shift_interval_secs: u64,
    #[serde(default = "default_down_text")]
    pub down_text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SpeedTestConfig {
    #[serde(default = "default_download_url")]
    pub download_url: String,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    #[serde(default = "default_upload_bytes")]
    pub upload_bytes: usize,
    #[serde(default = "default_speed_timeout")]
    pub timeout_secs: u64,
}

fn default_gate() -> TargetConfig {
    TargetConfig::new("INTERNET", "8.8.8.8", Some(80))
}

fn default_services() -> Vec<TargetConfig> {
    ["NAS_GOPI", "NAS_GOKU", "PLEX"]
        .into_iter()
        .map(|name| TargetConfig::new(name, "8.8.8.8", Some(80)))
        .collect()
}

fn default_state_file() -> PathBuf { PathBuf::from("pi_monitor.json") }
fn default_poll_interval() -> u64 { 30 }
pub fn default_timeout() -> u64 { 3000 }
pub fn default_ping_count() -> u32 { 1 }
fn default_width() -> usize { 16 }
fn default_tick_ms() -> u64 { 500 }
fn default_shift_interval() -> u64 { 5 }
fn default_down_text() -> String { "----NET DOWN----".into() }
fn default_download_url() -> String { "https://speed.cloudflare.com/__down?bytes=25000000".into() }
fn default_upload_url() -> String { "https://speed.cloudflare.com/__up".into() }
fn default_upload_bytes() -> usize { 5_000_000 }
fn default_speed_timeout() -> u64 { 60 }

impl TargetConfig {
    pub fn new(name: &str, address: &str, port: Option<u16>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            ping_count: default_ping_count(),
            max_retries: 0,
        }
    }

    /// The `PORT` field as it appears in the status document.
    pub fn port_label(&self) -> String {
        self.port.map(|p| p.to_string()).unwrap_or_default()
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            renderer: RendererKind::default(),
            width: default_width(),
            tick_ms: default_tick_ms(),
            shift_interval_secs: default_shift_interval(),
            down_text: default_down_text(),
        }
    }
}

impl DisplaySettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn shift_interval(&self) -> Duration {
        Duration::from_secs(self.shift_interval_secs)
    }
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            download_url: default_download_url(),
            upload_url: default_upload_url(),
            upload_bytes: default_upload_bytes(),
            timeout_secs: default_speed_timeout(),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            gate: default_gate(),
            services: default_services(),
            state_file: default_state_file(),
            poll_interval_secs: default_poll_interval(),
            probe_timeout_ms: default_timeout(),
            display: DisplaySettings::default(),
            speed_test: SpeedTestConfig::default(),
        }
    }
}

impl PanelConfig {
    /// Reads the config file, or falls back to the built-in panel layout when
    /// the file does not exist. A file that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            info!("{} not found, using built-in panel layout", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for target in std::iter::once(&self.gate).chain(&self.services) {
            if target.name.is_empty() {
                bail!("Target names must not be empty");
            }
            if target.name == SPEED_KEY {
                bail!("Target name {} is reserved for the speed sample", SPEED_KEY);
            }
            if !seen.insert(target.name.as_str()) {
                bail!("Duplicate target name {}", target.name);
            }
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than zero");
        }
        if self.display.tick_ms == 0 || self.display.shift_interval_secs == 0 {
            bail!("display tick_ms and shift_interval_secs must be greater than zero");
        }
        if self.display.width == 0 {
            bail!("display width must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn service(&self, name: &str) -> Option<&TargetConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}
