use anyhow::Context;
use rs485_lib::{monitor::DEFAULT_WAVE_GAP, profile::DeviceProfile, protocol::BaudRate};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "rs485tool.yml";

/// Defaults for the commandline tool. Commandline options take precedence.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Serial port; auto-detected if missing.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub baud_rate: BaudRate,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_delay", with = "humantime_serde")]
    pub delay: Duration,
    #[serde(default = "default_wave_gap", with = "humantime_serde")]
    pub wave_gap: Duration,
    /// Added to, or replacing, the built-in device profiles.
    #[serde(default)]
    pub profiles: Vec<DeviceProfile>,
}

fn default_timeout() -> Duration {
    Duration::from_millis(200)
}

fn default_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_wave_gap() -> Duration {
    DEFAULT_WAVE_GAP
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            baud_rate: BaudRate::default(),
            timeout: default_timeout(),
            delay: default_delay(),
            wave_gap: default_wave_gap(),
            profiles: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid configuration")
    }
}

/// Loads `path`, or the default file if it exists. Without any file the
/// built-in defaults apply.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = config_file_path(path) else {
        log::debug!("No config file, using defaults");
        return Ok(Config::default());
    };
    log::debug!("Loading config file from {path:?}");
    let config_file =
        File::open(&path).with_context(|| format!("Cannot open config file {path:?}"))?;
    serde_yaml::from_reader(&config_file)
        .with_context(|| format!("Invalid config file {path:?}"))
}

fn config_file_path(path: Option<&Path>) -> Option<PathBuf> {
    let default_file = Path::new(DEFAULT_CONFIG_FILE);
    match (path, default_file) {
        (Some(config), _) => Some(config.to_path_buf()),
        (None, config) if config.exists() => Some(config.to_path_buf()),
        _ => None,
    }
}
