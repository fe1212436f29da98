//! Configuration file management for beacon-heatmap.
//!
//! Reads/writes `~/.beacon-heatmap/config.yaml`: grid density, signal
//! range, retention, the company table path, database path, dashboard
//! bind address, and webhook URL.

use std::path::{Path, PathBuf};

use crate::grid::{GridQuantizer, DEFAULT_HORIZONTAL_MULTIPLIER, DEFAULT_VERTICAL_MULTIPLIER};
use crate::store::StoreConfig;
use crate::types::{BeaconError, Result, SignalRange, DEFAULT_MAX_RSSI, DEFAULT_MIN_RSSI, DEFAULT_SAMPLE_SIZE};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub grid: GridConfig,
    pub signal: SignalConfig,
    pub retention: RetentionConfig,
    pub resources: ResourceConfig,
    pub database: DatabaseConfig,
    pub dashboard: DashboardConfig,
    pub webhook: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridConfig {
    pub horizontal_multiplier: f32,
    pub vertical_multiplier: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalConfig {
    pub min_rssi: i32,
    pub max_rssi: i32,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    pub max_history_per_cell: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    pub company_table: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            grid: GridConfig {
                horizontal_multiplier: DEFAULT_HORIZONTAL_MULTIPLIER,
                vertical_multiplier: DEFAULT_VERTICAL_MULTIPLIER,
            },
            signal: SignalConfig {
                min_rssi: DEFAULT_MIN_RSSI,
                max_rssi: DEFAULT_MAX_RSSI,
                sample_size: DEFAULT_SAMPLE_SIZE,
            },
            retention: RetentionConfig {
                max_history_per_cell: None,
            },
            resources: ResourceConfig {
                company_table: "data/company_ids.csv".into(),
            },
            database: DatabaseConfig {
                path: "data/beacons.db".into(),
            },
            dashboard: DashboardConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                auth_token: None,
            },
            webhook: None,
        }
    }
}

impl Config {
    /// Store settings derived from the grid, signal, and retention sections.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            quantizer: GridQuantizer::new(
                self.grid.horizontal_multiplier,
                self.grid.vertical_multiplier,
            ),
            range: SignalRange::new(self.signal.min_rssi, self.signal.max_rssi),
            max_history_per_cell: self.retention.max_history_per_cell,
        }
    }

    /// Reject settings the store cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.grid.horizontal_multiplier > 0.0 && self.grid.vertical_multiplier > 0.0) {
            return Err(BeaconError::Config(
                "grid multipliers must be positive".into(),
            ));
        }
        if self.signal.min_rssi > self.signal.max_rssi {
            return Err(BeaconError::Config(format!(
                "signal.min_rssi ({}) is above signal.max_rssi ({})",
                self.signal.min_rssi, self.signal.max_rssi
            )));
        }
        if self.retention.max_history_per_cell == Some(0) {
            return Err(BeaconError::Config(
                "retention.max_history_per_cell must be at least 1 or null".into(),
            ));
        }
        Ok(())
    }
}

/// Get the config directory path (`~/.beacon-heatmap/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".beacon-heatmap")
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.beacon-heatmap/config.yaml`, or defaults.
pub fn load_config() -> Config {
    load_config_from(&config_file())
}

/// Load config from `path`. Missing or unreadable files give defaults.
pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(_) => Config::default(),
    }
}

/// Save config to `~/.beacon-heatmap/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf> {
    let path = config_file();
    save_config_to(config, &path)?;
    Ok(path)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| BeaconError::Config(e.to_string()))?;
    }
    std::fs::write(path, serialize_config(config)).map_err(|e| BeaconError::Config(e.to_string()))
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse simple YAML-like config text. Unknown keys and bad values are ignored.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut section: Option<&str> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let indented = line.starts_with("  ") || line.starts_with('\t');
        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !indented {
            if val.is_empty() {
                section = Some(key);
            } else {
                section = None;
                if key == "webhook" {
                    config.webhook = parse_string_value(val);
                }
            }
            continue;
        }

        match (section, key) {
            (Some("grid"), "horizontal_multiplier") => {
                set_parsed(&mut config.grid.horizontal_multiplier, val)
            }
            (Some("grid"), "vertical_multiplier") => {
                set_parsed(&mut config.grid.vertical_multiplier, val)
            }
            (Some("signal"), "min_rssi") => set_parsed(&mut config.signal.min_rssi, val),
            (Some("signal"), "max_rssi") => set_parsed(&mut config.signal.max_rssi, val),
            (Some("signal"), "sample_size") => set_parsed(&mut config.signal.sample_size, val),
            (Some("retention"), "max_history_per_cell") => {
                config.retention.max_history_per_cell =
                    parse_string_value(val).and_then(|v| v.parse().ok())
            }
            (Some("resources"), "company_table") => {
                if let Some(v) = parse_string_value(val) {
                    config.resources.company_table = v;
                }
            }
            (Some("database"), "path") => {
                if let Some(v) = parse_string_value(val) {
                    config.database.path = v;
                }
            }
            (Some("dashboard"), "host") => {
                if let Some(v) = parse_string_value(val) {
                    config.dashboard.host = v;
                }
            }
            (Some("dashboard"), "port") => set_parsed(&mut config.dashboard.port, val),
            (Some("dashboard"), "auth_token") => {
                config.dashboard.auth_token = parse_string_value(val)
            }
            _ => {}
        }
    }

    config
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, val: &str) {
    if let Ok(v) = val.parse::<T>() {
        *slot = v;
    }
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn opt_line<T: std::fmt::Display>(key: &str, val: Option<T>, quote: bool) -> String {
    match val {
        Some(v) if quote => format!("  {key}: \"{v}\""),
        Some(v) => format!("  {key}: {v}"),
        None => format!("  {key}: null"),
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# beacon-heatmap configuration".to_string(), String::new()];

    lines.push("grid:".into());
    lines.push(format!("  horizontal_multiplier: {}", config.grid.horizontal_multiplier));
    lines.push(format!("  vertical_multiplier: {}", config.grid.vertical_multiplier));
    lines.push(String::new());

    lines.push("signal:".into());
    lines.push(format!("  min_rssi: {}", config.signal.min_rssi));
    lines.push(format!("  max_rssi: {}", config.signal.max_rssi));
    lines.push(format!("  sample_size: {}", config.signal.sample_size));
    lines.push(String::new());

    lines.push("retention:".into());
    lines.push(opt_line(
        "max_history_per_cell",
        config.retention.max_history_per_cell,
        false,
    ));
    lines.push(String::new());

    lines.push("resources:".into());
    lines.push(format!("  company_table: \"{}\"", config.resources.company_table));
    lines.push(String::new());

    lines.push("database:".into());
    lines.push(format!("  path: \"{}\"", config.database.path));
    lines.push(String::new());

    lines.push("dashboard:".into());
    lines.push(format!("  host: \"{}\"", config.dashboard.host));
    lines.push(format!("  port: {}", config.dashboard.port));
    lines.push(opt_line("auth_token", config.dashboard.auth_token.as_deref(), true));
    lines.push(String::new());

    match &config.webhook {
        Some(url) => lines.push(format!("webhook: \"{url}\"")),
        None => lines.push("webhook: null".into()),
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
