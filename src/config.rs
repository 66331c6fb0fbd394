// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = "config.toml";

/// Lowest API version that exposes the 1.2 core features acceleration
/// structures depend on (buffer device address, descriptor indexing).
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_2;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub render: RenderConfig,
    pub debug: DebugConfig,
}

/// Instance / device selection settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    pub api_version: String,
    pub validation_layers: bool,
    pub device_index: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "vk-fill".to_string(),
            api_version: "1.2".to_string(),
            validation_layers: true,
            device_index: None,
        }
    }
}

/// Output image dimensions and the value written by the fill command
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub fill_value: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            fill_value: 0.5,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "vk_fill.log".to_string(),
        }
    }
}

/// Where the active configuration came from.
///
/// Loading happens before the logger exists, so the outcome is kept here and
/// reported with `log_outcome` once logging is up.
#[derive(Debug)]
pub enum ConfigOrigin {
    File(PathBuf),
    Missing(PathBuf),
    Invalid(PathBuf, anyhow::Error),
}

impl ConfigOrigin {
    pub fn log_outcome(&self) {
        match self {
            ConfigOrigin::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigOrigin::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            ConfigOrigin::Invalid(path, e) => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e)
            }
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults if missing or broken
    pub fn load() -> (Self, ConfigOrigin) {
        Self::load_or_default(CONFIG_PATH)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, ConfigOrigin) {
        let path = path.as_ref();

        if !path.exists() {
            return (Config::default(), ConfigOrigin::Missing(path.to_path_buf()));
        }

        match Self::load_from_path(path) {
            Ok(config) => (config, ConfigOrigin::File(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigOrigin::Invalid(path.to_path_buf(), e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Requested API version as a packed Vulkan version, never below 1.2
    pub fn api_version(&self) -> u32 {
        let requested = parse_api_version(&self.device.api_version).unwrap_or_else(|| {
            log::warn!(
                "Invalid api_version '{}', defaulting to 1.2",
                self.device.api_version
            );
            MIN_API_VERSION
        });

        if requested < MIN_API_VERSION {
            log::warn!(
                "api_version {} is too old for acceleration structures, using 1.2",
                self.device.api_version
            );
            return MIN_API_VERSION;
        }

        requested
    }

    /// Get log level as a `log` filter, info when the name is unknown
    pub fn log_level(&self) -> LevelFilter {
        self.parsed_log_level().unwrap_or(LevelFilter::Info)
    }

    pub fn parsed_log_level(&self) -> Option<LevelFilter> {
        match self.debug.log_level.to_lowercase().as_str() {
            "off" => Some(LevelFilter::Off),
            "error" => Some(LevelFilter::Error),
            "warn" => Some(LevelFilter::Warn),
            "info" => Some(LevelFilter::Info),
            "debug" => Some(LevelFilter::Debug),
            "trace" => Some(LevelFilter::Trace),
            _ => None,
        }
    }
}

/// Parses "major.minor" (an optional ".patch" is accepted and ignored)
fn parse_api_version(text: &str) -> Option<u32> {
    let mut parts = text.trim().split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next()?.parse().ok()?;
    if let Some(patch) = parts.next() {
        patch.parse::<u32>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(vk::make_api_version(0, major, minor, 0))
}
