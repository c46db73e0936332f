// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration. Every
//! field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub uart: UartConfig,

    #[serde(default)]
    pub reset: ResetConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Log level filter used by the binary.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Module-facing serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UartConfig {
    #[serde(default = "default_device")]
    pub device: PathBuf,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Depth of the bounded event queue (oldest event dropped when full).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Reset line of the module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetConfig {
    /// GPIO value file. No reset line when absent.
    #[serde(default)]
    pub gpio_value_path: Option<PathBuf>,

    /// High time and low time of the reset pulse (milliseconds).
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
}

/// Module detection handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_first_probe_timeout_ms")]
    pub first_probe_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive timeouts tolerated before detection gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// UDP tunnel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,

    /// Socket read timeout of the tunnel loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_device() -> PathBuf {
    PathBuf::from("/dev/ttyS1")
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_queue_depth() -> usize {
    20
}

fn default_pulse_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_first_probe_timeout_ms() -> u64 {
    3000
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_port() -> u16 {
    3008
}

fn default_keepalive_interval_ms() -> u64 {
    1000
}

fn default_keepalive_timeout_ms() -> u64 {
    1500
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            uart: UartConfig::default(),
            reset: ResetConfig::default(),
            detection: DetectionConfig::default(),
            tunnel: TunnelConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            gpio_value_path: None,
            pulse_ms: default_pulse_ms(),
        }
    }
}

impl ResetConfig {
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            first_probe_timeout_ms: default_first_probe_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl DetectionConfig {
    pub fn first_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.first_probe_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TunnelConfig {
    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, self.port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uart.baud_rate == 0 {
            return Err(ConfigError::Invalid("uart.baud_rate must be > 0".into()));
        }
        if self.uart.queue_depth == 0 {
            return Err(ConfigError::Invalid("uart.queue_depth must be >= 1".into()));
        }
        if self.reset.pulse_ms == 0 {
            return Err(ConfigError::Invalid("reset.pulse_ms must be > 0".into()));
        }

        let d = &self.detection;
        if d.first_probe_timeout_ms == 0 || d.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "detection timeouts must be > 0".into(),
            ));
        }
        if d.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "detection.max_retries must be >= 1".into(),
            ));
        }

        let t = &self.tunnel;
        for (name, value) in [
            ("keepalive_interval_ms", t.keepalive_interval_ms),
            ("keepalive_timeout_ms", t.keepalive_timeout_ms),
            ("poll_interval_ms", t.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("tunnel.{} must be > 0", name)));
            }
        }

        Ok(())
    }
}
