//! Runtime configuration
//!
//! Settings for both roles:
//! - Scan duty cycle (timeout and interval) for the central
//! - Advertising mode and transmit power for the peripheral
//! - Log level consumed by front ends

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid scan timeout: must be > 0 ms")]
    InvalidScanTimeout,

    #[error("Invalid scan interval: must be > 0 ms")]
    InvalidScanInterval,

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

// ============================================================================
// CENTRAL
// ============================================================================

/// Scan duty cycle: scan for `scan_timeout_ms`, pause for `scan_interval_ms`, repeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Length of each scanning phase in milliseconds (default 1000ms)
    pub scan_timeout_ms: u64,
    /// Pause between scanning phases in milliseconds (default 1000ms)
    pub scan_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 1000,
            scan_interval_ms: 1000,
        }
    }
}

impl ScanConfig {
    /// Create a new scan configuration
    pub fn new(scan_timeout_ms: u64, scan_interval_ms: u64) -> Result<Self, ConfigError> {
        let config = Self {
            scan_timeout_ms,
            scan_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_timeout_ms == 0 {
            return Err(ConfigError::InvalidScanTimeout);
        }
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::InvalidScanInterval);
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    pub scan: ScanConfig,
    /// Resume scanning for the same service when the peer drops the link
    pub rescan_on_remote_disconnect: bool,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            rescan_on_remote_disconnect: true,
        }
    }
}

// ============================================================================
// PERIPHERAL
// ============================================================================

/// Advertising interval trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

/// Advertising transmit power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power: TxPowerLevel,
    /// Include the transmit power level in the advertising payload
    pub include_tx_power: bool,
    pub connectable: bool,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self {
            mode: AdvertiseMode::Balanced,
            tx_power: TxPowerLevel::Medium,
            include_tx_power: false,
            connectable: true,
        }
    }
}

impl AdvertiseSettings {
    pub fn with_mode(mut self, mode: AdvertiseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tx_power(mut self, tx_power: TxPowerLevel) -> Self {
        self.tx_power = tx_power;
        self
    }

    pub fn with_include_tx_power(mut self, include: bool) -> Self {
        self.include_tx_power = include;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    pub advertise: AdvertiseSettings,
}

// ============================================================================
// TOP LEVEL
// ============================================================================

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattLinkConfig {
    pub central: CentralConfig,
    pub peripheral: PeripheralConfig,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for GattLinkConfig {
    fn default() -> Self {
        Self {
            central: CentralConfig::default(),
            peripheral: PeripheralConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl GattLinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.central.scan.validate()?;
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }

    /// Parse and validate a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: GattLinkConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
