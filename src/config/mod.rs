//! Configuration for the b2daq tools
//!
//! Loaded from a TOML file; every section and field has a default so an
//! empty file (or no file) is a valid configuration.
//!
//! # Example
//! ```ignore
//! let config = Config::load("config.toml")?;
//! let converter = RawDigitConverter::new(
//!     config.converter.clone(),
//!     config.calibration.policy.clone(),
//!     conditions,
//! );
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data_source_emulator::EmulatorConfig;
use crate::rawdata::layout::detector;
use crate::top::mapping::{BOARDSTACKS_PER_MODULE, NUM_MODULES};
use crate::top::{CalibrationPolicy, ConverterConfig, FrontEndMap, FrontEndMapping, ProdDebugConfig};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub unpacker: UnpackerConfig,
    pub converter: ConverterConfig,
    pub calibration: CalibrationConfig,
    pub emulator: EmulatorConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from a file when it exists, otherwise use defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.converter.storage_depth == 0 {
            return Err(ConfigError::invalid("converter.storage_depth", "must be positive"));
        }
        if self.converter.min_pulse_width > self.converter.max_pulse_width {
            return Err(ConfigError::invalid(
                "converter.min_pulse_width",
                "exceeds max_pulse_width",
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::invalid("pipeline.workers", "must be at least 1"));
        }
        if self.pipeline.queue_size == 0 {
            return Err(ConfigError::invalid("pipeline.queue_size", "must be at least 1"));
        }
        for entry in &self.unpacker.front_end {
            if entry.module_id == 0 || entry.module_id > NUM_MODULES {
                return Err(ConfigError::invalid(
                    "unpacker.front_end.module_id",
                    format!("{} outside 1..={}", entry.module_id, NUM_MODULES),
                ));
            }
            if entry.boardstack >= BOARDSTACKS_PER_MODULE {
                return Err(ConfigError::invalid(
                    "unpacker.front_end.boardstack",
                    format!("{} outside 0..{}", entry.boardstack, BOARDSTACKS_PER_MODULE),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unpacker
// =============================================================================

/// `[unpacker]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpackerConfig {
    /// Detector prefix the TOP unpacker is registered for
    pub top_detector_id: u32,
    /// SCROD → module/boardstack; empty uses the consecutive default layout
    pub front_end: Vec<FrontEndMapping>,
    /// Production debug decoder settings
    pub prod_debug: ProdDebugConfig,
    /// Convert raw digits into calibrated digits
    pub convert: bool,
}

impl Default for UnpackerConfig {
    fn default() -> Self {
        Self {
            top_detector_id: detector::TOP,
            front_end: Vec::new(),
            prod_debug: ProdDebugConfig::default(),
            convert: true,
        }
    }
}

impl UnpackerConfig {
    pub fn front_end_map(&self) -> FrontEndMap {
        if self.front_end.is_empty() {
            FrontEndMap::default_layout()
        } else {
            FrontEndMap::from_entries(self.front_end.iter().copied())
        }
    }
}

// =============================================================================
// Calibration
// =============================================================================

/// `[calibration]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// JSON payload file; none means every stage runs uncalibrated
    pub payloads: Option<PathBuf>,
    /// Mode per correction stage
    pub policy: CalibrationPolicy,
}

// =============================================================================
// Pipeline
// =============================================================================

/// `[pipeline]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker tasks unpacking blocks in parallel
    pub workers: usize,
    /// Capacity of each channel between stages
    pub queue_size: usize,
    /// Raw data file receiving quarantined blocks
    pub quarantine_file: Option<PathBuf>,
    /// Fill RawHeaders of blocks that arrive without them
    pub fill_raw_header: bool,
    /// Node id written when filling RawHeaders
    pub node_id: u32,
    /// Data type written when filling RawHeaders
    pub data_type: u32,
    /// Log a progress line every N blocks (0 disables)
    pub progress_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 1024,
            quarantine_file: None,
            fill_raw_header: false,
            node_id: detector::TOP | 0x01,
            data_type: 0,
            progress_interval: 10_000,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::top::CalibrationMode;

    #[test]
    fn parse_empty_config() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.converter.storage_depth, 508);
        assert_eq!(config.pipeline.workers, 4);
        assert!(config.unpacker.convert);
        assert_eq!(config.unpacker.front_end_map().len(), 64);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[unpacker]
convert = true

[[unpacker.front_end]]
scrod_id = 101
module_id = 3
boardstack = 1

[unpacker.prod_debug]
pedestal_subtracted = false

[converter]
lookback_windows = 30
window_shifts = [0, 0, 1, 1, 0, 0]
pedestal_rms = 8.5

[converter.cal_pulse]
asic_channel = 0

[calibration]
payloads = "/data/calib/top.json"

[calibration.policy]
common_t0 = "required"
time_walk = "off"

[emulator]
num_events = 50
scrod_ids = [101]
seed = 3

[pipeline]
workers = 2
quarantine_file = "/data/quarantine.b2raw"
fill_raw_header = true
"#;
        let config = Config::from_toml(toml).unwrap();

        let map = config.unpacker.front_end_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(101).map(|m| m.module_id), Some(3));
        assert!(!config.unpacker.prod_debug.pedestal_subtracted);

        assert_eq!(config.converter.lookback_windows, 30);
        assert_eq!(config.converter.window_shifts[2], 1);
        assert_eq!(config.converter.storage_depth, 508);
        assert_eq!(config.converter.cal_pulse.asic_channel, Some(0));

        assert_eq!(
            config.calibration.payloads,
            Some(PathBuf::from("/data/calib/top.json"))
        );
        assert_eq!(config.calibration.policy.common_t0, CalibrationMode::Required);
        assert_eq!(config.calibration.policy.time_walk, CalibrationMode::Off);
        assert_eq!(config.calibration.policy.channel_t0, CalibrationMode::Optional);

        assert_eq!(config.emulator.num_events, 50);
        assert_eq!(config.emulator.scrod_ids, vec![101]);
        assert_eq!(config.emulator.seed, Some(3));

        assert_eq!(config.pipeline.workers, 2);
        assert!(config.pipeline.fill_raw_header);
        assert_eq!(config.pipeline.queue_size, 1024);
    }

    #[test]
    fn reject_zero_workers() {
        let err = Config::from_toml("[pipeline]\nworkers = 0\n").unwrap_err();
        assert!(err.to_string().contains("pipeline.workers"));
    }

    #[test]
    fn reject_bad_front_end_entry() {
        let toml = r#"
[[unpacker.front_end]]
scrod_id = 1
module_id = 17
boardstack = 0
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("module_id"));
    }

    #[test]
    fn reject_bad_mode() {
        let err = Config::from_toml("[calibration.policy]\ncommon_t0 = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn load_or_default_without_file() {
        let config = Config::load_or_default("/nonexistent/b2daq.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pipeline]\nworkers = 8\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.workers, 8);
    }
}
