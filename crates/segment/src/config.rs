//! Configuration for a domain: partition routing plus segment limits.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xemem_partition::PartitionConfig;

/// Errors that can occur while loading a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	/// The document is not valid TOML or has mistyped fields.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),
	/// The file could not be read.
	#[error("failed to read {path}: {error}")]
	Io {
		path: PathBuf,
		#[source]
		error: std::io::Error,
	},
	/// A value parsed but is out of range.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Limits of the segment manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
	/// Granularity of segment addresses, sizes and attach offsets.
	pub page_size: u64,
	/// Highest segid a `make` may request as well-known.
	pub max_wk_segid: i64,
	/// Highest per-group uniq id for segids and apids.
	pub max_uniq_id: u16,
	/// Maximum outstanding cross-domain requests.
	pub request_slots: usize,
	/// Initial bucket hint for per-group permit tables.
	pub ap_table_size: usize,
	/// Initial bucket hint for per-group attachment tables.
	pub att_table_size: usize,
}

impl Default for SegmentConfig {
	fn default() -> Self {
		Self {
			page_size: 4096,
			max_wk_segid: 25,
			max_uniq_id: 0xFFFF,
			request_slots: 64,
			ap_table_size: 8,
			att_table_size: 8,
		}
	}
}

impl SegmentConfig {
	/// Rejects values the manager cannot work with.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if !self.page_size.is_power_of_two() {
			return Err(ConfigError::Invalid(format!(
				"page_size {} is not a power of two",
				self.page_size
			)));
		}
		if self.request_slots == 0 {
			return Err(ConfigError::Invalid("request_slots must be at least 1".into()));
		}
		if !(0..=i64::from(u16::MAX)).contains(&self.max_wk_segid) {
			return Err(ConfigError::Invalid(format!(
				"max_wk_segid {} is out of range",
				self.max_wk_segid
			)));
		}
		Ok(())
	}
}

/// Full configuration of one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub partition: PartitionConfig,
	pub segment: SegmentConfig,
}

impl Config {
	/// Parses and validates a TOML document.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: Config = toml::from_str(input)?;
		config.segment.validate()?;
		Ok(config)
	}

	/// Reads and parses a TOML file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&input)
	}
}
