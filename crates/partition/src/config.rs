//! Partition settings.

use serde::{Deserialize, Serialize};

/// Settings for one [`Partition`](crate::Partition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
	/// Highest link id handed out by `alloc_link`.
	pub max_link_id: i16,
	/// Initial bucket hint for the domid table.
	pub domid_table_size: usize,
	/// Initial bucket hint for the link table.
	pub link_table_size: usize,
	/// Name server discovery period in milliseconds.
	pub ping_interval_ms: u64,
}

impl Default for PartitionConfig {
	fn default() -> Self {
		Self {
			max_link_id: i16::MAX,
			domid_table_size: 32,
			link_table_size: 16,
			ping_interval_ms: 10_000,
		}
	}
}
