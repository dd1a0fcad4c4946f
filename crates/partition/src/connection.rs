//! Link endpoints.

use async_trait::async_trait;

use crate::{Command, Result};

/// Who sits behind a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
	/// Segment manager of this domain.
	Local,
	/// Another domain.
	Remote,
}

/// Delivers commands to whatever owns a link.
///
/// Implementations must preserve send order per link. Delivery need not
/// finish before `send` returns.
#[async_trait]
pub trait Connection: Send + Sync {
	/// Hands one command to the far end of the link.
	async fn send(&self, cmd: Command) -> Result<()>;
}
