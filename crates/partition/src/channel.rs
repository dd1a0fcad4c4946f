//! In-memory links between partitions of one process.
//!
//! Each direction of a link is an unbounded queue of encoded command records
//! drained by a pump task that decodes them and calls [`Partition::deliver`]
//! on the receiving side, so commands on one link arrive in send order and a
//! sender never waits on its peer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{COMMAND_SIZE, Command, Connection, ConnectionKind, Error, LinkId, Partition, Result};

/// Remote connection that queues commands for a peer partition.
pub struct ChannelConnection {
	tx: mpsc::UnboundedSender<[u8; COMMAND_SIZE]>,
}

#[async_trait]
impl Connection for ChannelConnection {
	async fn send(&self, cmd: Command) -> Result<()> {
		let record = cmd.encode()?;
		self.tx.send(record).map_err(|_| Error::LinkClosed)
	}
}

/// Joins two partitions, returning the link each one uses for the other.
///
/// Must be called inside a Tokio runtime. A pump stops once the sending
/// partition drops its connection, for example on shutdown.
pub fn connect(a: &Arc<Partition>, b: &Arc<Partition>) -> Result<(LinkId, LinkId)> {
	let (to_a, from_b) = mpsc::unbounded_channel();
	let (to_b, from_a) = mpsc::unbounded_channel();

	let a_link = a.add_connection(
		ConnectionKind::Remote,
		Arc::new(ChannelConnection { tx: to_b }),
	)?;
	let b_link = match b.add_connection(
		ConnectionKind::Remote,
		Arc::new(ChannelConnection { tx: to_a }),
	) {
		Ok(link) => link,
		Err(e) => {
			let _ = a.remove_connection(a_link);
			return Err(e);
		}
	};

	tokio::spawn(pump(Arc::clone(a), a_link, from_b));
	tokio::spawn(pump(Arc::clone(b), b_link, from_a));
	Ok((a_link, b_link))
}

async fn pump(
	part: Arc<Partition>,
	link: LinkId,
	mut rx: mpsc::UnboundedReceiver<[u8; COMMAND_SIZE]>,
) {
	while let Some(record) = rx.recv().await {
		let cmd = match Command::decode(&record) {
			Ok(cmd) => cmd,
			Err(e) => {
				warn!(%link, error = %e, "undecodable record dropped");
				continue;
			}
		};
		let kind = cmd.kind;
		match part.deliver(link, cmd).await {
			Ok(()) => {}
			Err(Error::Inconsistency(reason)) => {
				error!(%link, %reason, "stopping link");
				break;
			}
			Err(e) => warn!(%link, ?kind, error = %e, "command dropped"),
		}
	}
	debug!(%link, "link pump stopped");
}
