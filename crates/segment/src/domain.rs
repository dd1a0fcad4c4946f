//! The segment manager's link into its partition.
//!
//! Outgoing requests get a request id and a reply slot; the partition later
//! hands the matching completion to [`LocalConnection`], which fills the
//! slot. Requests from other domains arrive on the same connection and are
//! served by the manager.

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use xemem_partition::{Command, Connection, LinkId, Partition};
use xemem_table::{KeyedTable, hash_u64};

use crate::manager::SegmentManager;
use crate::{Error, Result};

struct Slots {
	last: u32,
	waiting: KeyedTable<u32, oneshot::Sender<Command>>,
}

pub(crate) struct DomainLink {
	part: Arc<Partition>,
	link: OnceLock<LinkId>,
	capacity: usize,
	slots: Mutex<Slots>,
}

impl DomainLink {
	pub(crate) fn new(part: Arc<Partition>, capacity: usize) -> Result<Self> {
		Ok(Self {
			part,
			link: OnceLock::new(),
			capacity,
			slots: Mutex::new(Slots {
				last: 0,
				waiting: KeyedTable::new(capacity, reqid_hash, u32::eq)?,
			}),
		})
	}

	pub(crate) fn bind(&self, link: LinkId) {
		if self.link.set(link).is_err() {
			warn!(%link, "segment manager link already bound");
		}
	}

	pub(crate) fn link(&self) -> Result<LinkId> {
		self.link
			.get()
			.copied()
			.ok_or(Error::Partition(xemem_partition::Error::LinkClosed))
	}

	pub(crate) fn partition(&self) -> &Arc<Partition> {
		&self.part
	}

	/// Sends `cmd` toward the name server and waits for its completion.
	///
	/// The reply slot is freed when this future finishes or is dropped.
	pub(crate) async fn request(&self, mut cmd: Command) -> Result<Command> {
		let link = self.link()?;
		self.part.get_domid().await?;

		let (reqid, rx) = self.reserve()?;
		let _slot = SlotGuard { domain: self, reqid };
		cmd.reqid = reqid;
		debug!(reqid, kind = ?cmd.kind, "request");
		self.part.deliver(link, cmd).await?;
		rx.await.map_err(|_| Error::Interrupted)
	}

	/// Sends a completion for a request served here.
	pub(crate) async fn reply(&self, cmd: Command) -> Result<()> {
		let link = self.link()?;
		self.part.deliver(link, cmd).await?;
		Ok(())
	}

	fn reserve(&self) -> Result<(u32, oneshot::Receiver<Command>)> {
		let mut slots = self.slots.lock();
		if slots.waiting.len() >= self.capacity {
			return Err(Error::Busy("request slots"));
		}
		let mut reqid = slots.last;
		loop {
			reqid = reqid.wrapping_add(1).max(1);
			if !slots.waiting.contains(&reqid) {
				break;
			}
		}
		let (tx, rx) = oneshot::channel();
		slots.waiting.insert(reqid, tx)?;
		slots.last = reqid;
		Ok((reqid, rx))
	}

	fn complete(&self, cmd: Command) {
		let waiter = self.slots.lock().waiting.remove(&cmd.reqid);
		match waiter {
			Some(tx) => {
				if tx.send(cmd).is_err() {
					debug!(reqid = cmd.reqid, "requester went away");
				}
			}
			None => warn!(reqid = cmd.reqid, kind = ?cmd.kind, "completion for unknown request"),
		}
	}

	/// Unbinds from the partition and wakes every waiting request.
	pub(crate) fn close(&self) {
		if let Some(link) = self.link.get()
			&& let Err(e) = self.part.remove_connection(*link)
		{
			debug!(%link, error = %e, "local connection already gone");
		}
		let dropped = self.slots.lock().waiting.drain();
		debug!(waiting = dropped.len(), "domain link closed");
	}

	pub(crate) fn outstanding(&self) -> usize {
		self.slots.lock().waiting.len()
	}
}

struct SlotGuard<'a> {
	domain: &'a DomainLink,
	reqid: u32,
}

impl Drop for SlotGuard<'_> {
	fn drop(&mut self) {
		self.domain.slots.lock().waiting.remove(&self.reqid);
	}
}

/// Connection registered on the local link of the partition.
pub(crate) struct LocalConnection {
	manager: Weak<SegmentManager>,
}

impl LocalConnection {
	pub(crate) fn new(manager: Weak<SegmentManager>) -> Self {
		Self { manager }
	}
}

#[async_trait]
impl Connection for LocalConnection {
	async fn send(&self, cmd: Command) -> xemem_partition::Result<()> {
		let Some(manager) = self.manager.upgrade() else {
			return Err(xemem_partition::Error::LinkClosed);
		};
		if cmd.kind.is_complete() {
			manager.domain().complete(cmd);
		} else if cmd.kind.is_request() {
			manager.serve(cmd).await;
		} else {
			warn!(kind = ?cmd.kind, "unexpected command on local link");
		}
		Ok(())
	}
}

fn reqid_hash(reqid: &u32) -> u32 {
	hash_u64(u64::from(*reqid))
}
