//! Per-domain link and route registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xemem_table::{KeyedTable, hash_u64};

use crate::forward::Forwarder;
use crate::{
	Command, CommandKind, Connection, ConnectionKind, DomId, Error, LinkId, PartitionConfig,
	Result,
};

/// Command processor of the root domain.
///
/// The name server allocates domain ids and resolves which domain owns a
/// segment. Its logic lives outside this crate; the partition only hands it
/// every command that arrives.
#[async_trait]
pub trait NameService: Send + Sync {
	/// Processes a command that arrived on `link`.
	async fn deliver(&self, partition: &Partition, link: LinkId, cmd: Command) -> Result<()>;
}

struct ConnectionRecord {
	kind: ConnectionKind,
	conn: Arc<dyn Connection>,
}

struct PartitionState {
	domid: Option<DomId>,
	local_link: Option<LinkId>,
	last_link: i16,
	domid_map: KeyedTable<DomId, LinkId>,
	link_map: KeyedTable<LinkId, ConnectionRecord>,
}

enum Role {
	NameServer(Arc<dyn NameService>),
	Forwarding(Forwarder),
}

/// Link registry and command router for one domain.
///
/// # Concurrency
///
/// Both tables and the domain id sit under one `parking_lot` mutex that is
/// never held across an await. Sends happen after the lock is released, so
/// a connection may re-enter the partition from `send`.
pub struct Partition {
	config: PartitionConfig,
	state: Mutex<PartitionState>,
	role: Role,
	shutdown: CancellationToken,
}

impl Partition {
	/// Creates the root partition, whose domain id is always
	/// [`DomId::NAME_SERVER`].
	pub fn name_server(config: PartitionConfig, ns: Arc<dyn NameService>) -> Result<Arc<Self>> {
		Self::new(config, Some(DomId::NAME_SERVER), Role::NameServer(ns))
	}

	/// Creates a non-root partition that acquires its domain id on demand.
	pub fn forwarding(config: PartitionConfig) -> Result<Arc<Self>> {
		Self::new(config, None, Role::Forwarding(Forwarder::new()))
	}

	fn new(config: PartitionConfig, domid: Option<DomId>, role: Role) -> Result<Arc<Self>> {
		let state = PartitionState {
			domid,
			local_link: None,
			last_link: 0,
			domid_map: KeyedTable::new(config.domid_table_size, domid_hash, DomId::eq)?,
			link_map: KeyedTable::new(config.link_table_size, link_hash, LinkId::eq)?,
		};
		Ok(Arc::new(Self {
			config,
			state: Mutex::new(state),
			role,
			shutdown: CancellationToken::new(),
		}))
	}

	/// Returns `true` for the root partition.
	pub fn is_name_server(&self) -> bool {
		matches!(self.role, Role::NameServer(_))
	}

	/// This domain's id, once assigned.
	pub fn domid(&self) -> Option<DomId> {
		self.state.lock().domid
	}

	/// Link of the local segment manager.
	pub fn local_link(&self) -> Option<LinkId> {
		self.state.lock().local_link
	}

	/// Links that lead to other domains.
	pub fn remote_links(&self) -> Vec<LinkId> {
		let state = self.state.lock();
		let mut links: Vec<LinkId> = state
			.link_map
			.iter()
			.filter(|(_, rec)| rec.kind == ConnectionKind::Remote)
			.map(|(link, _)| *link)
			.collect();
		links.sort();
		links
	}

	/// Reserves the next link id.
	pub fn alloc_link(&self) -> Result<LinkId> {
		let mut state = self.state.lock();
		self.next_link(&mut state)
	}

	fn next_link(&self, state: &mut PartitionState) -> Result<LinkId> {
		if state.last_link >= self.config.max_link_id {
			return Err(Error::LinkExhausted);
		}
		state.last_link += 1;
		Ok(LinkId(state.last_link))
	}

	/// Routes `domid` through `link`, replacing any previous route.
	///
	/// # Errors
	///
	/// Fails with [`Error::UnknownLink`] if `link` has no connection.
	pub fn add_domid(&self, domid: DomId, link: LinkId) -> Result<()> {
		let mut state = self.state.lock();
		if !state.link_map.contains(&link) {
			return Err(Error::UnknownLink(link));
		}
		if state.domid_map.change(&domid, link).is_none() {
			state.domid_map.insert(domid, link)?;
		}
		Ok(())
	}

	/// Link that leads to `domid`.
	pub fn lookup_domid(&self, domid: DomId) -> Option<LinkId> {
		self.state.lock().domid_map.search(&domid).copied()
	}

	/// Forgets the route to `domid`, returning the link it used.
	pub fn remove_domid(&self, domid: DomId) -> Option<LinkId> {
		self.state.lock().domid_map.remove(&domid)
	}

	/// Registers a connection under a fresh link.
	///
	/// A local connection becomes the local link and, if this domain already
	/// has an id, immediately receives the route for it.
	pub fn add_connection(
		&self,
		kind: ConnectionKind,
		conn: Arc<dyn Connection>,
	) -> Result<LinkId> {
		let mut state = self.state.lock();
		if kind == ConnectionKind::Local
			&& let Some(existing) = state.local_link
		{
			return Err(Error::LocalLinkTaken(existing));
		}

		let link = self.next_link(&mut state)?;
		state.link_map.insert(link, ConnectionRecord { kind, conn })?;

		if kind == ConnectionKind::Local {
			state.local_link = Some(link);
			if let Some(domid) = state.domid
				&& let Err(e) = state.domid_map.insert(domid, link)
			{
				state.link_map.remove(&link);
				state.local_link = None;
				return Err(e.into());
			}
		}
		debug!(%link, ?kind, "connection added");
		Ok(link)
	}

	/// Drops the connection on `link` and every route through it.
	pub fn remove_connection(&self, link: LinkId) -> Result<()> {
		let record = {
			let mut state = self.state.lock();
			let record = state
				.link_map
				.remove(&link)
				.ok_or(Error::UnknownLink(link))?;
			if state.local_link == Some(link) {
				state.local_link = None;
			}
			state.domid_map.retain(|_, l| *l != link);
			record
		};
		debug!(%link, kind = ?record.kind, "connection removed");
		Ok(())
	}

	/// Hands `cmd` to the connection registered on `link`.
	pub async fn send_cmd(&self, link: LinkId, cmd: Command) -> Result<()> {
		let conn = {
			let state = self.state.lock();
			let record = state.link_map.search(&link).ok_or(Error::UnknownLink(link))?;
			Arc::clone(&record.conn)
		};
		conn.send(cmd).await
	}

	/// Entry point for every command arriving on `link`.
	pub async fn deliver(&self, link: LinkId, cmd: Command) -> Result<()> {
		debug!(%link, kind = ?cmd.kind, src = %cmd.src_dom, dst = %cmd.dst_dom, "deliver");
		match &self.role {
			Role::NameServer(ns) => ns.deliver(self, link, cmd).await,
			Role::Forwarding(fwd) => fwd.deliver(self, link, cmd).await,
		}
	}

	/// This domain's id, acquiring one from upstream if needed.
	///
	/// Cancelled by [`shutdown`](Self::shutdown).
	pub async fn get_domid(&self) -> Result<DomId> {
		self.get_domid_with(&self.shutdown).await
	}

	/// Like [`get_domid`](Self::get_domid), additionally cancelled by `cancel`.
	///
	/// An interrupted wait returns [`Error::Interrupted`] and leaves the
	/// request outstanding, so a retry waits for the same response.
	pub async fn get_domid_with(&self, cancel: &CancellationToken) -> Result<DomId> {
		match &self.role {
			Role::NameServer(_) => Ok(DomId::NAME_SERVER),
			Role::Forwarding(fwd) => {
				let shutdown = self.shutdown.clone();
				tokio::select! {
					biased;
					res = fwd.get_domid(self, self.local_link()) => res,
					_ = cancel.cancelled() => Err(Error::Interrupted),
					_ = shutdown.cancelled() => Err(Error::Interrupted),
				}
			}
		}
	}

	/// Broadcasts a name server ping on every remote link.
	pub async fn ping_ns(&self) {
		for link in self.remote_links() {
			if let Err(e) = self.send_cmd(link, Command::ping(CommandKind::PingNs)).await {
				warn!(%link, error = %e, "ping failed");
			}
		}
	}

	/// Pings periodically until a route to the name server is known.
	///
	/// Returns `None` for the name server itself.
	pub fn spawn_ns_discovery(self: &Arc<Self>) -> Option<JoinHandle<()>> {
		if self.is_name_server() {
			return None;
		}
		let part = Arc::clone(self);
		let period = Duration::from_millis(self.config.ping_interval_ms.max(1));
		Some(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			loop {
				tokio::select! {
					_ = part.shutdown.cancelled() => break,
					_ = ticker.tick() => {}
				}
				if part.ns_link().is_some() {
					break;
				}
				part.ping_ns().await;
			}
			debug!("name server discovery finished");
		}))
	}

	/// Link toward the name server, if known.
	pub fn ns_link(&self) -> Option<LinkId> {
		match &self.role {
			Role::NameServer(_) => None,
			Role::Forwarding(fwd) => fwd.ns_link(),
		}
	}

	/// Releases this domain's id, cancels waiters and drops every connection.
	pub async fn shutdown(&self) {
		if let Role::Forwarding(fwd) = &self.role {
			fwd.release_domid(self).await;
		}
		self.shutdown.cancel();

		let records = {
			let mut state = self.state.lock();
			state.local_link = None;
			state.domid_map.clear();
			state.link_map.drain()
		};
		info!(links = records.len(), "partition shut down");
	}

	/// Claims `domid` and routes it to the local link.
	pub(crate) fn assign_domid(&self, domid: DomId) -> Result<()> {
		let mut state = self.state.lock();
		state.domid = Some(domid);
		if let Some(local) = state.local_link {
			if state.domid_map.change(&domid, local).is_none() {
				state.domid_map.insert(domid, local)?;
			}
		}
		Ok(())
	}
}

fn domid_hash(domid: &DomId) -> u32 {
	hash_u64(domid.0 as u64)
}

fn link_hash(link: &LinkId) -> u32 {
	hash_u64(link.0 as u64)
}
