//! Forwarding service of non-root domains.
//!
//! A forwarding partition learns its domain id from the first
//! `DomidResponse` it sees and remembers the link it arrived on as the route
//! to the name server. Requests from children are queued in arrival order and
//! answered by later responses, one each. Segment commands are relayed by
//! destination domain; locally originated ones always go to the name server.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{Command, CommandKind, DomId, Error, LinkId, Partition, Payload, Result};

#[derive(Default)]
struct ForwardState {
	/// A `DomidRequest` for this domain is in flight.
	requested: bool,
	ns_link: Option<LinkId>,
	/// Links whose `DomidRequest` is waiting for a response, oldest first.
	pending: VecDeque<LinkId>,
}

/// Forwarding role state of a [`Partition`].
///
/// Lock order: the forwarding lock is taken before the partition lock, never
/// the other way round.
pub(crate) struct Forwarder {
	state: Mutex<ForwardState>,
	domid_tx: watch::Sender<Option<DomId>>,
}

impl Forwarder {
	pub(crate) fn new() -> Self {
		Self {
			state: Mutex::new(ForwardState::default()),
			domid_tx: watch::Sender::new(None),
		}
	}

	pub(crate) fn ns_link(&self) -> Option<LinkId> {
		self.state.lock().ns_link
	}

	/// Returns this domain's id, waiting for the response to a single
	/// outstanding request if necessary.
	pub(crate) async fn get_domid(
		&self,
		part: &Partition,
		requesting_link: Option<LinkId>,
	) -> Result<DomId> {
		if let Some(domid) = part.domid() {
			return Ok(domid);
		}

		// Subscribe before requesting so the response cannot slip past.
		let mut rx = self.domid_tx.subscribe();
		self.request_domid(part, requesting_link).await?;

		loop {
			let current = *rx.borrow_and_update();
			if let Some(domid) = current {
				return Ok(domid);
			}
			if rx.changed().await.is_err() {
				return Err(Error::Interrupted);
			}
		}
	}

	/// Sends a `DomidRequest` for this domain unless one is outstanding or
	/// the id is already known.
	async fn request_domid(&self, part: &Partition, requesting_link: Option<LinkId>) -> Result<()> {
		let targets = {
			let mut state = self.state.lock();
			if state.requested || part.domid().is_some() {
				return Ok(());
			}
			let targets = upstream_targets(part, state.ns_link, requesting_link);
			if targets.is_empty() {
				return Err(Error::NoNameServer);
			}
			state.requested = true;
			targets
		};

		debug!(?targets, "requesting domain id");
		if self.send_domid_request(part, &targets).await {
			Ok(())
		} else {
			self.state.lock().requested = false;
			Err(Error::NoNameServer)
		}
	}

	/// Sends a `DomidRequest` on each target, returning `true` if any send
	/// succeeded.
	async fn send_domid_request(&self, part: &Partition, targets: &[LinkId]) -> bool {
		let mut cmd = Command::domid(CommandKind::DomidRequest, DomId::NONE);
		cmd.dst_dom = DomId::NAME_SERVER;

		let mut sent = false;
		for &link in targets {
			match part.send_cmd(link, cmd).await {
				Ok(()) => sent = true,
				Err(e) => warn!(%link, error = %e, "domain id request not sent"),
			}
		}
		sent
	}

	/// Sends `DomidRelease` for this domain toward the name server.
	pub(crate) async fn release_domid(&self, part: &Partition) {
		let (ns_link, domid) = {
			let mut state = self.state.lock();
			state.pending.clear();
			(state.ns_link, part.domid())
		};
		let (Some(link), Some(domid)) = (ns_link, domid) else {
			return;
		};

		let mut cmd = Command::domid(CommandKind::DomidRelease, domid);
		cmd.req_dom = domid;
		cmd.src_dom = domid;
		cmd.dst_dom = DomId::NAME_SERVER;
		if let Err(e) = part.send_cmd(link, cmd).await {
			warn!(%domid, error = %e, "domain id release not sent");
		}
	}

	pub(crate) async fn deliver(&self, part: &Partition, link: LinkId, cmd: Command) -> Result<()> {
		match cmd.kind {
			CommandKind::PingNs | CommandKind::PongNs => self.process_ping(part, link, cmd).await,
			CommandKind::DomidRequest => self.process_domid_request(part, link).await,
			CommandKind::DomidResponse => self.process_domid_response(part, link, cmd).await,
			CommandKind::DomidRelease => {
				let dst = part.lookup_domid(cmd.dst_dom).ok_or(Error::NoRoute(cmd.dst_dom))?;
				part.send_cmd(dst, cmd).await
			}
			_ => self.process_segment_cmd(part, link, cmd).await,
		}
	}

	async fn process_ping(&self, part: &Partition, link: LinkId, cmd: Command) -> Result<()> {
		if cmd.kind == CommandKind::PingNs {
			if self.ns_link().is_some() {
				return part.send_cmd(link, Command::ping(CommandKind::PongNs)).await;
			}
			debug!(%link, "ping before the name server is known");
			return Ok(());
		}

		let request = {
			let mut state = self.state.lock();
			if state.ns_link.is_some() {
				return Ok(());
			}
			state.ns_link = Some(link);
			let request = !state.requested && part.domid().is_none();
			if request {
				state.requested = true;
			}
			request
		};
		info!(%link, "name server found");
		part.add_domid(DomId::NAME_SERVER, link)?;

		for other in part.remote_links() {
			if other == link {
				continue;
			}
			if let Err(e) = part.send_cmd(other, Command::ping(CommandKind::PongNs)).await {
				warn!(link = %other, error = %e, "pong not forwarded");
			}
		}

		if request && !self.send_domid_request(part, &[link]).await {
			self.state.lock().requested = false;
		}
		Ok(())
	}

	/// Queues a child's request behind this domain's own, then passes it
	/// upstream.
	async fn process_domid_request(&self, part: &Partition, link: LinkId) -> Result<()> {
		self.state.lock().pending.push_back(link);

		if let Err(e) = self.request_domid(part, Some(link)).await {
			self.drop_pending(link);
			return Err(e);
		}

		let targets = {
			let state = self.state.lock();
			upstream_targets(part, state.ns_link, Some(link))
		};
		debug!(%link, ?targets, "forwarding domain id request");
		if self.send_domid_request(part, &targets).await {
			Ok(())
		} else {
			self.drop_pending(link);
			Err(Error::NoNameServer)
		}
	}

	/// Forgets the newest pending request from `link`.
	fn drop_pending(&self, link: LinkId) {
		let mut state = self.state.lock();
		if let Some(pos) = state.pending.iter().rposition(|l| *l == link) {
			state.pending.remove(pos);
		}
	}

	async fn process_domid_response(
		&self,
		part: &Partition,
		link: LinkId,
		cmd: Command,
	) -> Result<()> {
		let Payload::Domid(domid) = cmd.payload else {
			return Err(Error::Malformed("domain id response without a domain id".into()));
		};
		if !domid.is_valid() {
			warn!(%link, %domid, "invalid domain id in response");
			return Err(Error::Malformed(format!("invalid domain id {}", domid.0)));
		}

		let forward_to = {
			let mut state = self.state.lock();
			if part.domid().is_none() {
				state.ns_link = Some(link);
				// Requests that came down from upstream were echoes of our own broadcast.
				state.pending.retain(|l| *l != link);
				part.assign_domid(domid)?;
				None
			} else {
				let Some(child) = state.pending.pop_front() else {
					error!(%link, %domid, "domain id response with no pending request");
					return Err(Error::Inconsistency(format!(
						"unmatched domain id response for {domid}"
					)));
				};
				Some(child)
			}
		};

		match forward_to {
			None => {
				part.add_domid(DomId::NAME_SERVER, link)?;
				self.domid_tx.send_replace(Some(domid));
				info!(%domid, ns_link = %link, "domain id assigned");
				Ok(())
			}
			Some(child) => {
				part.add_domid(domid, child)?;
				debug!(%domid, link = %child, "domain id handed down");
				part.send_cmd(child, cmd).await
			}
		}
	}

	async fn process_segment_cmd(
		&self,
		part: &Partition,
		link: LinkId,
		mut cmd: Command,
	) -> Result<()> {
		let domid = part.domid();
		if part.local_link() == Some(link) {
			if let Some(domid) = domid {
				if !cmd.req_dom.is_valid() {
					cmd.req_dom = domid;
				}
				cmd.src_dom = domid;
			}
			cmd.dst_dom = DomId::NAME_SERVER;
		}

		if domid.is_none() {
			if cmd.kind.is_request() {
				debug!(%link, kind = ?cmd.kind, "failing command, no domain id");
				cmd.fail();
				return part.send_cmd(link, cmd).await;
			}
			warn!(%link, kind = ?cmd.kind, "dropping completion, no domain id");
			return Err(Error::NoDomid);
		}

		let Some(dst) = part.lookup_domid(cmd.dst_dom) else {
			warn!(%link, kind = ?cmd.kind, dst = %cmd.dst_dom, "no route, dropping command");
			return Err(Error::NoRoute(cmd.dst_dom));
		};
		part.send_cmd(dst, cmd).await
	}
}

/// Where a domain id request goes: the name server link if known, otherwise
/// every remote link but the one the request came from.
fn upstream_targets(
	part: &Partition,
	ns_link: Option<LinkId>,
	requesting_link: Option<LinkId>,
) -> Vec<LinkId> {
	match ns_link {
		Some(link) => vec![link],
		None => part
			.remote_links()
			.into_iter()
			.filter(|l| Some(*l) != requesting_link)
			.collect(),
	}
}

#[cfg(test)]
mod tests;
