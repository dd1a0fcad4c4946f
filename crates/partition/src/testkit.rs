//! Test doubles for building domain trees in tests.
//!
//! [`TestNameServer`] hands out domain ids from a counter and routes segment
//! commands to the domain that registered the segid. [`RecordingConnection`]
//! keeps every command it is given.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
	Command, CommandKind, Connection, DomId, Error, LinkId, NameService, Partition,
	PartitionConfig, Payload, Result, SegId,
};

/// Minimal name server: fresh domain ids and segid ownership routing.
pub struct TestNameServer {
	next_domid: AtomicI64,
	owners: Mutex<HashMap<SegId, DomId>>,
	domid_requests: AtomicUsize,
}

impl Default for TestNameServer {
	fn default() -> Self {
		Self {
			next_domid: AtomicI64::new(2),
			owners: Mutex::new(HashMap::new()),
			domid_requests: AtomicUsize::new(0),
		}
	}
}

impl TestNameServer {
	/// Creates a root partition backed by a new name server.
	pub fn partition() -> Result<(Arc<Partition>, Arc<TestNameServer>)> {
		let ns = Arc::new(TestNameServer::default());
		let part = Partition::name_server(PartitionConfig::default(), ns.clone())?;
		Ok((part, ns))
	}

	/// Number of `DomidRequest`s received.
	pub fn domid_requests(&self) -> usize {
		self.domid_requests.load(Ordering::SeqCst)
	}

	/// Domain registered as owner of `segid`.
	pub fn owner(&self, segid: SegId) -> Option<DomId> {
		self.owners.lock().get(&segid).copied()
	}

	async fn route(&self, part: &Partition, dst: DomId, mut cmd: Command) -> Result<()> {
		cmd.src_dom = DomId::NAME_SERVER;
		cmd.dst_dom = dst;
		let link = part.lookup_domid(dst).ok_or(Error::NoRoute(dst))?;
		part.send_cmd(link, cmd).await
	}
}

#[async_trait]
impl NameService for TestNameServer {
	async fn deliver(&self, part: &Partition, link: LinkId, mut cmd: Command) -> Result<()> {
		if part.local_link() == Some(link) && !cmd.req_dom.is_valid() {
			cmd.req_dom = DomId::NAME_SERVER;
		}

		match cmd.kind {
			CommandKind::DomidRequest => {
				self.domid_requests.fetch_add(1, Ordering::SeqCst);
				let domid = DomId(self.next_domid.fetch_add(1, Ordering::SeqCst));
				part.add_domid(domid, link)?;
				let mut resp = Command::domid(CommandKind::DomidResponse, domid);
				resp.src_dom = DomId::NAME_SERVER;
				part.send_cmd(link, resp).await
			}
			CommandKind::DomidRelease => {
				if let Payload::Domid(domid) = cmd.payload {
					part.remove_domid(domid);
				}
				Ok(())
			}
			CommandKind::PingNs => part.send_cmd(link, Command::ping(CommandKind::PongNs)).await,
			CommandKind::PongNs | CommandKind::DomidResponse => Ok(()),
			CommandKind::Make => {
				if let Payload::Make(args) = &mut cmd.payload {
					let mut owners = self.owners.lock();
					if owners.contains_key(&args.segid) {
						args.segid = SegId(-1);
					} else {
						owners.insert(args.segid, cmd.req_dom);
					}
				}
				cmd.complete();
				self.route(part, cmd.req_dom, cmd).await
			}
			CommandKind::Remove => {
				if let Some(segid) = cmd.segid() {
					self.owners.lock().remove(&segid);
				}
				cmd.complete();
				self.route(part, cmd.req_dom, cmd).await
			}
			CommandKind::Get | CommandKind::Release | CommandKind::Attach | CommandKind::Detach => {
				match cmd.segid().and_then(|segid| self.owner(segid)) {
					Some(owner) => self.route(part, owner, cmd).await,
					None => {
						cmd.fail();
						self.route(part, cmd.req_dom, cmd).await
					}
				}
			}
			_ => self.route(part, cmd.req_dom, cmd).await,
		}
	}
}

/// Connection that stores what it is sent.
#[derive(Default)]
pub struct RecordingConnection {
	sent: Mutex<Vec<Command>>,
	notify: Notify,
}

impl RecordingConnection {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Everything sent so far.
	pub fn sent(&self) -> Vec<Command> {
		self.sent.lock().clone()
	}

	/// Number of commands of `kind` sent so far.
	pub fn count(&self, kind: CommandKind) -> usize {
		self.sent.lock().iter().filter(|c| c.kind == kind).count()
	}

	/// Waits until at least `n` commands have been sent.
	pub async fn wait_for(&self, n: usize) {
		loop {
			let notified = self.notify.notified();
			if self.sent.lock().len() >= n {
				return;
			}
			notified.await;
		}
	}
}

#[async_trait]
impl Connection for RecordingConnection {
	async fn send(&self, cmd: Command) -> Result<()> {
		self.sent.lock().push(cmd);
		self.notify.notify_waiters();
		Ok(())
	}
}
