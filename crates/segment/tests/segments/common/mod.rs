//! Domains and a fake page-table layer for segment tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use xemem_partition::testkit::TestNameServer;
use xemem_partition::{FrameList, Partition, PartitionConfig, channel};
use xemem_segment::{AddressSpace, Error, Result, SegmentConfig, SegmentManager, TgId};

pub const PAGE: u64 = 4096;

#[derive(Default)]
struct FakeState {
	next_frames: u64,
	next_vaddr: u64,
	pinned: HashMap<u64, (TgId, u64, u64)>,
	mapped: HashMap<(TgId, u64), (FrameList, u64, bool)>,
	fail_map: bool,
}

/// Records pinned frame lists and mappings instead of touching page tables.
#[derive(Default)]
pub struct FakeAddressSpace {
	state: Mutex<FakeState>,
}

impl FakeAddressSpace {
	/// Frame lists handed out and not yet released.
	pub fn pinned(&self) -> usize {
		self.state.lock().pinned.len()
	}

	/// Live mappings.
	pub fn mapped(&self) -> usize {
		self.state.lock().mapped.len()
	}

	pub fn mapping(&self, tg: TgId, vaddr: u64) -> Option<(FrameList, u64, bool)> {
		self.state.lock().mapped.get(&(tg, vaddr)).copied()
	}

	pub fn fail_map(&self, fail: bool) {
		self.state.lock().fail_map = fail;
	}
}

impl AddressSpace for FakeAddressSpace {
	fn frames(&self, tg: TgId, vaddr: u64, size: u64) -> Result<FrameList> {
		let mut state = self.state.lock();
		state.next_frames += 1;
		let addr = 0xF000_0000 + state.next_frames * 0x100;
		state.pinned.insert(addr, (tg, vaddr, size));
		Ok(FrameList {
			addr,
			count: size / PAGE,
		})
	}

	fn map(
		&self,
		tg: TgId,
		frames: FrameList,
		size: u64,
		hint: Option<u64>,
		writable: bool,
	) -> Result<u64> {
		let mut state = self.state.lock();
		if state.fail_map {
			return Err(Error::Mapping("mapping refused".into()));
		}
		let vaddr = match hint {
			Some(hint) => hint,
			None => {
				state.next_vaddr += 0x10_0000;
				0x7000_0000_0000 + state.next_vaddr
			}
		};
		state.mapped.insert((tg, vaddr), (frames, size, writable));
		Ok(vaddr)
	}

	fn unmap(&self, tg: TgId, vaddr: u64, _size: u64) -> Result<()> {
		match self.state.lock().mapped.remove(&(tg, vaddr)) {
			Some(_) => Ok(()),
			None => Err(Error::Mapping(format!("{vaddr:#x} is not mapped"))),
		}
	}

	fn release_frames(&self, frames: FrameList) {
		self.state.lock().pinned.remove(&frames.addr);
	}
}

/// One domain: partition, segment manager and its address space.
pub struct Domain {
	pub part: Arc<Partition>,
	pub manager: Arc<SegmentManager>,
	pub aspace: Arc<FakeAddressSpace>,
}

impl Domain {
	fn with_partition(part: Arc<Partition>) -> Self {
		let aspace = Arc::new(FakeAddressSpace::default());
		let manager = SegmentManager::new(
			SegmentConfig::default(),
			Arc::clone(&part),
			aspace.clone(),
		)
		.unwrap();
		Self {
			part,
			manager,
			aspace,
		}
	}
}

/// Root domain backed by a test name server.
pub fn name_server() -> (Domain, Arc<TestNameServer>) {
	let _ = tracing_subscriber::fmt::try_init();
	let (part, ns) = TestNameServer::partition().unwrap();
	(Domain::with_partition(part), ns)
}

/// Domain without a domain id, not connected to anything yet.
pub fn domain() -> Domain {
	Domain::with_partition(Partition::forwarding(PartitionConfig::default()).unwrap())
}

/// Name server with two child domains.
pub fn tree() -> (Domain, Arc<TestNameServer>, Domain, Domain) {
	let (root, ns) = name_server();
	let a = domain();
	let b = domain();
	channel::connect(&root.part, &a.part).unwrap();
	channel::connect(&root.part, &b.part).unwrap();
	(root, ns, a, b)
}
