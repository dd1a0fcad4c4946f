//! Per-process-group registries.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use xemem_partition::{ApId, SegId};
use xemem_table::{KeyedTable, hash_u64};

use crate::config::SegmentConfig;
use crate::segment::{AccessPermit, Attachment, Segment};
use crate::{Error, Result};

/// Identifier of a process group.
///
/// `TgId(0)` is reserved: it holds the permits and attachments this domain
/// grants to other domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TgId(pub u32);

impl TgId {
	pub(crate) const REMOTE: TgId = TgId(0);
}

impl fmt::Display for TgId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "tg#{}", self.0)
	}
}

/// Uniq id allocator that reuses freed ids before minting new ones.
pub(crate) struct UniqIds {
	what: &'static str,
	max: u16,
	state: Mutex<UniqState>,
}

struct UniqState {
	last: u16,
	free: Vec<u16>,
}

impl UniqIds {
	pub(crate) fn new(what: &'static str, max: u16) -> Self {
		Self {
			what,
			max,
			state: Mutex::new(UniqState {
				last: 0,
				free: Vec::new(),
			}),
		}
	}

	pub(crate) fn alloc(&self) -> Result<u16> {
		let mut state = self.state.lock();
		if let Some(id) = state.free.pop() {
			return Ok(id);
		}
		if state.last >= self.max {
			return Err(Error::Busy(self.what));
		}
		state.last += 1;
		Ok(state.last)
	}

	pub(crate) fn free(&self, id: u16) {
		self.state.lock().free.push(id);
	}
}

pub(crate) struct ThreadGroup {
	pub(crate) id: TgId,
	pub(crate) segids: UniqIds,
	pub(crate) apids: UniqIds,
	segs: RwLock<Vec<Arc<Segment>>>,
	permits: Mutex<KeyedTable<ApId, Arc<AccessPermit>>>,
	attachments: Mutex<KeyedTable<u64, Arc<Attachment>>>,
}

impl ThreadGroup {
	pub(crate) fn new(id: TgId, config: &SegmentConfig) -> Result<Self> {
		Ok(Self {
			id,
			segids: UniqIds::new("segids", config.max_uniq_id),
			apids: UniqIds::new("apids", config.max_uniq_id),
			segs: RwLock::new(Vec::new()),
			permits: Mutex::new(KeyedTable::new(config.ap_table_size, apid_hash, ApId::eq)?),
			attachments: Mutex::new(KeyedTable::new(config.att_table_size, vaddr_hash, u64::eq)?),
		})
	}

	pub(crate) fn add_segment(&self, seg: Arc<Segment>) {
		self.segs.write().push(seg);
	}

	pub(crate) fn segment(&self, segid: SegId) -> Option<Arc<Segment>> {
		self.segs.read().iter().find(|s| s.segid == segid).cloned()
	}

	pub(crate) fn remove_segment(&self, segid: SegId) -> Option<Arc<Segment>> {
		let mut segs = self.segs.write();
		let pos = segs.iter().position(|s| s.segid == segid)?;
		Some(segs.swap_remove(pos))
	}

	pub(crate) fn segments(&self) -> Vec<Arc<Segment>> {
		self.segs.read().clone()
	}

	pub(crate) fn insert_permit(&self, permit: Arc<AccessPermit>) -> Result<()> {
		self.permits.lock().insert(permit.apid, permit)?;
		Ok(())
	}

	pub(crate) fn permit(&self, apid: ApId) -> Option<Arc<AccessPermit>> {
		self.permits.lock().search(&apid).cloned()
	}

	pub(crate) fn remove_permit(&self, apid: ApId) -> Option<Arc<AccessPermit>> {
		self.permits.lock().remove(&apid)
	}

	pub(crate) fn permits(&self) -> Vec<Arc<AccessPermit>> {
		self.permits.lock().iter().map(|(_, p)| Arc::clone(p)).collect()
	}

	pub(crate) fn insert_attachment(&self, att: Arc<Attachment>) -> Result<()> {
		self.attachments.lock().insert(att.vaddr, att)?;
		Ok(())
	}

	pub(crate) fn attachment(&self, vaddr: u64) -> Option<Arc<Attachment>> {
		self.attachments.lock().search(&vaddr).cloned()
	}

	pub(crate) fn remove_attachment(&self, vaddr: u64) -> Option<Arc<Attachment>> {
		self.attachments.lock().remove(&vaddr)
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.segs.read().is_empty()
			&& self.permits.lock().is_empty()
			&& self.attachments.lock().is_empty()
	}
}

fn apid_hash(apid: &ApId) -> u32 {
	hash_u64(apid.0 as u64)
}

fn vaddr_hash(vaddr: &u64) -> u32 {
	hash_u64(*vaddr)
}
