//! Boundary to the page-table layer.

use xemem_partition::FrameList;

use crate::Result;
use crate::thread_group::TgId;

/// Page-table operations the segment manager needs from its host.
///
/// Implementations report failures as [`Error::Mapping`](crate::Error::Mapping).
pub trait AddressSpace: Send + Sync {
	/// Pins the frames backing `[vaddr, vaddr + size)` of `tg`.
	fn frames(&self, tg: TgId, vaddr: u64, size: u64) -> Result<FrameList>;

	/// Maps `frames` into `tg` and returns the chosen address.
	///
	/// `hint` is a page-aligned address the caller would like, if any.
	fn map(
		&self,
		tg: TgId,
		frames: FrameList,
		size: u64,
		hint: Option<u64>,
		writable: bool,
	) -> Result<u64>;

	/// Removes a mapping created by [`map`](Self::map).
	fn unmap(&self, tg: TgId, vaddr: u64, size: u64) -> Result<()>;

	/// Unpins a frame list returned by [`frames`](Self::frames).
	fn release_frames(&self, frames: FrameList) {
		let _ = frames;
	}
}
