//! Segments, access permits and attachments.
//!
//! Each entity carries a [`Lifecycle`] under its own lock. Teardown first
//! moves the entity to [`Lifecycle::Destroying`], which makes every later
//! lookup treat it as gone, and only then unlinks it from the registries.
//! A second teardown of the same entity is a no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;
use xemem_partition::{
	AccessMode, ApId, DomId, FrameList, PermitType, SegId, SegmentFlags, SigId,
};

use crate::signal::SignalHandle;
use crate::thread_group::TgId;

bitflags! {
	/// What a `make` exports.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct MakeFlags: u32 {
		/// A memory region.
		const MEM = 0x1;
		/// A signal channel.
		const SIG = 0x2;
		/// Ask for a well-known segid.
		const REQUEST = 0x4;
	}
}

/// Teardown state shared by segments, permits and attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
	Active,
	Destroying,
	Freed,
}

/// Outcome of [`Segment::begin_destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DestroyStart {
	Started,
	/// Someone else is tearing it down, or already did.
	AlreadyGone,
	/// A shadow that local permits still reference.
	Referenced,
}

struct SegmentState {
	lifecycle: Lifecycle,
	permits: Vec<ApId>,
}

/// Shadow-only data: the permit held at the owning domain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteGrant {
	pub(crate) apid: ApId,
	pub(crate) access: AccessMode,
}

pub(crate) struct Segment {
	pub(crate) segid: SegId,
	/// Owner for local segments, creator for shadows.
	pub(crate) tg: TgId,
	/// Owning domain.
	pub(crate) domid: DomId,
	pub(crate) vaddr: u64,
	pub(crate) size: u64,
	pub(crate) permit_type: PermitType,
	pub(crate) permit_value: u64,
	pub(crate) flags: SegmentFlags,
	pub(crate) sigid: SigId,
	pub(crate) signal: Option<SignalHandle>,
	pub(crate) remote: Option<RemoteGrant>,
	refs: AtomicUsize,
	state: Mutex<SegmentState>,
}

impl Segment {
	#[allow(clippy::too_many_arguments, reason = "mirrors the make arguments")]
	pub(crate) fn local(
		segid: SegId,
		tg: TgId,
		domid: DomId,
		vaddr: u64,
		size: u64,
		permit_type: PermitType,
		permit_value: u64,
		signal: Option<SignalHandle>,
	) -> Self {
		let (flags, sigid) = match &signal {
			Some(handle) => (SegmentFlags::SIGNALLABLE, handle.sigid()),
			None => (SegmentFlags::empty(), SigId::default()),
		};
		Self::new(
			segid,
			tg,
			domid,
			vaddr,
			size,
			(permit_type, permit_value),
			flags,
			sigid,
			signal,
			None,
		)
	}

	/// Local stand-in for a segment owned by `domid`.
	pub(crate) fn shadow(
		segid: SegId,
		tg: TgId,
		domid: DomId,
		size: u64,
		sigid: SigId,
		flags: SegmentFlags,
		grant: RemoteGrant,
	) -> Self {
		Self::new(
			segid,
			tg,
			domid,
			0,
			size,
			(PermitType::Global, 0),
			flags | SegmentFlags::SHADOW,
			sigid,
			None,
			Some(grant),
		)
	}

	#[allow(clippy::too_many_arguments, reason = "mirrors the make arguments")]
	fn new(
		segid: SegId,
		tg: TgId,
		domid: DomId,
		vaddr: u64,
		size: u64,
		(permit_type, permit_value): (PermitType, u64),
		flags: SegmentFlags,
		sigid: SigId,
		signal: Option<SignalHandle>,
		remote: Option<RemoteGrant>,
	) -> Self {
		Self {
			segid,
			tg,
			domid,
			vaddr,
			size,
			permit_type,
			permit_value,
			flags,
			sigid,
			signal,
			remote,
			refs: AtomicUsize::new(0),
			state: Mutex::new(SegmentState {
				lifecycle: Lifecycle::Active,
				permits: Vec::new(),
			}),
		}
	}

	pub(crate) fn is_shadow(&self) -> bool {
		self.flags.contains(SegmentFlags::SHADOW)
	}

	pub(crate) fn lifecycle(&self) -> Lifecycle {
		self.state.lock().lifecycle
	}

	pub(crate) fn is_active(&self) -> bool {
		self.lifecycle() == Lifecycle::Active
	}

	/// Number of permits referencing this segment.
	pub(crate) fn refs(&self) -> usize {
		self.refs.load(Ordering::Acquire)
	}

	/// Links a new permit; fails once teardown has begun.
	pub(crate) fn add_permit(&self, apid: ApId) -> bool {
		let mut state = self.state.lock();
		if state.lifecycle != Lifecycle::Active {
			return false;
		}
		state.permits.push(apid);
		self.refs.fetch_add(1, Ordering::AcqRel);
		true
	}

	pub(crate) fn remove_permit(&self, apid: ApId) {
		let mut state = self.state.lock();
		if let Some(pos) = state.permits.iter().position(|p| *p == apid) {
			state.permits.swap_remove(pos);
			self.refs.fetch_sub(1, Ordering::AcqRel);
		}
	}

	pub(crate) fn permit_ids(&self) -> Vec<ApId> {
		self.state.lock().permits.clone()
	}

	pub(crate) fn begin_destroy(&self) -> DestroyStart {
		let mut state = self.state.lock();
		if state.lifecycle != Lifecycle::Active {
			return DestroyStart::AlreadyGone;
		}
		if self.is_shadow() && !state.permits.is_empty() {
			return DestroyStart::Referenced;
		}
		state.lifecycle = Lifecycle::Destroying;
		DestroyStart::Started
	}

	pub(crate) fn finish_destroy(&self) {
		self.state.lock().lifecycle = Lifecycle::Freed;
	}
}

struct PermitState {
	lifecycle: Lifecycle,
	attachments: Vec<u64>,
}

/// Capability of one thread group to attach a segment.
pub(crate) struct AccessPermit {
	pub(crate) apid: ApId,
	pub(crate) tg: TgId,
	pub(crate) segment: Arc<Segment>,
	pub(crate) access: AccessMode,
	state: Mutex<PermitState>,
}

impl AccessPermit {
	pub(crate) fn new(apid: ApId, tg: TgId, segment: Arc<Segment>, access: AccessMode) -> Self {
		Self {
			apid,
			tg,
			segment,
			access,
			state: Mutex::new(PermitState {
				lifecycle: Lifecycle::Active,
				attachments: Vec::new(),
			}),
		}
	}

	pub(crate) fn is_active(&self) -> bool {
		self.state.lock().lifecycle == Lifecycle::Active
	}

	pub(crate) fn add_attachment(&self, vaddr: u64) -> bool {
		let mut state = self.state.lock();
		if state.lifecycle != Lifecycle::Active {
			return false;
		}
		state.attachments.push(vaddr);
		true
	}

	pub(crate) fn remove_attachment(&self, vaddr: u64) {
		let mut state = self.state.lock();
		state.attachments.retain(|v| *v != vaddr);
	}

	/// Some remaining attachment, for teardown loops that must not hold the
	/// permit lock while detaching.
	pub(crate) fn next_attachment(&self) -> Option<u64> {
		self.state.lock().attachments.last().copied()
	}

	pub(crate) fn attachment_count(&self) -> usize {
		self.state.lock().attachments.len()
	}

	pub(crate) fn begin_destroy(&self) -> bool {
		let mut state = self.state.lock();
		if state.lifecycle != Lifecycle::Active {
			return false;
		}
		state.lifecycle = Lifecycle::Destroying;
		true
	}

	pub(crate) fn finish_destroy(&self) {
		self.state.lock().lifecycle = Lifecycle::Freed;
	}
}

/// One mapping of a segment range.
pub(crate) struct Attachment {
	/// Mapped address, or the frame list cookie for attachments served to
	/// another domain.
	pub(crate) vaddr: u64,
	pub(crate) size: u64,
	pub(crate) apid: ApId,
	pub(crate) frames: FrameList,
	/// Owner-side record of a mapping that lives in another domain.
	pub(crate) served: bool,
	lifecycle: Mutex<Lifecycle>,
}

impl Attachment {
	pub(crate) fn new(
		vaddr: u64,
		size: u64,
		apid: ApId,
		frames: FrameList,
		served: bool,
	) -> Self {
		Self {
			vaddr,
			size,
			apid,
			frames,
			served,
			lifecycle: Mutex::new(Lifecycle::Active),
		}
	}

	pub(crate) fn begin_destroy(&self) -> bool {
		let mut lifecycle = self.lifecycle.lock();
		if *lifecycle != Lifecycle::Active {
			return false;
		}
		*lifecycle = Lifecycle::Destroying;
		true
	}

	pub(crate) fn finish_destroy(&self) {
		*self.lifecycle.lock() = Lifecycle::Freed;
	}
}
