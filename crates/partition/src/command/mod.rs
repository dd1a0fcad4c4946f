//! Commands exchanged between domains.
//!
//! A [`Command`] is a fixed-size tagged record. Every segment operation has a
//! request kind and a matching `*Complete` kind that travels back to the
//! requesting domain carrying the same payload, filled in by the owner.

mod wire;

pub use wire::COMMAND_SIZE;

use serde::{Deserialize, Serialize};

use crate::types::{AccessMode, ApId, DomId, PermitType, SegId, SegmentFlags, SigId};

/// Operation carried by a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum CommandKind {
	Make = 0,
	MakeComplete = 1,
	Remove = 2,
	RemoveComplete = 3,
	Get = 4,
	GetComplete = 5,
	Release = 6,
	ReleaseComplete = 7,
	Attach = 8,
	AttachComplete = 9,
	Detach = 10,
	DetachComplete = 11,
	PingNs = 12,
	PongNs = 13,
	DomidRequest = 14,
	DomidResponse = 15,
	DomidRelease = 16,
}

impl CommandKind {
	/// Segment operation requests.
	pub fn is_request(self) -> bool {
		matches!(
			self,
			Self::Make | Self::Remove | Self::Get | Self::Release | Self::Attach | Self::Detach
		)
	}

	/// Replies to segment operation requests.
	pub fn is_complete(self) -> bool {
		matches!(
			self,
			Self::MakeComplete
				| Self::RemoveComplete
				| Self::GetComplete
				| Self::ReleaseComplete
				| Self::AttachComplete
				| Self::DetachComplete
		)
	}

	/// Kinds handled by the domain id protocol.
	pub fn is_domid(self) -> bool {
		matches!(
			self,
			Self::DomidRequest | Self::DomidResponse | Self::DomidRelease
		)
	}

	/// The `*Complete` kind answering a request, or `self` for anything else.
	pub fn complement(self) -> Self {
		match self {
			Self::Make => Self::MakeComplete,
			Self::Remove => Self::RemoveComplete,
			Self::Get => Self::GetComplete,
			Self::Release => Self::ReleaseComplete,
			Self::Attach => Self::AttachComplete,
			Self::Detach => Self::DetachComplete,
			other => other,
		}
	}
}

impl From<CommandKind> for u32 {
	fn from(kind: CommandKind) -> u32 {
		kind as u32
	}
}

impl TryFrom<u32> for CommandKind {
	type Error = crate::Error;

	fn try_from(raw: u32) -> crate::Result<Self> {
		Ok(match raw {
			0 => Self::Make,
			1 => Self::MakeComplete,
			2 => Self::Remove,
			3 => Self::RemoveComplete,
			4 => Self::Get,
			5 => Self::GetComplete,
			6 => Self::Release,
			7 => Self::ReleaseComplete,
			8 => Self::Attach,
			9 => Self::AttachComplete,
			10 => Self::Detach,
			11 => Self::DetachComplete,
			12 => Self::PingNs,
			13 => Self::PongNs,
			14 => Self::DomidRequest,
			15 => Self::DomidResponse,
			16 => Self::DomidRelease,
			other => return Err(crate::Error::UnknownCommand(other)),
		})
	}
}

/// Descriptor of a physical frame list, opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FrameList {
	/// Where the list lives.
	pub addr: u64,
	/// Number of frames, 0 on failure.
	pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MakeArgs {
	/// Requested well-known id, 0 for none.
	pub request: SegId,
	/// Proposed segid; the name server answers with the registered one or -1.
	pub segid: SegId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
	pub segid: SegId,
	pub access: AccessMode,
	pub permit_type: PermitType,
	pub permit_value: u64,
	/// Filled by the owner, -1 on failure.
	pub apid: ApId,
	pub size: u64,
	/// Owning domain.
	pub domid: DomId,
	pub sigid: SigId,
	pub seg_flags: SegmentFlags,
}

impl GetArgs {
	/// Request fields only; the reply fields start empty.
	pub fn new(
		segid: SegId,
		access: AccessMode,
		permit_type: PermitType,
		permit_value: u64,
	) -> Self {
		Self {
			segid,
			access,
			permit_type,
			permit_value,
			apid: ApId::default(),
			size: 0,
			domid: DomId::NONE,
			sigid: SigId::default(),
			seg_flags: SegmentFlags::empty(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReleaseArgs {
	/// Routing key at the name server.
	pub segid: SegId,
	pub apid: ApId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttachArgs {
	pub segid: SegId,
	pub apid: ApId,
	pub offset: u64,
	pub size: u64,
	/// Filled by the owner.
	pub frames: FrameList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetachArgs {
	pub segid: SegId,
	pub apid: ApId,
	/// Owner-side attachment cookie.
	pub vaddr: u64,
}

/// Operation-specific part of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
	Make(MakeArgs),
	Remove { segid: SegId },
	Get(GetArgs),
	Release(ReleaseArgs),
	Attach(AttachArgs),
	Detach(DetachArgs),
	Domid(DomId),
	Empty,
}

/// One routed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
	pub kind: CommandKind,
	/// Correlates a completion with the waiting request in the requesting domain.
	pub reqid: u32,
	/// Domain that invoked the operation.
	pub req_dom: DomId,
	/// Domain that last produced this record.
	pub src_dom: DomId,
	/// Domain the record is addressed to.
	pub dst_dom: DomId,
	pub payload: Payload,
}

impl Command {
	/// Creates an unaddressed command.
	pub fn new(kind: CommandKind, payload: Payload) -> Self {
		Self {
			kind,
			reqid: 0,
			req_dom: DomId::NONE,
			src_dom: DomId::NONE,
			dst_dom: DomId::NONE,
			payload,
		}
	}

	/// Domain id protocol command.
	pub fn domid(kind: CommandKind, domid: DomId) -> Self {
		Self::new(kind, Payload::Domid(domid))
	}

	/// Name server discovery command.
	pub fn ping(kind: CommandKind) -> Self {
		Self::new(kind, Payload::Empty)
	}

	/// Segment id the command refers to, used for routing at the name server.
	pub fn segid(&self) -> Option<SegId> {
		match self.payload {
			Payload::Make(args) => Some(args.segid),
			Payload::Remove { segid } => Some(segid),
			Payload::Get(args) => Some(args.segid),
			Payload::Release(args) => Some(args.segid),
			Payload::Attach(args) => Some(args.segid),
			Payload::Detach(args) => Some(args.segid),
			Payload::Domid(_) | Payload::Empty => None,
		}
	}

	/// Turns a request into its completion.
	pub fn complete(&mut self) {
		self.kind = self.kind.complement();
	}

	/// Turns a request into a failed completion.
	pub fn fail(&mut self) {
		match &mut self.payload {
			Payload::Make(args) => args.segid = SegId(-1),
			Payload::Get(args) => args.apid = ApId(-1),
			Payload::Attach(args) => args.frames = FrameList::default(),
			_ => {}
		}
		self.complete();
	}
}
