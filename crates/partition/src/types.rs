//! Identifier and flag types carried in commands.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one domain in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomId(pub i64);

impl DomId {
	/// Placeholder for a domain id that is not known.
	pub const NONE: DomId = DomId(-1);
	/// The name server, root of the tree.
	pub const NAME_SERVER: DomId = DomId(1);

	/// Returns `true` for an assigned id.
	pub fn is_valid(self) -> bool {
		self.0 > 0
	}
}

impl fmt::Display for DomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "dom#{}", self.0)
	}
}

/// Identifier of one connection endpoint inside a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub i16);

impl fmt::Display for LinkId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "link#{}", self.0)
	}
}

/// Generates an id packing an owner thread group, a domain, and a counter.
///
/// Layout, most significant first: 32 bits thread group, 16 bits domain,
/// 16 bits counter. The owner can be recovered from the id alone.
macro_rules! packed_id {
	($(#[$meta:meta])* $name:ident, $label:literal) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
		#[derive(Serialize, Deserialize)]
		pub struct $name(pub i64);

		impl $name {
			/// Packs an id from its parts.
			pub fn pack(tgid: u32, domid: DomId, uniq: u16) -> Self {
				Self(((tgid as i64) << 32) | ((domid.0 & 0xFFFF) << 16) | uniq as i64)
			}

			/// Owning thread group.
			pub fn tgid(self) -> u32 {
				(self.0 >> 32) as u32
			}

			/// Low 16 bits of the owning domain.
			pub fn domid(self) -> DomId {
				DomId((self.0 >> 16) & 0xFFFF)
			}

			/// Per-owner counter.
			pub fn uniq(self) -> u16 {
				(self.0 & 0xFFFF) as u16
			}

			/// Ids are strictly positive.
			pub fn is_valid(self) -> bool {
				self.0 > 0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, concat!($label, "#{:#x}"), self.0)
			}
		}
	};
}

packed_id!(
	/// Global segment id.
	SegId,
	"seg"
);
packed_id!(
	/// Access permit id.
	ApId,
	"ap"
);

/// Signal delivery id of a signal-capable segment, 0 when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SigId(pub i64);

/// Permission policy attached to a segment or presented by a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PermitType {
	/// POSIX-style `0o777` permission bits.
	Mode = 1,
	/// No restriction.
	Global = 2,
}

/// Access requested by a `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AccessMode {
	/// Read only.
	ReadOnly = 0x1,
	/// Read and write.
	ReadWrite = 0x2,
}

bitflags::bitflags! {
	/// Segment properties reported to remote requesters.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
	#[serde(transparent)]
	pub struct SegmentFlags: u32 {
		/// Local stand-in for a segment owned by another domain.
		const SHADOW = 0x100;
		/// Segment accepts signals.
		const SIGNALLABLE = 0x400;
	}
}
