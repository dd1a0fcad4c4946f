//! Segment lifecycle for xemem.
//!
//! A process group exports a memory or signal region with
//! [`SegmentManager::make`]. Any process group in any domain can then
//! [`get`](SegmentManager::get) an access permit for it,
//! [`attach`](SegmentManager::attach) it into its address space, and undo
//! both with [`detach`](SegmentManager::detach) and
//! [`release`](SegmentManager::release).
//!
//! When the segment lives in another domain, `get` sends a command through
//! the partition and builds a local *shadow segment* that stands in for the
//! remote one. Later operations on permits of a shadow are forwarded to the
//! owner transparently.
//!
//! Page-table work is delegated to an [`AddressSpace`].

mod address_space;
mod config;
mod domain;
mod manager;
mod segment;
mod signal;
mod thread_group;

pub use address_space::AddressSpace;
pub use config::{Config, ConfigError, SegmentConfig};
pub use manager::{Made, MakeRequest, SegmentInfo, SegmentManager};
pub use segment::{Lifecycle, MakeFlags};
pub use signal::SignalHandle;
pub use thread_group::TgId;
use xemem_partition::CommandKind;
use xemem_table::TableError;

/// Errors returned by segment operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// An argument failed validation; nothing was changed.
	#[error("invalid argument: {0}")]
	Invalid(String),
	/// The caller does not own the object or lacks the requested access.
	#[error("permission denied")]
	PermissionDenied,
	/// No such object, or it is already gone.
	#[error("{0} not found")]
	NotFound(&'static str),
	/// A well-known segid or similar resource is taken.
	#[error("{0} already exists")]
	AlreadyExists(String),
	/// An id space or request table is exhausted.
	#[error("{0} exhausted")]
	Busy(&'static str),
	/// The owning domain answered with a failure.
	#[error("remote {0:?} failed")]
	RemoteFailure(CommandKind),
	/// The operation cannot be performed on this kind of segment.
	#[error("{0} not supported")]
	NotSupported(&'static str),
	/// The address space collaborator failed.
	#[error("mapping failed: {0}")]
	Mapping(String),
	/// A wait was cancelled.
	#[error("interrupted")]
	Interrupted,
	/// Routing failed.
	#[error(transparent)]
	Partition(#[from] xemem_partition::Error),
	/// A registry table failed.
	#[error(transparent)]
	Table(#[from] TableError),
}

impl Error {
	/// POSIX status code for the control-file layer.
	pub fn errno(&self) -> i32 {
		use xemem_partition::Error as P;
		match self {
			Self::Invalid(_) => libc::EINVAL,
			Self::PermissionDenied => libc::EACCES,
			Self::NotFound(_) => libc::ENOENT,
			Self::AlreadyExists(_) => libc::EEXIST,
			Self::Busy(_) => libc::EBUSY,
			Self::RemoteFailure(_) | Self::Mapping(_) => libc::EFAULT,
			Self::NotSupported(_) => libc::EOPNOTSUPP,
			Self::Interrupted => libc::EINTR,
			Self::Table(TableError::OutOfMemory) => libc::ENOMEM,
			Self::Table(TableError::TooLarge(_)) => libc::EINVAL,
			Self::Partition(e) => match e {
				P::Interrupted => libc::EINTR,
				P::NoNameServer | P::NoDomid => libc::EHOSTUNREACH,
				P::LinkExhausted | P::LocalLinkTaken(_) => libc::EBUSY,
				P::LinkClosed => libc::EPIPE,
				P::Inconsistency(_) => libc::EIO,
				P::Table(TableError::OutOfMemory) => libc::ENOMEM,
				P::UnknownLink(_)
				| P::NoRoute(_)
				| P::UnknownCommand(_)
				| P::Malformed(_)
				| P::Table(TableError::TooLarge(_)) => libc::EINVAL,
			},
		}
	}
}

/// Result type for segment operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
