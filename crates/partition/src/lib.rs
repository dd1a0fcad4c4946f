//! Partition registry and forwarding service for xemem.
//!
//! Every domain in the tree owns one [`Partition`]. It assigns link ids to
//! connections, maps domain ids to links, and routes [`Command`]s. The root
//! partition hands commands to an injected [`NameService`]; every other
//! partition runs the forwarding protocol, which acquires a domain id from
//! upstream and relays segment commands toward the name server or back down
//! to the requesting domain.
//!
//! # Links
//!
//! A link is one endpoint owned by this partition: the parent, a child, or
//! the local segment manager. Connections implement [`Connection`]; the
//! in-memory [`channel`] transport joins two partitions inside one process.

pub mod channel;
mod command;
mod config;
mod connection;
mod forward;
mod partition;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
mod types;

pub use command::{
	AttachArgs, COMMAND_SIZE, Command, CommandKind, DetachArgs, FrameList, GetArgs, MakeArgs,
	Payload, ReleaseArgs,
};
pub use config::PartitionConfig;
pub use connection::{Connection, ConnectionKind};
pub use partition::{NameService, Partition};
pub use types::{AccessMode, ApId, DomId, LinkId, PermitType, SegId, SegmentFlags, SigId};
use xemem_table::TableError;

/// Errors that can occur while routing commands.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// The link has no registered connection.
	#[error("link {0} is not registered")]
	UnknownLink(LinkId),
	/// No link is known for the destination domain.
	#[error("no route to {0}")]
	NoRoute(DomId),
	/// Every representable link id is in use.
	#[error("link ids exhausted")]
	LinkExhausted,
	/// A second local connection was registered.
	#[error("local connection already registered on {0}")]
	LocalLinkTaken(LinkId),
	/// A domain id request had nowhere to go.
	#[error("no name server reachable")]
	NoNameServer,
	/// This domain has no domain id yet.
	#[error("domain id not assigned")]
	NoDomid,
	/// A wait was cancelled before it completed.
	#[error("interrupted")]
	Interrupted,
	/// The peer end of a link has gone away.
	#[error("link closed")]
	LinkClosed,
	/// A wire record carried an unknown command type.
	#[error("unknown command type {0}")]
	UnknownCommand(u32),
	/// A wire record could not be decoded.
	#[error("malformed command: {0}")]
	Malformed(String),
	/// Partition state contradicts the protocol.
	#[error("inconsistent partition state: {0}")]
	Inconsistency(String),
	/// A registry table failed.
	#[error(transparent)]
	Table(#[from] TableError),
}

/// Result type for partition operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
