//! Fixed-size wire record of a [`Command`].
//!
//! A command is serialized with `postcard` into a zero-padded record of
//! [`COMMAND_SIZE`] bytes. The kind is the first field, so an unknown kind
//! is reported before the rest of the record is read.

use super::{Command, CommandKind};
use crate::{Error, Result};

/// Size of one encoded command.
///
/// Covers the largest payload with every integer at its widest varint.
pub const COMMAND_SIZE: usize = 128;

impl Command {
	/// Encodes the command into its wire record.
	///
	/// # Errors
	///
	/// Fails with [`Error::Malformed`] if the command does not fit a record.
	pub fn encode(&self) -> Result<[u8; COMMAND_SIZE]> {
		let mut record = [0; COMMAND_SIZE];
		postcard::to_slice(self, &mut record).map_err(malformed)?;
		Ok(record)
	}

	/// Decodes a wire record.
	///
	/// # Errors
	///
	/// Fails with [`Error::UnknownCommand`] for an unknown type tag and
	/// [`Error::Malformed`] for a short record or invalid field.
	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.len() < COMMAND_SIZE {
			return Err(Error::Malformed(format!(
				"record is {} bytes, expected {COMMAND_SIZE}",
				buf.len()
			)));
		}
		let record = &buf[..COMMAND_SIZE];
		let (raw_kind, _) = postcard::take_from_bytes::<u32>(record).map_err(malformed)?;
		CommandKind::try_from(raw_kind)?;
		postcard::from_bytes(record).map_err(malformed)
	}
}

fn malformed(e: postcard::Error) -> Error {
	Error::Malformed(e.to_string())
}
