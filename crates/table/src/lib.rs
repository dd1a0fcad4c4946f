//! Chained hashtable used for every registry in xemem.
//!
//! [`KeyedTable`] maps a key to a value through caller-supplied hash and
//! equality functions. Buckets are singly linked chains stored in an entry
//! arena, and the bucket array walks a fixed ladder of primes as the table
//! fills. Growth never fails an insert: if no larger bucket array can be
//! allocated the table keeps using the one it has.

mod hash;
mod table;

pub use hash::{hash_bytes, hash_u64};
pub use table::{EqFn, HashFn, Iter, KeyedTable, MAX_MIN_SIZE};

/// Errors reported by [`KeyedTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
	/// The entry arena or bucket array could not be allocated.
	#[error("out of memory")]
	OutOfMemory,
	/// The requested minimum size exceeds [`MAX_MIN_SIZE`].
	#[error("requested table size {0} is too large")]
	TooLarge(usize),
}

/// Result type for table operations.
pub type Result<T, E = TableError> = std::result::Result<T, E>;
