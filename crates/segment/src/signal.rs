//! Signal channels of signallable segments.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use tokio::sync::Notify;
use xemem_partition::SigId;

struct SignalState {
	pending: AtomicU64,
	closed: AtomicBool,
	notify: Notify,
}

/// Receiving end of a segment's signal channel.
///
/// Every `signal` on a permit of the segment bumps the pending count and
/// wakes one waiter. The handle closes when the segment is removed.
#[derive(Clone)]
pub struct SignalHandle {
	sigid: SigId,
	state: Arc<SignalState>,
}

impl std::fmt::Debug for SignalHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SignalHandle")
			.field("sigid", &self.sigid)
			.field("pending", &self.pending())
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl SignalHandle {
	fn new(sigid: SigId) -> Self {
		Self {
			sigid,
			state: Arc::new(SignalState {
				pending: AtomicU64::new(0),
				closed: AtomicBool::new(false),
				notify: Notify::new(),
			}),
		}
	}

	pub fn sigid(&self) -> SigId {
		self.sigid
	}

	/// Signals raised but not yet consumed.
	pub fn pending(&self) -> u64 {
		self.state.pending.load(Ordering::Acquire)
	}

	pub fn is_closed(&self) -> bool {
		self.state.closed.load(Ordering::Acquire)
	}

	/// Waits for at least one signal and consumes all pending ones.
	///
	/// Returns `None` once the segment is gone and nothing is pending.
	pub async fn wait(&self) -> Option<u64> {
		loop {
			let notified = self.state.notify.notified();
			let count = self.state.pending.swap(0, Ordering::AcqRel);
			if count > 0 {
				return Some(count);
			}
			if self.is_closed() {
				return None;
			}
			notified.await;
		}
	}

	pub(crate) fn raise(&self) -> bool {
		if self.is_closed() {
			return false;
		}
		self.state.pending.fetch_add(1, Ordering::AcqRel);
		self.state.notify.notify_one();
		true
	}

	pub(crate) fn close(&self) {
		self.state.closed.store(true, Ordering::Release);
		self.state.notify.notify_waiters();
	}
}

/// Allocates domain-unique signal ids.
pub(crate) struct SignalIds {
	next: AtomicI64,
}

impl SignalIds {
	pub(crate) fn new() -> Self {
		Self { next: AtomicI64::new(0) }
	}

	pub(crate) fn open(&self) -> SignalHandle {
		let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
		SignalHandle::new(SigId(id))
	}
}
