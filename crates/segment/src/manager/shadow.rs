//! Shadow segments: local stand-ins for segments owned by other domains.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};
use xemem_partition::{
	AccessMode, Command, CommandKind, GetArgs, Payload, PermitType, SegId, SegmentFlags,
};

use super::{SegmentManager, check_access, invalid};
use crate::segment::{RemoteGrant, Segment};
use crate::thread_group::TgId;
use crate::{Error, Result};

type ShadowResult = Arc<Result<Arc<Segment>>>;

/// A shadow being fetched; followers wait on `rx` for the leader's result.
pub(super) struct InFlightShadow {
	tx: watch::Sender<Option<ShadowResult>>,
	rx: watch::Receiver<Option<ShadowResult>>,
}

pub(super) type InFlightMap = Arc<tokio::sync::Mutex<HashMap<SegId, Arc<InFlightShadow>>>>;

impl SegmentManager {
	/// Active shadow of `segid`.
	pub(super) fn shadow(&self, segid: SegId) -> Option<Arc<Segment>> {
		let seg = self.shadows.lock().search(&segid).cloned()?;
		seg.is_active().then_some(seg)
	}

	/// Shadow of `segid`, fetching it from the owner if needed.
	///
	/// The flag is `true` when this call created the shadow.
	pub(super) async fn shadow_for(
		&self,
		segid: SegId,
		tg: TgId,
		access: AccessMode,
		permit_type: PermitType,
		permit_value: u64,
	) -> Result<(Arc<Segment>, bool)> {
		if let Some(seg) = self.shadow(segid) {
			check_access(&seg, access)?;
			return Ok((seg, false));
		}

		let (inflight, is_leader) = {
			let mut map = self.inflight.lock().await;
			if let Some(existing) = map.get(&segid) {
				(Arc::clone(existing), false)
			} else {
				let (tx, rx) = watch::channel(None);
				let fresh = Arc::new(InFlightShadow { tx, rx });
				map.insert(segid, Arc::clone(&fresh));
				(fresh, true)
			}
		};

		if !is_leader {
			let seg = wait_for_leader(&inflight).await?;
			check_access(&seg, access)?;
			return Ok((seg, false));
		}

		let guard = ShadowGuard::new(segid, Arc::clone(&self.inflight), inflight);
		if let Some(seg) = self.shadow(segid) {
			let seg = guard.complete(Ok(seg))?;
			check_access(&seg, access)?;
			return Ok((seg, false));
		}

		let fetched = self
			.fetch_shadow(segid, tg, access, permit_type, permit_value)
			.await;
		let seg = guard.complete(fetched)?;
		Ok((seg, true))
	}

	async fn fetch_shadow(
		&self,
		segid: SegId,
		tg: TgId,
		access: AccessMode,
		permit_type: PermitType,
		permit_value: u64,
	) -> Result<Arc<Segment>> {
		let args = GetArgs::new(segid, access, permit_type, permit_value);
		let reply = self
			.domain
			.request(Command::new(CommandKind::Get, Payload::Get(args)))
			.await?;
		let got = match reply.payload {
			Payload::Get(got) if got.apid.is_valid() => got,
			_ => return Err(Error::RemoteFailure(CommandKind::Get)),
		};

		let signallable = got.sigid.0 != 0 || got.seg_flags.contains(SegmentFlags::SIGNALLABLE);
		if got.size == 0 && !signallable {
			self.release_remote(segid, got.apid).await;
			return Err(invalid("remote segment exports neither memory nor a signal"));
		}

		let grant = RemoteGrant {
			apid: got.apid,
			access,
		};
		let seg = Arc::new(Segment::shadow(
			segid,
			tg,
			got.domid,
			got.size,
			got.sigid,
			got.seg_flags & SegmentFlags::SIGNALLABLE,
			grant,
		));
		let inserted = self.shadows.lock().insert(segid, Arc::clone(&seg));
		if let Err(e) = inserted {
			self.release_remote(segid, got.apid).await;
			return Err(e.into());
		}

		info!(
			%segid,
			owner = %got.domid,
			remote_apid = %got.apid,
			size = got.size,
			"shadow segment created"
		);
		Ok(seg)
	}
}

async fn wait_for_leader(inflight: &InFlightShadow) -> Result<Arc<Segment>> {
	let mut rx = inflight.rx.clone();
	loop {
		let result = {
			let borrow = rx.borrow();
			borrow.as_ref().cloned()
		};
		if let Some(res) = result {
			return (*res).clone();
		}
		if rx.changed().await.is_err() {
			return Err(Error::Interrupted);
		}
	}
}

/// Clears the in-flight entry if the leader fails or is cancelled, so
/// followers see an error instead of waiting forever.
struct ShadowGuard {
	segid: SegId,
	inflight_map: InFlightMap,
	inflight: Arc<InFlightShadow>,
	completed: bool,
}

impl ShadowGuard {
	fn new(segid: SegId, inflight_map: InFlightMap, inflight: Arc<InFlightShadow>) -> Self {
		Self {
			segid,
			inflight_map,
			inflight,
			completed: false,
		}
	}

	fn complete(mut self, res: Result<Arc<Segment>>) -> Result<Arc<Segment>> {
		self.completed = true;
		let _ = self.inflight.tx.send(Some(Arc::new(res.clone())));
		forget_inflight(self.segid, &self.inflight_map, &self.inflight);
		res
	}
}

impl Drop for ShadowGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}
		debug!(segid = %self.segid, "shadow fetch abandoned");
		let _ = self.inflight.tx.send(Some(Arc::new(Err(Error::Interrupted))));
		forget_inflight(self.segid, &self.inflight_map, &self.inflight);
	}
}

fn forget_inflight(segid: SegId, inflight_map: &InFlightMap, inflight: &Arc<InFlightShadow>) {
	if let Ok(mut map) = inflight_map.try_lock() {
		remove_if_current(&mut map, segid, inflight);
		return;
	}
	let inflight_map = Arc::clone(inflight_map);
	let inflight = Arc::clone(inflight);
	tokio::spawn(async move {
		let mut map = inflight_map.lock().await;
		remove_if_current(&mut map, segid, &inflight);
	});
}

fn remove_if_current(
	map: &mut HashMap<SegId, Arc<InFlightShadow>>,
	segid: SegId,
	inflight: &Arc<InFlightShadow>,
) {
	if map.get(&segid).is_some_and(|current| Arc::ptr_eq(current, inflight)) {
		map.remove(&segid);
	}
}
