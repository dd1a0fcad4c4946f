//! Segment lifecycle manager.
//!
//! One [`SegmentManager`] serves one domain. It keeps a registry per thread
//! group, the table of shadow segments standing in for remote segments, and
//! the well-known segid table. The manager registers itself as the local
//! connection of its [`Partition`]: its own requests leave through it, and
//! requests from other domains for segments it owns arrive through it.
//!
//! # Concurrency
//!
//! Registries sit under `parking_lot` locks that are never held across an
//! await. Each segment, permit and attachment guards its own teardown with a
//! [`Lifecycle`] flag, so concurrent teardown paths collapse into one.

mod remote;
mod shadow;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use xemem_partition::{
	AccessMode, ApId, AttachArgs, Command, CommandKind, ConnectionKind, DetachArgs, DomId,
	FrameList, MakeArgs, Partition, Payload, PermitType, ReleaseArgs, SegId,
};
use xemem_table::{KeyedTable, hash_u64};

use crate::address_space::AddressSpace;
use crate::config::SegmentConfig;
use crate::domain::{DomainLink, LocalConnection};
use crate::segment::{AccessPermit, Attachment, DestroyStart, Lifecycle, MakeFlags, Segment};
use crate::signal::{SignalHandle, SignalIds};
use crate::thread_group::{TgId, ThreadGroup};
use crate::{Error, Result};

/// Arguments of [`SegmentManager::make`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MakeRequest {
	pub vaddr: u64,
	pub size: u64,
	pub permit_type: PermitType,
	pub permit_value: u64,
	pub flags: MakeFlags,
	/// Requested well-known segid, used with [`MakeFlags::REQUEST`].
	pub well_known: SegId,
}

impl MakeRequest {
	/// Exports `[vaddr, vaddr + size)` to everyone.
	pub fn memory(vaddr: u64, size: u64) -> Self {
		Self {
			vaddr,
			size,
			permit_type: PermitType::Global,
			permit_value: 0,
			flags: MakeFlags::MEM,
			well_known: SegId(0),
		}
	}

	/// Exports a signal channel only.
	pub fn signal() -> Self {
		Self {
			flags: MakeFlags::SIG,
			..Self::memory(0, 0)
		}
	}

	/// Adds a signal channel to a memory segment.
	pub fn with_signal(mut self) -> Self {
		self.flags |= MakeFlags::SIG;
		self
	}

	pub fn permit(mut self, permit_type: PermitType, permit_value: u64) -> Self {
		self.permit_type = permit_type;
		self.permit_value = permit_value;
		self
	}

	/// Asks for `segid` from the well-known range.
	pub fn well_known(mut self, segid: i64) -> Self {
		self.flags |= MakeFlags::REQUEST;
		self.well_known = SegId(segid);
		self
	}
}

/// Result of a successful [`SegmentManager::make`].
#[derive(Debug, Clone)]
pub struct Made {
	pub segid: SegId,
	/// Present when the segment was made with [`MakeFlags::SIG`].
	pub signal: Option<SignalHandle>,
}

/// Snapshot of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
	pub segid: SegId,
	pub tg: TgId,
	/// Owning domain.
	pub domid: DomId,
	pub size: u64,
	pub shadow: bool,
	/// Permit held at the owning domain, for shadows.
	pub remote_apid: Option<ApId>,
	/// Permits referencing the segment.
	pub refs: usize,
	pub lifecycle: Lifecycle,
}

impl From<&Segment> for SegmentInfo {
	fn from(seg: &Segment) -> Self {
		Self {
			segid: seg.segid,
			tg: seg.tg,
			domid: seg.domid,
			size: seg.size,
			shadow: seg.is_shadow(),
			remote_apid: seg.remote.map(|grant| grant.apid),
			refs: seg.refs(),
			lifecycle: seg.lifecycle(),
		}
	}
}

/// Segment, permit and attachment registry of one domain.
pub struct SegmentManager {
	config: SegmentConfig,
	aspace: Arc<dyn AddressSpace>,
	domain: DomainLink,
	groups: RwLock<KeyedTable<TgId, Arc<ThreadGroup>>>,
	shadows: Mutex<KeyedTable<SegId, Arc<Segment>>>,
	well_known: Mutex<Vec<Option<TgId>>>,
	inflight: shadow::InFlightMap,
	signals: SignalIds,
	#[cfg(test)]
	faults: tests::Faults,
}

impl SegmentManager {
	/// Creates a manager and registers it as the local connection of `part`.
	///
	/// # Errors
	///
	/// Fails if `config` is invalid or `part` already has a local connection.
	pub fn new(
		config: SegmentConfig,
		part: Arc<Partition>,
		aspace: Arc<dyn AddressSpace>,
	) -> Result<Arc<Self>> {
		config.validate().map_err(|e| Error::Invalid(e.to_string()))?;

		let mut groups = KeyedTable::new(16, tg_hash, TgId::eq)?;
		groups.insert(
			TgId::REMOTE,
			Arc::new(ThreadGroup::new(TgId::REMOTE, &config)?),
		)?;
		let well_known = vec![None; config.max_wk_segid as usize + 1];

		let manager = Arc::new(Self {
			domain: DomainLink::new(part, config.request_slots)?,
			groups: RwLock::new(groups),
			shadows: Mutex::new(KeyedTable::new(16, segid_hash, SegId::eq)?),
			well_known: Mutex::new(well_known),
			inflight: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
			signals: SignalIds::new(),
			#[cfg(test)]
			faults: tests::Faults::default(),
			aspace,
			config,
		});

		let conn = Arc::new(LocalConnection::new(Arc::downgrade(&manager)));
		let link = manager
			.domain
			.partition()
			.add_connection(ConnectionKind::Local, conn)?;
		manager.domain.bind(link);
		info!(%link, "segment manager attached to partition");
		Ok(manager)
	}

	pub fn partition(&self) -> &Arc<Partition> {
		self.domain.partition()
	}

	pub(crate) fn domain(&self) -> &DomainLink {
		&self.domain
	}

	/// Exports a memory region or signal channel of `tg` as a new segment.
	///
	/// The segid is registered with the name server before it is returned.
	pub async fn make(&self, tg: TgId, req: MakeRequest) -> Result<Made> {
		check_caller(tg)?;
		self.validate_make(&req)?;
		let group = self.group_or_create(tg)?;
		let domid = self.partition().get_domid().await?;

		let well_known = req.flags.contains(MakeFlags::REQUEST);
		let (proposed, uniq) = if well_known {
			self.reserve_well_known(req.well_known, tg)?;
			(req.well_known, None)
		} else {
			let uniq = group.segids.alloc()?;
			(SegId::pack(tg.0, domid, uniq), Some(uniq))
		};

		let args = MakeArgs {
			request: if well_known { req.well_known } else { SegId(0) },
			segid: proposed,
		};
		let reply = self
			.domain
			.request(Command::new(CommandKind::Make, Payload::Make(args)))
			.await;
		let segid = match reply {
			Ok(Command {
				payload: Payload::Make(args),
				..
			}) if args.segid.is_valid() => args.segid,
			Ok(_) => {
				self.abandon_segid(&group, proposed, uniq);
				return Err(if well_known {
					Error::AlreadyExists(proposed.to_string())
				} else {
					Error::RemoteFailure(CommandKind::Make)
				});
			}
			Err(e) => {
				self.abandon_segid(&group, proposed, uniq);
				return Err(e);
			}
		};

		let signal = req.flags.contains(MakeFlags::SIG).then(|| self.signals.open());
		let seg = Segment::local(
			segid,
			tg,
			domid,
			req.vaddr,
			req.size,
			req.permit_type,
			req.permit_value,
			signal.clone(),
		);
		group.add_segment(Arc::new(seg));
		info!(%segid, %tg, vaddr = req.vaddr, size = req.size, "segment made");
		Ok(Made { segid, signal })
	}

	fn validate_make(&self, req: &MakeRequest) -> Result<()> {
		let page = self.config.page_size;
		if !req.flags.intersects(MakeFlags::MEM | MakeFlags::SIG) {
			return Err(invalid("segment exports neither memory nor a signal"));
		}
		if req.flags.contains(MakeFlags::MEM) {
			if req.size == 0 {
				return Err(invalid("memory segment of size 0"));
			}
			if req.vaddr % page != 0 || req.size % page != 0 {
				return Err(invalid("region is not page aligned"));
			}
			if req.vaddr.checked_add(req.size).is_none() {
				return Err(invalid("region wraps the address space"));
			}
		} else if req.size != 0 {
			return Err(invalid("signal-only segment with a size"));
		}
		check_permit_args(req.permit_type, req.permit_value)?;
		if req.flags.contains(MakeFlags::REQUEST) && !self.is_well_known(req.well_known) {
			return Err(invalid(format!("{} is not a well-known segid", req.well_known)));
		}
		Ok(())
	}

	/// Retires a segment owned by `tg`.
	///
	/// Every permit for the segment is released first, including those
	/// granted to other domains. A shadow still referenced by local permits
	/// stays until the last one is released. Removing a segment that is
	/// already being removed succeeds without effect.
	pub async fn remove(&self, tg: TgId, segid: SegId) -> Result<()> {
		check_caller(tg)?;
		if !segid.is_valid() {
			return Err(invalid("segid must be positive"));
		}

		let owned = self.group(tg).and_then(|group| group.segment(segid));
		if let Some(seg) = owned {
			return self.remove_segment(&seg).await;
		}
		let shadow = self.shadow(segid);
		if let Some(seg) = shadow {
			if seg.tg != tg {
				return Err(Error::PermissionDenied);
			}
			return self.remove_segment(&seg).await;
		}
		if self.local_segment(segid).is_some() {
			return Err(Error::PermissionDenied);
		}
		Err(Error::NotFound("segment"))
	}

	pub(crate) async fn remove_segment(&self, seg: &Arc<Segment>) -> Result<()> {
		match seg.begin_destroy() {
			DestroyStart::AlreadyGone => return Ok(()),
			DestroyStart::Referenced => {
				debug!(
					segid = %seg.segid,
					refs = seg.refs(),
					"shadow still referenced, removal cancelled"
				);
				return Ok(());
			}
			DestroyStart::Started => {}
		}

		match seg.remote {
			Some(grant) => {
				self.shadows
					.lock()
					.retain(|_, other| !Arc::ptr_eq(other, seg));
				self.release_remote(seg.segid, grant.apid).await;
			}
			None => {
				let group = self.group(seg.tg);
				if let Some(group) = &group {
					group.remove_segment(seg.segid);
				}
				for apid in seg.permit_ids() {
					let holder = self.group(TgId(apid.tgid()));
					let permit = holder.as_ref().and_then(|h| h.permit(apid));
					if let (Some(holder), Some(permit)) = (holder, permit) {
						self.drop_permit(&holder, &permit).await;
					}
				}
				if let Some(handle) = &seg.signal {
					handle.close();
				}
				self.retire(seg.segid).await;

				if self.is_well_known(seg.segid) {
					self.unreserve_well_known(seg.segid);
				} else if let Some(group) = &group {
					group.segids.free(seg.segid.uniq());
				}
			}
		}

		seg.finish_destroy();
		info!(segid = %seg.segid, tg = %seg.tg, shadow = seg.is_shadow(), "segment removed");
		Ok(())
	}

	/// Tells the name server that `segid` no longer exists.
	async fn retire(&self, segid: SegId) {
		let cmd = Command::new(CommandKind::Remove, Payload::Remove { segid });
		if let Err(e) = self.domain.request(cmd).await {
			warn!(%segid, error = %e, "segid not retired at the name server");
		}
	}

	/// Returns a permit held at another domain.
	async fn release_remote(&self, segid: SegId, apid: ApId) {
		let cmd = Command::new(
			CommandKind::Release,
			Payload::Release(ReleaseArgs { segid, apid }),
		);
		match self.domain.request(cmd).await {
			Ok(_) => debug!(%segid, %apid, "remote permit released"),
			Err(e) => warn!(%segid, %apid, error = %e, "remote permit not released"),
		}
	}

	/// Grants `tg` an access permit for `segid`.
	///
	/// A segid owned by another domain is resolved through the name server
	/// and backed by a shadow segment. Concurrent first gets of the same
	/// remote segid share one shadow.
	pub async fn get(
		&self,
		tg: TgId,
		segid: SegId,
		access: AccessMode,
		permit_type: PermitType,
		permit_value: u64,
	) -> Result<ApId> {
		check_caller(tg)?;
		if !segid.is_valid() {
			return Err(invalid("segid must be positive"));
		}
		check_permit_args(permit_type, permit_value)?;
		let group = self.group_or_create(tg)?;

		if let Some(seg) = self.local_segment(segid) {
			check_access(&seg, access)?;
			return self.grant(&group, seg, access);
		}

		// A reused shadow can lose its last permit between lookup and grant.
		let mut refetched = false;
		loop {
			let (seg, fresh) = self
				.shadow_for(segid, tg, access, permit_type, permit_value)
				.await?;
			#[cfg(test)]
			{
				let pending = self.faults.release_before_grant.lock().take();
				if let Some((holder, apid)) = pending {
					self.release(holder, apid).await?;
				}
			}
			match self.grant(&group, Arc::clone(&seg), access) {
				Ok(apid) => return Ok(apid),
				Err(Error::NotFound(_)) if !fresh && !refetched && !seg.is_active() => {
					debug!(%segid, "shadow torn down before grant, fetching again");
					refetched = true;
				}
				Err(e) => {
					if fresh && let Err(cleanup) = self.remove_segment(&seg).await {
						warn!(%segid, error = %cleanup, "unused shadow not removed");
					}
					return Err(e);
				}
			}
		}
	}

	pub(crate) fn grant(
		&self,
		group: &ThreadGroup,
		seg: Arc<Segment>,
		access: AccessMode,
	) -> Result<ApId> {
		let uniq = group.apids.alloc()?;
		let apid = ApId::pack(group.id.0, self.local_domid(), uniq);
		if !seg.add_permit(apid) {
			group.apids.free(uniq);
			return Err(Error::NotFound("segment"));
		}

		let segid = seg.segid;
		let permit = Arc::new(AccessPermit::new(apid, group.id, Arc::clone(&seg), access));
		if let Err(e) = group.insert_permit(permit) {
			seg.remove_permit(apid);
			group.apids.free(uniq);
			return Err(e);
		}
		debug!(%apid, %segid, tg = %group.id, "permit granted");
		Ok(apid)
	}

	/// Drops a permit, detaching all of its attachments first.
	pub async fn release(&self, tg: TgId, apid: ApId) -> Result<()> {
		check_caller(tg)?;
		let (group, permit) = self.owned_permit(tg, apid)?;
		self.release_permit(&group, &permit).await
	}

	pub(crate) async fn release_permit(
		&self,
		group: &ThreadGroup,
		permit: &AccessPermit,
	) -> Result<()> {
		if let Some(shadow) = self.drop_permit(group, permit).await {
			self.remove_segment(&shadow).await?;
		}
		Ok(())
	}

	/// Tears down a permit and returns its segment if that is a shadow,
	/// which the caller removes once the permit is gone.
	async fn drop_permit(
		&self,
		group: &ThreadGroup,
		permit: &AccessPermit,
	) -> Option<Arc<Segment>> {
		if !permit.begin_destroy() {
			return None;
		}
		debug!(apid = %permit.apid, attachments = permit.attachment_count(), "releasing permit");

		while let Some(vaddr) = permit.next_attachment() {
			let att = group.attachment(vaddr);
			match att {
				Some(att) => {
					if let Err(e) = self.detach_attachment(group, permit, &att).await {
						warn!(
							apid = %permit.apid,
							vaddr,
							error = %e,
							"detach during release failed"
						);
					}
				}
				None => permit.remove_attachment(vaddr),
			}
		}

		group.remove_permit(permit.apid);
		let seg = &permit.segment;
		seg.remove_permit(permit.apid);
		group.apids.free(permit.apid.uniq());
		permit.finish_destroy();
		debug!(apid = %permit.apid, segid = %seg.segid, tg = %permit.tg, "permit released");

		seg.is_shadow().then(|| Arc::clone(seg))
	}

	/// Maps `size` bytes at `offset` of the permit's segment into `tg`.
	pub async fn attach(
		&self,
		tg: TgId,
		apid: ApId,
		offset: u64,
		size: u64,
		hint: Option<u64>,
		writable: bool,
	) -> Result<u64> {
		check_caller(tg)?;
		let page = self.config.page_size;
		if offset % page != 0 || hint.is_some_and(|h| h % page != 0) {
			return Err(invalid("attach address is not page aligned"));
		}
		if size == 0 {
			return Err(invalid("attach of size 0"));
		}
		let size = size
			.checked_next_multiple_of(page)
			.ok_or_else(|| invalid("attach size overflows"))?;

		let (group, permit) = self.owned_permit(tg, apid)?;
		if !permit.is_active() {
			return Err(Error::NotFound("permit"));
		}
		if writable && permit.access == AccessMode::ReadOnly {
			return Err(Error::PermissionDenied);
		}
		let seg = Arc::clone(&permit.segment);
		if !seg.is_active() {
			return Err(Error::NotFound("segment"));
		}
		if offset.checked_add(size).is_none_or(|end| end > seg.size) {
			return Err(invalid("range lies outside the segment"));
		}

		let frames = self.segment_frames(&seg, offset, size).await?;
		let vaddr = match self.aspace.map(tg, frames, size, hint, writable) {
			Ok(vaddr) => vaddr,
			Err(e) => {
				self.return_frames(&seg, frames).await;
				return Err(e);
			}
		};

		let att = Arc::new(Attachment::new(vaddr, size, apid, frames, false));
		let linked = if permit.add_attachment(vaddr) {
			group.insert_attachment(att).inspect_err(|_| permit.remove_attachment(vaddr))
		} else {
			Err(Error::NotFound("permit"))
		};
		if let Err(e) = linked {
			if let Err(unmap) = self.aspace.unmap(tg, vaddr, size) {
				warn!(vaddr, error = %unmap, "unmap after failed attach");
			}
			self.return_frames(&seg, frames).await;
			return Err(e);
		}

		debug!(%apid, segid = %seg.segid, vaddr, size, "attached");
		Ok(vaddr)
	}

	async fn segment_frames(&self, seg: &Segment, offset: u64, size: u64) -> Result<FrameList> {
		let Some(grant) = seg.remote else {
			return self.aspace.frames(seg.tg, seg.vaddr + offset, size);
		};
		let args = AttachArgs {
			segid: seg.segid,
			apid: grant.apid,
			offset,
			size,
			frames: FrameList::default(),
		};
		let reply = self
			.domain
			.request(Command::new(CommandKind::Attach, Payload::Attach(args)))
			.await?;
		match reply.payload {
			Payload::Attach(args) if args.frames.count > 0 => Ok(args.frames),
			_ => Err(Error::RemoteFailure(CommandKind::Attach)),
		}
	}

	/// Gives back frames obtained by [`segment_frames`](Self::segment_frames).
	async fn return_frames(&self, seg: &Segment, frames: FrameList) {
		let Some(grant) = seg.remote else {
			self.aspace.release_frames(frames);
			return;
		};
		let args = DetachArgs {
			segid: seg.segid,
			apid: grant.apid,
			vaddr: frames.addr,
		};
		let cmd = Command::new(CommandKind::Detach, Payload::Detach(args));
		if let Err(e) = self.domain.request(cmd).await {
			warn!(segid = %seg.segid, error = %e, "remote detach failed");
		}
	}

	/// Unmaps the attachment at `vaddr`.
	pub async fn detach(&self, tg: TgId, vaddr: u64) -> Result<()> {
		check_caller(tg)?;
		let group = self.group(tg).ok_or(Error::NotFound("attachment"))?;
		let att = group.attachment(vaddr).ok_or(Error::NotFound("attachment"))?;
		let permit = group.permit(att.apid).ok_or(Error::NotFound("permit"))?;
		self.detach_attachment(&group, &permit, &att).await
	}

	pub(crate) async fn detach_attachment(
		&self,
		group: &ThreadGroup,
		permit: &AccessPermit,
		att: &Attachment,
	) -> Result<()> {
		permit.remove_attachment(att.vaddr);
		if !att.begin_destroy() {
			return Ok(());
		}
		group.remove_attachment(att.vaddr);

		let result = if att.served {
			self.aspace.release_frames(att.frames);
			Ok(())
		} else {
			let unmapped = self.aspace.unmap(group.id, att.vaddr, att.size);
			self.return_frames(&permit.segment, att.frames).await;
			unmapped
		};
		att.finish_destroy();
		debug!(apid = %att.apid, vaddr = att.vaddr, served = att.served, "detached");
		result
	}

	/// Raises the signal of the permit's segment.
	pub fn signal(&self, tg: TgId, apid: ApId) -> Result<()> {
		check_caller(tg)?;
		let (_, permit) = self.owned_permit(tg, apid)?;
		let seg = &permit.segment;
		if seg.is_shadow() {
			return Err(Error::NotSupported("signalling a remote segment"));
		}
		let handle = seg
			.signal
			.as_ref()
			.ok_or_else(|| invalid("segment has no signal channel"))?;
		if !permit.is_active() || !seg.is_active() || !handle.raise() {
			return Err(Error::NotFound("segment"));
		}
		Ok(())
	}

	/// Releases every permit held by `tg`.
	pub async fn release_all(&self, tg: TgId) {
		let Some(group) = self.group(tg) else {
			return;
		};
		for permit in group.permits() {
			if let Err(e) = self.release_permit(&group, &permit).await {
				warn!(%tg, apid = %permit.apid, error = %e, "release failed");
			}
		}
	}

	/// Removes every segment owned by `tg` that is not already going away.
	pub async fn remove_all(&self, tg: TgId) {
		let Some(group) = self.group(tg) else {
			return;
		};
		for seg in group.segments() {
			if !seg.is_active() {
				continue;
			}
			if let Err(e) = self.remove_segment(&seg).await {
				warn!(%tg, segid = %seg.segid, error = %e, "remove failed");
			}
		}
	}

	/// Cleans up after a process group that went away.
	pub async fn thread_group_exit(&self, tg: TgId) {
		if tg == TgId::REMOTE {
			return;
		}
		self.release_all(tg).await;
		self.remove_all(tg).await;
		let group = self.groups.write().remove(&tg);
		if let Some(group) = group
			&& !group.is_empty()
		{
			warn!(%tg, "thread group exited with live objects");
		}
		info!(%tg, "thread group exited");
	}

	/// Tears down every local thread group and leaves the partition.
	pub async fn shutdown(&self) {
		let tgs: Vec<TgId> = self
			.groups
			.read()
			.iter()
			.map(|(tg, _)| *tg)
			.filter(|tg| *tg != TgId::REMOTE)
			.collect();
		for tg in tgs {
			self.thread_group_exit(tg).await;
		}
		self.domain.close();
		info!("segment manager shut down");
	}

	/// Looks up a segment this domain owns or shadows.
	pub fn segment_info(&self, segid: SegId) -> Option<SegmentInfo> {
		let seg = self.shadow(segid).or_else(|| self.local_segment(segid))?;
		Some(SegmentInfo::from(&*seg))
	}

	/// Segids owned by `tg`.
	pub fn segments(&self, tg: TgId) -> Vec<SegId> {
		self.group(tg)
			.map(|group| group.segments().iter().map(|s| s.segid).collect())
			.unwrap_or_default()
	}

	/// Permits held by `tg`, sorted.
	pub fn permits(&self, tg: TgId) -> Vec<ApId> {
		let mut apids: Vec<ApId> = self
			.group(tg)
			.map(|group| group.permits().iter().map(|p| p.apid).collect())
			.unwrap_or_default();
		apids.sort();
		apids
	}

	/// Permits this domain has granted to other domains.
	pub fn served_permits(&self) -> Vec<ApId> {
		self.permits(TgId::REMOTE)
	}

	/// Cross-domain requests waiting for a completion.
	pub fn outstanding_requests(&self) -> usize {
		self.domain.outstanding()
	}

	fn group(&self, tg: TgId) -> Option<Arc<ThreadGroup>> {
		self.groups.read().search(&tg).cloned()
	}

	fn group_or_create(&self, tg: TgId) -> Result<Arc<ThreadGroup>> {
		if let Some(group) = self.group(tg) {
			return Ok(group);
		}
		let mut groups = self.groups.write();
		if let Some(group) = groups.search(&tg) {
			return Ok(Arc::clone(group));
		}
		let group = Arc::new(ThreadGroup::new(tg, &self.config)?);
		groups.insert(tg, Arc::clone(&group))?;
		debug!(%tg, "thread group registered");
		Ok(group)
	}

	fn owned_permit(&self, tg: TgId, apid: ApId) -> Result<(Arc<ThreadGroup>, Arc<AccessPermit>)> {
		if !apid.is_valid() {
			return Err(invalid("apid must be positive"));
		}
		if apid.tgid() != tg.0 {
			return Err(Error::PermissionDenied);
		}
		let group = self.group(tg).ok_or(Error::NotFound("permit"))?;
		let permit = group.permit(apid).ok_or(Error::NotFound("permit"))?;
		Ok((group, permit))
	}

	/// Active segment owned by a thread group of this domain.
	pub(crate) fn local_segment(&self, segid: SegId) -> Option<Arc<Segment>> {
		let owner = if self.is_well_known(segid) {
			self.well_known.lock().get(segid.0 as usize).copied().flatten()?
		} else {
			TgId(segid.tgid())
		};
		let seg = self.group(owner)?.segment(segid)?;
		seg.is_active().then_some(seg)
	}

	fn local_domid(&self) -> DomId {
		self.partition().domid().unwrap_or(DomId::NONE)
	}

	fn is_well_known(&self, segid: SegId) -> bool {
		(1..=self.config.max_wk_segid).contains(&segid.0)
	}

	fn reserve_well_known(&self, segid: SegId, tg: TgId) -> Result<()> {
		let mut table = self.well_known.lock();
		let slot = table
			.get_mut(segid.0 as usize)
			.ok_or_else(|| invalid(format!("{segid} is not a well-known segid")))?;
		if slot.is_some() {
			return Err(Error::AlreadyExists(segid.to_string()));
		}
		*slot = Some(tg);
		Ok(())
	}

	fn unreserve_well_known(&self, segid: SegId) {
		if let Some(slot) = self.well_known.lock().get_mut(segid.0 as usize) {
			*slot = None;
		}
	}

	fn abandon_segid(&self, group: &ThreadGroup, segid: SegId, uniq: Option<u16>) {
		match uniq {
			Some(uniq) => group.segids.free(uniq),
			None => self.unreserve_well_known(segid),
		}
	}
}

fn check_caller(tg: TgId) -> Result<()> {
	if tg == TgId::REMOTE {
		return Err(invalid("thread group 0 is reserved"));
	}
	Ok(())
}

fn check_permit_args(permit_type: PermitType, permit_value: u64) -> Result<()> {
	if permit_type == PermitType::Mode && permit_value & !0o777 != 0 {
		return Err(invalid(format!("permit mode {permit_value:#o} has bits beyond 0o777")));
	}
	Ok(())
}

/// Checks `access` against the segment's policy, or against the permit a
/// shadow holds at the owner.
pub(crate) fn check_access(seg: &Segment, access: AccessMode) -> Result<()> {
	if let Some(grant) = seg.remote {
		if access == AccessMode::ReadWrite && grant.access == AccessMode::ReadOnly {
			return Err(Error::PermissionDenied);
		}
		return Ok(());
	}
	match seg.permit_type {
		PermitType::Global => Ok(()),
		PermitType::Mode => {
			let needed = match access {
				AccessMode::ReadOnly => 0o444,
				AccessMode::ReadWrite => 0o222,
			};
			if seg.permit_value & needed == 0 {
				return Err(Error::PermissionDenied);
			}
			Ok(())
		}
	}
}

fn invalid(msg: impl Into<String>) -> Error {
	Error::Invalid(msg.into())
}

fn tg_hash(tg: &TgId) -> u32 {
	hash_u64(u64::from(tg.0))
}

fn segid_hash(segid: &SegId) -> u32 {
	hash_u64(segid.0 as u64)
}
