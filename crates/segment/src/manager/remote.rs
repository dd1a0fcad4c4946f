//! Requests from other domains for segments owned here.
//!
//! Permits and attachments granted to other domains live in the reserved
//! thread group [`TgId::REMOTE`]. A served attachment is keyed by the
//! address of its frame list, which the requester echoes back on detach.

use std::sync::Arc;

use tracing::{debug, warn};
use xemem_partition::{AttachArgs, Command, DetachArgs, GetArgs, Payload, ReleaseArgs};

use super::{SegmentManager, check_access};
use crate::segment::Attachment;
use crate::thread_group::{TgId, ThreadGroup};
use crate::{Error, Result};

impl SegmentManager {
	/// Serves one request and sends back its completion, failed if the
	/// request could not be carried out.
	pub(crate) async fn serve(&self, mut cmd: Command) {
		let served = match cmd.payload {
			Payload::Get(args) => self.serve_get(args).map(Payload::Get),
			Payload::Release(args) => self
				.serve_release(args)
				.await
				.map(|()| Payload::Release(args)),
			Payload::Attach(args) => self.serve_attach(args).map(Payload::Attach),
			Payload::Detach(args) => self.serve_detach(args).await.map(|()| Payload::Detach(args)),
			_ => Err(Error::NotSupported("segment registration outside the name server")),
		};

		match served {
			Ok(payload) => {
				cmd.payload = payload;
				cmd.complete();
			}
			Err(e) => {
				debug!(kind = ?cmd.kind, req = %cmd.req_dom, error = %e, "request refused");
				cmd.fail();
			}
		}
		if let Err(e) = self.domain.reply(cmd).await {
			warn!(kind = ?cmd.kind, req = %cmd.req_dom, error = %e, "completion not sent");
		}
	}

	fn serve_get(&self, mut args: GetArgs) -> Result<GetArgs> {
		let seg = self.local_segment(args.segid).ok_or(Error::NotFound("segment"))?;
		check_access(&seg, args.access)?;
		let group = self.remote_group()?;

		args.apid = self.grant(&group, Arc::clone(&seg), args.access)?;
		args.size = seg.size;
		args.domid = seg.domid;
		args.sigid = seg.sigid;
		args.seg_flags = seg.flags;
		Ok(args)
	}

	async fn serve_release(&self, args: ReleaseArgs) -> Result<()> {
		let group = self.remote_group()?;
		let permit = group.permit(args.apid).ok_or(Error::NotFound("permit"))?;
		if permit.segment.segid != args.segid {
			return Err(Error::PermissionDenied);
		}
		self.release_permit(&group, &permit).await
	}

	fn serve_attach(&self, mut args: AttachArgs) -> Result<AttachArgs> {
		let group = self.remote_group()?;
		let permit = group
			.permit(args.apid)
			.filter(|p| p.is_active())
			.ok_or(Error::NotFound("permit"))?;
		let seg = &permit.segment;
		if seg.segid != args.segid {
			return Err(Error::PermissionDenied);
		}
		if !seg.is_active() {
			return Err(Error::NotFound("segment"));
		}
		if args.size == 0
			|| args
				.offset
				.checked_add(args.size)
				.is_none_or(|end| end > seg.size)
		{
			return Err(Error::Invalid("range lies outside the segment".into()));
		}

		let frames = self.aspace.frames(seg.tg, seg.vaddr + args.offset, args.size)?;
		let att = Arc::new(Attachment::new(frames.addr, args.size, args.apid, frames, true));
		let linked = if permit.add_attachment(frames.addr) {
			group
				.insert_attachment(att)
				.inspect_err(|_| permit.remove_attachment(frames.addr))
		} else {
			Err(Error::NotFound("permit"))
		};
		if let Err(e) = linked {
			self.aspace.release_frames(frames);
			return Err(e);
		}

		args.frames = frames;
		Ok(args)
	}

	async fn serve_detach(&self, args: DetachArgs) -> Result<()> {
		let group = self.remote_group()?;
		let att = group.attachment(args.vaddr).ok_or(Error::NotFound("attachment"))?;
		if att.apid != args.apid {
			return Err(Error::PermissionDenied);
		}
		let permit = group.permit(att.apid).ok_or(Error::NotFound("permit"))?;
		self.detach_attachment(&group, &permit, &att).await
	}

	fn remote_group(&self) -> Result<Arc<ThreadGroup>> {
		self.group(TgId::REMOTE).ok_or(Error::NotFound("remote thread group"))
	}
}
