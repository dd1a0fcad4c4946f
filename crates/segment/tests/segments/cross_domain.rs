//! Segments shared between domains through shadow segments.

use pretty_assertions::assert_eq;
use xemem_partition::{AccessMode, CommandKind, PermitType, channel};
use xemem_segment::{Error, Lifecycle, MakeRequest, TgId};

use crate::common::{PAGE, domain, tree};

const OWNER: TgId = TgId(1);
const READER: TgId = TgId(7);
const OTHER: TgId = TgId(8);

#[tokio::test]
async fn test_remote_get_attach_release() {
	let (_root, ns, a, b) = tree();
	let made = a
		.manager
		.make(OWNER, MakeRequest::memory(0x1000, PAGE))
		.await
		.unwrap();
	let a_dom = a.part.domid().unwrap();
	assert_eq!(made.segid.domid(), a_dom);
	assert_eq!(ns.owner(made.segid), Some(a_dom));

	let apid = b
		.manager
		.get(READER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();
	assert_eq!(apid.tgid(), READER.0);
	assert_ne!(b.part.domid(), Some(a_dom));

	let shadow = b.manager.segment_info(made.segid).unwrap();
	assert!(shadow.shadow);
	assert_eq!(shadow.domid, a_dom);
	assert_eq!(shadow.size, PAGE);
	assert_eq!(shadow.refs, 1);
	let served = a.manager.served_permits();
	assert_eq!(served.len(), 1);
	assert_eq!(shadow.remote_apid, Some(served[0]));
	assert_eq!(a.manager.segment_info(made.segid).unwrap().refs, 1);

	let writable = b.manager.attach(READER, apid, 0, PAGE, None, true).await;
	assert!(matches!(writable, Err(Error::PermissionDenied)));

	let vaddr = b
		.manager
		.attach(READER, apid, 0, PAGE, None, false)
		.await
		.unwrap();
	assert_eq!(b.aspace.mapped(), 1);
	assert_eq!(a.aspace.pinned(), 1);
	let (frames, _, _) = b.aspace.mapping(READER, vaddr).unwrap();
	assert_eq!(frames.count, 1);

	b.manager.release(READER, apid).await.unwrap();
	assert_eq!(b.aspace.mapped(), 0);
	assert_eq!(a.aspace.pinned(), 0);
	assert!(a.manager.served_permits().is_empty());
	assert!(b.manager.segment_info(made.segid).is_none());

	let owned = a.manager.segment_info(made.segid).unwrap();
	assert_eq!(owned.lifecycle, Lifecycle::Active);
	assert_eq!(owned.refs, 0);

	a.manager.remove(OWNER, made.segid).await.unwrap();
	assert_eq!(ns.owner(made.segid), None);
	assert_eq!(b.manager.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_gets_share_one_shadow() {
	let (_root, _ns, a, b) = tree();
	let made = a
		.manager
		.make(OWNER, MakeRequest::memory(0x1000, 2 * PAGE))
		.await
		.unwrap();

	let (first, second) = tokio::join!(
		b.manager
			.get(READER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0),
		b.manager
			.get(OTHER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0),
	);
	let first = first.unwrap();
	let second = second.unwrap();

	assert_eq!(a.manager.served_permits().len(), 1);
	assert_eq!(b.manager.segment_info(made.segid).unwrap().refs, 2);

	b.manager.release(READER, first).await.unwrap();
	let shadow = b.manager.segment_info(made.segid).unwrap();
	assert_eq!(shadow.refs, 1);
	assert_eq!(a.manager.served_permits().len(), 1);

	b.manager.release(OTHER, second).await.unwrap();
	assert!(b.manager.segment_info(made.segid).is_none());
	assert!(a.manager.served_permits().is_empty());
}

#[tokio::test]
async fn test_referenced_shadow_survives_remove() {
	let (_root, _ns, a, b) = tree();
	let made = a
		.manager
		.make(OWNER, MakeRequest::memory(0x1000, PAGE))
		.await
		.unwrap();
	let apid = b
		.manager
		.get(READER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();

	let foreign = b.manager.remove(OTHER, made.segid).await;
	assert!(matches!(foreign, Err(Error::PermissionDenied)));

	b.manager.remove(READER, made.segid).await.unwrap();
	let shadow = b.manager.segment_info(made.segid).unwrap();
	assert_eq!(shadow.lifecycle, Lifecycle::Active);
	assert_eq!(a.manager.served_permits().len(), 1);

	let upgrade = b
		.manager
		.get(OTHER, made.segid, AccessMode::ReadWrite, PermitType::Global, 0)
		.await;
	assert!(matches!(upgrade, Err(Error::PermissionDenied)));

	b.manager.release(READER, apid).await.unwrap();
	assert!(b.manager.segment_info(made.segid).is_none());
}

#[tokio::test]
async fn test_owner_refuses_remote_get() {
	let (_root, _ns, a, b) = tree();
	let made = a
		.manager
		.make(
			OWNER,
			MakeRequest::memory(0x1000, PAGE).permit(PermitType::Mode, 0o440),
		)
		.await
		.unwrap();

	let res = b
		.manager
		.get(READER, made.segid, AccessMode::ReadWrite, PermitType::Global, 0)
		.await;
	assert!(matches!(res, Err(Error::RemoteFailure(CommandKind::Get))));
	assert!(b.manager.segment_info(made.segid).is_none());
	assert!(a.manager.served_permits().is_empty());

	b.manager
		.get(READER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();
	assert_eq!(a.manager.served_permits().len(), 1);
}

#[tokio::test]
async fn test_owner_remove_revokes_remote_permits() {
	let (_root, _ns, a, b) = tree();
	let made = a
		.manager
		.make(OWNER, MakeRequest::memory(0x1000, 2 * PAGE))
		.await
		.unwrap();
	let apid = b
		.manager
		.get(READER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();
	b.manager
		.attach(READER, apid, 0, PAGE, None, false)
		.await
		.unwrap();
	assert_eq!(a.aspace.pinned(), 1);

	a.manager.remove(OWNER, made.segid).await.unwrap();
	assert!(a.manager.served_permits().is_empty());
	assert_eq!(a.aspace.pinned(), 0);

	let res = b.manager.attach(READER, apid, PAGE, PAGE, None, false).await;
	assert!(matches!(res, Err(Error::RemoteFailure(CommandKind::Attach))));
	assert_eq!(b.aspace.mapped(), 1);

	b.manager.release(READER, apid).await.unwrap();
	assert_eq!(b.aspace.mapped(), 0);
	assert!(b.manager.segment_info(made.segid).is_none());
}

#[tokio::test]
async fn test_remote_signal_segment() {
	let (_root, _ns, a, b) = tree();
	let made = a.manager.make(OWNER, MakeRequest::signal()).await.unwrap();
	let apid = b
		.manager
		.get(READER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();

	let shadow = b.manager.segment_info(made.segid).unwrap();
	assert_eq!(shadow.size, 0);
	assert!(matches!(
		b.manager.signal(READER, apid),
		Err(Error::NotSupported(_))
	));
}

#[tokio::test]
async fn test_grandchild_attaches_through_parent() {
	let (_root, ns, a, b) = tree();
	let c = domain();
	channel::connect(&a.part, &c.part).unwrap();

	let made = b
		.manager
		.make(OWNER, MakeRequest::memory(0x2000, 2 * PAGE))
		.await
		.unwrap();
	assert_eq!(ns.owner(made.segid), b.part.domid());

	let apid = c
		.manager
		.get(READER, made.segid, AccessMode::ReadWrite, PermitType::Global, 0)
		.await
		.unwrap();
	let c_dom = c.part.domid().unwrap();
	assert_ne!(Some(c_dom), a.part.domid());
	assert_ne!(Some(c_dom), b.part.domid());

	let vaddr = c
		.manager
		.attach(READER, apid, PAGE, PAGE, None, true)
		.await
		.unwrap();
	assert_eq!(b.aspace.pinned(), 1);

	c.manager.detach(READER, vaddr).await.unwrap();
	assert_eq!(b.aspace.pinned(), 0);
	c.manager.thread_group_exit(READER).await;
	assert!(b.manager.served_permits().is_empty());
}
