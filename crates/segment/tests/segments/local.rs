//! Segments used inside the name server's own domain.

use pretty_assertions::assert_eq;
use xemem_partition::{AccessMode, ApId, CommandKind, DomId, PermitType, SegId};
use xemem_segment::{Error, Lifecycle, MakeFlags, MakeRequest, TgId};

use crate::common::{PAGE, domain, name_server};

const OWNER: TgId = TgId(1);
const USER: TgId = TgId(2);

#[tokio::test]
async fn test_make_registers_with_name_server() {
	let (root, ns) = name_server();
	let made = root
		.manager
		.make(OWNER, MakeRequest::memory(0x1000, PAGE))
		.await
		.unwrap();

	assert_eq!(made.segid, SegId::pack(1, DomId::NAME_SERVER, 1));
	assert_eq!(ns.owner(made.segid), Some(DomId::NAME_SERVER));
	assert_eq!(root.manager.segments(OWNER), vec![made.segid]);
	assert!(made.signal.is_none());

	let info = root.manager.segment_info(made.segid).unwrap();
	assert!(!info.shadow);
	assert_eq!(info.lifecycle, Lifecycle::Active);
	assert_eq!(info.size, PAGE);
	assert_eq!(root.manager.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_make_validates_arguments() {
	let (root, _ns) = name_server();
	let m = &root.manager;

	let unaligned = m.make(OWNER, MakeRequest::memory(0x1001, PAGE)).await;
	assert!(matches!(unaligned, Err(Error::Invalid(_))));
	let empty = m.make(OWNER, MakeRequest::memory(0x1000, 0)).await;
	assert!(matches!(empty, Err(Error::Invalid(_))));
	let mut nothing = MakeRequest::memory(0x1000, PAGE);
	nothing.flags = MakeFlags::empty();
	assert!(matches!(m.make(OWNER, nothing).await, Err(Error::Invalid(_))));
	let mode = MakeRequest::memory(0x1000, PAGE).permit(PermitType::Mode, 0o1777);
	assert!(matches!(m.make(OWNER, mode).await, Err(Error::Invalid(_))));
	let reserved = m.make(TgId(0), MakeRequest::memory(0x1000, PAGE)).await;
	assert!(matches!(reserved, Err(Error::Invalid(_))));
	let out_of_range = MakeRequest::memory(0x1000, PAGE).well_known(26);
	assert!(matches!(m.make(OWNER, out_of_range).await, Err(Error::Invalid(_))));

	assert!(m.segments(OWNER).is_empty());
}

#[tokio::test]
async fn test_well_known_segid() {
	let (root, ns) = name_server();
	let m = &root.manager;
	let req = MakeRequest::memory(0x1000, PAGE).well_known(5);

	let made = m.make(OWNER, req).await.unwrap();
	assert_eq!(made.segid, SegId(5));
	assert_eq!(ns.owner(SegId(5)), Some(DomId::NAME_SERVER));

	let again = m.make(TgId(3), req).await;
	assert!(matches!(again, Err(Error::AlreadyExists(_))));

	let apid = m
		.get(USER, SegId(5), AccessMode::ReadWrite, PermitType::Global, 0)
		.await
		.unwrap();
	m.release(USER, apid).await.unwrap();

	m.remove(OWNER, SegId(5)).await.unwrap();
	assert_eq!(ns.owner(SegId(5)), None);
	let remade = m.make(TgId(3), req).await.unwrap();
	assert_eq!(remade.segid, SegId(5));
}

#[tokio::test]
async fn test_get_checks_mode() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let made = m
		.make(
			OWNER,
			MakeRequest::memory(0x4000, 2 * PAGE).permit(PermitType::Mode, 0o400),
		)
		.await
		.unwrap();

	let denied = m
		.get(USER, made.segid, AccessMode::ReadWrite, PermitType::Global, 0)
		.await;
	assert!(matches!(denied, Err(Error::PermissionDenied)));

	let apid = m
		.get(USER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();
	assert_eq!(apid.tgid(), USER.0);
	assert_eq!(m.permits(USER), vec![apid]);
	assert_eq!(m.segment_info(made.segid).unwrap().refs, 1);
}

#[tokio::test]
async fn test_attach_and_detach() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let made = m.make(OWNER, MakeRequest::memory(0x10000, 4 * PAGE)).await.unwrap();
	let apid = m
		.get(USER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();

	let writable = m.attach(USER, apid, 0, PAGE, None, true).await;
	assert!(matches!(writable, Err(Error::PermissionDenied)));
	let outside = m.attach(USER, apid, 2 * PAGE, 3 * PAGE, None, false).await;
	assert!(matches!(outside, Err(Error::Invalid(_))));
	let foreign = m.attach(TgId(9), apid, 0, PAGE, None, false).await;
	assert!(matches!(foreign, Err(Error::PermissionDenied)));

	let vaddr = m
		.attach(USER, apid, PAGE, 100, Some(0x5000_0000), false)
		.await
		.unwrap();
	assert_eq!(vaddr, 0x5000_0000);
	let (frames, size, writable) = root.aspace.mapping(USER, vaddr).unwrap();
	assert_eq!(size, PAGE);
	assert_eq!(frames.count, 1);
	assert!(!writable);
	assert_eq!(root.aspace.pinned(), 1);

	m.detach(USER, vaddr).await.unwrap();
	assert_eq!(root.aspace.mapped(), 0);
	assert_eq!(root.aspace.pinned(), 0);
	assert!(matches!(m.detach(USER, vaddr).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_failed_map_returns_frames() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let made = m.make(OWNER, MakeRequest::memory(0x10000, PAGE)).await.unwrap();
	let apid = m
		.get(USER, made.segid, AccessMode::ReadWrite, PermitType::Global, 0)
		.await
		.unwrap();

	root.aspace.fail_map(true);
	let res = m.attach(USER, apid, 0, PAGE, None, true).await;
	assert!(matches!(res, Err(Error::Mapping(_))));
	assert_eq!(root.aspace.pinned(), 0);

	root.aspace.fail_map(false);
	m.attach(USER, apid, 0, PAGE, None, true).await.unwrap();
	assert_eq!(root.aspace.mapped(), 1);
}

#[tokio::test]
async fn test_release_detaches_first() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let made = m.make(OWNER, MakeRequest::memory(0x10000, 4 * PAGE)).await.unwrap();
	let apid = m
		.get(USER, made.segid, AccessMode::ReadWrite, PermitType::Global, 0)
		.await
		.unwrap();
	m.attach(USER, apid, 0, PAGE, None, true).await.unwrap();
	m.attach(USER, apid, PAGE, 2 * PAGE, None, false).await.unwrap();
	assert_eq!(root.aspace.mapped(), 2);

	let foreign = m.release(TgId(9), apid).await;
	assert!(matches!(foreign, Err(Error::PermissionDenied)));

	m.release(USER, apid).await.unwrap();
	assert_eq!(root.aspace.mapped(), 0);
	assert_eq!(root.aspace.pinned(), 0);
	assert!(m.permits(USER).is_empty());
	assert_eq!(m.segment_info(made.segid).unwrap().refs, 0);

	let again = m.release(USER, apid).await;
	assert!(matches!(again, Err(Error::NotFound(_))));
	let attach = m.attach(USER, apid, 0, PAGE, None, false).await;
	assert!(matches!(attach, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_remove_is_idempotent() {
	let (root, ns) = name_server();
	let m = &root.manager;
	let made = m.make(OWNER, MakeRequest::memory(0x1000, PAGE)).await.unwrap();

	let foreign = m.remove(USER, made.segid).await;
	assert!(matches!(foreign, Err(Error::PermissionDenied)));

	let (first, second) = tokio::join!(m.remove(OWNER, made.segid), m.remove(OWNER, made.segid));
	assert!(first.is_ok());
	assert!(matches!(second, Ok(()) | Err(Error::NotFound(_))));
	assert!(matches!(m.remove(OWNER, made.segid).await, Err(Error::NotFound(_))));

	assert_eq!(ns.owner(made.segid), None);
	assert!(m.segments(OWNER).is_empty());
	assert!(m.segment_info(made.segid).is_none());

	let get = m
		.get(USER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await;
	assert!(matches!(get, Err(Error::RemoteFailure(CommandKind::Get))));
}

#[tokio::test]
async fn test_remove_releases_permits() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let made = m.make(OWNER, MakeRequest::memory(0x1000, PAGE)).await.unwrap();
	let apid = m
		.get(USER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();
	m.attach(USER, apid, 0, PAGE, None, false).await.unwrap();

	m.remove(OWNER, made.segid).await.unwrap();
	assert!(m.permits(USER).is_empty());
	assert_eq!(root.aspace.mapped(), 0);
	assert_eq!(root.aspace.pinned(), 0);

	let attach = m.attach(USER, apid, 0, PAGE, None, false).await;
	assert!(matches!(attach, Err(Error::NotFound("permit"))));
	assert!(matches!(m.release(USER, apid).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_signal_segment() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let made = m.make(OWNER, MakeRequest::signal()).await.unwrap();
	let handle = made.signal.unwrap();

	let apid = m
		.get(USER, made.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();
	m.signal(USER, apid).unwrap();
	m.signal(USER, apid).unwrap();
	assert_eq!(handle.wait().await, Some(2));

	let memory = m.make(OWNER, MakeRequest::memory(0x1000, PAGE)).await.unwrap();
	let plain = m
		.get(USER, memory.segid, AccessMode::ReadOnly, PermitType::Global, 0)
		.await
		.unwrap();
	assert!(matches!(m.signal(USER, plain), Err(Error::Invalid(_))));

	m.remove(OWNER, made.segid).await.unwrap();
	assert!(handle.is_closed());
	assert_eq!(handle.wait().await, None);
	assert!(matches!(m.signal(USER, apid), Err(Error::NotFound("permit"))));
}

#[tokio::test]
async fn test_thread_group_exit() {
	let (root, ns) = name_server();
	let m = &root.manager;
	let first = m.make(OWNER, MakeRequest::memory(0x1000, PAGE)).await.unwrap();
	let second = m.make(OWNER, MakeRequest::memory(0x8000, PAGE)).await.unwrap();
	let apid = m
		.get(USER, first.segid, AccessMode::ReadWrite, PermitType::Global, 0)
		.await
		.unwrap();
	m.attach(USER, apid, 0, PAGE, None, true).await.unwrap();

	m.thread_group_exit(USER).await;
	assert_eq!(root.aspace.mapped(), 0);
	assert!(m.permits(USER).is_empty());

	m.thread_group_exit(OWNER).await;
	assert!(m.segments(OWNER).is_empty());
	assert_eq!(ns.owner(first.segid), None);
	assert_eq!(ns.owner(second.segid), None);
}

#[tokio::test]
async fn test_segid_reused_after_remove() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let first = m.make(OWNER, MakeRequest::memory(0x1000, PAGE)).await.unwrap();
	m.remove(OWNER, first.segid).await.unwrap();
	let second = m.make(OWNER, MakeRequest::memory(0x1000, PAGE)).await.unwrap();
	assert_eq!(first.segid, second.segid);
}

#[tokio::test]
async fn test_make_without_name_server() {
	let lone = domain();
	let res = lone.manager.make(OWNER, MakeRequest::memory(0x1000, PAGE)).await;
	let err = res.unwrap_err();
	assert!(matches!(
		err,
		Error::Partition(xemem_partition::Error::NoNameServer)
	));
	assert_eq!(err.errno(), libc::EHOSTUNREACH);
	assert!(lone.manager.segments(OWNER).is_empty());
}

#[tokio::test]
async fn test_invalid_ids() {
	let (root, _ns) = name_server();
	let m = &root.manager;
	let get = m
		.get(USER, SegId(-1), AccessMode::ReadOnly, PermitType::Global, 0)
		.await;
	assert!(matches!(get, Err(Error::Invalid(_))));
	assert!(matches!(m.release(USER, ApId(0)).await, Err(Error::Invalid(_))));
	assert!(matches!(m.remove(USER, SegId(0)).await, Err(Error::Invalid(_))));
}

#[tokio::test]
async fn test_shutdown_leaves_partition() {
	let (root, _ns) = name_server();
	let made = root
		.manager
		.make(OWNER, MakeRequest::memory(0x1000, PAGE))
		.await
		.unwrap();
	assert!(root.part.local_link().is_some());

	root.manager.shutdown().await;
	assert!(root.part.local_link().is_none());
	assert!(root.manager.segment_info(made.segid).is_none());
}
