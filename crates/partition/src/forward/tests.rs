use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use crate::testkit::RecordingConnection;
use crate::{
	AccessMode, ApId, Command, CommandKind, ConnectionKind, DomId, Error, GetArgs, LinkId,
	Partition, PartitionConfig, Payload, PermitType, SegId,
};

struct Node {
	part: Arc<Partition>,
	local: Arc<RecordingConnection>,
	local_link: LinkId,
	up: Arc<RecordingConnection>,
	up_link: LinkId,
	down: Arc<RecordingConnection>,
	down_link: LinkId,
}

/// Forwarding partition with a local connection, a parent and one child.
fn node() -> Node {
	let part = Partition::forwarding(PartitionConfig::default()).unwrap();
	let local = RecordingConnection::new();
	let up = RecordingConnection::new();
	let down = RecordingConnection::new();
	let local_link = part.add_connection(ConnectionKind::Local, local.clone()).unwrap();
	let up_link = part.add_connection(ConnectionKind::Remote, up.clone()).unwrap();
	let down_link = part.add_connection(ConnectionKind::Remote, down.clone()).unwrap();
	Node {
		part,
		local,
		local_link,
		up,
		up_link,
		down,
		down_link,
	}
}

fn response(domid: i64) -> Command {
	let mut cmd = Command::domid(CommandKind::DomidResponse, DomId(domid));
	cmd.src_dom = DomId::NAME_SERVER;
	cmd
}

fn get_cmd() -> Command {
	Command::new(
		CommandKind::Get,
		Payload::Get(GetArgs::new(
			SegId(99),
			AccessMode::ReadOnly,
			PermitType::Global,
			0,
		)),
	)
}

/// Gives the domain id `domid`, learned over the parent link.
async fn assign(n: &Node, domid: i64) {
	n.part.deliver(n.up_link, response(domid)).await.unwrap();
	assert_eq!(n.part.domid(), Some(DomId(domid)));
}

#[tokio::test]
async fn test_concurrent_get_domid_sends_one_request() {
	let n = node();
	let (a, b, ()) = tokio::join!(n.part.get_domid(), n.part.get_domid(), async {
		n.up.wait_for(1).await;
		tokio::task::yield_now().await;
		n.part.deliver(n.up_link, response(5)).await.unwrap();
	});

	assert_eq!(a.unwrap(), DomId(5));
	assert_eq!(b.unwrap(), DomId(5));
	assert_eq!(n.up.count(CommandKind::DomidRequest), 1);
	assert_eq!(n.part.lookup_domid(DomId(5)), Some(n.local_link));
	assert_eq!(n.part.lookup_domid(DomId::NAME_SERVER), Some(n.up_link));
	assert_eq!(n.part.ns_link(), Some(n.up_link));
}

#[tokio::test]
async fn test_domid_request_broadcasts_to_remote_links() {
	let n = node();
	let (res, ()) = tokio::join!(n.part.get_domid(), async {
		n.down.wait_for(1).await;
		n.part.deliver(n.up_link, response(3)).await.unwrap();
	});

	assert_eq!(res.unwrap(), DomId(3));
	assert_eq!(n.up.count(CommandKind::DomidRequest), 1);
	assert_eq!(n.down.count(CommandKind::DomidRequest), 1);
	assert!(n.local.sent().is_empty());
	let request = n.up.sent()[0];
	assert_eq!(request.dst_dom, DomId::NAME_SERVER);
}

#[tokio::test]
async fn test_get_domid_without_upstream_fails() {
	let part = Partition::forwarding(PartitionConfig::default()).unwrap();
	part
		.add_connection(ConnectionKind::Local, RecordingConnection::new())
		.unwrap();

	assert!(matches!(part.get_domid().await, Err(Error::NoNameServer)));
	assert!(matches!(part.get_domid().await, Err(Error::NoNameServer)));
}

#[tokio::test]
async fn test_interrupted_wait_keeps_request_outstanding() {
	let n = node();
	let cancel = CancellationToken::new();
	cancel.cancel();

	let res = n.part.get_domid_with(&cancel).await;
	assert!(matches!(res, Err(Error::Interrupted)));
	assert_eq!(n.up.count(CommandKind::DomidRequest), 1);

	let (res, ()) = tokio::join!(n.part.get_domid(), async {
		tokio::task::yield_now().await;
		n.part.deliver(n.up_link, response(4)).await.unwrap();
	});
	assert_eq!(res.unwrap(), DomId(4));
	assert_eq!(n.up.count(CommandKind::DomidRequest), 1);
}

#[tokio::test]
async fn test_child_request_is_answered_after_own() {
	let n = node();
	let child_request = Command::domid(CommandKind::DomidRequest, DomId::NONE);
	n.part.deliver(n.down_link, child_request).await.unwrap();

	// own request first, then the one on the child's behalf
	assert_eq!(n.up.count(CommandKind::DomidRequest), 2);
	assert_eq!(n.down.count(CommandKind::DomidRequest), 0);

	n.part.deliver(n.up_link, response(7)).await.unwrap();
	assert_eq!(n.part.domid(), Some(DomId(7)));
	assert!(n.down.sent().is_empty());

	n.part.deliver(n.up_link, response(8)).await.unwrap();
	assert_eq!(n.part.domid(), Some(DomId(7)));
	assert_eq!(n.part.lookup_domid(DomId(8)), Some(n.down_link));
	let forwarded = n.down.sent();
	assert_eq!(forwarded.len(), 1);
	assert_eq!(forwarded[0].payload, Payload::Domid(DomId(8)));
}

#[tokio::test]
async fn test_child_request_goes_to_ns_link_once_known() {
	let n = node();
	assign(&n, 2).await;

	let child_request = Command::domid(CommandKind::DomidRequest, DomId::NONE);
	n.part.deliver(n.down_link, child_request).await.unwrap();
	assert_eq!(n.up.count(CommandKind::DomidRequest), 1);

	n.part.deliver(n.up_link, response(9)).await.unwrap();
	assert_eq!(n.part.lookup_domid(DomId(9)), Some(n.down_link));
	assert_eq!(n.down.count(CommandKind::DomidResponse), 1);
}

#[tokio::test]
async fn test_unmatched_response_is_inconsistent() {
	let n = node();
	assign(&n, 2).await;

	let err = n.part.deliver(n.up_link, response(3)).await.unwrap_err();
	assert!(matches!(err, Error::Inconsistency(_)));
}

#[tokio::test]
async fn test_request_without_domid_fails_back() {
	let n = node();
	n.part.deliver(n.down_link, get_cmd()).await.unwrap();

	let reply = n.down.sent()[0];
	assert_eq!(reply.kind, CommandKind::GetComplete);
	let Payload::Get(args) = reply.payload else {
		panic!("expected get payload");
	};
	assert_eq!(args.apid, ApId(-1));

	let mut completion = get_cmd();
	completion.complete();
	let err = n.part.deliver(n.down_link, completion).await.unwrap_err();
	assert!(matches!(err, Error::NoDomid));
}

#[tokio::test]
async fn test_local_commands_are_stamped_and_sent_to_name_server() {
	let n = node();
	assign(&n, 5).await;

	n.part.deliver(n.local_link, get_cmd()).await.unwrap();

	let sent = n.up.sent().into_iter().last().unwrap();
	assert_eq!(sent.kind, CommandKind::Get);
	assert_eq!(sent.req_dom, DomId(5));
	assert_eq!(sent.src_dom, DomId(5));
	assert_eq!(sent.dst_dom, DomId::NAME_SERVER);
}

#[tokio::test]
async fn test_commands_route_by_destination() {
	let n = node();
	assign(&n, 5).await;
	n.part.add_domid(DomId(8), n.down_link).unwrap();

	let mut to_child = get_cmd();
	to_child.dst_dom = DomId(8);
	n.part.deliver(n.up_link, to_child).await.unwrap();
	assert_eq!(n.down.sent(), vec![to_child]);

	let mut to_self = get_cmd();
	to_self.dst_dom = DomId(5);
	n.part.deliver(n.up_link, to_self).await.unwrap();
	assert_eq!(n.local.sent(), vec![to_self]);

	let mut lost = get_cmd();
	lost.dst_dom = DomId(40);
	let err = n.part.deliver(n.up_link, lost).await.unwrap_err();
	assert!(matches!(err, Error::NoRoute(DomId(40))));
}

#[tokio::test]
async fn test_domid_release_is_relayed() {
	let n = node();
	assign(&n, 5).await;

	let mut release = Command::domid(CommandKind::DomidRelease, DomId(8));
	release.dst_dom = DomId::NAME_SERVER;
	n.part.deliver(n.down_link, release).await.unwrap();
	assert_eq!(n.up.sent().into_iter().last(), Some(release));
}

#[tokio::test]
async fn test_pong_discovers_name_server() {
	let n = node();
	n.part
		.deliver(n.up_link, Command::ping(CommandKind::PongNs))
		.await
		.unwrap();

	assert_eq!(n.part.ns_link(), Some(n.up_link));
	assert_eq!(n.part.lookup_domid(DomId::NAME_SERVER), Some(n.up_link));
	assert_eq!(n.up.count(CommandKind::DomidRequest), 1);
	assert_eq!(n.down.count(CommandKind::PongNs), 1);

	n.part
		.deliver(n.down_link, Command::ping(CommandKind::PingNs))
		.await
		.unwrap();
	assert_eq!(n.down.count(CommandKind::PongNs), 2);
}

#[tokio::test]
async fn test_ping_before_discovery_is_ignored() {
	let n = node();
	n.part
		.deliver(n.down_link, Command::ping(CommandKind::PingNs))
		.await
		.unwrap();
	assert!(n.down.sent().is_empty());
}
