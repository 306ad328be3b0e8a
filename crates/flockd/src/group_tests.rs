//! Cluster scenario tests.
//!
//! Whole nodes are assembled around one in-process bus and driven by
//! hand: every test pulls driver events one at a time and pumps the
//! serializer until the cluster is quiescent, so interleavings are
//! deterministic and the rosters of all nodes can be compared after
//! every step.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::timeout;

use flock_proto::constants::SD_FLAG_CMD_DIRECT;
use flock_proto::error::{SdError, SdResult};
use flock_proto::message::{
    JoinMessage, LeaveMessage, Message, MessageHeader, MsgState, Opcode, VdiOpcode, VdiRequest,
};
use flock_proto::node::{ClusterStatus, NodeEntry, NodeId};
use flock_proto::request::{IoOpcode, IoRequest, VdiOpReply, VdiOpRequest};

use crate::cluster::local::{LocalBus, LocalDriver};
use crate::cluster::ClusterDriver;
use crate::config::{self, ClusterConfig};
use crate::core::Core;
use crate::epoch::EpochLog;
use crate::group::Reachability;
use crate::serializer::{
    Event, Gate, GatewayPool, IoResponder, IoWorkerPool, QueuedRequest, Serializer,
    SerializerParts,
};
use crate::store::FixedRecoveryStore;
use crate::vdi::{MemVdiLayer, VdiLayer};

const CTIME: u64 = 0x5eed_0000_0000_0001;

// ─── Test doubles ───────────────────────────────────────────────────────

/// Reachability matrix: peers are reachable unless cut.
#[derive(Default)]
struct MatrixProbe {
    unreachable: Mutex<HashSet<NodeEntry>>,
}

impl MatrixProbe {
    fn cut(&self, peers: &[NodeEntry]) {
        let mut set = self.unreachable.lock().unwrap();
        for peer in peers {
            set.insert(*peer);
        }
    }
}

#[async_trait]
impl Reachability for MatrixProbe {
    async fn reachable(&self, peer: &NodeEntry) -> bool {
        !self.unreachable.lock().unwrap().contains(peer)
    }
}

/// Worker pool that completes every request on the spot.
struct InstantPool;

#[async_trait]
impl IoWorkerPool for InstantPool {
    async fn execute(&self, req: IoRequest, responder: IoResponder) {
        responder.complete(Ok(req.data));
    }
}

#[async_trait]
impl GatewayPool for InstantPool {
    async fn forward(&self, req: IoRequest, responder: IoResponder) {
        responder.complete(Ok(req.data));
    }
}

/// Worker pool that parks requests until the test releases them.
#[derive(Default)]
struct HoldPool {
    held: Mutex<Vec<IoResponder>>,
}

impl HoldPool {
    fn release_one(&self) {
        if let Some(responder) = self.held.lock().unwrap().pop() {
            responder.complete(Ok(Vec::new()));
        }
    }

    fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

#[async_trait]
impl IoWorkerPool for HoldPool {
    async fn execute(&self, _req: IoRequest, responder: IoResponder) {
        self.held.lock().unwrap().push(responder);
    }
}

#[async_trait]
impl GatewayPool for HoldPool {
    async fn forward(&self, _req: IoRequest, responder: IoResponder) {
        self.held.lock().unwrap().push(responder);
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

struct TestNode {
    node: Serializer,
    id: NodeId,
    entry: NodeEntry,
    store: Arc<FixedRecoveryStore>,
    probe: Arc<MatrixProbe>,
    vdi: Arc<MemVdiLayer>,
}

fn entry(n: u8) -> NodeEntry {
    let mut e = NodeEntry::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 7000);
    e.zone = n as u32;
    e
}

async fn seed_history(dir: &Path, epoch: u32, nodes: &[NodeEntry], copies: u32) {
    EpochLog::new(dir.join("epoch"))
        .write(epoch, nodes)
        .await
        .unwrap();
    config::save_config(
        dir,
        &ClusterConfig {
            ctime: CTIME,
            nr_copies: copies,
            flags: 0,
        },
    )
    .await
    .unwrap();
}

async fn boot_with_pool(
    bus: &Arc<LocalBus>,
    dir: &Path,
    n: u8,
    io_pool: Arc<dyn IoWorkerPool>,
    gateway: Arc<dyn GatewayPool>,
) -> TestNode {
    let this_entry = entry(n);
    let driver: Arc<dyn ClusterDriver> = Arc::new(LocalDriver::new(bus.clone()));
    let id = driver.init(&this_entry).await.unwrap();

    let store = Arc::new(FixedRecoveryStore::default());
    let probe = Arc::new(MatrixProbe::default());
    let vdi = Arc::new(MemVdiLayer::default());
    let config = config::load_config(dir).await.unwrap();

    let (mut node, _handle) = Serializer::new(SerializerParts {
        core: Core::new(id, this_entry),
        config,
        dir: dir.to_path_buf(),
        epoch_log: EpochLog::new(dir.join("epoch")),
        driver,
        store: store.clone(),
        vdi: vdi.clone(),
        io_pool,
        gateway,
        probe: probe.clone(),
    });
    node.prepare().await.unwrap();
    node.driver.join().await.unwrap();

    TestNode {
        node,
        id,
        entry: this_entry,
        store,
        probe,
        vdi,
    }
}

async fn boot(bus: &Arc<LocalBus>, dir: &Path, n: u8) -> TestNode {
    boot_with_pool(bus, dir, n, Arc::new(InstantPool), Arc::new(InstantPool)).await
}

/// Pull and process everything this node can see right now. Returns
/// whether any driver event was consumed, or the fatal error that fenced
/// the node.
async fn drive(tn: &mut TestNode) -> SdResult<bool> {
    let mut busy = false;
    loop {
        tn.node.drain_commands().await?;
        let driver = tn.node.driver.clone();
        match timeout(Duration::from_millis(20), driver.recv_event()).await {
            Ok(Ok(ev)) => {
                busy = true;
                tn.node.ingest_driver(ev);
                tn.node.pump().await?;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tn.node.pump().await?;
                tn.node.drain_commands().await?;
                tn.node.pump().await?;
                return Ok(busy);
            }
        }
    }
}

/// Drive every node until a full round moves nothing.
async fn settle(nodes: &mut [TestNode]) {
    loop {
        let mut busy = false;
        for tn in nodes.iter_mut() {
            busy |= drive(tn).await.unwrap();
        }
        if !busy {
            return;
        }
    }
}

async fn submit_vdi(
    tn: &mut TestNode,
    req: VdiRequest,
    data: Vec<u8>,
) -> oneshot::Receiver<VdiOpReply> {
    let (tx, rx) = oneshot::channel();
    tn.node.fifo.push_back(Event::Request(QueuedRequest::Vdi {
        req: VdiOpRequest { req, data },
        client: tx,
    }));
    tn.node.pump().await.unwrap();
    rx
}

async fn submit_io(
    tn: &mut TestNode,
    oid: u64,
    epoch: u32,
    flags: u16,
) -> oneshot::Receiver<SdResult<Vec<u8>>> {
    let mut req = IoRequest::new(IoOpcode::Read, oid, epoch);
    req.flags |= flags;
    let (tx, rx) = oneshot::channel();
    tn.node
        .fifo
        .push_back(Event::Request(QueuedRequest::Io { req, client: tx }));
    tn.node.pump().await.unwrap();
    rx
}

async fn make_fs(tn: &mut TestNode, copies: u32) -> oneshot::Receiver<VdiOpReply> {
    let mut req = VdiRequest::new(VdiOpcode::MakeFs);
    req.copies = copies;
    req.ctime = CTIME;
    submit_vdi(tn, req, Vec::new()).await
}

/// Identical event histories must leave identical membership state.
async fn assert_same_view(a: &TestNode, b: &TestNode) {
    assert_eq!(a.node.core.epoch, b.node.core.epoch);
    assert_eq!(a.node.core.status, b.node.core.status);
    assert_eq!(
        a.node.core.ordered_node_list(),
        b.node.core.ordered_node_list()
    );
    let epoch = a.node.core.epoch;
    if epoch > 0 {
        assert_eq!(
            a.node.epoch_log.read(epoch).await.unwrap(),
            b.node.epoch_log.read(epoch).await.unwrap()
        );
    }
}

// ─── End-to-end scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn test_first_node_bootstrap_and_format() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = vec![boot(&bus, dir.path(), 1).await];
    settle(&mut nodes).await;

    let n1 = &nodes[0];
    assert_eq!(n1.node.core.status, ClusterStatus::WaitForFormat);
    assert_eq!(n1.node.core.epoch, 0);
    assert!(n1.node.core.is_master());
    assert_eq!(n1.node.core.ordered_node_list(), vec![n1.entry]);

    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    let reply = reply.try_recv().expect("format reply");
    assert_eq!(reply.rsp.result, 0);

    let n1 = &nodes[0];
    assert_eq!(n1.node.core.status, ClusterStatus::Ok);
    assert_eq!(n1.node.core.epoch, 1);
    assert_eq!(n1.node.core.nr_copies, 3);
    assert_eq!(n1.node.core.ctime, CTIME);
    assert_eq!(
        n1.node.epoch_log.read(1).await.unwrap(),
        vec![n1.entry]
    );

    // Format itself is not a membership change; no recovery ran.
    assert!(n1.store.recovery_epochs().is_empty());
}

#[tokio::test]
async fn test_second_node_admission() {
    let bus = LocalBus::new();
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let mut nodes = vec![boot(&bus, dir1.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);

    nodes.push(boot(&bus, dir2.path(), 2).await);
    settle(&mut nodes).await;

    for tn in &nodes {
        assert_eq!(tn.node.core.status, ClusterStatus::Ok);
        assert_eq!(tn.node.core.epoch, 2);
        assert_eq!(
            tn.node.core.ordered_node_list(),
            vec![entry(1), entry(2)]
        );
        assert_eq!(
            tn.node.epoch_log.read(2).await.unwrap(),
            vec![entry(1), entry(2)]
        );
        // The admission commit kicked off recovery for the new epoch.
        assert_eq!(tn.node.core.nr_leave(), 0);
        assert!(tn.store.recovery_epochs().contains(&2));
    }
    // The joiner adopted the cluster settings.
    assert_eq!(nodes[1].node.core.ctime, CTIME);
    assert_eq!(nodes[1].node.core.nr_copies, 3);
    assert!(nodes[0].node.core.is_master());
    assert!(!nodes[1].node.core.is_master());
    assert_same_view(&nodes[0], &nodes[1]).await;
}

#[tokio::test]
async fn test_full_restart_reaches_quorum() {
    let bus = LocalBus::new();
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let roster = vec![entry(1), entry(2), entry(3)];
    for dir in &dirs {
        seed_history(dir.path(), 5, &roster, 3).await;
    }

    let mut nodes = vec![boot(&bus, dirs[0].path(), 1).await];
    settle(&mut nodes).await;
    assert_eq!(nodes[0].node.core.status, ClusterStatus::WaitForJoin);
    assert_eq!(nodes[0].node.core.epoch, 5);
    assert!(nodes[0].node.core.is_master());

    nodes.push(boot(&bus, dirs[1].path(), 2).await);
    settle(&mut nodes).await;
    for tn in &nodes {
        assert_eq!(tn.node.core.status, ClusterStatus::WaitForJoin);
        assert_eq!(tn.node.core.epoch, 5);
    }

    nodes.push(boot(&bus, dirs[2].path(), 3).await);
    settle(&mut nodes).await;
    for tn in &nodes {
        assert_eq!(tn.node.core.status, ClusterStatus::Ok);
        assert_eq!(tn.node.core.epoch, 6);
        assert_eq!(tn.node.core.ordered_node_list(), roster);
        assert_eq!(tn.node.epoch_log.read(6).await.unwrap(), roster);
        assert!(tn.store.recovery_epochs().contains(&6));
        // Rejoin history was not rewritten.
        assert_eq!(tn.node.epoch_log.read(5).await.unwrap(), roster);
    }
    assert_same_view(&nodes[0], &nodes[1]).await;
    assert_same_view(&nodes[1], &nodes[2]).await;
}

#[tokio::test]
async fn test_partial_restart_with_known_dead_peer() {
    let bus = LocalBus::new();
    let dirs: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
    let old_roster = vec![entry(1), entry(2), entry(3)];
    for dir in &dirs {
        seed_history(dir.path(), 5, &old_roster, 3).await;
    }

    let mut nodes = vec![boot(&bus, dirs[0].path(), 1).await];
    settle(&mut nodes).await;
    assert_eq!(nodes[0].node.core.status, ClusterStatus::WaitForJoin);

    // The third node is known dead: replay its leave announcement.
    let dead_id = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 99);
    let leave = Message::Leave(LeaveMessage {
        header: MessageHeader::new(Opcode::Leave, MsgState::Fin, dead_id, entry(3)),
        epoch: 5,
    });
    bus.inject(dead_id, &leave.encode()).await;
    settle(&mut nodes).await;
    assert_eq!(nodes[0].node.core.status, ClusterStatus::WaitForJoin);
    assert_eq!(nodes[0].node.core.nr_leave(), 1);

    // The second rejoin now satisfies known == present + leave.
    nodes.push(boot(&bus, dirs[1].path(), 2).await);
    settle(&mut nodes).await;

    let new_roster = vec![entry(1), entry(2)];
    for tn in &nodes {
        assert_eq!(tn.node.core.status, ClusterStatus::Ok);
        assert_eq!(tn.node.core.epoch, 6);
        assert_eq!(tn.node.core.ordered_node_list(), new_roster);
        assert_eq!(tn.node.epoch_log.read(6).await.unwrap(), new_roster);
        assert_eq!(tn.node.core.nr_leave(), 0);
    }
    assert_same_view(&nodes[0], &nodes[1]).await;
}

#[tokio::test]
async fn test_minority_partition_self_fences() {
    let bus = LocalBus::new();
    let dirs: Vec<_> = (0..5).map(|_| tempfile::tempdir().unwrap()).collect();

    let mut nodes = vec![boot(&bus, dirs[0].path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);

    for n in 2..=5u8 {
        nodes.push(boot(&bus, dirs[n as usize - 1].path(), n).await);
        settle(&mut nodes).await;
    }
    assert_eq!(nodes[0].node.core.epoch, 5);
    assert_eq!(nodes[0].node.core.nr_storage(), 5);

    // Cut {n4, n5} off from {n1, n2, n3}.
    let majority = [entry(1), entry(2), entry(3)];
    let minority = [entry(4), entry(5)];
    for tn in &nodes[..3] {
        tn.probe.cut(&minority);
    }
    for tn in &nodes[3..] {
        tn.probe.cut(&majority);
    }
    let majority_ids = [nodes[0].id, nodes[1].id, nodes[2].id];
    let minority_ids = [nodes[3].id, nodes[4].id];
    bus.partition(&[&majority_ids, &minority_ids]).await;

    // The minority pair cannot reach a majority and aborts.
    assert!(drive(&mut nodes[3]).await.is_err());
    assert!(drive(&mut nodes[4]).await.is_err());

    // The majority keeps serving: two departures, two epoch bumps.
    for tn in nodes[..3].iter_mut() {
        assert!(drive(tn).await.is_ok());
    }
    for tn in &nodes[..3] {
        assert_eq!(tn.node.core.status, ClusterStatus::Ok);
        assert_eq!(tn.node.core.epoch, 7);
        assert_eq!(
            tn.node.core.ordered_node_list(),
            vec![entry(1), entry(2), entry(3)]
        );
        assert_eq!(
            tn.node.epoch_log.read(7).await.unwrap(),
            vec![entry(1), entry(2), entry(3)]
        );
    }
}

#[tokio::test]
async fn test_master_transfer_on_epoch_mismatch() {
    let bus = LocalBus::new();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    // A went down at epoch 5; B lived on alone up to epoch 7.
    seed_history(dir_a.path(), 5, &[entry(1), entry(2)], 3).await;
    seed_history(dir_b.path(), 7, &[entry(2)], 3).await;

    let mut a = boot(&bus, dir_a.path(), 1).await;
    assert!(drive(&mut a).await.is_ok());
    assert_eq!(a.node.core.status, ClusterStatus::WaitForJoin);
    assert_eq!(a.node.core.epoch, 5);
    assert!(a.node.core.is_master());

    let mut b = boot(&bus, dir_b.path(), 2).await;
    assert!(drive(&mut b).await.is_ok());

    // The master learns the joiner outlived it and steps down.
    assert!(drive(&mut a).await.is_err());

    // The next node in roster order picks the cluster up at its epoch.
    assert!(drive(&mut b).await.is_ok());
    assert_eq!(b.node.core.status, ClusterStatus::Ok);
    assert_eq!(b.node.core.epoch, 7);
    assert!(b.node.core.is_master());
    assert_eq!(b.node.core.ordered_node_list(), vec![entry(2)]);
}

// ─── VDI-op round trips ─────────────────────────────────────────────────

#[tokio::test]
async fn test_vdi_op_from_non_master() {
    let bus = LocalBus::new();
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let mut nodes = vec![boot(&bus, dir1.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);
    nodes.push(boot(&bus, dir2.path(), 2).await);
    settle(&mut nodes).await;

    // Create a VDI through the non-master; the master executes it and
    // the commit reaches every node.
    let mut req = VdiRequest::new(VdiOpcode::New);
    req.vdi_size = 1 << 30;
    let mut reply = submit_vdi(&mut nodes[1], req, b"vol0\0".to_vec()).await;
    settle(&mut nodes).await;
    let reply = reply.try_recv().expect("vdi reply");
    assert_eq!(reply.rsp.result, 0);
    let vid = reply.rsp.vdi_id;
    assert_ne!(vid, 0);

    // Side effects land on every node; the execution only on the master.
    assert!(nodes[0].node.core.is_vdi_inuse(vid));
    assert!(nodes[1].node.core.is_vdi_inuse(vid));
    assert_eq!(nodes[0].vdi.lookup(2, "vol0", 0).await.unwrap(), vid);
    assert_eq!(
        nodes[1].vdi.lookup(2, "vol0", 0).await,
        Err(SdError::NoVdi)
    );

    // A second create of the same name fails cluster-wide.
    let mut reply = submit_vdi(
        &mut nodes[1],
        VdiRequest::new(VdiOpcode::New),
        b"vol0\0".to_vec(),
    )
    .await;
    settle(&mut nodes).await;
    assert_eq!(
        reply.try_recv().unwrap().rsp.result,
        SdError::VdiExist.to_code()
    );
}

#[tokio::test]
async fn test_shutdown_op_commits_everywhere() {
    let bus = LocalBus::new();
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let mut nodes = vec![boot(&bus, dir1.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);
    nodes.push(boot(&bus, dir2.path(), 2).await);
    settle(&mut nodes).await;

    let mut reply = submit_vdi(&mut nodes[0], VdiRequest::new(VdiOpcode::Shutdown), Vec::new()).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);
    for tn in &nodes {
        assert_eq!(tn.node.core.status, ClusterStatus::Shutdown);
    }
}

#[tokio::test]
async fn test_join_commit_redelivery_bumps_once() {
    let bus = LocalBus::new();
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let mut nodes = vec![boot(&bus, dir1.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);
    nodes.push(boot(&bus, dir2.path(), 2).await);
    settle(&mut nodes).await;
    assert_eq!(nodes[0].node.core.epoch, 2);

    // Replay the commit of n2's join against n1: the joiner is already
    // ratified, so the epoch must not move again.
    let mut jm = JoinMessage::new(nodes[1].id, nodes[1].entry);
    jm.header.state = MsgState::Fin;
    jm.result = 0;
    jm.inc_epoch = true;
    jm.cluster_status = ClusterStatus::Ok;
    jm.epoch = 1;
    jm.ctime = CTIME;
    jm.nr_copies = 3;
    nodes[0].node.update_cluster_info(&jm).await.unwrap();

    assert_eq!(nodes[0].node.core.epoch, 2);
    assert_eq!(
        nodes[0].node.epoch_log.read(3).await,
        Err(SdError::NoTag)
    );
}

// ─── Request gating ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_io_epoch_gate() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = vec![boot(&bus, dir.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);

    // Matching epoch: dispatched and completed.
    let mut rx = submit_io(&mut nodes[0], 0x100, 1, SD_FLAG_CMD_DIRECT).await;
    settle(&mut nodes).await;
    assert!(rx.try_recv().unwrap().is_ok());

    // Stale epoch on a locally-owned object.
    let mut rx = submit_io(&mut nodes[0], 0x100, 0, SD_FLAG_CMD_DIRECT).await;
    assert_eq!(rx.try_recv().unwrap(), Err(SdError::OldNodeVer));

    // Future epoch on a locally-owned object.
    let mut rx = submit_io(&mut nodes[0], 0x100, 2, SD_FLAG_CMD_DIRECT).await;
    assert_eq!(rx.try_recv().unwrap(), Err(SdError::NewNodeVer));
}

#[tokio::test]
async fn test_recovering_object_gate() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = vec![boot(&bus, dir.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);

    nodes[0].store.set_recovering(0x200, true);

    // Direct access to a recovering object fails fast.
    let mut rx = submit_io(&mut nodes[0], 0x200, 1, SD_FLAG_CMD_DIRECT).await;
    assert_eq!(rx.try_recv().unwrap(), Err(SdError::NewNodeVer));

    // A forwarded request waits on the object instead.
    let mut waiting = submit_io(&mut nodes[0], 0x200, 1, 0).await;
    assert!(waiting.try_recv().is_err());

    // Once the object is recovered, traffic on it resumes and the waiter
    // is replayed.
    nodes[0].store.set_recovering(0x200, false);
    let mut rx = submit_io(&mut nodes[0], 0x200, 1, SD_FLAG_CMD_DIRECT).await;
    settle(&mut nodes).await;
    assert!(rx.try_recv().unwrap().is_ok());
    assert!(waiting.try_recv().unwrap().is_ok());
}

#[tokio::test]
async fn test_membership_waits_for_outstanding_io() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(HoldPool::default());
    let mut tn = boot_with_pool(
        &bus,
        dir.path(),
        1,
        pool.clone(),
        Arc::new(InstantPool),
    )
    .await;
    let mut nodes = Vec::new();
    drive(&mut tn).await.unwrap();
    nodes.push(tn);
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);

    // First request is dispatched and held by the pool; a second on the
    // same object parks on the wait list.
    let mut first = submit_io(&mut nodes[0], 0x300, 1, SD_FLAG_CMD_DIRECT).await;
    assert_eq!(pool.held(), 1);
    let mut second = submit_io(&mut nodes[0], 0x300, 1, SD_FLAG_CMD_DIRECT).await;
    assert_eq!(pool.held(), 1);

    // A membership event must not start while I/O is outstanding.
    let ghost = NodeId::new(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)), 7);
    nodes[0].node.fifo.push_back(Event::ViewLeave {
        left: ghost,
        members: Vec::new(),
    });
    nodes[0].node.pump().await.unwrap();
    assert_eq!(nodes[0].node.fifo.len(), 1);
    assert_eq!(nodes[0].node.nr_outstanding_io, 1);

    // Completion unblocks the queue: the view-change runs, then the
    // waiter is dispatched.
    pool.release_one();
    drive(&mut nodes[0]).await.unwrap();
    assert!(first.try_recv().unwrap().is_ok());
    assert!(nodes[0].node.fifo.is_empty());
    assert_eq!(pool.held(), 1);
    pool.release_one();
    drive(&mut nodes[0]).await.unwrap();
    assert!(second.try_recv().unwrap().is_ok());
}

#[tokio::test]
async fn test_joining_gate_fails_direct_io() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = vec![boot(&bus, dir.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);

    nodes[0].node.gate = Gate::Joining;

    let mut direct = submit_io(&mut nodes[0], 0x400, 1, SD_FLAG_CMD_DIRECT).await;
    assert_eq!(direct.try_recv().unwrap(), Err(SdError::NewNodeVer));

    // Forwarded requests stay queued behind the join.
    let mut forwarded = submit_io(&mut nodes[0], 0x400, 1, 0).await;
    assert!(forwarded.try_recv().is_err());
    assert_eq!(nodes[0].node.fifo.len(), 1);

    nodes[0].node.gate = Gate::Idle;
    nodes[0].node.pump().await.unwrap();
    settle(&mut nodes).await;
    assert!(forwarded.try_recv().unwrap().is_ok());
}

#[tokio::test]
async fn test_queued_commit_is_pulled_forward() {
    let bus = LocalBus::new();
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();

    let mut nodes = vec![boot(&bus, dir1.path(), 1).await];
    settle(&mut nodes).await;
    let mut reply = make_fs(&mut nodes[0], 3).await;
    settle(&mut nodes).await;
    assert_eq!(reply.try_recv().unwrap().rsp.result, 0);
    nodes.push(boot(&bus, dir2.path(), 2).await);
    settle(&mut nodes).await;

    // The master runs a full VDI round; n2 ingests the INIT and the FIN
    // in one batch before pumping, exercising the queued-response scan
    // instead of the gate.
    let mut req = VdiRequest::new(VdiOpcode::New);
    req.vdi_size = 1 << 20;
    let mut reply = submit_vdi(&mut nodes[0], req, b"batched\0".to_vec()).await;
    drive(&mut nodes[0]).await.unwrap();

    let driver = nodes[1].node.driver.clone();
    while let Ok(Ok(ev)) = timeout(Duration::from_millis(20), driver.recv_event()).await {
        nodes[1].node.ingest_driver(ev);
    }
    nodes[1].node.pump().await.unwrap();

    assert_eq!(nodes[1].node.gate, Gate::Idle);
    let vid = reply.try_recv().unwrap().rsp.vdi_id;
    assert!(nodes[1].node.core.is_vdi_inuse(vid));
}

// ─── Status gates ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_status_gates() {
    let bus = LocalBus::new();
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = vec![boot(&bus, dir.path(), 1).await];
    settle(&mut nodes).await;

    let direct = {
        let mut req = IoRequest::new(IoOpcode::Read, 1, 0);
        req.flags |= SD_FLAG_CMD_DIRECT;
        req
    };
    let forwarded = IoRequest::new(IoOpcode::Read, 1, 0);
    let format = VdiOpRequest {
        req: VdiRequest::new(VdiOpcode::MakeFs),
        data: Vec::new(),
    };
    let create = VdiOpRequest {
        req: VdiRequest::new(VdiOpcode::New),
        data: Vec::new(),
    };

    // Unformatted: only format-class operations get through.
    let n = &nodes[0].node;
    assert_eq!(n.io_status_gate(&direct), Err(SdError::WaitForFormat));
    assert!(n.vdi_status_gate(&format).is_ok());
    assert_eq!(n.vdi_status_gate(&create), Err(SdError::WaitForFormat));

    nodes[0].node.core.status = ClusterStatus::Halt;
    let n = &nodes[0].node;
    assert_eq!(n.io_status_gate(&direct), Err(SdError::Halt));
    assert!(n.vdi_status_gate(&format).is_ok());

    nodes[0].node.core.status = ClusterStatus::Shutdown;
    let n = &nodes[0].node;
    assert_eq!(n.io_status_gate(&direct), Err(SdError::Shutdown));
    assert_eq!(n.vdi_status_gate(&format), Err(SdError::Shutdown));

    // A rejected node still forwards I/O but refuses local work.
    nodes[0].node.core.status = ClusterStatus::JoinFailed;
    let n = &nodes[0].node;
    assert_eq!(n.io_status_gate(&direct), Err(SdError::JoinFailed));
    assert!(n.io_status_gate(&forwarded).is_ok());

    nodes[0].node.core.status = ClusterStatus::Ok;
    let n = &nodes[0].node;
    assert!(n.io_status_gate(&direct).is_ok());
    assert!(n.vdi_status_gate(&create).is_ok());
}
