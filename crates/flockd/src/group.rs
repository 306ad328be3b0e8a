//! Cluster protocols: join, VDI operations, leave, mastership transfer.
//!
//! Every protocol is a conversation over the ordered bus. The join
//! protocol decides whether an arriving node is admitted, rejected, or
//! forces a mastership hand-off; the VDI-op protocol serializes control
//! operations through the master; the leave protocol fences off network
//! partitions and keeps the epoch in step with departures.
//!
//! All handlers here run on the serializer task and are the only code
//! that mutates [`crate::core::Core`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use flock_proto::constants::{SD_DEFAULT_COPIES, SD_NODE_PROTO_VER, SD_PROTO_VER};
use flock_proto::constants::{SD_FLAG_CMD_CREAT, SD_FLAG_CMD_EXCL};
use flock_proto::defaults::DEFAULT_PROBE_TIMEOUT_MS;
use flock_proto::error::{SdError, SdResult};
use flock_proto::hash::sd_hash_vdi;
use flock_proto::message::{
    JoinMessage, LeaveMessage, MasterTransferMessage, Message, MessageHeader, MsgState, Opcode,
    VdiOpMessage, VdiOpcode, VdiResponse,
};
use flock_proto::node::{ClusterStatus, NodeEntry, NodeId};
use flock_proto::request::{VdiOpReply, VdiOpRequest};
use tokio::sync::oneshot;

use crate::config;
use crate::serializer::Serializer;
use crate::vdi::name_from_data;

/// Liveness probe used by the partition check. The production probe is a
/// TCP connect; tests swap in a reachability matrix.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn reachable(&self, peer: &NodeEntry) -> bool;
}

/// TCP-connect probe with a bounded timeout.
pub struct TcpProbe {
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }
}

#[async_trait]
impl Reachability for TcpProbe {
    async fn reachable(&self, peer: &NodeEntry) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(peer.socket_addr())).await,
            Ok(Ok(_))
        )
    }
}

impl Serializer {
    // ─── View-change handlers ───────────────────────────────────────────

    /// A node entered the transport group.
    pub(crate) async fn view_join_done(
        &mut self,
        joined: NodeId,
        members: &[NodeId],
    ) -> SdResult<()> {
        let first_in_group = members.len() == 1 && joined == self.core.this_id;

        if first_in_group {
            // Alone in the group: master by definition, no join round
            // needed.
            self.core.join_finished = true;
            self.core.nr_copies = self.config.nr_copies;
        }

        if self.core.transport_is_empty() {
            for &member in members {
                self.core.add_transport(member);
            }
        } else {
            self.core.add_transport(joined);
        }

        if first_in_group {
            self.bootstrap_first_node().await?;
            return Ok(());
        }

        if joined == self.core.this_id {
            self.send_join_request().await?;
        }
        Ok(())
    }

    /// First node in the group: resume from the epoch log, or wait for a
    /// format if there is none.
    async fn bootstrap_first_node(&mut self) -> SdResult<()> {
        let mut outcome = JoinMessage::new(self.core.this_id, self.core.this_entry);
        outcome.nr_copies = self.core.nr_copies;

        let latest = self.epoch_log.latest().await;
        let entries = if latest > 0 {
            self.epoch_log.read(latest).await.ok()
        } else {
            None
        };
        match entries {
            Some(entries) => {
                self.core.epoch = latest;
                outcome.epoch = latest;
                outcome.ctime = self.config.ctime;
                let this_entry = self.core.this_entry;
                let (_, status, _) = self
                    .get_cluster_status(&this_entry, &entries, outcome.ctime, latest)
                    .await;
                outcome.cluster_status = status;
            }
            None => outcome.cluster_status = ClusterStatus::WaitForFormat,
        }

        self.update_cluster_info(&outcome).await?;

        if self.core.status == ClusterStatus::Ok {
            // A cluster can legitimately consist of one node.
            if let Err(e) = self.store.start_recovery(self.core.epoch).await {
                warn!("recovery start failed: {}", e);
            }
        }
        Ok(())
    }

    /// A node left the transport group (the majority check has already
    /// passed).
    pub(crate) async fn view_leave_done(&mut self, left: NodeId) -> SdResult<()> {
        if let Some(entry) = self.core.remove_storage_member(left) {
            info!("node {} left the cluster", entry);
            if self.core.status.is_serving() {
                self.update_epoch_log(self.core.epoch + 1).await;
                self.core.epoch += 1;
                if let Err(e) = self.store.start_recovery(self.core.epoch).await {
                    warn!("recovery start failed: {}", e);
                }
            }
        } else if self.core.remove_transport_member(left) {
            debug!("node {} left before its join was ratified", left);
        }
        Ok(())
    }

    /// Whether this node can still reach a majority of the storage
    /// roster, `left` excluded. Clusters below three nodes cannot
    /// distinguish a partition from a peer failure and always pass.
    pub(crate) async fn check_majority(&self, left: NodeId) -> bool {
        let nr_nodes = self.core.nr_storage();
        if nr_nodes < 3 {
            return true;
        }
        let nr_majority = nr_nodes / 2 + 1;
        let mut nr_reachable = 1; // this node

        for (entry, &id) in self.core.storage_members() {
            if id == left || id == self.core.this_id {
                continue;
            }
            if self.probe.reachable(entry).await {
                nr_reachable += 1;
                if nr_reachable >= nr_majority {
                    return true;
                }
            }
        }
        error!(
            "{} of {} nodes reachable, majority is {}",
            nr_reachable, nr_nodes, nr_majority
        );
        false
    }

    // ─── Notify handlers ────────────────────────────────────────────────

    /// First phase of broadcast handling: decide whether the message is
    /// for us at all, bind the sender's storage identity, and let the
    /// master execute VDI operations.
    pub(crate) async fn notify_fn(&mut self, msg: &mut Message, skip: &mut bool) {
        let header = *msg.header();

        // Until our own join completes we only care about mastership
        // hand-offs and our own messages; everything else belongs to
        // rounds that finished before we were admitted.
        if !self.core.join_finished
            && header.op != Opcode::MasterTransfer
            && header.from_id != self.core.this_id
        {
            *skip = true;
            return;
        }

        if header.op == Opcode::Join && !self.core.bind_entry(header.from_id, header.from_entry) {
            debug!("node {} left before its join finished", header.from_id);
        }

        if header.state == MsgState::Init && self.core.is_master() {
            match msg {
                Message::Join(_) => {}
                Message::VdiOp(m) => self.vdi_op_exec(m).await,
                _ => warn!("unexpected {:?} INIT broadcast", header.op),
            }
        }
    }

    /// Second phase: apply FIN mutations, answer INIT rounds if we are
    /// the master, and trigger recovery after membership commits.
    pub(crate) async fn apply_notify(&mut self, msg: &mut Message) -> SdResult<()> {
        let header = *msg.header();

        if header.state == MsgState::Fin {
            match msg {
                Message::Join(jm) => {
                    let jm = jm.clone();
                    self.update_cluster_info(&jm).await?;
                }
                Message::Leave(lm) => {
                    let from = (lm.header.from_id, lm.header.from_entry);
                    if let Some(entry) = self.core.remove_storage_member(from.0) {
                        info!("node {} announced leave at epoch {}", entry, lm.epoch);
                        if self.core.status == ClusterStatus::Ok {
                            self.core.epoch += 1;
                            let epoch = self.core.epoch;
                            self.update_epoch_log(epoch).await;
                        }
                    }
                    self.waitjoin_progress(Some(from)).await;
                }
                Message::MasterTransfer(_) => {
                    self.waitjoin_progress(None).await;
                }
                Message::VdiOp(_) | Message::MasterChanged(_) => {}
            }
        }

        if header.state == MsgState::Init && self.core.is_master() {
            match msg {
                Message::Join(jm) => self.send_join_response(jm).await?,
                Message::VdiOp(m) => {
                    m.header.state = MsgState::Fin;
                    let bytes = Message::VdiOp(m.clone()).encode();
                    if let Err(e) = self.driver.broadcast(&bytes).await {
                        error!("cannot broadcast VDI result: {}", e);
                    }
                }
                _ => warn!("unexpected {:?} INIT broadcast", header.op),
            }
        }

        let membership_committed = header.state == MsgState::Fin
            && matches!(header.op, Opcode::Join | Opcode::Leave);
        if membership_committed && self.core.status.is_serving() {
            self.core.clear_leave_list();
            if let Err(e) = self.store.start_recovery(self.core.epoch).await {
                warn!("recovery start failed: {}", e);
            }
        }
        Ok(())
    }

    // ─── Join protocol ──────────────────────────────────────────────────

    /// Broadcast our admission request, carrying everything we know from
    /// our last life: epoch, creation time, and the node list we went
    /// down with.
    pub(crate) async fn send_join_request(&mut self) -> SdResult<()> {
        let mut jm = JoinMessage::new(self.core.this_id, self.core.this_entry);
        jm.nr_copies = self.config.nr_copies;

        let latest = self.epoch_log.latest().await;
        if latest > 0 {
            if let Ok(entries) = self.epoch_log.read(latest).await {
                jm.epoch = latest;
                jm.ctime = self.config.ctime;
                jm.nodes = entries
                    .into_iter()
                    .map(|entry| (NodeId::default(), entry))
                    .collect();
            }
        }

        info!("requesting to join at epoch {}", jm.epoch);
        self.driver.broadcast(&Message::Join(jm).encode()).await
    }

    /// The master's verdict over a join request.
    async fn join_fill(&self, jm: &mut JoinMessage) {
        if jm.header.proto_ver != SD_NODE_PROTO_VER {
            error!(
                "joining node {} sent protocol version {}",
                jm.header.from_entry, jm.header.proto_ver
            );
            jm.result = SdError::VerMismatch.to_code();
            return;
        }

        let entries: Vec<NodeEntry> = jm.nodes.iter().map(|&(_, entry)| entry).collect();
        let (result, status, inc_epoch) = self
            .get_cluster_status(&jm.header.from_entry, &entries, jm.ctime, jm.epoch)
            .await;
        jm.result = result;
        jm.cluster_status = status;
        jm.inc_epoch = inc_epoch;
        jm.nr_copies = self.core.nr_copies;
        jm.ctime = self.core.ctime;
        jm.nodes = self.core.node_pairs();
    }

    /// Sanity checks an arriving node must pass before the quorum logic
    /// even looks at it.
    async fn cluster_sanity_check(
        &self,
        entries: &[NodeEntry],
        ctime: u64,
        epoch: u32,
    ) -> SdResult<()> {
        if matches!(
            self.core.status,
            ClusterStatus::WaitForFormat | ClusterStatus::Shutdown
        ) {
            return Ok(());
        }
        // A brand-new node carries no history to contradict ours.
        if entries.is_empty() {
            return Ok(());
        }
        if ctime != self.core.ctime {
            return Err(SdError::InvalidCtime);
        }
        let latest = self.epoch_log.latest().await;
        if epoch > latest {
            return Err(SdError::OldNodeVer);
        }
        if self.core.status.is_serving() {
            return Ok(());
        }
        if epoch < latest {
            return Err(SdError::NewNodeVer);
        }
        match self.epoch_log.read(epoch).await {
            Ok(local) if local == entries => Ok(()),
            _ => Err(SdError::InvalidEpoch),
        }
    }

    /// Resolve what admitting `from` would do to the cluster: the result
    /// code for the joiner, the status the cluster ends up in, and
    /// whether every node must bump its epoch on apply.
    pub(crate) async fn get_cluster_status(
        &self,
        from: &NodeEntry,
        entries: &[NodeEntry],
        ctime: u64,
        epoch: u32,
    ) -> (u32, ClusterStatus, bool) {
        let mut status = self.core.status;
        let mut inc_epoch = false;

        let mut result = self.cluster_sanity_check(entries, ctime, epoch).await;
        if result.is_ok() {
            match self.core.status {
                ClusterStatus::Ok | ClusterStatus::Halt => inc_epoch = true,
                ClusterStatus::WaitForFormat => {
                    if !entries.is_empty() {
                        result = Err(SdError::NotFormatted);
                    }
                }
                ClusterStatus::WaitForJoin => {
                    let nr_present = self.core.nr_storage() + 1;
                    let nr_known = self
                        .epoch_log
                        .read(epoch)
                        .await
                        .map(|nodes| nodes.len())
                        .unwrap_or(0);
                    if nr_known == nr_present {
                        // Everyone we were waiting for is back.
                        status = ClusterStatus::Ok;
                        inc_epoch = true;
                    } else if nr_known == nr_present + self.core.nr_leave() {
                        // The remainder are known dead; recovery can deal
                        // with their objects right away.
                        status = ClusterStatus::Ok;
                        inc_epoch = true;
                    }
                }
                ClusterStatus::Shutdown => result = Err(SdError::Shutdown),
                ClusterStatus::JoinFailed => {}
            }
        }

        if let Err(e) = result {
            warn!("join of {} rejected: {}", from, e);
        }
        (SdError::code_of(&result), status, inc_epoch)
    }

    /// Turn a join INIT into the cluster-wide FIN, or hand mastership to
    /// a node that knows a newer epoch than we do.
    pub(crate) async fn send_join_response(&mut self, jm: &mut JoinMessage) -> SdResult<()> {
        self.join_fill(jm).await;
        jm.header.state = MsgState::Fin;

        debug!(
            "join response: result {:#x}, status {}",
            jm.result, jm.cluster_status
        );
        if jm.result == 0 && jm.cluster_status == ClusterStatus::WaitForJoin {
            jm.leave_nodes = self.core.leave_pairs();
        } else if jm.result != 0
            && jm.epoch > self.core.epoch
            && jm.cluster_status == ClusterStatus::WaitForJoin
        {
            // The joiner outlived us: it has epochs we never saw. Hand it
            // the cluster and get out of the way; the roster order makes
            // the hand-off deterministic.
            error!(
                "joiner knows epoch {} but we are at {}; transferring mastership",
                jm.epoch, self.core.epoch
            );
            self.tx_mastership().await;
            return Err(SdError::ClusterError);
        }

        jm.epoch = self.core.epoch;
        self.driver.broadcast(&Message::Join(jm.clone()).encode()).await
    }

    async fn tx_mastership(&self) {
        let msg = Message::MasterTransfer(MasterTransferMessage {
            header: MessageHeader::new(
                Opcode::MasterTransfer,
                MsgState::Fin,
                self.core.this_id,
                self.core.this_entry,
            ),
            epoch: self.core.epoch,
        });
        if let Err(e) = self.driver.broadcast(&msg.encode()).await {
            error!("cannot broadcast mastership transfer: {}", e);
        }
    }

    /// Apply a committed join on every node.
    pub(crate) async fn update_cluster_info(&mut self, jm: &JoinMessage) -> SdResult<()> {
        debug!(
            "join commit: status {}, epoch {}, result {:#x}",
            jm.cluster_status, jm.epoch, jm.result
        );

        if let Err(e) = SdError::result_of(jm.result) {
            if jm.header.from_id == self.core.this_id {
                error!("this node was not admitted: {}", e);
                self.leave_cluster().await;
                self.core.status = ClusterStatus::JoinFailed;
                warn!("continuing as a stateless gateway; restart once the master is back");
            }
            return Ok(());
        }
        if self.core.status == ClusterStatus::JoinFailed {
            return Ok(());
        }

        if self.core.nr_copies == 0 {
            self.core.nr_copies = jm.nr_copies;
        }

        if !self.core.join_finished {
            // Our own admission: adopt the master's view wholesale.
            self.core.epoch = jm.epoch;
            for &(id, entry) in &jm.nodes {
                if !self.core.migrate_to_storage(id, entry) {
                    info!("ratified node {} is already gone", id);
                }
            }
            if jm.cluster_status == ClusterStatus::WaitForJoin {
                self.merge_leave_nodes(&jm.leave_nodes).await;
            }
            self.core.join_finished = true;
            if jm.cluster_status.is_serving()
                && jm.inc_epoch
                && self.epoch_log.read(self.core.epoch).await.is_err()
            {
                // A node joining for the first time lacks the epoch
                // everyone else already committed; catch up before the
                // bump below. A rejoining node keeps its history as is.
                let epoch = self.core.epoch;
                self.update_epoch_log(epoch).await;
            }
        }

        let migrated = self
            .core
            .migrate_to_storage(jm.header.from_id, jm.header.from_entry);
        if !migrated {
            debug!("joiner {} already ratified or gone", jm.header.from_id);
        }

        if jm.cluster_status.is_serving() {
            // Redelivered commits must not double-bump: only the apply
            // that actually moved the joiner advances the epoch.
            if jm.inc_epoch && migrated {
                self.core.epoch += 1;
                let epoch = self.core.epoch;
                self.update_epoch_log(epoch).await;
            }
            self.core.ctime = jm.ctime;
            self.config.ctime = jm.ctime;
            self.config.nr_copies = self.core.nr_copies;
            self.persist_config().await;
        }

        self.core.status = jm.cluster_status;
        info!(
            "cluster: {} nodes, epoch {}, status {}",
            self.core.nr_storage(),
            self.core.epoch,
            self.core.status
        );
        Ok(())
    }

    // ─── Leave protocol ─────────────────────────────────────────────────

    /// Announce a clean departure so the remaining nodes can tell it from
    /// a crash.
    pub(crate) async fn leave_cluster(&mut self) {
        let latest = self.epoch_log.latest().await;
        let msg = Message::Leave(LeaveMessage {
            header: MessageHeader::new(
                Opcode::Leave,
                MsgState::Fin,
                self.core.this_id,
                self.core.this_entry,
            ),
            epoch: latest,
        });
        if let Err(e) = self.driver.broadcast(&msg.encode()).await {
            warn!("cannot announce leave: {}", e);
        }
    }

    /// While waiting for the previous members, every leave or mastership
    /// hand-off can complete the quorum equation.
    async fn waitjoin_progress(&mut self, leave_of: Option<(NodeId, NodeEntry)>) {
        if self.core.status != ClusterStatus::WaitForJoin {
            return;
        }

        if let Some((id, entry)) = leave_of {
            self.add_leave_node(id, entry).await;
        }

        if !self.core.join_finished {
            // The old master handed off before ratifying us; promote
            // ourselves so the roster has a head again.
            self.core.join_finished = true;
            self.core.add_transport(self.core.this_id);
            let (this_id, this_entry) = (self.core.this_id, self.core.this_entry);
            self.core.migrate_to_storage(this_id, this_entry);
            self.core.epoch = self.epoch_log.latest().await;
        }

        let nr_known = self
            .epoch_log
            .read(self.core.epoch)
            .await
            .map(|nodes| nodes.len())
            .unwrap_or(0);
        let nr = self.core.nr_storage();
        let nr_leave = self.core.nr_leave();
        debug!("rejoin quorum: {} == {} + {}", nr_known, nr, nr_leave);
        if nr_known == nr + nr_leave {
            self.core.status = ClusterStatus::Ok;
            let epoch = self.core.epoch;
            self.update_epoch_log(epoch).await;
        }
    }

    /// Remember a departed node, but only if the latest committed epoch
    /// actually knows it; anything else is stale gossip.
    async fn add_leave_node(&mut self, id: NodeId, entry: NodeEntry) {
        if self.core.leave_contains(&entry) {
            return;
        }
        if !self.entry_in_epoch(entry).await {
            return;
        }
        self.core.add_leave(id, entry);
        debug!("leave list now has {} nodes", self.core.nr_leave());
    }

    async fn merge_leave_nodes(&mut self, nodes: &[(NodeId, NodeEntry)]) {
        for &(id, entry) in nodes {
            self.add_leave_node(id, entry).await;
        }
    }

    async fn entry_in_epoch(&self, entry: NodeEntry) -> bool {
        let latest = self.epoch_log.latest().await;
        match self.epoch_log.read(latest).await {
            Ok(nodes) => nodes.contains(&entry),
            Err(_) => false,
        }
    }

    // ─── VDI-op protocol ────────────────────────────────────────────────

    /// Wrap a client VDI operation into an INIT broadcast and park the
    /// client until the FIN comes back to us.
    pub(crate) async fn forward_vdi_op(
        &mut self,
        mut op: VdiOpRequest,
        client: oneshot::Sender<VdiOpReply>,
    ) -> SdResult<()> {
        self.next_req_id += 1;
        op.req.req_id = self.next_req_id;
        op.req.epoch = self.core.epoch;
        op.req.data_length = op.data.len() as u32;

        let msg = Message::VdiOp(VdiOpMessage {
            header: MessageHeader::new(
                Opcode::VdiOp,
                MsgState::Init,
                self.core.this_id,
                self.core.this_entry,
            ),
            req: op.req,
            rsp: VdiResponse::default(),
            data: op.data,
        });

        self.pending_vdi.insert(op.req.req_id, client);
        if let Err(e) = self.driver.broadcast(&msg.encode()).await {
            error!("cannot broadcast VDI operation: {}", e);
            if let Some(client) = self.pending_vdi.remove(&op.req.req_id) {
                let mut reply = VdiOpReply {
                    rsp: VdiResponse::default(),
                    data: Vec::new(),
                };
                reply.rsp.result = e.to_code();
                let _ = client.send(reply);
            }
        }
        Ok(())
    }

    /// The master executes the operation against the VDI layer and
    /// embeds the outcome; every other node leaves the message alone.
    pub(crate) async fn vdi_op_exec(&self, m: &mut VdiOpMessage) {
        let req = m.req;
        let epoch = req.epoch;
        let mut vid = 0u32;
        let mut attr_id = 0u32;
        let mut nr_copies = self.core.nr_copies;

        let result: SdResult<()> = async {
            match req.opcode {
                VdiOpcode::New => {
                    let name = name_from_data(&m.data)?;
                    let copies = if req.copies == 0 {
                        self.core.nr_copies
                    } else {
                        req.copies
                    };
                    nr_copies = copies;
                    vid = self
                        .vdi
                        .add(epoch, name, req.vdi_size, req.base_vid, copies, req.snapid)
                        .await?;
                }
                VdiOpcode::Del => {
                    let name = name_from_data(&m.data)?;
                    vid = self.vdi.del(epoch, name, req.snapid).await?;
                }
                VdiOpcode::Lock | VdiOpcode::GetInfo => {
                    if req.proto_ver != SD_PROTO_VER {
                        return Err(SdError::VerMismatch);
                    }
                    let name = name_from_data(&m.data)?;
                    vid = self.vdi.lookup(epoch, name, req.snapid).await?;
                }
                VdiOpcode::GetAttr => {
                    let name = name_from_data(&m.data)?;
                    self.vdi.lookup(epoch, name, req.snapid).await?;
                    // Snapshots shift the current vid, so attributes hang
                    // off the name hash instead.
                    vid = sd_hash_vdi(name);
                    let key_off = (name.len() + 1).min(m.data.len());
                    let key = name_from_data(&m.data[key_off..])?;
                    attr_id = self
                        .vdi
                        .get_attr(
                            epoch,
                            vid,
                            key,
                            req.flags & SD_FLAG_CMD_CREAT != 0,
                            req.flags & SD_FLAG_CMD_EXCL != 0,
                        )
                        .await?;
                }
                VdiOpcode::Release | VdiOpcode::MakeFs | VdiOpcode::Shutdown => {}
            }
            Ok(())
        }
        .await;

        m.rsp = VdiResponse {
            result: SdError::code_of(&result),
            vdi_id: vid,
            attr_id,
            copies: nr_copies,
            data_length: m.data.len() as u32,
        };
    }

    /// Apply a committed VDI operation's side effects on every node, and
    /// complete the originator's waiting client.
    pub(crate) async fn vdi_op_done(&mut self, m: &VdiOpMessage) {
        if m.rsp.result == 0 {
            match m.req.opcode {
                VdiOpcode::New => {
                    info!("vdi {:#x} created", m.rsp.vdi_id);
                    self.core.set_vdi_inuse(m.rsp.vdi_id);
                }
                VdiOpcode::Del => {
                    self.core.clear_vdi_inuse(m.rsp.vdi_id);
                }
                VdiOpcode::Lock
                | VdiOpcode::Release
                | VdiOpcode::GetInfo
                | VdiOpcode::GetAttr => {}
                VdiOpcode::MakeFs => self.apply_make_fs(&m.req).await,
                VdiOpcode::Shutdown => {
                    info!("cluster shutdown committed");
                    self.core.status = ClusterStatus::Shutdown;
                }
            }
        }

        if m.header.from_id != self.core.this_id {
            return;
        }
        match self.pending_vdi.remove(&m.req.req_id) {
            Some(client) => {
                let _ = client.send(VdiOpReply {
                    rsp: m.rsp,
                    data: m.data.clone(),
                });
            }
            None => warn!("no pending client for VDI request {}", m.req.req_id),
        }
    }

    /// Format: wipe all membership history and VDI state, then commit
    /// epoch 1 with the current roster.
    async fn apply_make_fs(&mut self, req: &flock_proto::message::VdiRequest) {
        self.core.nr_copies = if req.copies == 0 {
            SD_DEFAULT_COPIES
        } else {
            req.copies
        };
        self.core.ctime = req.ctime;
        self.config.nr_copies = self.core.nr_copies;
        self.config.ctime = req.ctime;
        self.persist_config().await;

        let latest = self.epoch_log.latest().await;
        for epoch in 1..=latest {
            let _ = self.epoch_log.remove(epoch).await;
        }
        self.core.reset_vdi_inuse();
        self.vdi.reset().await;

        self.core.epoch = 1;
        self.update_epoch_log(1).await;
        self.core.status = ClusterStatus::Ok;
        info!(
            "cluster formatted: {} copies, {} nodes",
            self.core.nr_copies,
            self.core.nr_storage()
        );
    }

    // ─── Persistence helpers ────────────────────────────────────────────

    /// Commit the current roster under `epoch`. A failed write is logged
    /// by the log itself and must not take the node down.
    pub(crate) async fn update_epoch_log(&self, epoch: u32) {
        let nodes = self.core.ordered_node_list();
        debug!("update epoch {} with {} nodes", epoch, nodes.len());
        let _ = self.epoch_log.write(epoch, &nodes).await;
    }

    async fn persist_config(&self) {
        if let Err(e) = config::save_config(&self.dir, &self.config).await {
            warn!("cannot persist cluster config: {}", e);
        }
    }
}
