//! Event serializer.
//!
//! The cluster core is driven by exactly one task owning one FIFO of
//! events. Four kinds of event share the queue: driver view-joins,
//! driver view-leaves, totally-ordered broadcasts, and client requests.
//! Putting requests on the same queue is what keeps them causally ordered
//! against membership transitions: a request never overtakes a membership
//! event that was queued before it, and a membership event never starts
//! while I/O dispatched under the previous epoch is still outstanding.
//!
//! Scheduling discipline, examined at every wake-up:
//!
//! 1. while a join round is in flight (`Gate::Joining`), direct-I/O
//!    requests at the head are completed immediately with `NewNodeVer`
//!    so clients retry under the new epoch;
//! 2. otherwise all leading requests are drained: parked on a per-object
//!    wait list when the object is being recovered or already has a
//!    request outstanding, failed with `Old/NewNodeVer` on epoch skew
//!    against locally-owned objects, else handed to the I/O or gateway
//!    pool;
//! 3. a membership or broadcast event is popped only while the gate is
//!    open, and a membership event additionally waits for
//!    `nr_outstanding_io` to drain to zero.
//!
//! Each non-request event runs two phases back to back on this task:
//! `fn` (may inspect and rewrite the message, e.g. the master filling a
//! VDI-op response) and `done` (applies roster/epoch mutations). `done`
//! may close the gate before returning so subsequent events observe it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use flock_proto::error::{SdError, SdResult};
use flock_proto::message::{Message, MsgState, Opcode, VdiOpcode};
use flock_proto::node::{ClusterStatus, NodeId};
use flock_proto::request::{epoch_after, epoch_before, IoRequest, VdiOpReply, VdiOpRequest};

use crate::cluster::{ClusterDriver, DriverEvent};
use crate::config::ClusterConfig;
use crate::core::{ClusterSnapshot, Core};
use crate::epoch::EpochLog;
use crate::group::Reachability;
use crate::store::ObjectStore;
use crate::vdi::VdiLayer;

/// Gate over the event FIFO. The states form a little ladder: `Idle`
/// admits everything, `Suspended` holds back `INIT` broadcasts until the
/// in-flight round's `FIN` arrives, and `Joining` additionally fast-fails
/// direct I/O because the epoch is about to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Idle,
    Suspended,
    Joining,
}

/// Completion handle given to a worker pool along with a request. The
/// pool answers the client and, through the same call, tells the
/// serializer the object is no longer busy.
pub struct IoResponder {
    oid: u64,
    client: oneshot::Sender<SdResult<Vec<u8>>>,
    cmd: mpsc::UnboundedSender<Command>,
}

impl IoResponder {
    pub fn complete(self, result: SdResult<Vec<u8>>) {
        let _ = self.client.send(result);
        let _ = self.cmd.send(Command::IoDone { oid: self.oid });
    }
}

/// Worker pool executing object I/O locally.
#[async_trait]
pub trait IoWorkerPool: Send + Sync {
    async fn execute(&self, req: IoRequest, responder: IoResponder);
}

/// Worker pool forwarding object I/O to the responsible peers.
#[async_trait]
pub trait GatewayPool: Send + Sync {
    async fn forward(&self, req: IoRequest, responder: IoResponder);
}

/// Pool stub for deployments without an object backend: every request is
/// answered with an I/O error.
pub struct UnwiredPool;

#[async_trait]
impl IoWorkerPool for UnwiredPool {
    async fn execute(&self, req: IoRequest, responder: IoResponder) {
        warn!("no object backend wired, failing I/O on {:#x}", req.oid);
        responder.complete(Err(SdError::Eio));
    }
}

#[async_trait]
impl GatewayPool for UnwiredPool {
    async fn forward(&self, req: IoRequest, responder: IoResponder) {
        warn!("no gateway backend wired, failing I/O on {:#x}", req.oid);
        responder.complete(Err(SdError::Eio));
    }
}

/// Inputs multiplexed into the serializer task.
pub enum Command {
    SubmitIo {
        req: IoRequest,
        client: oneshot::Sender<SdResult<Vec<u8>>>,
    },
    SubmitVdi {
        req: VdiOpRequest,
        client: oneshot::Sender<VdiOpReply>,
    },
    IoDone {
        oid: u64,
    },
    /// Voluntary departure: announce it on the bus and stop.
    Leave,
}

/// One entry in the event FIFO.
pub(crate) enum Event {
    ViewJoin {
        joined: NodeId,
        members: Vec<NodeId>,
    },
    ViewLeave {
        left: NodeId,
        #[allow(dead_code)]
        members: Vec<NodeId>,
    },
    Notify {
        msg: Box<Message>,
        skip: bool,
    },
    Request(QueuedRequest),
}

impl Event {
    fn is_membership(&self) -> bool {
        matches!(self, Event::ViewJoin { .. } | Event::ViewLeave { .. })
    }
}

pub(crate) enum QueuedRequest {
    Io {
        req: IoRequest,
        client: oneshot::Sender<SdResult<Vec<u8>>>,
    },
    Vdi {
        req: VdiOpRequest,
        client: oneshot::Sender<VdiOpReply>,
    },
}

enum Flow {
    Continue,
    Stop,
}

/// Client-side handle onto a running serializer.
#[derive(Clone)]
pub struct SerializerHandle {
    cmd: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ClusterSnapshot>,
}

impl SerializerHandle {
    /// Submit an object I/O request and wait for its completion.
    pub async fn submit_io(&self, req: IoRequest) -> SdResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::SubmitIo { req, client: tx })
            .map_err(|_| SdError::Shutdown)?;
        rx.await.map_err(|_| SdError::Shutdown)?
    }

    /// Submit a VDI control operation and wait for the cluster-wide
    /// outcome.
    pub async fn submit_vdi(&self, req: VdiOpRequest) -> SdResult<VdiOpReply> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(Command::SubmitVdi { req, client: tx })
            .map_err(|_| SdError::Shutdown)?;
        rx.await.map_err(|_| SdError::Shutdown)
    }

    /// Announce a voluntary leave; the serializer stops afterwards.
    pub fn leave(&self) {
        let _ = self.cmd.send(Command::Leave);
    }

    /// The latest published membership snapshot.
    pub fn snapshot(&self) -> ClusterSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch membership snapshots as they are published.
    pub fn watch(&self) -> watch::Receiver<ClusterSnapshot> {
        self.snapshot.clone()
    }
}

/// The cluster core: membership state plus the single-consumer event
/// queue that serializes everything that may touch it.
pub struct Serializer {
    pub(crate) core: Core,
    pub(crate) config: ClusterConfig,
    pub(crate) dir: PathBuf,
    pub(crate) epoch_log: EpochLog,
    pub(crate) driver: Arc<dyn ClusterDriver>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) vdi: Arc<dyn VdiLayer>,
    pub(crate) io_pool: Arc<dyn IoWorkerPool>,
    pub(crate) gateway: Arc<dyn GatewayPool>,
    pub(crate) probe: Arc<dyn Reachability>,

    pub(crate) fifo: VecDeque<Event>,
    pub(crate) gate: Gate,
    pub(crate) nr_outstanding_io: usize,
    outstanding_oids: HashMap<u64, usize>,
    wait_for_obj: HashMap<u64, Vec<(IoRequest, oneshot::Sender<SdResult<Vec<u8>>>)>>,
    pub(crate) pending_vdi: HashMap<u64, oneshot::Sender<VdiOpReply>>,
    pub(crate) next_req_id: u64,

    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    snapshot_tx: watch::Sender<ClusterSnapshot>,
}

/// Everything the serializer needs besides its own queue.
pub struct SerializerParts {
    pub core: Core,
    pub config: ClusterConfig,
    pub dir: PathBuf,
    pub epoch_log: EpochLog,
    pub driver: Arc<dyn ClusterDriver>,
    pub store: Arc<dyn ObjectStore>,
    pub vdi: Arc<dyn VdiLayer>,
    pub io_pool: Arc<dyn IoWorkerPool>,
    pub gateway: Arc<dyn GatewayPool>,
    pub probe: Arc<dyn Reachability>,
}

impl Serializer {
    pub fn new(parts: SerializerParts) -> (Self, SerializerHandle) {
        let SerializerParts {
            mut core,
            config,
            dir,
            epoch_log,
            driver,
            store,
            vdi,
            io_pool,
            gateway,
            probe,
        } = parts;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(core.snapshot());

        let handle = SerializerHandle {
            cmd: cmd_tx.clone(),
            snapshot: snapshot_rx,
        };
        let serializer = Self {
            core,
            config,
            dir,
            epoch_log,
            driver,
            store,
            vdi,
            io_pool,
            gateway,
            probe,
            fifo: VecDeque::new(),
            gate: Gate::Idle,
            nr_outstanding_io: 0,
            outstanding_oids: HashMap::new(),
            wait_for_obj: HashMap::new(),
            pending_vdi: HashMap::new(),
            next_req_id: 0,
            cmd_tx,
            cmd_rx,
            snapshot_tx,
        };
        (serializer, handle)
    }

    /// Join the group and process events until the node leaves, the
    /// cluster shuts down, or a fatal condition fences this node off.
    /// A nonzero process exit hinges on the returned error.
    pub async fn run(mut self) -> SdResult<()> {
        self.prepare().await?;
        self.driver.join().await?;
        self.publish();

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { continue };
                    if let Flow::Stop = self.handle_command(cmd).await? {
                        return Ok(());
                    }
                }
                ev = self.driver.recv_event() => {
                    match ev {
                        Ok(ev) => self.ingest_driver(ev),
                        Err(e) => {
                            error!("cluster driver is gone: {}", e);
                            return Err(e);
                        }
                    }
                }
            }
            self.pump().await?;
            self.publish();
        }
    }

    /// Derive the boot status from the epoch log: a log on disk means a
    /// cluster existed before and its members must be waited for.
    pub(crate) async fn prepare(&mut self) -> SdResult<()> {
        self.core.ctime = self.config.ctime;
        let latest = self.epoch_log.latest().await;
        self.core.status = if latest == 0 {
            ClusterStatus::WaitForFormat
        } else {
            ClusterStatus::WaitForJoin
        };
        info!(
            "starting at epoch {} in status {}",
            latest, self.core.status
        );
        Ok(())
    }

    fn publish(&mut self) {
        self.snapshot_tx.send_replace(self.core.snapshot());
    }

    // ─── Ingestion ──────────────────────────────────────────────────────

    pub(crate) fn ingest_driver(&mut self, ev: DriverEvent) {
        match ev {
            DriverEvent::ViewJoin { joined, members } => {
                if self.core.status == ClusterStatus::Shutdown {
                    return;
                }
                debug!("view: {} joined ({} members)", joined, members.len());
                self.fifo.push_back(Event::ViewJoin { joined, members });
            }
            DriverEvent::ViewLeave { left, members } => {
                if self.core.status == ClusterStatus::Shutdown {
                    return;
                }
                debug!("view: {} left ({} members)", left, members.len());
                self.fifo.push_back(Event::ViewLeave { left, members });
            }
            DriverEvent::Notify { from, payload } => {
                let msg = match Message::decode(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("undecodable broadcast from {}: {}", from, e);
                        return;
                    }
                };
                self.ingest_notify(msg);
            }
        }
    }

    fn ingest_notify(&mut self, msg: Message) {
        let header = *msg.header();
        debug!(
            "notify: op {:?} state {:?} from {}",
            header.op, header.state, header.from_id
        );

        // The response to the round we are suspended on goes to the front
        // of the queue and reopens the gate.
        if self.gate != Gate::Idle && header.state == MsgState::Fin {
            if self.gate == Gate::Joining && header.op != Opcode::Join {
                warn!(
                    "{:?} response arrived while a join was in flight",
                    header.op
                );
            }
            self.fifo.push_front(Event::Notify {
                msg: Box::new(msg),
                skip: false,
            });
            self.gate = Gate::Idle;
        } else {
            self.fifo.push_back(Event::Notify {
                msg: Box::new(msg),
                skip: false,
            });
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> SdResult<Flow> {
        match cmd {
            Command::SubmitIo { req, client } => {
                if let Err(e) = self.io_status_gate(&req) {
                    let _ = client.send(Err(e));
                } else {
                    self.fifo.push_back(Event::Request(QueuedRequest::Io { req, client }));
                }
            }
            Command::SubmitVdi { req, client } => {
                if let Err(e) = self.vdi_status_gate(&req) {
                    let mut reply = VdiOpReply {
                        rsp: Default::default(),
                        data: Vec::new(),
                    };
                    reply.rsp.result = e.to_code();
                    let _ = client.send(reply);
                } else {
                    self.fifo.push_back(Event::Request(QueuedRequest::Vdi { req, client }));
                }
            }
            Command::IoDone { oid } => {
                self.nr_outstanding_io = self.nr_outstanding_io.saturating_sub(1);
                if let Some(count) = self.outstanding_oids.get_mut(&oid) {
                    *count -= 1;
                    if *count == 0 {
                        self.outstanding_oids.remove(&oid);
                    }
                }
                // The object is free again; its waiters rejoin the queue.
                if let Some(waiters) = self.wait_for_obj.remove(&oid) {
                    for (req, client) in waiters {
                        self.fifo.push_back(Event::Request(QueuedRequest::Io { req, client }));
                    }
                }
            }
            Command::Leave => {
                info!("leaving the cluster");
                self.leave_cluster().await;
                if let Err(e) = self.driver.leave().await {
                    warn!("driver leave failed: {}", e);
                }
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Status gate applied when a request enters the queue.
    pub(crate) fn io_status_gate(&self, req: &IoRequest) -> SdResult<()> {
        match self.core.status {
            ClusterStatus::Ok => Ok(()),
            // A rejected node still forwards client I/O as a gateway.
            ClusterStatus::JoinFailed if !req.is_direct() => Ok(()),
            _ => self.core.status_result(),
        }
    }

    pub(crate) fn vdi_status_gate(&self, req: &VdiOpRequest) -> SdResult<()> {
        let force = matches!(req.req.opcode, VdiOpcode::MakeFs | VdiOpcode::Shutdown);
        match self.core.status {
            ClusterStatus::Ok => Ok(()),
            ClusterStatus::Shutdown | ClusterStatus::JoinFailed => self.core.status_result(),
            _ if force => Ok(()),
            _ => self.core.status_result(),
        }
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    pub(crate) async fn pump(&mut self) -> SdResult<()> {
        loop {
            if self.gate == Gate::Joining {
                self.fail_direct_head();
                return Ok(());
            }

            self.drain_requests().await?;

            if self.gate != Gate::Idle {
                return Ok(());
            }
            let head_is_membership =
                matches!(self.fifo.front(), Some(ev) if ev.is_membership());
            if head_is_membership && self.nr_outstanding_io > 0 {
                // Membership must not advance while I/O straddles epochs.
                return Ok(());
            }
            let Some(ev) = self.fifo.pop_front() else {
                return Ok(());
            };
            self.handle_event(ev).await?;
        }
    }

    /// While this node's view of the epoch is about to change, leading
    /// direct-I/O requests are not worth queueing: complete them with
    /// `NewNodeVer` so the client retries.
    fn fail_direct_head(&mut self) {
        while matches!(
            self.fifo.front(),
            Some(Event::Request(QueuedRequest::Io { req, .. })) if req.is_direct()
        ) {
            if let Some(Event::Request(QueuedRequest::Io { client, .. })) = self.fifo.pop_front() {
                let _ = client.send(Err(SdError::NewNodeVer));
            }
        }
    }

    /// Walk the queue and dispatch every request ahead of the first
    /// membership event. Broadcast notifications are left in place.
    async fn drain_requests(&mut self) -> SdResult<()> {
        let mut i = 0;
        while i < self.fifo.len() {
            match &self.fifo[i] {
                Event::Notify { .. } => {
                    i += 1;
                }
                Event::ViewJoin { .. } | Event::ViewLeave { .. } => break,
                Event::Request(_) => {
                    let Some(Event::Request(q)) = self.fifo.remove(i) else {
                        break;
                    };
                    self.dispatch_request(q).await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch_request(&mut self, q: QueuedRequest) -> SdResult<()> {
        match q {
            QueuedRequest::Vdi { req, client } => self.forward_vdi_op(req, client).await,
            QueuedRequest::Io { req, client } => self.dispatch_io(req, client).await,
        }
    }

    async fn dispatch_io(
        &mut self,
        req: IoRequest,
        client: oneshot::Sender<SdResult<Vec<u8>>>,
    ) -> SdResult<()> {
        let direct = req.is_direct();

        if !req.is_recovery() {
            if self.store.is_recovering(req.oid) {
                if direct {
                    let _ = client.send(Err(SdError::NewNodeVer));
                } else {
                    self.wait_for_obj
                        .entry(req.oid)
                        .or_default()
                        .push((req, client));
                }
                return Ok(());
            }
            if self.outstanding_oids.contains_key(&req.oid) {
                self.wait_for_obj
                    .entry(req.oid)
                    .or_default()
                    .push((req, client));
                return Ok(());
            }
        }

        // Version skew is only an error for objects this node holds a
        // replica of; everything else is the remote owner's business.
        let copies = self.core.nr_copies as usize;
        let ring = self.core.ring();
        let this_entry = self.core.this_entry;
        if ring.is_access_local(&this_entry, req.oid, copies)
            || ring.is_access_local(&this_entry, req.cow_oid, copies)
        {
            if epoch_before(req.epoch, self.core.epoch) {
                debug!(
                    "old node version: req epoch {} local {}",
                    req.epoch, self.core.epoch
                );
                let _ = client.send(Err(SdError::OldNodeVer));
                return Ok(());
            }
            if epoch_after(req.epoch, self.core.epoch) {
                debug!(
                    "new node version: req epoch {} local {}",
                    req.epoch, self.core.epoch
                );
                let _ = client.send(Err(SdError::NewNodeVer));
                return Ok(());
            }
        }

        self.nr_outstanding_io += 1;
        *self.outstanding_oids.entry(req.oid).or_insert(0) += 1;
        let responder = IoResponder {
            oid: req.oid,
            client,
            cmd: self.cmd_tx.clone(),
        };
        if direct {
            self.io_pool.execute(req, responder).await;
        } else {
            self.gateway.forward(req, responder).await;
        }
        Ok(())
    }

    // ─── Event execution ────────────────────────────────────────────────

    async fn handle_event(&mut self, ev: Event) -> SdResult<()> {
        match ev {
            Event::ViewJoin { joined, members } => self.view_join_done(joined, &members).await,
            Event::ViewLeave { left, .. } => {
                // Partition fencing runs before the roster is touched: a
                // node that cannot see a majority must not keep serving.
                if !self.check_majority(left).await {
                    error!("majority of nodes lost; network partition assumed");
                    return Err(SdError::ClusterError);
                }
                self.view_leave_done(left).await
            }
            Event::Notify { mut msg, mut skip } => {
                self.notify_fn(&mut msg, &mut skip).await;
                self.notify_done(*msg, skip).await
            }
            Event::Request(_) => {
                error!("request event reached the cluster worker");
                Ok(())
            }
        }
    }

    async fn notify_done(&mut self, mut msg: Message, skip: bool) -> SdResult<()> {
        if skip {
            debug!("discarding broadcast observed before our join completed");
            return Ok(());
        }

        // A finished VDI round completes the originator's client first so
        // the response is visible before the next round may start.
        if msg.header().state == MsgState::Fin {
            if let Message::VdiOp(m) = &msg {
                let m = m.clone();
                self.vdi_op_done(&m).await;
            }
        }

        // A locally-processed INIT opens a round; hold the queue until
        // the FIN comes back (it may already be queued behind us).
        if self.core.join_finished && msg.header().state == MsgState::Init {
            self.suspend_until_fin(&msg);
        }

        self.apply_notify(&mut msg).await
    }

    /// Process queued commands without blocking; test harnesses drive the
    /// serializer manually instead of through [`Serializer::run`].
    #[cfg(test)]
    pub(crate) async fn drain_commands(&mut self) -> SdResult<()> {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let Flow::Stop = self.handle_command(cmd).await? {
                break;
            }
        }
        Ok(())
    }

    fn suspend_until_fin(&mut self, msg: &Message) {
        let queued_fin = self.fifo.iter().position(|ev| {
            matches!(ev, Event::Notify { msg, .. } if msg.header().state == MsgState::Fin)
        });
        if let Some(pos) = queued_fin {
            debug!("response already queued, pulling it forward");
            if let Some(ev) = self.fifo.remove(pos) {
                self.fifo.push_front(ev);
            }
            return;
        }
        self.gate = if msg.header().op == Opcode::Join {
            Gate::Joining
        } else {
            Gate::Suspended
        };
    }
}
