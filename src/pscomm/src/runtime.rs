//! The owned runtime value: queues, ready tables, worker threads and the
//! receive-path hooks. Constructed at `init`, dropped (or explicitly shut
//! down) at the end of the job; background workers hold the shared state
//! through an `Arc` and observe a single shutdown flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use strum::IntoEnumIterator;

use crate::collab::{Collaborators, CoordSignal, Delivery, SignalHandler};
use crate::config::Config;
use crate::context::{ContextRegistry, DeclRecord};
use crate::dispatch::{PipelineModes, StageKind};
use crate::handle::HandleManager;
use crate::key::{self, KeyRouter, OpType};
use crate::loops;
use crate::queue::ScheduledQueue;
use crate::ready_table::ReadyTable;
use crate::status::{CommError, Status, StatusCallback};
use crate::trace::TraceCollector;

/// Ready tables present on this rank. A table exists only where its
/// countdown is non-trivial for the rank's role.
#[derive(Default)]
pub(crate) struct Tables {
    pub reduce: Option<Arc<ReadyTable>>,
    pub pcie_reduce: Option<Arc<ReadyTable>>,
    pub push: Option<Arc<ReadyTable>>,
    pub broadcast: Option<Arc<ReadyTable>>,
    pub copy_h2d: Option<Arc<ReadyTable>>,
    pub cpu_reduce: Option<Arc<ReadyTable>>,
    pub cpu_bcast: Option<Arc<ReadyTable>>,
    pub cpu_bcast_finish: Option<Arc<ReadyTable>>,
    pub p2p_copy: Option<Arc<ReadyTable>>,
    pub p2p_group_copy: Option<Arc<ReadyTable>>,
    pub p2p_pull_response: Option<Arc<ReadyTable>>,
    pub p2p_ack: Option<Arc<ReadyTable>>,
    pub allgather: Option<Arc<ReadyTable>>,
    pub allgather_bcast: Option<Arc<ReadyTable>>,
    pub allgather_copy_h2d: Option<Arc<ReadyTable>>,
    pub allgather_pull_resp: Option<Arc<ReadyTable>>,
    pub allgather_pull_ack: Option<Arc<ReadyTable>>,
    pub allgather_wlr_resp: Option<Arc<ReadyTable>>,
    pub allgather_wlr_ack: Option<Arc<ReadyTable>>,
    pub gdr: Option<Arc<ReadyTable>>,
}

impl Tables {
    fn build(config: &Config, modes: &PipelineModes, group_size: usize) -> Self {
        let mut tables = Tables::default();
        let local_peers = config.local_size.saturating_sub(1);
        let some = |required: usize, name: &'static str| {
            (required > 0).then(|| Arc::new(ReadyTable::new(required, name)))
        };
        if modes.signal_root && group_size > 1 {
            tables.reduce = some(group_size - 1, "REDUCE");
            tables.broadcast = some(group_size - 1, "BROADCAST");
            tables.allgather = some(group_size - 1, "ALLGATHER");
            tables.allgather_bcast = some(group_size - 1, "ALLGATHER_BCAST");
        }
        if modes.root_device {
            tables.push = some(local_peers, "PUSH");
            tables.cpu_reduce = some(local_peers, "CPU_REDUCE");
            tables.cpu_bcast_finish = some(local_peers, "CPU_BCAST_FINISH");
        } else {
            tables.copy_h2d = some(1, "COPY_H2D");
            tables.cpu_bcast = some(1, "CPU_BCAST");
            tables.allgather_copy_h2d = some(1, "ALLGATHER_COPY_H2D");
        }
        if modes.cross_pcie_switch && modes.root_device {
            let switches = config.local_size / group_size.max(1);
            tables.pcie_reduce = some(switches.saturating_sub(1), "PCIE_REDUCE");
        }
        if config.joint {
            tables.p2p_copy = some(1, "P2P_COPY");
            tables.p2p_group_copy = some(1, "P2P_GROUP_COPY");
            tables.p2p_pull_response = some(1, "P2P_PULL_RESPONSE");
            tables.p2p_ack = some(1, "P2P_ACK");
            // response lanes need the pull request plus local data readiness
            if modes.local_rank0 {
                tables.allgather_wlr_resp = some(2, "ALLGATHER_WLR_RESP");
                tables.allgather_wlr_ack = some(1, "ALLGATHER_WLR_ACK");
            }
            if modes.root_device {
                tables.allgather_pull_resp = some(2, "ALLGATHER_PULL_RESP");
                tables.allgather_pull_ack = some(1, "ALLGATHER_PULL_ACK");
            }
        }
        if modes.gdr_allreduce && modes.signal_root {
            tables.gdr = some(1, "GDR_PUSH_PULL");
        }
        tables
    }

    /// The table gating a stage's queue, if any.
    fn gate_for(&self, stage: StageKind) -> Option<Arc<ReadyTable>> {
        use StageKind::*;
        let table = match stage {
            Reduce => &self.reduce,
            PcieReduce => &self.pcie_reduce,
            Push => &self.push,
            Broadcast => &self.broadcast,
            CopyH2D => &self.copy_h2d,
            CpuReduce => &self.cpu_reduce,
            CpuBcast => &self.cpu_bcast,
            CpuBcastFinish => &self.cpu_bcast_finish,
            Recv => &self.p2p_copy,
            P2pGroupCopyH2D => &self.p2p_group_copy,
            P2pPullResponse => &self.p2p_pull_response,
            P2pWaitAck => &self.p2p_ack,
            Allgather => &self.allgather,
            AllgatherBcast => &self.allgather_bcast,
            AllgatherCopyH2D => &self.allgather_copy_h2d,
            AllgatherPullResp => &self.allgather_pull_resp,
            AllgatherPullAck => &self.allgather_pull_ack,
            AllgatherPullWorkerLocalRootResp => &self.allgather_wlr_resp,
            AllgatherPullWorkerLocalRootAck => &self.allgather_wlr_ack,
            GdrWaitPushPull => &self.gdr,
            _ => return None,
        };
        table.clone()
    }
}

/// Payloads and grouped arrivals delivered by the PS receive path, parked
/// until the gated stage consumes them.
pub(crate) struct PendingTransfers {
    data: DashMap<u64, VecDeque<Bytes>>,
    groups: DashMap<u64, GroupCollect>,
}

struct GroupCollect {
    expected: usize,
    parts: Vec<(u64, Bytes)>,
}

impl PendingTransfers {
    fn new() -> Self {
        PendingTransfers {
            data: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    pub fn push_data(&self, key: u64, data: Bytes) {
        self.data.entry(key).or_default().push_back(data);
    }

    pub fn take_data(&self, key: u64) -> Option<Bytes> {
        self.data.get_mut(&key).and_then(|mut q| q.pop_front())
    }

    /// Announces that `expected` chunks will arrive for a grouped copy.
    /// Returns true when the expectation is already satisfied (zero peers).
    pub fn expect_group(&self, group_key: u64, expected: usize) -> bool {
        if expected == 0 {
            return true;
        }
        self.groups.insert(
            group_key,
            GroupCollect {
                expected,
                parts: Vec::new(),
            },
        );
        false
    }

    /// Files one chunk under its group; true once the group is complete.
    pub fn group_push(&self, group_key: u64, key: u64, data: Bytes) -> bool {
        match self.groups.get_mut(&group_key) {
            Some(mut group) => {
                group.parts.push((key, data));
                group.parts.len() == group.expected
            }
            None => false,
        }
    }

    pub fn take_group(&self, group_key: u64) -> Vec<(u64, Bytes)> {
        self.groups
            .remove(&group_key)
            .map(|(_, g)| g.parts)
            .unwrap_or_default()
    }

    pub fn has_group(&self, group_key: u64) -> bool {
        self.groups.contains_key(&group_key)
    }
}

pub(crate) struct RuntimeShared {
    pub config: Config,
    pub modes: PipelineModes,
    pub collab: Collaborators,
    pub router: KeyRouter,
    pub queues: Vec<Arc<ScheduledQueue>>,
    pub tables: Tables,
    pub registry: ContextRegistry,
    pub pending: PendingTransfers,
    pub handles: Arc<HandleManager>,
    pub trace: Option<Arc<TraceCollector>>,
    pub err_callbacks: DashMap<u64, StatusCallback>,
    pub shutdown: AtomicBool,
    pub initialized: AtomicBool,
    pub joined_threads: AtomicUsize,
    pub total_threads: AtomicUsize,
    shutdown_lock: Mutex<()>,
    shutdown_cv: Condvar,
}

impl RuntimeShared {
    pub fn queue(&self, stage: StageKind) -> &Arc<ScheduledQueue> {
        &self.queues[stage.index()]
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn notify_all_queues(&self) {
        for queue in &self.queues {
            queue.notify();
        }
    }

    fn wait_shutdown(&self, timeout: Duration) -> bool {
        // the flag is flipped under the same lock, so the check-then-wait
        // cannot miss the wakeup
        let guard = self.shutdown_lock.lock().unwrap();
        if self.should_shutdown() {
            return true;
        }
        let (_guard, _) = self.shutdown_cv.wait_timeout(guard, timeout).unwrap();
        self.should_shutdown()
    }

    /// Adds one count to a table (if present on this rank) and pokes the
    /// stage queue it gates.
    pub fn table_ready(&self, table: &Option<Arc<ReadyTable>>, stage: StageKind, key: u64) {
        if let Some(table) = table {
            table.add_ready(key);
            self.queue(stage).notify();
        }
    }
}

/// Receive-path and signal hooks installed into the collaborators. Holds
/// the shared state weakly so a dropped runtime stops the hooks.
struct RuntimeHooks {
    shared: Weak<RuntimeShared>,
}

impl RuntimeHooks {
    fn with_shared(&self, f: impl FnOnce(&RuntimeShared)) {
        if let Some(shared) = self.shared.upgrade() {
            if !shared.should_shutdown() {
                f(&shared);
            }
        }
    }
}

impl Delivery for RuntimeHooks {
    fn on_receive(&self, recv_key: u64, data: Bytes) {
        self.with_shared(|shared| {
            let Some(parts) = key::decode(recv_key) else {
                log::warn!("dropping payload with malformed key {}", recv_key);
                return;
            };
            match parts.op {
                OpType::Alltoall => {
                    let group_key = key::alltoall_tensor_id(recv_key);
                    shared.pending.push_data(recv_key, data);
                    if shared.pending.has_group(group_key) {
                        if let Some(chunk) = shared.pending.take_data(recv_key) {
                            if shared.pending.group_push(group_key, recv_key, chunk) {
                                shared.table_ready(
                                    &shared.tables.p2p_group_copy,
                                    StageKind::P2pGroupCopyH2D,
                                    group_key,
                                );
                            }
                        }
                    } else {
                        shared.table_ready(&shared.tables.p2p_copy, StageKind::Recv, recv_key);
                    }
                }
                OpType::P2p => {
                    shared.pending.push_data(recv_key, data);
                    shared.table_ready(&shared.tables.p2p_copy, StageKind::Recv, recv_key);
                }
                OpType::PushPull => {
                    // reduced GDR partitions come back keyed like push-pull
                    shared.pending.push_data(recv_key, data);
                    shared.table_ready(&shared.tables.gdr, StageKind::GdrWaitPushPull, recv_key);
                    shared.queue(StageKind::GdrV2PushPull).notify();
                }
                OpType::Allgather => {
                    log::warn!("unexpected pushed payload for allgather key {}", recv_key);
                }
            }
        });
    }

    fn on_pull_request(&self, recv_key: u64) {
        self.with_shared(|shared| {
            let Some(parts) = key::decode(recv_key & !1) else {
                log::warn!("dropping pull request with malformed key {}", recv_key);
                return;
            };
            match parts.op {
                OpType::Alltoall => {
                    shared.table_ready(
                        &shared.tables.p2p_pull_response,
                        StageKind::P2pPullResponse,
                        recv_key,
                    );
                }
                OpType::Allgather => {
                    // the low bit marks the worker-local-root lane
                    if recv_key & 1 == 1 {
                        shared.table_ready(
                            &shared.tables.allgather_wlr_resp,
                            StageKind::AllgatherPullWorkerLocalRootResp,
                            recv_key & !1,
                        );
                    } else {
                        shared.table_ready(
                            &shared.tables.allgather_pull_resp,
                            StageKind::AllgatherPullResp,
                            recv_key,
                        );
                    }
                }
                _ => log::warn!("unexpected pull request for key {}", recv_key),
            }
        });
    }

    fn on_ack(&self, recv_key: u64) {
        self.with_shared(|shared| {
            let Some(parts) = key::decode(recv_key & !1) else {
                return;
            };
            match parts.op {
                OpType::Alltoall => {
                    shared.table_ready(&shared.tables.p2p_ack, StageKind::P2pWaitAck, recv_key);
                }
                OpType::Allgather => {
                    if recv_key & 1 == 1 {
                        shared.table_ready(
                            &shared.tables.allgather_wlr_ack,
                            StageKind::AllgatherPullWorkerLocalRootAck,
                            recv_key & !1,
                        );
                    } else {
                        shared.table_ready(
                            &shared.tables.allgather_pull_ack,
                            StageKind::AllgatherPullAck,
                            recv_key,
                        );
                    }
                }
                _ => {}
            }
        });
    }
}

impl SignalHandler for RuntimeHooks {
    fn on_signal(&self, signal: CoordSignal, signal_key: u64) {
        self.with_shared(|shared| {
            use CoordSignal::*;
            let tables = &shared.tables;
            match signal {
                ReduceReady => shared.table_ready(&tables.reduce, StageKind::Reduce, signal_key),
                PcieReduceReady => {
                    shared.table_ready(&tables.pcie_reduce, StageKind::PcieReduce, signal_key)
                }
                PushReady => shared.table_ready(&tables.push, StageKind::Push, signal_key),
                BcastReady => {
                    shared.table_ready(&tables.broadcast, StageKind::Broadcast, signal_key)
                }
                CpuReduceReady => {
                    shared.table_ready(&tables.cpu_reduce, StageKind::CpuReduce, signal_key)
                }
                CpuBcastReady => {
                    shared.table_ready(&tables.cpu_bcast, StageKind::CpuBcast, signal_key)
                }
                CpuBcastFinishReady => shared.table_ready(
                    &tables.cpu_bcast_finish,
                    StageKind::CpuBcastFinish,
                    signal_key,
                ),
                AllgatherReady => {
                    shared.table_ready(&tables.allgather, StageKind::Allgather, signal_key)
                }
                AllgatherBcastReady => shared.table_ready(
                    &tables.allgather_bcast,
                    StageKind::AllgatherBcast,
                    signal_key,
                ),
                CopyH2dReady => {
                    shared.table_ready(&tables.copy_h2d, StageKind::CopyH2D, signal_key)
                }
                AllgatherCopyH2dReady => shared.table_ready(
                    &tables.allgather_copy_h2d,
                    StageKind::AllgatherCopyH2D,
                    signal_key,
                ),
                AllgatherRespReady => shared.table_ready(
                    &tables.allgather_wlr_resp,
                    StageKind::AllgatherPullWorkerLocalRootResp,
                    signal_key,
                ),
            }
        });
    }
}

/// The stage workers this rank must run, mirroring the conditional loop
/// list of the original init path.
fn loop_set(config: &Config, modes: &PipelineModes) -> Vec<StageKind> {
    use StageKind::*;
    let mut set = Vec::new();
    let distributed = modes.distributed;
    let allreduce_host_path = !config.disable_cpu_allreduce
        || (!config.disable_gpu_allreduce && !modes.gdr_allreduce);

    if distributed && config.joint && !config.disable_p2p {
        if !config.disable_send_recv {
            set.push(Recv);
            set.push(Send);
        }
        if config.alltoall_use_pull {
            set.push(P2pPull);
            set.push(P2pPullResponse);
            if !config.disable_p2p_ack {
                set.push(P2pWaitAck);
            }
        } else {
            set.push(P2pGroupCopyH2D);
        }
    }
    if distributed && modes.root_device && allreduce_host_path {
        set.push(Pull);
    }
    if modes.cross_pcie_switch && !config.disable_gpu_allreduce {
        set.push(PcieReduce);
    }
    if !modes.signal_root {
        set.push(CoordinateReduce);
        set.push(CoordinateBroadcast);
        set.push(CoordinateAllgather);
        set.push(CoordinateAllgatherBcast);
    }
    if !modes.root_device {
        set.push(CoordinatePush);
    }
    if (distributed || modes.cross_pcie_switch) && allreduce_host_path {
        set.push(CopyD2H);
        set.push(CopyH2D);
        if modes.root_device {
            set.push(Push);
        }
    }
    if modes.root_device && !config.disable_compress {
        if distributed {
            set.push(Decompress);
        }
        if distributed || modes.cross_pcie_switch {
            set.push(Compress);
        }
    }
    if !config.disable_gpu_allreduce || !config.disable_gpu_allgather {
        set.push(Reduce);
        set.push(Broadcast);
        set.push(Allgather);
        set.push(AllgatherBcast);
        if modes.gdr_allreduce && modes.multi_node {
            if modes.gdr_gpu2gpu {
                set.push(GdrV2PushPull);
            } else {
                set.push(GdrV1PushPull);
            }
            set.push(GdrWaitPushPull);
        }
    }
    if !config.disable_cpu_allreduce {
        set.push(CpuCopy);
        set.push(CpuReduce);
        set.push(CpuBcast);
        if modes.root_device {
            set.push(CpuBcastFinish);
        }
    }
    if config.joint && !config.disable_gpu_allgather && distributed {
        if modes.root_device {
            set.push(AllgatherPullWorkerLocalRoot);
            set.push(AllgatherPull);
            set.push(AllgatherPullResp);
        }
        if modes.local_rank0 {
            set.push(AllgatherPullWorkerLocalRootResp);
        }
        if (modes.root_device || modes.local_rank0) && !config.disable_p2p_ack {
            if modes.root_device {
                set.push(AllgatherPullAck);
            }
            if modes.local_rank0 {
                set.push(AllgatherPullWorkerLocalRootAck);
            }
        }
        if !modes.gdr_allgather {
            set.push(AllgatherCopyD2H);
            set.push(AllgatherCopyH2D);
        }
    }
    set.sort_by_key(|s| s.index());
    set.dedup();
    set
}

/// Declarations that survive a suspend; fed back into `Runtime::resume`.
pub struct SuspendedState {
    pub config: Config,
    declarations: Vec<DeclRecord>,
}

pub struct Runtime {
    pub(crate) shared: Arc<RuntimeShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    down: AtomicBool,
}

impl Runtime {
    pub fn init(config: Config, collab: Collaborators) -> Result<Runtime, CommError> {
        config.validate()?;
        let group_size = collab.reducer.group_size();
        let modes = PipelineModes {
            distributed: config.is_distributed(),
            cross_pcie_switch: config.local_size > group_size,
            root_device: config.is_root_device(),
            signal_root: collab.reducer.is_signal_root(),
            local_rank0: config.local_rank == 0,
            multi_node: config.num_phy_nodes > 1,
            gdr_allreduce: config.use_gdr_allreduce,
            gdr_gpu2gpu: config.gdr_gpu2gpu(),
            gdr_allgather: config.use_gdr_allgather,
            alltoall_use_pull: config.alltoall_use_pull,
            p2p_ack_disabled: config.disable_p2p_ack,
        };
        let router = KeyRouter::new(
            config.hash_kind()?,
            config.num_server.max(1),
            config.num_worker,
            config.num_phy_nodes,
            config.local_size,
            config.effective_server_local_root(),
            config.built_in_hash_coefficient,
            config.mixed_mode_bound,
        )?;
        let tables = Tables::build(&config, &modes, group_size);
        let queues: Vec<Arc<ScheduledQueue>> = StageKind::iter()
            .map(|stage| {
                let credit = (stage == StageKind::Push && config.scheduling_credit > 0)
                    .then_some(config.scheduling_credit);
                Arc::new(ScheduledQueue::new(stage, tables.gate_for(stage), credit))
            })
            .collect();
        let trace = config
            .trace_on
            .then(|| Arc::new(TraceCollector::new(&config.trace_dir, config.rank)));

        log::info!(
            "init rank={} local_rank={} size={} local_size={} worker_id={} distributed={} joint={}",
            config.rank,
            config.local_rank,
            config.size,
            config.local_size,
            config.worker_id,
            modes.distributed,
            config.joint
        );

        let shared = Arc::new(RuntimeShared {
            config,
            modes,
            collab,
            router,
            queues,
            tables,
            registry: ContextRegistry::new(),
            pending: PendingTransfers::new(),
            handles: Arc::new(HandleManager::new()),
            trace,
            err_callbacks: DashMap::new(),
            shutdown: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            joined_threads: AtomicUsize::new(0),
            total_threads: AtomicUsize::new(0),
            shutdown_lock: Mutex::new(()),
            shutdown_cv: Condvar::new(),
        });

        let hooks = Arc::new(RuntimeHooks {
            shared: Arc::downgrade(&shared),
        });
        shared.collab.ps.set_delivery(hooks.clone());
        shared.collab.node_comm.set_handler(hooks);

        let stages = loop_set(&shared.config, &shared.modes);
        let mut workers = Vec::with_capacity(stages.len() + 1);
        for stage in &stages {
            let shared = shared.clone();
            let stage = *stage;
            workers.push(std::thread::spawn(move || {
                loops::worker_mainloop(shared, stage)
            }));
        }
        if shared.config.monitor_interval_secs > 0 {
            let shared = shared.clone();
            workers.push(std::thread::spawn(move || monitor_mainloop(shared)));
        }
        shared
            .total_threads
            .store(workers.len(), Ordering::Release);
        log::debug!(
            "started {} background threads, local_rank={}",
            workers.len(),
            shared.config.local_rank
        );

        // init barrier: non-roots wait for the root before any traffic
        shared.collab.node_comm.barrier()?;
        shared.initialized.store(true, Ordering::Release);

        Ok(Runtime {
            shared,
            workers: Mutex::new(workers),
            down: AtomicBool::new(false),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire) && !self.down.load(Ordering::Acquire)
    }

    pub fn rank(&self) -> usize {
        self.shared.config.rank
    }

    pub fn local_rank(&self) -> usize {
        self.shared.config.local_rank
    }

    pub fn size(&self) -> usize {
        self.shared.config.size
    }

    pub fn local_size(&self) -> usize {
        self.shared.config.local_size
    }

    pub fn declare(&self, name: &str, provided_id: i32) -> Result<i32, CommError> {
        self.shared
            .registry
            .declare(name, OpType::PushPull, provided_id, -1)
    }

    pub fn declare_p2p(&self, name: &str, sender: i32, receiver: i32) -> Result<i32, CommError> {
        self.shared.registry.declare_p2p(name, sender, receiver)
    }

    pub fn declare_allgather(&self, name: &str, provided_id: i32) -> Result<i32, CommError> {
        self.shared
            .registry
            .declare(name, OpType::Allgather, provided_id, -1)
    }

    pub fn poll(&self, handle: u64) -> bool {
        self.shared.handles.poll(handle)
    }

    /// Blocks until the operation completes and returns its final status.
    pub fn wait(&self, handle: u64, busy_waiting: bool) -> Status {
        self.shared.handles.wait(handle, busy_waiting);
        self.shared.handles.release(handle)
    }

    /// Tears everything down: stops workers, drains queues, finalizes the
    /// PS client and drops the ready tables.
    pub fn shutdown(mut self) {
        self.do_shutdown();
    }

    /// Shutdown that preserves the declaration record for `resume`.
    pub fn suspend(mut self) -> SuspendedState {
        let declarations = self.shared.registry.declarations();
        let config = self.shared.config.clone();
        self.do_shutdown();
        log::info!("suspended, {} declarations kept", declarations.len());
        SuspendedState {
            config,
            declarations,
        }
    }

    /// Re-enters a suspended job with a possibly different cluster size and
    /// replays the recorded declarations.
    pub fn resume(
        state: SuspendedState,
        num_workers: usize,
        num_servers: usize,
        collab: Collaborators,
    ) -> Result<Runtime, CommError> {
        let mut config = state.config;
        config.num_worker = num_workers;
        config.num_server = num_servers;
        let runtime = Runtime::init(config, collab)?;
        runtime.shared.registry.redeclare_all(&state.declarations)?;
        log::info!("resumed with {} workers, {} servers", num_workers, num_servers);
        Ok(runtime)
    }

    fn do_shutdown(&mut self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.shared;
        log::debug!("shutdown: stopping workers, rank={}", shared.config.rank);
        {
            let _guard = shared.shutdown_lock.lock().unwrap();
            shared.shutdown.store(true, Ordering::Release);
        }
        shared.shutdown_cv.notify_all();
        shared.notify_all_queues();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        let total = workers.len();
        for worker in workers {
            let _ = worker.join();
        }
        while shared.joined_threads.load(Ordering::Acquire) < total {
            std::thread::sleep(Duration::from_micros(10));
        }
        if let Err(e) = shared.collab.ps.finalize() {
            log::warn!("ps finalize failed: {}", e);
        }
        if let Some(trace) = &shared.trace {
            trace.flush();
        }
        shared.initialized.store(false, Ordering::Release);
        log::debug!(
            "shutdown complete: joined {} threads, rank={}",
            total,
            shared.config.rank
        );
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.do_shutdown();
    }
}

/// Watchdog: reports tasks stuck in a queue longer than the monitor
/// interval; optionally aborts the process.
fn monitor_mainloop(shared: Arc<RuntimeShared>) {
    let interval = Duration::from_secs(shared.config.monitor_interval_secs);
    loop {
        if shared.wait_shutdown(interval) {
            break;
        }
        let mut stuck = 0usize;
        for queue in &shared.queues {
            for (name, pending_key, age) in queue.pending_tasks() {
                if age >= interval {
                    stuck += 1;
                    log::warn!(
                        "task {} (key {}) pending in {} for {:?}",
                        name,
                        pending_key,
                        queue.stage().as_ref(),
                        age
                    );
                }
            }
        }
        if stuck > 0 && shared.config.abort_on_timeout {
            log::error!("{} tasks exceeded the monitor interval, aborting", stuck);
            std::process::abort();
        }
    }
    shared.joined_threads.fetch_add(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_set_for_single_rank_cpu() {
        let config = Config {
            force_distributed: true,
            num_server: 1,
            disable_gpu_allreduce: true,
            disable_gpu_allgather: true,
            ..Config::default()
        };
        let modes = PipelineModes {
            distributed: true,
            root_device: true,
            signal_root: true,
            ..Default::default()
        };
        let set = loop_set(&config, &modes);
        for stage in [
            StageKind::CpuCopy,
            StageKind::CpuReduce,
            StageKind::CpuBcast,
            StageKind::CpuBcastFinish,
            StageKind::Push,
            StageKind::Pull,
            StageKind::CopyD2H,
            StageKind::CopyH2D,
        ] {
            assert!(set.contains(&stage), "missing {:?}", stage);
        }
        assert!(!set.contains(&StageKind::CoordinateReduce));
        assert!(!set.contains(&StageKind::Send));
    }

    #[test]
    fn loop_set_for_non_root_gets_coordinate_loops() {
        let config = Config {
            local_size: 2,
            local_rank: 0,
            size: 2,
            ..Config::default()
        };
        let modes = PipelineModes {
            root_device: false,
            signal_root: false,
            ..Default::default()
        };
        let set = loop_set(&config, &modes);
        assert!(set.contains(&StageKind::CoordinateReduce));
        assert!(set.contains(&StageKind::CoordinatePush));
        assert!(set.contains(&StageKind::CoordinateBroadcast));
        assert!(!set.contains(&StageKind::Pull));
        assert!(!set.contains(&StageKind::CpuBcastFinish));
    }
}
