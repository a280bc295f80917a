//! In-process collaborators. One `LocalCluster` plays the role of the PS
//! substrate, the intra-node signal sockets, the shared-memory namespace
//! and the ring reducer for every rank of a single-machine (joint mode)
//! job; each rank receives per-rank endpoints bound to the shared state.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use bytes::Bytes;
use dashmap::DashMap;

use crate::buffer::SharedRegion;
use crate::key::RoutedKey;
use crate::status::{CommError, Status};
use crate::task::{DataType, Device, Tensor};

use super::{
    Collaborators, Compressor, CompressorFactory, CoordSignal, Copier, CopyStream, CpuReducer,
    Delivery, IntraNodeReducer, NodeComm, PsClient, ShmAllocator, SignalHandler,
};

// ---------------------------------------------------------------------------
// CPU reduction kernels

pub struct PlainCpuReducer;

macro_rules! sum_as {
    ($ty:ty, $dst:expr, $src:expr) => {{
        let dst_vals = $dst.chunks_exact_mut(std::mem::size_of::<$ty>());
        let src_vals = $src.chunks_exact(std::mem::size_of::<$ty>());
        for (d, s) in dst_vals.zip(src_vals) {
            let sum = <$ty>::from_le_bytes(d.try_into().unwrap())
                + <$ty>::from_le_bytes(s.try_into().unwrap());
            d.copy_from_slice(&sum.to_le_bytes());
        }
    }};
}

macro_rules! scale_as {
    ($ty:ty, $buf:expr, $factor:expr) => {{
        for chunk in $buf.chunks_exact_mut(std::mem::size_of::<$ty>()) {
            let scaled = (<$ty>::from_le_bytes(chunk.try_into().unwrap()) as f64 * $factor) as $ty;
            chunk.copy_from_slice(&scaled.to_le_bytes());
        }
    }};
}

impl CpuReducer for PlainCpuReducer {
    fn sum(&self, dst: &mut [u8], src: &[u8], dtype: DataType) -> Status {
        match dtype {
            DataType::Float32 => sum_as!(f32, dst, src),
            DataType::Float64 => sum_as!(f64, dst, src),
            DataType::Int32 => sum_as!(i32, dst, src),
            DataType::Int64 => sum_as!(i64, dst, src),
            other => {
                return Err(CommError::Unknown(format!(
                    "cpu reduce not implemented for {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn scale(&self, buf: &mut [u8], dtype: DataType, factor: f64) -> Status {
        match dtype {
            DataType::Float32 => scale_as!(f32, buf, factor),
            DataType::Float64 => scale_as!(f64, buf, factor),
            DataType::Int32 => scale_as!(i32, buf, factor),
            DataType::Int64 => scale_as!(i64, buf, factor),
            other => {
                return Err(CommError::Unknown(format!(
                    "cpu scale not implemented for {:?}",
                    other
                )))
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Heap-backed tensors

/// Tensor handle backed by plain heap storage; what the bench binary and
/// the test harness hand to the enqueue paths.
pub struct HeapTensor {
    data: Mutex<Vec<u8>>,
    dtype: DataType,
    device: Device,
}

impl HeapTensor {
    pub fn zeros(bytes: usize, dtype: DataType, device: Device) -> Arc<Self> {
        Arc::new(HeapTensor {
            data: Mutex::new(vec![0u8; bytes]),
            dtype,
            device,
        })
    }

    pub fn from_f32(values: &[f32], device: Device) -> Arc<Self> {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Arc::new(HeapTensor {
            data: Mutex::new(data),
            dtype: DataType::Float32,
            device,
        })
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        let data = self.data.lock().unwrap();
        data.chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Tensor for HeapTensor {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn device(&self) -> Device {
        self.device
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock().unwrap();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    fn write_at(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock().unwrap();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    fn resize(&self, new_size: usize) {
        self.data.lock().unwrap().resize(new_size, 0);
    }
}

// ---------------------------------------------------------------------------
// Device copies

pub struct LocalCopier;

impl Copier for LocalCopier {
    fn d2h(
        &self,
        _stream: CopyStream,
        src: &Arc<dyn Tensor>,
        src_offset: usize,
        dst: &SharedRegion,
        dst_offset: usize,
        len: usize,
    ) -> Status {
        let mut buf = vec![0u8; len];
        src.read_at(src_offset, &mut buf);
        dst.write_at(dst_offset, &buf);
        Ok(())
    }

    fn h2d(
        &self,
        _stream: CopyStream,
        src: &SharedRegion,
        src_offset: usize,
        dst: &Arc<dyn Tensor>,
        dst_offset: usize,
        len: usize,
    ) -> Status {
        dst.write_at(dst_offset, src.snapshot(src_offset, len).as_ref());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compression

struct PassthroughCompressor;

impl Compressor for PassthroughCompressor {
    fn compress(&self, data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    fn decompress(&self, data: &[u8], out: &mut [u8]) -> Status {
        out[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

pub struct LocalCompressorFactory;

impl CompressorFactory for LocalCompressorFactory {
    fn create(
        &self,
        kwargs: &HashMap<String, String>,
        _aligned_len: usize,
        _dtype: DataType,
    ) -> Result<Arc<dyn Compressor>, CommError> {
        match kwargs.get("compressor").map(String::as_str) {
            Some("identity") | None => Ok(Arc::new(PassthroughCompressor)),
            Some(other) => Err(CommError::InvalidArgument(format!(
                "unknown compressor {:?}",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared memory namespace

pub struct LocalShm {
    segments: DashMap<String, SharedRegion>,
}

impl LocalShm {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalShm {
            segments: DashMap::new(),
        })
    }
}

impl ShmAllocator for LocalShm {
    fn open(
        &self,
        prefix: &str,
        key: u64,
        len: usize,
        _create: bool,
    ) -> Result<SharedRegion, CommError> {
        let name = format!("{}{}", prefix, key);
        let region = self
            .segments
            .entry(name)
            .or_insert_with(|| SharedRegion::new(len));
        if region.len() < len {
            return Err(CommError::Unknown(format!(
                "shared segment {}{} smaller than requested: {} < {}",
                prefix,
                key,
                region.len(),
                len
            )));
        }
        Ok(region.clone())
    }

    fn open_pcie(
        &self,
        prefix: &str,
        key: u64,
        len: usize,
        num_switches: usize,
    ) -> Result<Vec<SharedRegion>, CommError> {
        (0..num_switches)
            .map(|switch| self.open(&format!("{}_switch{}_", prefix, switch), key, len, true))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Parameter-server substrate

struct AggEntry {
    acc: Vec<u8>,
    pushes: usize,
    pulls: usize,
}

struct PsShared {
    num_ranks: usize,
    /// Leader ranks expected to push/pull each round.
    expected: usize,
    aggregates: Mutex<HashMap<u64, AggEntry>>,
    agg_cv: Condvar,
    deliveries: Mutex<Vec<Option<Arc<dyn Delivery>>>>,
    delivery_cv: Condvar,
    /// Sends that arrived before the receiver installed its delivery hook.
    backlog: Mutex<Vec<Vec<(u64, Bytes)>>>,
    /// (requester, responder, key) -> response payload.
    pull_slots: Mutex<HashMap<(usize, usize, u64), Option<Bytes>>>,
    pull_cv: Condvar,
    gdr: Mutex<HashMap<u64, Vec<(usize, Bytes, DataType)>>>,
    reducer: PlainCpuReducer,
}

/// The in-process stand-in for the ps-lite substrate shared by all ranks.
pub struct LocalPs {
    shared: Arc<PsShared>,
}

impl LocalPs {
    pub fn new(num_ranks: usize, expected_leaders: usize) -> Self {
        LocalPs {
            shared: Arc::new(PsShared {
                num_ranks,
                expected: expected_leaders.max(1),
                aggregates: Mutex::new(HashMap::new()),
                agg_cv: Condvar::new(),
                deliveries: Mutex::new(vec![None; num_ranks]),
                delivery_cv: Condvar::new(),
                backlog: Mutex::new(vec![Vec::new(); num_ranks]),
                pull_slots: Mutex::new(HashMap::new()),
                pull_cv: Condvar::new(),
                gdr: Mutex::new(HashMap::new()),
                reducer: PlainCpuReducer,
            }),
        }
    }

    pub fn endpoint(&self, rank: usize) -> Arc<LocalPsEndpoint> {
        assert!(rank < self.shared.num_ranks);
        Arc::new(LocalPsEndpoint {
            rank,
            shared: self.shared.clone(),
        })
    }
}

pub struct LocalPsEndpoint {
    rank: usize,
    shared: Arc<PsShared>,
}

impl PsShared {
    /// Blocks until the target rank has installed its hook; ranks come up
    /// at their own pace and only intra-node startup is barriered.
    fn deliver(&self, rank: usize, f: impl FnOnce(&Arc<dyn Delivery>)) -> Status {
        let mut deliveries = self.deliveries.lock().unwrap();
        loop {
            if let Some(delivery) = deliveries[rank].clone() {
                drop(deliveries);
                f(&delivery);
                return Ok(());
            }
            deliveries = self.delivery_cv.wait(deliveries).unwrap();
        }
    }

    fn deliver_data(&self, rank: usize, key: u64, data: Bytes) {
        let deliveries = self.deliveries.lock().unwrap();
        match deliveries[rank].clone() {
            Some(delivery) => {
                drop(deliveries);
                delivery.on_receive(key, data);
            }
            None => {
                // parked under the deliveries lock so the hook installer
                // cannot drain the backlog in between
                self.backlog.lock().unwrap()[rank].push((key, data));
            }
        }
    }
}

impl PsClient for LocalPsEndpoint {
    fn register(&self, routed: RoutedKey, init: Bytes) -> Status {
        let mut aggregates = self.shared.aggregates.lock().unwrap();
        aggregates.entry(routed.ps_key).or_insert_with(|| AggEntry {
            acc: vec![0u8; init.len().max(routed.len)],
            pushes: 0,
            pulls: 0,
        });
        log::trace!("rank {} registered ps key {}", self.rank, routed.ps_key);
        Ok(())
    }

    fn push(&self, routed: RoutedKey, data: Bytes, dtype: DataType, aggregate: bool) -> Status {
        let mut aggregates = self.shared.aggregates.lock().unwrap();
        loop {
            let entry = aggregates.entry(routed.ps_key).or_insert_with(|| AggEntry {
                acc: vec![0u8; data.len()],
                pushes: 0,
                pulls: 0,
            });
            if entry.acc.len() < data.len() {
                entry.acc.resize(data.len(), 0);
            }
            if !aggregate {
                entry.acc[..data.len()].copy_from_slice(&data);
                entry.pushes = self.shared.expected;
                break;
            }
            // wait out the previous round's drain
            if entry.pushes == self.shared.expected && entry.pulls < self.shared.expected {
                aggregates = self.shared.agg_cv.wait(aggregates).unwrap();
                continue;
            }
            if entry.pushes == 0 {
                entry.acc[..data.len()].fill(0);
                entry.pulls = 0;
            }
            self.shared
                .reducer
                .sum(&mut entry.acc[..data.len()], &data, dtype)?;
            entry.pushes += 1;
            break;
        }
        drop(aggregates);
        self.shared.agg_cv.notify_all();
        Ok(())
    }

    fn pull(&self, routed: RoutedKey, len: usize) -> Result<Bytes, CommError> {
        let mut aggregates = self.shared.aggregates.lock().unwrap();
        loop {
            let ready = aggregates
                .get(&routed.ps_key)
                .map_or(false, |e| e.pushes >= self.shared.expected);
            if ready {
                let entry = aggregates.get_mut(&routed.ps_key).unwrap();
                let data = Bytes::copy_from_slice(&entry.acc[..len]);
                entry.pulls += 1;
                if entry.pulls >= self.shared.expected {
                    entry.pushes = 0;
                }
                drop(aggregates);
                self.shared.agg_cv.notify_all();
                return Ok(data);
            }
            aggregates = self.shared.agg_cv.wait(aggregates).unwrap();
        }
    }

    fn send(&self, receiver: usize, key: u64, data: Bytes) -> Status {
        if receiver >= self.shared.num_ranks {
            return Err(CommError::InvalidArgument(format!(
                "receiver {} out of range",
                receiver
            )));
        }
        self.shared.deliver_data(receiver, key, data);
        Ok(())
    }

    fn pull_from(&self, target: usize, key: u64) -> Result<Bytes, CommError> {
        let slot = (self.rank, target, key);
        {
            let mut slots = self.shared.pull_slots.lock().unwrap();
            slots.insert(slot, None);
        }
        self.shared
            .deliver(target, |delivery| delivery.on_pull_request(key))?;
        let mut slots = self.shared.pull_slots.lock().unwrap();
        loop {
            if let Some(Some(_)) = slots.get(&slot) {
                let data = slots.remove(&slot).unwrap().unwrap();
                return Ok(data);
            }
            slots = self.shared.pull_cv.wait(slots).unwrap();
        }
    }

    fn respond(&self, requester: usize, key: u64, data: Bytes) -> Status {
        let slot = (requester, self.rank, key);
        let mut slots = self.shared.pull_slots.lock().unwrap();
        if !slots.contains_key(&slot) {
            return Err(CommError::Unknown(format!(
                "no outstanding pull from rank {} for key {}",
                requester, key
            )));
        }
        slots.insert(slot, Some(data));
        drop(slots);
        self.shared.pull_cv.notify_all();
        Ok(())
    }

    fn ack(&self, target: usize, key: u64) -> Status {
        self.shared.deliver(target, |delivery| delivery.on_ack(key))
    }

    fn gdr_exchange(&self, key: u64, data: Bytes, dtype: DataType) -> Status {
        let complete = {
            let mut gdr = self.shared.gdr.lock().unwrap();
            let entry = gdr.entry(key).or_default();
            entry.push((self.rank, data, dtype));
            if entry.len() == self.shared.expected {
                gdr.remove(&key)
            } else {
                None
            }
        };
        if let Some(contributions) = complete {
            let dtype = contributions[0].2;
            let mut acc = contributions[0].1.to_vec();
            for (_, data, _) in &contributions[1..] {
                self.shared.reducer.sum(&mut acc, data, dtype)?;
            }
            let reduced = Bytes::from(acc);
            for (rank, _, _) in &contributions {
                self.shared.deliver_data(*rank, key, reduced.clone());
            }
        }
        Ok(())
    }

    fn set_delivery(&self, delivery: Arc<dyn Delivery>) {
        let mut deliveries = self.shared.deliveries.lock().unwrap();
        deliveries[self.rank] = Some(delivery.clone());
        drop(deliveries);
        self.shared.delivery_cv.notify_all();
        let pending: Vec<(u64, Bytes)> =
            std::mem::take(&mut self.shared.backlog.lock().unwrap()[self.rank]);
        for (key, data) in pending {
            delivery.on_receive(key, data);
        }
    }

    fn finalize(&self) -> Status {
        let mut deliveries = self.shared.deliveries.lock().unwrap();
        deliveries[self.rank] = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Intra-node signal channel

struct SignalShared {
    handlers: Mutex<HashMap<usize, Arc<dyn SignalHandler>>>,
    root_local_rank: usize,
    local_size: usize,
    barrier_state: Mutex<(usize, u64)>,
    barrier_cv: Condvar,
}

/// Signal fabric for one physical node.
pub struct LocalSignalFabric {
    shared: Arc<SignalShared>,
}

impl LocalSignalFabric {
    pub fn new(local_size: usize, root_local_rank: usize) -> Self {
        LocalSignalFabric {
            shared: Arc::new(SignalShared {
                handlers: Mutex::new(HashMap::new()),
                root_local_rank,
                local_size,
                barrier_state: Mutex::new((0, 0)),
                barrier_cv: Condvar::new(),
            }),
        }
    }

    pub fn endpoint(&self, local_rank: usize) -> Arc<LocalSignalEndpoint> {
        Arc::new(LocalSignalEndpoint {
            local_rank,
            shared: self.shared.clone(),
        })
    }
}

pub struct LocalSignalEndpoint {
    local_rank: usize,
    shared: Arc<SignalShared>,
}

impl NodeComm for LocalSignalEndpoint {
    fn send_to_root(&self, signal: CoordSignal, key: u64) -> Status {
        let handlers = self.shared.handlers.lock().unwrap();
        match handlers.get(&self.shared.root_local_rank) {
            Some(handler) => {
                handler.on_signal(signal, key);
                Ok(())
            }
            None => Err(CommError::Unknown("node root is not listening".into())),
        }
    }

    fn broadcast(&self, signal: CoordSignal, key: u64) -> Status {
        let handlers = self.shared.handlers.lock().unwrap();
        for (local_rank, handler) in handlers.iter() {
            if *local_rank != self.local_rank {
                handler.on_signal(signal, key);
            }
        }
        Ok(())
    }

    fn set_handler(&self, handler: Arc<dyn SignalHandler>) {
        self.shared
            .handlers
            .lock()
            .unwrap()
            .insert(self.local_rank, handler);
    }

    fn barrier(&self) -> Status {
        let mut state = self.shared.barrier_state.lock().unwrap();
        let generation = state.1;
        state.0 += 1;
        if state.0 == self.shared.local_size {
            state.0 = 0;
            state.1 += 1;
            self.shared.barrier_cv.notify_all();
        } else {
            while state.1 == generation {
                state = self.shared.barrier_cv.wait(state).unwrap();
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Intra-node ring reducer

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum RingOp {
    Reduce,
    Broadcast,
    Allgather,
}

struct Participant {
    tensor: Arc<dyn Tensor>,
    output: Option<Arc<dyn Tensor>>,
    offset: usize,
    len: usize,
    dtype: DataType,
}

struct RingEntry {
    participants: HashMap<usize, Participant>,
    done: bool,
    left: usize,
}

struct RingShared {
    local_size: usize,
    signal_root: usize,
    ops: Mutex<HashMap<(u64, RingOp), RingEntry>>,
    cv: Condvar,
    reducer: PlainCpuReducer,
}

/// Rendezvous ring reducer for one physical node. Every local rank must
/// call the same collective with the same key; the last arrival computes.
pub struct LocalRing {
    shared: Arc<RingShared>,
}

impl LocalRing {
    pub fn new(local_size: usize, signal_root: usize) -> Self {
        LocalRing {
            shared: Arc::new(RingShared {
                local_size,
                signal_root,
                ops: Mutex::new(HashMap::new()),
                cv: Condvar::new(),
                reducer: PlainCpuReducer,
            }),
        }
    }

    pub fn endpoint(&self, local_rank: usize) -> Arc<LocalRingEndpoint> {
        Arc::new(LocalRingEndpoint {
            local_rank,
            shared: self.shared.clone(),
        })
    }
}

pub struct LocalRingEndpoint {
    local_rank: usize,
    shared: Arc<RingShared>,
}

impl LocalRingEndpoint {
    fn rendezvous(
        &self,
        key: u64,
        op: RingOp,
        participant: Participant,
        compute: impl FnOnce(&RingShared, &mut RingEntry) -> Status,
    ) -> Status {
        let shared = &self.shared;
        let mut ops = shared.ops.lock().unwrap();
        // wait for any previous round on this key to fully drain
        loop {
            let draining = matches!(
                ops.get(&(key, op)),
                Some(entry) if entry.done && !entry.participants.contains_key(&self.local_rank)
            );
            if !draining {
                break;
            }
            ops = shared.cv.wait(ops).unwrap();
        }
        let entry = ops.entry((key, op)).or_insert_with(|| RingEntry {
            participants: HashMap::new(),
            done: false,
            left: 0,
        });
        entry.participants.insert(self.local_rank, participant);
        if entry.participants.len() == shared.local_size {
            let result = {
                let entry = ops.get_mut(&(key, op)).unwrap();
                let result = compute(shared, entry);
                entry.done = true;
                result
            };
            shared.cv.notify_all();
            result?;
        } else {
            while !ops.get(&(key, op)).map_or(false, |e| e.done) {
                ops = shared.cv.wait(ops).unwrap();
            }
        }
        // leave; the last one out removes the entry
        let entry = ops.get_mut(&(key, op)).unwrap();
        entry.left += 1;
        if entry.left == shared.local_size {
            ops.remove(&(key, op));
        }
        drop(ops);
        shared.cv.notify_all();
        Ok(())
    }
}

impl IntraNodeReducer for LocalRingEndpoint {
    fn is_signal_root(&self) -> bool {
        self.local_rank == self.shared.signal_root
    }

    fn group_size(&self) -> usize {
        self.shared.local_size
    }

    fn reduce(
        &self,
        key: u64,
        tensor: &Arc<dyn Tensor>,
        offset: usize,
        len: usize,
        dtype: DataType,
    ) -> Status {
        let participant = Participant {
            tensor: tensor.clone(),
            output: None,
            offset,
            len,
            dtype,
        };
        self.rendezvous(key, RingOp::Reduce, participant, |shared, entry| {
            let root = &entry.participants[&shared.signal_root];
            let mut acc = vec![0u8; root.len];
            root.tensor.read_at(root.offset, &mut acc);
            for (rank, p) in entry.participants.iter() {
                if *rank == shared.signal_root {
                    continue;
                }
                let mut contribution = vec![0u8; p.len];
                p.tensor.read_at(p.offset, &mut contribution);
                shared.reducer.sum(&mut acc, &contribution, p.dtype)?;
            }
            root.tensor.write_at(root.offset, &acc);
            Ok(())
        })
    }

    fn broadcast(
        &self,
        key: u64,
        tensor: &Arc<dyn Tensor>,
        offset: usize,
        len: usize,
        dtype: DataType,
    ) -> Status {
        let participant = Participant {
            tensor: tensor.clone(),
            output: None,
            offset,
            len,
            dtype,
        };
        self.rendezvous(key, RingOp::Broadcast, participant, |shared, entry| {
            let root = &entry.participants[&shared.signal_root];
            let mut data = vec![0u8; root.len];
            root.tensor.read_at(root.offset, &mut data);
            for (rank, p) in entry.participants.iter() {
                if *rank != shared.signal_root {
                    p.tensor.write_at(p.offset, &data[..p.len]);
                }
            }
            Ok(())
        })
    }

    fn allgather(
        &self,
        key: u64,
        input: &Arc<dyn Tensor>,
        output: &Arc<dyn Tensor>,
        dst_offset: usize,
        len: usize,
    ) -> Status {
        let participant = Participant {
            tensor: input.clone(),
            output: Some(output.clone()),
            offset: dst_offset,
            len,
            dtype: input.dtype(),
        };
        self.rendezvous(key, RingOp::Allgather, participant, |_, entry| {
            for p in entry.participants.values() {
                let mut data = vec![0u8; p.len];
                p.tensor.read_at(0, &mut data);
                for q in entry.participants.values() {
                    q.output
                        .as_ref()
                        .expect("allgather output missing")
                        .write_at(p.offset, &data);
                }
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Cluster assembly

/// Shared substrate for an in-process cluster: one PS, one shm namespace,
/// and per-node signal fabrics and rings.
pub struct LocalCluster {
    pub num_ranks: usize,
    pub local_size: usize,
    ps: LocalPs,
    // shared memory is a per-host namespace
    shms: Vec<Arc<LocalShm>>,
    signals: Vec<LocalSignalFabric>,
    rings: Vec<LocalRing>,
}

impl LocalCluster {
    /// `num_ranks` total ranks evenly spread over `num_nodes` physical
    /// nodes. The signal root / worker-local root of each node is its last
    /// local rank.
    pub fn new(num_ranks: usize, num_nodes: usize) -> Self {
        assert!(num_nodes > 0 && num_ranks % num_nodes == 0);
        let local_size = num_ranks / num_nodes;
        Self::with_root(num_ranks, num_nodes, local_size - 1)
    }

    /// Like `new`, with an explicit root local rank per node; must match
    /// the `worker_local_root` the runtimes are configured with.
    pub fn with_root(num_ranks: usize, num_nodes: usize, root_local_rank: usize) -> Self {
        assert!(num_nodes > 0 && num_ranks % num_nodes == 0);
        let local_size = num_ranks / num_nodes;
        assert!(root_local_rank < local_size);
        let signals = (0..num_nodes)
            .map(|_| LocalSignalFabric::new(local_size, root_local_rank))
            .collect();
        let rings = (0..num_nodes)
            .map(|_| LocalRing::new(local_size, root_local_rank))
            .collect();
        LocalCluster {
            num_ranks,
            local_size,
            ps: LocalPs::new(num_ranks, num_nodes),
            shms: (0..num_nodes).map(|_| LocalShm::new()).collect(),
            signals,
            rings,
        }
    }

    /// Collaborator set for one rank.
    pub fn collaborators(&self, rank: usize) -> Collaborators {
        let node = rank / self.local_size;
        let local_rank = rank % self.local_size;
        Collaborators {
            ps: self.ps.endpoint(rank),
            reducer: self.rings[node].endpoint(local_rank),
            cpu_reducer: Arc::new(PlainCpuReducer),
            copier: Arc::new(LocalCopier),
            shm: self.shms[node].clone(),
            compressors: Arc::new(LocalCompressorFactory),
            node_comm: self.signals[node].endpoint(local_rank),
        }
    }
}
