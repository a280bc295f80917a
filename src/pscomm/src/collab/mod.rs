//! Capability interfaces for the external collaborators: the parameter
//! server transport, the intra-node ring reducer, CPU reduction kernels,
//! device copies, shared memory and compression codecs. The runtime only
//! ever talks to these traits; `local` provides in-process implementations
//! used by tests, benches and single-machine jobs.

pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::SharedRegion;
use crate::key::RoutedKey;
use crate::status::{CommError, Status};
use crate::task::{DataType, Tensor};

/// Parameter-server client bound to one rank. Blocking calls; the stage
/// workers own the blocking.
pub trait PsClient: Send + Sync {
    /// Registers a key with its server. Blocking; doubles as a rendezvous
    /// barrier with the server on first touch.
    fn register(&self, routed: RoutedKey, init: Bytes) -> Status;
    /// Pushes one partition. With `aggregate`, the server sums pushes from
    /// all leader ranks for the current round.
    fn push(&self, routed: RoutedKey, data: Bytes, dtype: DataType, aggregate: bool) -> Status;
    /// Pulls the current aggregate for a key; blocks until every leader's
    /// push for the round has landed.
    fn pull(&self, routed: RoutedKey, len: usize) -> Result<Bytes, CommError>;
    /// One-way transfer to a peer rank's receive path.
    fn send(&self, receiver: usize, key: u64, data: Bytes) -> Status;
    /// Requests `key` from a peer and blocks until the peer's response
    /// stage answers.
    fn pull_from(&self, target: usize, key: u64) -> Result<Bytes, CommError>;
    /// Answers an outstanding `pull_from` on the requester side.
    fn respond(&self, requester: usize, key: u64, data: Bytes) -> Status;
    /// Notifies a peer that its response has been consumed.
    fn ack(&self, target: usize, key: u64) -> Status;
    /// Initiates the cross-node exchange for one GDR partition; reduced
    /// data comes back through the delivery hook.
    fn gdr_exchange(&self, key: u64, data: Bytes, dtype: DataType) -> Status;
    /// Installs the receive-path hook for this rank.
    fn set_delivery(&self, delivery: Arc<dyn Delivery>);
    fn finalize(&self) -> Status;
}

/// Receive-path events surfaced by the PS client. Implemented by the
/// runtime; implementations must be brief (stash bytes, poke a table).
pub trait Delivery: Send + Sync {
    /// Data for `key` arrived (p2p send, push-mode alltoall, GDR result).
    fn on_receive(&self, key: u64, data: Bytes);
    /// A peer asked for `key` (pull-mode alltoall, allgather lanes).
    fn on_pull_request(&self, key: u64);
    /// A peer confirmed consumption of our response for `key`.
    fn on_ack(&self, key: u64);
}

/// Intra-node NCCL-equivalent ring reducer. Calls are rendezvous points:
/// every local rank participating in `key` must invoke the same operation.
pub trait IntraNodeReducer: Send + Sync {
    fn is_signal_root(&self) -> bool;
    fn group_size(&self) -> usize;
    /// Reduces the byte range across local ranks; the result is visible in
    /// the signal root's tensor.
    fn reduce(
        &self,
        key: u64,
        tensor: &Arc<dyn Tensor>,
        offset: usize,
        len: usize,
        dtype: DataType,
    ) -> Status;
    /// Broadcasts the signal root's byte range to all local ranks.
    fn broadcast(
        &self,
        key: u64,
        tensor: &Arc<dyn Tensor>,
        offset: usize,
        len: usize,
        dtype: DataType,
    ) -> Status;
    /// Gathers each local rank's input into every local rank's output at
    /// the caller-provided destination offset.
    fn allgather(
        &self,
        key: u64,
        input: &Arc<dyn Tensor>,
        output: &Arc<dyn Tensor>,
        dst_offset: usize,
        len: usize,
    ) -> Status;
}

/// CPU reduction kernels; data plane only, no policy.
pub trait CpuReducer: Send + Sync {
    fn sum(&self, dst: &mut [u8], src: &[u8], dtype: DataType) -> Status;
    fn scale(&self, buf: &mut [u8], dtype: DataType, factor: f64) -> Status;
}

/// Streams mirror the dedicated CUDA streams of the original; each is used
/// by exactly one stage worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyStream {
    D2H,
    H2D,
    AllgatherD2H,
    AllgatherH2D,
}

pub trait Copier: Send + Sync {
    fn d2h(
        &self,
        stream: CopyStream,
        src: &Arc<dyn Tensor>,
        src_offset: usize,
        dst: &SharedRegion,
        dst_offset: usize,
        len: usize,
    ) -> Status;
    fn h2d(
        &self,
        stream: CopyStream,
        src: &SharedRegion,
        src_offset: usize,
        dst: &Arc<dyn Tensor>,
        dst_offset: usize,
        len: usize,
    ) -> Status;
}

/// Named shared-memory segments; local ranks opening the same name get
/// aliased storage.
pub trait ShmAllocator: Send + Sync {
    fn open(&self, prefix: &str, key: u64, len: usize, create: bool)
        -> Result<SharedRegion, CommError>;
    /// One segment per PCIe switch for cross-switch merging.
    fn open_pcie(
        &self,
        prefix: &str,
        key: u64,
        len: usize,
        num_switches: usize,
    ) -> Result<Vec<SharedRegion>, CommError>;
}

pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Bytes;
    fn decompress(&self, data: &[u8], out: &mut [u8]) -> Status;
}

pub trait CompressorFactory: Send + Sync {
    fn create(
        &self,
        kwargs: &HashMap<String, String>,
        aligned_len: usize,
        dtype: DataType,
    ) -> Result<Arc<dyn Compressor>, CommError>;
}

/// Intra-node signal channel between local ranks (socket pair in the
/// original). Coordinate stages funnel readiness through it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoordSignal {
    ReduceReady,
    PcieReduceReady,
    PushReady,
    BcastReady,
    CpuReduceReady,
    CpuBcastReady,
    CpuBcastFinishReady,
    AllgatherReady,
    AllgatherBcastReady,
    CopyH2dReady,
    AllgatherCopyH2dReady,
    /// A node root announcing its allgather slice is staged for peers.
    AllgatherRespReady,
}

pub trait SignalHandler: Send + Sync {
    fn on_signal(&self, signal: CoordSignal, key: u64);
}

pub trait NodeComm: Send + Sync {
    /// Sends a readiness signal to the worker-local root.
    fn send_to_root(&self, signal: CoordSignal, key: u64) -> Status;
    /// Root-only: fans a signal out to all non-root local ranks.
    fn broadcast(&self, signal: CoordSignal, key: u64) -> Status;
    fn set_handler(&self, handler: Arc<dyn SignalHandler>);
    /// Init barrier: the root releases non-roots.
    fn barrier(&self) -> Status;
}

/// The full collaborator set handed to `Runtime::init`.
#[derive(Clone)]
pub struct Collaborators {
    pub ps: Arc<dyn PsClient>,
    pub reducer: Arc<dyn IntraNodeReducer>,
    pub cpu_reducer: Arc<dyn CpuReducer>,
    pub copier: Arc<dyn Copier>,
    pub shm: Arc<dyn ShmAllocator>,
    pub compressors: Arc<dyn CompressorFactory>,
    pub node_comm: Arc<dyn NodeComm>,
}
