use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::buffer::SharedRegion;
use crate::collab::Compressor;
use crate::context::CommContext;
use crate::dispatch::StageKind;
use crate::status::{CommError, Status, StatusCallback};

/// Device id used for CPU tensors.
pub const CPU_DEVICE_ID: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(i32),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

// Order kept consistent with mshadow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Float32 = 0,
    Float64 = 1,
    Float16 = 2,
    Uint8 = 3,
    Int32 = 4,
    Int8 = 5,
    Int64 = 6,
    Uint16 = 7,
    Int16 = 8,
    Bool = 9,
}

impl DataType {
    pub fn size_of(&self) -> usize {
        match self {
            DataType::Uint8 | DataType::Int8 | DataType::Bool => 1,
            DataType::Float16 | DataType::Uint16 | DataType::Int16 => 2,
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float64 | DataType::Int64 => 8,
        }
    }
}

/// Alignment unit used when sizing shared buffers for a tensor.
pub fn align(size: usize, dtype: DataType) -> usize {
    let min_size = dtype.size_of() * dtype.size_of() * 8;
    size + (min_size - size % min_size) % min_size
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Average,
    Sum,
}

/// Framework tensor handle. Accessors copy through the byte range so that
/// fakes can back the tensor with plain heap storage.
pub trait Tensor: Send + Sync {
    fn dtype(&self) -> DataType;
    fn size(&self) -> usize;
    fn device(&self) -> Device;
    fn read_at(&self, offset: usize, dst: &mut [u8]);
    fn write_at(&self, offset: usize, src: &[u8]);
    /// Only used for output tensors whose size is discovered at runtime.
    fn resize(&self, new_size: usize);
}

/// Readiness signal for the task's input data. `None` on a task means the
/// data is ready immediately.
pub trait ReadyEvent: Send + Sync {
    fn ready(&self) -> bool;
}

/// Completion token shared by all partitions of one enqueue. The token
/// never references tasks, so task graphs stay acyclic.
pub struct Completion {
    total: u32,
    finished: AtomicU32,
    fired: AtomicBool,
    error: Mutex<Option<CommError>>,
    callback: StatusCallback,
}

impl Completion {
    pub fn new(total: u32, callback: StatusCallback) -> Arc<Self> {
        Arc::new(Completion {
            total,
            finished: AtomicU32::new(0),
            fired: AtomicBool::new(false),
            error: Mutex::new(None),
            callback,
        })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::Acquire)
    }

    /// First error wins; later ones are dropped here (and deduplicated again
    /// at the handle manager).
    pub fn record_error(&self, err: CommError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Marks one partition as done with the whole pipeline. Fires the user
    /// callback exactly once, when the last partition lands.
    pub fn finish_partition(&self) -> bool {
        let done = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(done <= self.total);
        if done == self.total {
            self.fire();
            true
        } else {
            false
        }
    }

    /// Immediate completion for enqueues that produced no tasks.
    pub fn fire_now(&self) {
        self.fire();
    }

    fn fire(&self) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let status: Status = match self.error.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            (*self.callback)(status);
        }
    }
}

/// Extension carried by alltoall, allgather and send/recv tasks.
#[derive(Clone)]
pub struct P2pExt {
    /// Per-peer keys (request half for request tasks, response half for
    /// response tasks).
    pub key_list: Vec<u64>,
    /// Cumulative byte offsets per peer; always begins with 0.
    pub offset_list: Vec<usize>,
    /// Per-peer aligned buffers, where the mode needs them.
    pub peer_bufs: Vec<Option<SharedRegion>>,
    /// Element counts per rank for allgatherv.
    pub shape_list: Vec<usize>,
    /// Outstanding remote sends or pulls.
    pub request_counter: Arc<AtomicI32>,
    /// Outstanding worker-local-root lane pulls (allgather only).
    pub local_root_counter: Arc<AtomicI32>,
    /// Shape/size output for unknown-size alltoall.
    pub aux_output: Option<Arc<dyn Tensor>>,
    pub output_device: Device,
    pub output_size_unknown: bool,
    pub group_inputs: Vec<Arc<dyn Tensor>>,
    pub group_outputs: Vec<Arc<dyn Tensor>>,
}

impl P2pExt {
    pub fn new() -> Self {
        P2pExt {
            key_list: Vec::new(),
            offset_list: Vec::new(),
            peer_bufs: Vec::new(),
            shape_list: Vec::new(),
            request_counter: Arc::new(AtomicI32::new(0)),
            local_root_counter: Arc::new(AtomicI32::new(0)),
            aux_output: None,
            output_device: Device::Cpu,
            output_size_unknown: false,
            group_inputs: Vec::new(),
            group_outputs: Vec::new(),
        }
    }
}

impl Default for P2pExt {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of work travelling through the stage pipeline. Partitions of
/// the same enqueue share the completion token and nothing else mutable.
#[derive(Clone)]
pub struct TensorTask {
    pub name: String,
    pub key: u64,
    pub context: Arc<CommContext>,
    pub priority: i32,
    pub version: i32,
    pub input: Option<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    pub device: Device,
    pub reduce_op: ReduceOp,
    /// Byte range of this partition within the logical tensor.
    pub offset: usize,
    pub len: usize,
    /// Remaining sub-pipeline, consumed front to back.
    pub stage_list: VecDeque<StageKind>,
    pub completion: Arc<Completion>,
    /// Cross-node phase countdown for one partition.
    pub push_pull_counter: Arc<AtomicI32>,
    pub cpu_buf: Option<SharedRegion>,
    pub gpu_buf: Option<SharedRegion>,
    pub pcie_bufs: Vec<SharedRegion>,
    pub numa_bufs: Vec<SharedRegion>,
    pub compressor: Option<Arc<dyn Compressor>>,
    /// Set by the compress stage, consumed by push.
    pub compressed: Option<Bytes>,
    pub p2p: Option<Box<P2pExt>>,
}

impl TensorTask {
    pub fn is_ready(&self) -> bool {
        self.ready_event.as_ref().map_or(true, |e| e.ready())
    }

    pub fn p2p(&self) -> &P2pExt {
        self.p2p.as_ref().expect("p2p extension missing")
    }

    pub fn p2p_mut(&mut self) -> &mut P2pExt {
        self.p2p.as_mut().expect("p2p extension missing")
    }

    /// Number of bytes this task's tensor spans (input preferred).
    pub fn tensor_size(&self) -> usize {
        self.input
            .as_ref()
            .or(self.output.as_ref())
            .map_or(0, |t| t.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn completion_fires_once_at_total() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let completion = Completion::new(
            3,
            Arc::new(move |status: Status| {
                assert!(status.is_ok());
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(!completion.finish_partition());
        assert!(!completion.finish_partition());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(completion.finish_partition());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // later fire attempts are ignored
        completion.fire_now();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_error_wins() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let completion = Completion::new(
            2,
            Arc::new(move |status: Status| {
                *sink.lock().unwrap() = Some(status);
            }),
        );
        completion.record_error(CommError::Aborted("first".into()));
        completion.record_error(CommError::Unknown("second".into()));
        completion.finish_partition();
        completion.finish_partition();
        let status = seen.lock().unwrap().take().unwrap();
        assert_eq!(status, Err(CommError::Aborted("first".into())));
    }

    #[test]
    fn align_rounds_to_dtype_unit() {
        assert_eq!(align(1, DataType::Float32), 128);
        assert_eq!(align(128, DataType::Float32), 128);
        assert_eq!(align(129, DataType::Float32), 256);
    }
}
