use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::SharedRegion;
use crate::collab::Compressor;
use crate::key::OpType;
use crate::status::{CommError, Status};

/// Everything a context caches once its first enqueue has initialized it.
#[derive(Default)]
pub struct ContextBuffers {
    /// One key per partition, or per peer, depending on the op type.
    pub keys: Vec<u64>,
    pub cpu_buf: Option<SharedRegion>,
    pub gpu_buf: Option<SharedRegion>,
    pub pcie_bufs: Vec<SharedRegion>,
    pub numa_bufs: Vec<SharedRegion>,
    /// Per-peer aligned buffers (alltoall push mode, p2p send side).
    pub peer_bufs: Vec<Option<SharedRegion>>,
    /// One compressor per partition; empty means no compression.
    pub compressors: Vec<Arc<dyn Compressor>>,
    /// Frozen per-peer push-buffer allotment (alltoall).
    pub alltoall_bounds: Vec<u32>,
}

/// Cached per-tensor state. Mutated only during the exactly-once init and
/// by the step counter used for the trace window.
pub struct CommContext {
    pub name: String,
    pub base_name: String,
    pub declared_id: i32,
    pub op_type: OpType,
    /// P2P only; -1 otherwise.
    pub sender: i32,
    pub receiver: i32,
    initialized: AtomicBool,
    state: Mutex<ContextBuffers>,
    pub kwargs: Mutex<HashMap<String, String>>,
    step_count: AtomicU64,
    profile_flag: AtomicBool,
}

impl CommContext {
    fn new(name: String, base_name: String, declared_id: i32, op_type: OpType) -> Arc<Self> {
        Arc::new(CommContext {
            name,
            base_name,
            declared_id,
            op_type,
            sender: -1,
            receiver: -1,
            initialized: AtomicBool::new(false),
            state: Mutex::new(ContextBuffers::default()),
            kwargs: Mutex::new(HashMap::new()),
            step_count: AtomicU64::new(0),
            profile_flag: AtomicBool::new(false),
        })
    }

    fn new_p2p(name: String, declared_id: i32, sender: i32, receiver: i32) -> Arc<Self> {
        Arc::new(CommContext {
            name: name.clone(),
            base_name: name,
            declared_id,
            op_type: OpType::P2p,
            sender,
            receiver,
            initialized: AtomicBool::new(false),
            state: Mutex::new(ContextBuffers::default()),
            kwargs: Mutex::new(HashMap::new()),
            step_count: AtomicU64::new(0),
            profile_flag: AtomicBool::new(false),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Runs the initialization side effects exactly once. Concurrent first
    /// touches serialize on the state mutex; losers observe `initialized`
    /// and return without side effects.
    pub fn init_once<F>(&self, f: F) -> Status
    where
        F: FnOnce(&mut ContextBuffers) -> Status,
    {
        let mut state = self.state.lock().unwrap();
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        f(&mut state)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&ContextBuffers) -> R) -> R {
        f(&self.state.lock().unwrap())
    }

    pub fn partition_count(&self) -> usize {
        self.with_state(|s| s.keys.len())
    }

    /// Bumps the per-context step counter; returns the step just entered.
    pub fn next_step(&self) -> u64 {
        self.step_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn step(&self) -> u64 {
        self.step_count.load(Ordering::Relaxed)
    }

    pub fn set_profiling(&self, on: bool) {
        self.profile_flag.store(on, Ordering::Relaxed);
    }

    pub fn profiling(&self) -> bool {
        self.profile_flag.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct DeclRecord {
    pub name: String,
    pub op_type: OpType,
}

struct RegistryInner {
    contexts: HashMap<String, Arc<CommContext>>,
    declared_order: Vec<DeclRecord>,
    next_ids: HashMap<OpType, i32>,
    used_ids: HashMap<OpType, HashSet<i32>>,
    p2p_next_ids: HashMap<u32, i32>,
    session_ids: HashMap<String, u64>,
    session_done: HashMap<String, u64>,
}

/// Name-to-context map with per-op-type id spaces. One mutex; every
/// operation is a brief map update.
pub struct ContextRegistry {
    inner: Mutex<RegistryInner>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        ContextRegistry {
            inner: Mutex::new(RegistryInner {
                contexts: HashMap::new(),
                declared_order: Vec::new(),
                next_ids: HashMap::new(),
                used_ids: HashMap::new(),
                p2p_next_ids: HashMap::new(),
                session_ids: HashMap::new(),
                session_done: HashMap::new(),
            }),
        }
    }

    /// Declares `name` under `op_type`, optionally with a caller-provided id
    /// and a session prefix. Idempotent on an identical name; the recorded
    /// declaration order is what `redeclare_all` replays on resume.
    pub fn declare(
        &self,
        name: &str,
        op_type: OpType,
        provided_id: i32,
        session: i32,
    ) -> Result<i32, CommError> {
        let effective = if session >= 0 {
            format!("session_{}_{}", session, name)
        } else {
            name.to_string()
        };
        let mut inner = self.inner.lock().unwrap();
        if let Some(ctx) = inner.contexts.get(&effective) {
            return Ok(ctx.declared_id);
        }
        inner.used_ids.entry(op_type).or_default();
        let id = if provided_id == -1 {
            let mut candidate = *inner.next_ids.entry(op_type).or_insert(0);
            while inner.used_ids[&op_type].contains(&candidate) {
                candidate += 1;
            }
            inner.next_ids.insert(op_type, candidate + 1);
            candidate
        } else {
            if inner.used_ids[&op_type].contains(&provided_id) {
                return Err(CommError::InvalidArgument(format!(
                    "declared id {} already used for op type {:?}",
                    provided_id, op_type
                )));
            }
            provided_id
        };
        inner.used_ids.get_mut(&op_type).unwrap().insert(id);
        let ctx = CommContext::new(effective.clone(), name.to_string(), id, op_type);
        inner.contexts.insert(effective.clone(), ctx);
        inner.declared_order.push(DeclRecord {
            name: effective.clone(),
            op_type,
        });
        log::debug!(
            "declared tensor {} id={} op={:?} session={}",
            effective,
            id,
            op_type,
            session
        );
        Ok(id)
    }

    /// P2P declarations draw ids from a per-(sender, receiver) space.
    pub fn declare_p2p(&self, name: &str, sender: i32, receiver: i32) -> Result<i32, CommError> {
        if sender == receiver {
            return Err(CommError::InvalidArgument(format!(
                "self send/recv is not supported (rank {})",
                sender
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(ctx) = inner.contexts.get(name) {
            return Ok(ctx.declared_id);
        }
        let pair = ((sender as u32) << 16) | (receiver as u32 & 0xffff);
        let next = inner.p2p_next_ids.entry(pair).or_insert(0);
        let id = *next;
        *next += 1;
        let ctx = CommContext::new_p2p(name.to_string(), id, sender, receiver);
        inner.contexts.insert(name.to_string(), ctx);
        inner.declared_order.push(DeclRecord {
            name: name.to_string(),
            op_type: OpType::P2p,
        });
        log::debug!(
            "declared p2p tensor {} id={} sender={} receiver={}",
            name,
            id,
            sender,
            receiver
        );
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<CommContext>, CommError> {
        self.inner
            .lock()
            .unwrap()
            .contexts
            .get(name)
            .cloned()
            .ok_or_else(|| {
                CommError::InvalidArgument(format!("tensor {} has not been declared", name))
            })
    }

    pub fn contexts(&self) -> Vec<Arc<CommContext>> {
        self.inner.lock().unwrap().contexts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The declaration record that survives suspend; fed back through
    /// `redeclare_all` on resume.
    pub fn declarations(&self) -> Vec<DeclRecord> {
        self.inner.lock().unwrap().declared_order.clone()
    }

    /// Replays recorded declarations in original order. Every declaration
    /// is re-applied as PUSH_PULL; non-push-pull records lose their op type
    /// in the process, which is logged rather than silently dropped.
    pub fn redeclare_all(&self, records: &[DeclRecord]) -> Status {
        for record in records {
            if record.op_type != OpType::PushPull {
                log::warn!(
                    "redeclaring {} as push_pull; original op type {:?} is dropped",
                    record.name,
                    record.op_type
                );
            }
            self.declare(&record.name, OpType::PushPull, -1, -1)?;
        }
        Ok(())
    }

    /// Rotating session counter for alltoall name disambiguation.
    pub fn session_id(&self, name: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.session_ids.entry(name.to_string()).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }

    pub fn mark_done(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        *inner.session_done.entry(name.to_string()).or_insert(0) += 1;
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_is_idempotent_and_assigns_fresh_ids() {
        let registry = ContextRegistry::new();
        let a = registry.declare("a", OpType::PushPull, -1, -1).unwrap();
        let b = registry.declare("b", OpType::PushPull, -1, -1).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.declare("a", OpType::PushPull, -1, -1).unwrap(), a);
    }

    #[test]
    fn id_spaces_are_per_op_type() {
        let registry = ContextRegistry::new();
        let pp = registry.declare("x", OpType::PushPull, -1, -1).unwrap();
        let ag = registry.declare("y", OpType::Allgather, -1, -1).unwrap();
        assert_eq!(pp, 0);
        assert_eq!(ag, 0);
    }

    #[test]
    fn provided_ids_are_verified_and_skipped() {
        let registry = ContextRegistry::new();
        assert_eq!(registry.declare("a", OpType::PushPull, 0, -1).unwrap(), 0);
        let err = registry.declare("b", OpType::PushPull, 0, -1).unwrap_err();
        assert!(matches!(err, CommError::InvalidArgument(_)));
        // auto-assignment skips the used id
        assert_eq!(registry.declare("c", OpType::PushPull, -1, -1).unwrap(), 1);
    }

    #[test]
    fn session_prefix_applies_to_effective_name() {
        let registry = ContextRegistry::new();
        registry.declare("t", OpType::Alltoall, -1, 3).unwrap();
        assert!(registry.lookup("session_3_t").is_ok());
        assert!(registry.lookup("t").is_err());
    }

    #[test]
    fn p2p_ids_are_per_pair() {
        let registry = ContextRegistry::new();
        assert_eq!(registry.declare_p2p("a", 0, 1).unwrap(), 0);
        assert_eq!(registry.declare_p2p("b", 0, 1).unwrap(), 1);
        assert_eq!(registry.declare_p2p("c", 1, 0).unwrap(), 0);
        assert!(registry.declare_p2p("d", 2, 2).is_err());
    }

    #[test]
    fn init_once_runs_exactly_once_under_contention() {
        use std::sync::atomic::AtomicUsize;

        let ctx = test_support::dummy_context();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            let runs = runs.clone();
            handles.push(std::thread::spawn(move || {
                ctx.init_once(|state| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    state.keys.push(42);
                    Ok(())
                })
                .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.partition_count(), 1);
    }

    #[test]
    fn redeclare_replays_in_order_as_push_pull() {
        let registry = ContextRegistry::new();
        registry.declare("a", OpType::Alltoall, -1, -1).unwrap();
        registry.declare("b", OpType::PushPull, -1, -1).unwrap();
        let records = registry.declarations();

        let resumed = ContextRegistry::new();
        resumed.redeclare_all(&records).unwrap();
        assert_eq!(resumed.lookup("a").unwrap().op_type, OpType::PushPull);
        assert_eq!(resumed.lookup("b").unwrap().op_type, OpType::PushPull);
    }
}
