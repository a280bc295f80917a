use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::dispatch::StageKind;
use crate::ready_table::ReadyTable;
use crate::task::TensorTask;

/// Wake-up period for readiness sources that do not notify the queue
/// directly (ready events signalled by the framework).
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Entry {
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    task: Box<TensorTask>,
}

struct QueueInner {
    // kept sorted: higher priority first, FIFO within a priority
    tasks: Vec<Entry>,
    seq: u64,
    credits: Option<i64>,
}

/// Priority-ordered task queue for one stage. A task is admitted only when
/// its ready event is signalled, the stage's gate table (if any) reports
/// its key ready, and the byte-credit budget (if any) still admits it.
pub struct ScheduledQueue {
    stage: StageKind,
    gate: Option<Arc<ReadyTable>>,
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl ScheduledQueue {
    pub fn new(stage: StageKind, gate: Option<Arc<ReadyTable>>, credit_bytes: Option<usize>) -> Self {
        ScheduledQueue {
            stage,
            gate,
            inner: Mutex::new(QueueInner {
                tasks: Vec::new(),
                seq: 0,
                credits: credit_bytes.map(|c| c as i64),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn gate(&self) -> Option<&Arc<ReadyTable>> {
        self.gate.as_ref()
    }

    pub fn add_task(&self, task: Box<TensorTask>) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        let entry = Entry {
            priority: task.priority,
            seq,
            enqueued_at: Instant::now(),
            task,
        };
        let pos = inner.tasks.partition_point(|e| {
            (e.priority, std::cmp::Reverse(e.seq)) >= (entry.priority, std::cmp::Reverse(entry.seq))
        });
        inner.tasks.insert(pos, entry);
        log::trace!("{}: task added, len={}", self.stage.as_ref(), inner.tasks.len());
        drop(inner);
        self.cond.notify_all();
    }

    /// Blocking dequeue. Returns `None` once `shutdown` is observed.
    pub fn get_task(&self, shutdown: &AtomicBool) -> Option<Box<TensorTask>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(idx) = self.find_admissible(&inner) {
                let entry = inner.tasks.remove(idx);
                if let Some(credits) = inner.credits.as_mut() {
                    *credits -= entry.task.len as i64;
                }
                return Some(entry.task);
            }
            let (guard, _timeout) = self.cond.wait_timeout(inner, POLL_INTERVAL).unwrap();
            inner = guard;
        }
    }

    fn find_admissible(&self, inner: &QueueInner) -> Option<usize> {
        for (idx, entry) in inner.tasks.iter().enumerate() {
            if !entry.task.is_ready() {
                continue;
            }
            // the budget may go negative on an oversized task; admission
            // only requires some credit left
            if let Some(credits) = inner.credits {
                if credits <= 0 {
                    continue;
                }
            }
            // the gate check consumes readiness, so it must come last
            if let Some(gate) = &self.gate {
                if !gate.is_ready(entry.task.key) {
                    continue;
                }
            }
            return Some(idx);
        }
        None
    }

    /// Returns bytes to the credit budget once a task has left the stage.
    pub fn release_credit(&self, len: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(credits) = inner.credits.as_mut() {
            *credits += len as i64;
            drop(inner);
            self.cond.notify_all();
        }
    }

    /// Wakes blocked workers after an external readiness change (gate table
    /// contribution, shutdown flag).
    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (task name, key, age) of pending entries, for the monitor loop.
    pub fn pending_tasks(&self) -> Vec<(String, u64, Duration)> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .iter()
            .map(|e| (e.task.name.clone(), e.task.key, e.enqueued_at.elapsed()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::dummy_context;
    use crate::task::Completion;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;

    fn task(name: &str, priority: i32) -> Box<TensorTask> {
        Box::new(TensorTask {
            name: name.to_string(),
            key: 1,
            context: dummy_context(),
            priority,
            version: 0,
            input: None,
            output: None,
            ready_event: None,
            device: crate::task::Device::Cpu,
            reduce_op: crate::task::ReduceOp::Sum,
            offset: 0,
            len: 64,
            stage_list: VecDeque::new(),
            completion: Completion::new(1, Arc::new(|_| {})),
            push_pull_counter: Arc::new(AtomicI32::new(0)),
            cpu_buf: None,
            gpu_buf: None,
            pcie_bufs: Vec::new(),
            numa_bufs: Vec::new(),
            compressor: None,
            compressed: None,
            p2p: None,
        })
    }

    #[test]
    fn priority_order_with_fifo_tie_break() {
        let queue = ScheduledQueue::new(StageKind::Push, None, None);
        let shutdown = AtomicBool::new(false);
        queue.add_task(task("low", 0));
        queue.add_task(task("high", 10));
        queue.add_task(task("tie_a", 5));
        queue.add_task(task("tie_b", 5));
        let order: Vec<String> = (0..4)
            .map(|_| queue.get_task(&shutdown).unwrap().name)
            .collect();
        assert_eq!(order, ["high", "tie_a", "tie_b", "low"]);
    }

    #[test]
    fn gate_blocks_until_ready() {
        let gate = Arc::new(ReadyTable::new(2, "TEST"));
        let queue = ScheduledQueue::new(StageKind::Reduce, Some(gate.clone()), None);
        let shutdown = Arc::new(AtomicBool::new(false));
        queue.add_task(task("gated", 0));
        let queue = Arc::new(queue);

        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || queue.get_task(&shutdown).map(|t| t.name))
        };
        gate.add_ready(1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        gate.add_ready(1);
        queue.notify();
        assert_eq!(waiter.join().unwrap().as_deref(), Some("gated"));
    }

    #[test]
    fn shutdown_unblocks_empty_queue() {
        let queue = Arc::new(ScheduledQueue::new(StageKind::Pull, None, None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || queue.get_task(&shutdown).is_none())
        };
        std::thread::sleep(Duration::from_millis(20));
        shutdown.store(true, Ordering::Release);
        queue.notify();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn credits_throttle_admission() {
        let queue = Arc::new(ScheduledQueue::new(StageKind::Push, None, Some(64)));
        let shutdown = Arc::new(AtomicBool::new(false));
        queue.add_task(task("first", 0));
        queue.add_task(task("second", 0));
        let first = queue.get_task(&shutdown).unwrap();
        assert_eq!(first.name, "first");
        // budget exhausted: the next dequeue stays blocked until credit
        // is returned
        let waiter = {
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || queue.get_task(&shutdown).map(|t| t.name))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        queue.release_credit(first.len);
        assert_eq!(waiter.join().unwrap().as_deref(), Some("second"));
    }
}
