use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use crate::key::OpType;
use crate::task::TensorTask;

pub struct PartitionParams {
    /// Maximum partition length (already page aligned).
    pub bound: usize,
    pub num_phy_nodes: usize,
    pub skip_input_copy: bool,
}

/// Splits one logical enqueue into fixed-size partitions. All partitions
/// share the base task's completion token; each gets its own byte range,
/// a fresh cross-node counter, and its per-partition compressor/buffer.
pub fn partition_tensor(base: &TensorTask, params: &PartitionParams) -> Vec<TensorTask> {
    let size = base.tensor_size();
    let bound = params.bound;
    let mut partitions = Vec::new();
    let mut accumulated = 0usize;
    let mut index = 0usize;

    let (peer_bufs, compressors) = base
        .context
        .with_state(|s| (s.peer_bufs.clone(), s.compressors.clone()));

    while accumulated < size {
        let mut e = base.clone();
        e.name = format!("{}_{}", base.name, index);
        e.len = (size - accumulated).min(bound);
        e.offset = accumulated;
        if base.context.op_type != OpType::PushPull {
            // p2p partitions stage through their per-partition aligned
            // buffer, unless the input copy is skipped entirely
            if params.skip_input_copy && base.input.is_some() {
                e.cpu_buf = None;
            } else {
                e.cpu_buf = peer_bufs.get(index).cloned().flatten();
            }
        }
        e.compressor = compressors.get(index).cloned();
        e.push_pull_counter = Arc::new(AtomicI32::new(params.num_phy_nodes as i32 - 1));
        accumulated += e.len;
        index += 1;
        partitions.push(e);
    }
    debug_assert_eq!(accumulated, size);
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::local::HeapTensor;
    use crate::context::test_support::dummy_context;
    use crate::task::{Completion, DataType, Device, ReduceOp, Tensor};
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn base_task(size: usize) -> TensorTask {
        let tensor: Arc<dyn Tensor> = HeapTensor::zeros(size, DataType::Float32, Device::Cpu);
        TensorTask {
            name: "t".into(),
            key: 0,
            context: dummy_context(),
            priority: 0,
            version: 0,
            input: Some(tensor),
            output: None,
            ready_event: None,
            device: Device::Cpu,
            reduce_op: ReduceOp::Sum,
            offset: 0,
            len: 0,
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
        }
    }

    proptest! {
        #[test]
        fn partition_law(size in 1usize..4_000_000, bound_kb in 1usize..2048) {
            let bound = bound_kb * 1024;
            let params = PartitionParams {
                bound,
                num_phy_nodes: 2,
                skip_input_copy: false,
            };
            let parts = partition_tensor(&base_task(size), &params);
            prop_assert_eq!(parts.len(), (size + bound - 1) / bound);
            prop_assert_eq!(parts.iter().map(|p| p.len).sum::<usize>(), size);
            // ranges are contiguous and in order
            let mut expected_offset = 0;
            for p in &parts {
                prop_assert_eq!(p.offset, expected_offset);
                expected_offset += p.len;
            }
        }
    }

    #[test]
    fn partitions_share_completion_and_get_fresh_counters() {
        let params = PartitionParams {
            bound: 1024,
            num_phy_nodes: 3,
            skip_input_copy: false,
        };
        let parts = partition_tensor(&base_task(3000), &params);
        assert_eq!(parts.len(), 3);
        assert!(Arc::ptr_eq(&parts[0].completion, &parts[1].completion));
        assert!(!Arc::ptr_eq(
            &parts[0].push_pull_counter,
            &parts[1].push_pull_counter
        ));
        assert_eq!(
            parts[0]
                .push_pull_counter
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
        assert_eq!(parts[2].name, "t_2");
    }
}
