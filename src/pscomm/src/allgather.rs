//! Allgather control: one key per physical node; roots enqueue response
//! tasks serving the two pull lanes for every peer node.

use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use crate::context::CommContext;
use crate::dispatch;
use crate::key::{self, OpType};
use crate::ops::{completion_callback, record_err_callback, update_profile_window};
use crate::runtime::{Runtime, RuntimeShared};
use crate::status::{CommError, Status};
use crate::task::{align, Completion, P2pExt, ReadyEvent, ReduceOp, Tensor, TensorTask};

impl Runtime {
    /// Gathers every rank's input into each rank's output, in rank order.
    /// `shape_list` gives per-rank element counts for uneven gathers; empty
    /// means all ranks contribute `input`-sized slices.
    #[allow(clippy::too_many_arguments)]
    pub fn allgather(
        &self,
        input: Arc<dyn Tensor>,
        output: Arc<dyn Tensor>,
        shape_list: Vec<usize>,
        name: &str,
        version: i32,
        priority: i32,
        ready_event: Option<Arc<dyn ReadyEvent>>,
    ) -> Result<u64, CommError> {
        self.check_ready()?;
        let shared = &self.shared;
        let config = &shared.config;
        if !config.joint {
            return Err(CommError::Precondition(
                "allgather is only supported in joint mode".into(),
            ));
        }
        let ctx = shared.registry.lookup(name)?;
        if ctx.op_type != OpType::Allgather {
            return Err(CommError::InvalidArgument(format!(
                "{} was not declared as an allgather tensor",
                name
            )));
        }
        if input.size() == 0 {
            return Err(CommError::InvalidArgument(format!("{}: empty input", name)));
        }
        let unit = input.dtype().size_of();
        if !shape_list.is_empty() && shape_list.len() != config.size {
            return Err(CommError::InvalidArgument(format!(
                "{}: shape_list must have one entry per rank",
                name
            )));
        }
        if !shape_list.is_empty() && shape_list[config.rank] * unit != input.size() {
            return Err(CommError::InvalidArgument(format!(
                "{}: shape_list[{}] does not match the input size",
                name, config.rank
            )));
        }
        let mut offset_list = Vec::with_capacity(config.size + 1);
        offset_list.push(0usize);
        for rank in 0..config.size {
            let len = if shape_list.is_empty() {
                input.size()
            } else {
                shape_list[rank] * unit
            };
            offset_list.push(offset_list[rank] + len);
        }
        let total_bytes = *offset_list.last().unwrap();
        if output.size() != total_bytes {
            return Err(CommError::InvalidArgument(format!(
                "{}: output size {} does not match gathered size {}",
                name,
                output.size(),
                total_bytes
            )));
        }

        init_tensor_allgather(shared, &ctx, total_bytes, input.dtype())?;

        let step = ctx.next_step();
        update_profile_window(shared, &ctx, step);

        let num_phy = config.num_phy_nodes;
        let total = if shared.modes.distributed
            && (shared.modes.local_rank0 || shared.modes.root_device)
        {
            num_phy
        } else {
            1
        };

        let (keys, cpu_buf) = ctx.with_state(|s| (s.keys.clone(), s.cpu_buf.clone()));
        let handle = shared.handles.allocate();
        let callback = completion_callback(shared, &ctx, handle);
        record_err_callback(shared, keys[0], &callback);
        let completion = Completion::new(total as u32, callback);

        let request_q = dispatch::allgather_request_stages(&shared.modes);
        let response_q = dispatch::allgather_response_stages(&shared.modes);

        let base = TensorTask {
            name: ctx.name.clone(),
            key: keys[config.phy_node_id],
            context: ctx.clone(),
            priority,
            version,
            input: Some(input.clone()),
            output: Some(output.clone()),
            ready_event,
            device: input.device(),
            reduce_op: ReduceOp::Sum,
            offset: 0,
            len: input.size(),
            stage_list: request_q.iter().copied().collect(),
            completion,
            push_pull_counter: Arc::new(AtomicI32::new(0)),
            cpu_buf,
            gpu_buf: None,
            pcie_bufs: Vec::new(),
            numa_bufs: Vec::new(),
            compressor: None,
            compressed: None,
            p2p: Some(Box::new(P2pExt {
                key_list: keys.clone(),
                offset_list,
                peer_bufs: Vec::new(),
                shape_list,
                request_counter: Arc::new(AtomicI32::new(num_phy as i32 - 1)),
                local_root_counter: Arc::new(AtomicI32::new(num_phy as i32 - 1)),
                aux_output: None,
                output_device: output.device(),
                output_size_unknown: false,
                group_inputs: Vec::new(),
                group_outputs: Vec::new(),
            })),
        };

        if !request_q.is_empty() {
            shared.queue(request_q[0]).add_task(Box::new(base.clone()));
        }
        if !response_q.is_empty() && shared.modes.distributed {
            for phy in 0..num_phy {
                if phy == config.phy_node_id {
                    continue;
                }
                let mut task = base.clone();
                task.name = format!("{}_resp_{}", ctx.name, phy);
                task.key = keys[phy];
                task.stage_list = response_q.iter().copied().collect();
                shared.queue(response_q[0]).add_task(Box::new(task));
            }
        }
        log::trace!(
            "allgather enqueued: {} rank={} total_partnum={}",
            ctx.name,
            config.rank,
            total
        );
        Ok(handle)
    }
}

fn init_tensor_allgather(
    shared: &RuntimeShared,
    ctx: &Arc<CommContext>,
    output_bytes: usize,
    dtype: crate::task::DataType,
) -> Status {
    let config = &shared.config;
    ctx.init_once(|state| {
        for phy in 0..config.num_phy_nodes {
            state
                .keys
                .push(key::encode_allgather(phy as u16, ctx.declared_id as u16));
        }
        if !config.use_gdr_allgather {
            let aligned = align(output_bytes, dtype);
            state.cpu_buf = Some(shared.collab.shm.open(
                &format!("PSC_ShM_{}_", config.job_id),
                state.keys[0],
                aligned,
                true,
            )?);
        }
        log::debug!(
            "allgather init {}: {} node keys, gathered_len={}",
            ctx.name,
            config.num_phy_nodes,
            output_bytes
        );
        Ok(())
    })
}
