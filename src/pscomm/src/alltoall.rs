//! Alltoall control: one request task plus up to `num_ranks` response
//! tasks per call, reconciled through a shared completion token and the
//! per-peer buffer bounds frozen at first use.

use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use bytes::Bytes;

use crate::context::CommContext;
use crate::dispatch::{self, StageKind};
use crate::key::{self, OpType};
use crate::ops::{completion_callback, record_err_callback, update_profile_window};
use crate::runtime::{Runtime, RuntimeShared};
use crate::status::{CommError, Status};
use crate::task::{Completion, Device, P2pExt, ReadyEvent, ReduceOp, Tensor, TensorTask};

pub struct AlltoallArgs {
    pub name: String,
    pub input: Option<Arc<dyn Tensor>>,
    pub group_inputs: Vec<Arc<dyn Tensor>>,
    pub output: Option<Arc<dyn Tensor>>,
    pub group_outputs: Vec<Arc<dyn Tensor>>,
    /// Receives per-peer element counts when the output size is unknown.
    pub size_output: Option<Arc<dyn Tensor>>,
    /// Cumulative element offsets, `num_ranks + 1` entries starting at 0.
    pub send_begin: Vec<usize>,
    pub recv_begin: Vec<usize>,
    pub priority: i32,
    pub version: i32,
    pub output_size_unknown: bool,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
}

fn validate_begin(list: &[usize], num_ranks: usize, what: &str, name: &str) -> Status {
    if list.len() != num_ranks + 1 {
        return Err(CommError::InvalidArgument(format!(
            "{}: {} must have {} entries, got {}",
            name,
            what,
            num_ranks + 1,
            list.len()
        )));
    }
    if list[0] != 0 {
        return Err(CommError::InvalidArgument(format!(
            "{}: {} must begin with 0",
            name, what
        )));
    }
    for i in 0..num_ranks {
        if list[i + 1] < list[i] {
            return Err(CommError::InvalidArgument(format!(
                "{}: invalid {}[{}]: negative split",
                name, what, i
            )));
        }
    }
    Ok(())
}

impl Runtime {
    pub fn alltoall(&self, args: AlltoallArgs) -> Result<u64, CommError> {
        self.check_ready()?;
        let shared = &self.shared;
        let config = &shared.config;
        if !config.joint {
            return Err(CommError::Precondition(
                "alltoall is only supported in joint mode".into(),
            ));
        }
        let num_ranks = config.size;
        let my_rank = config.rank;
        validate_begin(&args.send_begin, num_ranks, "send_begin", &args.name)?;
        if !args.output_size_unknown {
            validate_begin(&args.recv_begin, num_ranks, "recv_begin", &args.name)?;
        }

        let dtype = args
            .input
            .as_ref()
            .map(|t| t.dtype())
            .or_else(|| args.group_inputs.first().map(|t| t.dtype()))
            .ok_or_else(|| {
                CommError::InvalidArgument(format!("{}: alltoall without inputs", args.name))
            })?;
        let unit = dtype.size_of();
        if let Some(input) = &args.input {
            if args.send_begin[num_ranks] * unit != input.size() {
                return Err(CommError::InvalidArgument(format!(
                    "{}: split sum {} does not match input size {}",
                    args.name,
                    args.send_begin[num_ranks] * unit,
                    input.size()
                )));
            }
        }

        // rotate the session so back-to-back calls on one name do not
        // collide on keys
        let session = self.session_id(&args.name) % config.alltoall_session_size as u64;
        shared
            .registry
            .declare(&args.name, OpType::Alltoall, -1, session as i32)?;
        let session_name = format!("session_{}_{}", session, args.name);
        let ctx = shared.registry.lookup(&session_name)?;

        let use_pull = config.alltoall_use_pull && !args.output_size_unknown;
        let request_begin = if use_pull {
            &args.recv_begin
        } else {
            &args.send_begin
        };
        let resp_begin = if use_pull {
            &args.send_begin
        } else {
            &args.recv_begin
        };
        let empty: Vec<usize>;
        let resp_begin = if args.output_size_unknown && resp_begin.is_empty() {
            empty = vec![0; num_ranks + 1];
            &empty
        } else {
            resp_begin
        };

        let mut request_sizes = Vec::with_capacity(num_ranks);
        let mut resp_sizes = Vec::with_capacity(num_ranks);
        let mut num_ps_requests = 0;
        let mut resp_partnum = usize::from(args.output_size_unknown);
        for peer in 0..num_ranks {
            let request_size = unit * (request_begin[peer + 1] - request_begin[peer]);
            request_sizes.push(request_size);
            if peer != my_rank && (args.output_size_unknown || request_size != 0) {
                num_ps_requests += 1;
            }
            let resp_size = unit * (resp_begin[peer + 1] - resp_begin[peer]);
            resp_sizes.push(resp_size);
            if !args.output_size_unknown && resp_size != 0 {
                resp_partnum += 1;
            }
        }
        // without remote traffic the self chunk rides on the response task
        let request_partnum = usize::from(args.output_size_unknown || num_ps_requests > 0);
        let total = request_partnum + resp_partnum;

        let recv_on_gpu = args
            .output
            .as_ref()
            .map(|t| t.device())
            .or_else(|| args.group_outputs.first().map(|t| t.device()))
            .map_or(false, |d| !d.is_cpu());
        init_tensor_alltoall(
            shared,
            &ctx,
            &request_sizes,
            &resp_sizes,
            use_pull,
            recv_on_gpu,
        )?;

        // frozen bounds are enforced on every call after init
        ctx.with_state(|state| {
            for peer in 0..num_ranks {
                let bound = state.alltoall_bounds[peer] as usize;
                if request_sizes[peer] > bound || resp_sizes[peer] > bound {
                    return Err(CommError::InvalidArgument(format!(
                        "{}: alltoall size exceeds buffer bound for rank {} \
                         (request={} response={} bound={})",
                        ctx.name, peer, request_sizes[peer], resp_sizes[peer], bound
                    )));
                }
            }
            Ok(())
        })?;

        let step = ctx.next_step();
        update_profile_window(shared, &ctx, step);

        let (keys, peer_bufs) = ctx.with_state(|s| (s.keys.clone(), s.peer_bufs.clone()));
        let request_keys = &keys[..num_ranks];
        let resp_keys = &keys[num_ranks..];

        let handle = shared.handles.allocate();
        let callback = completion_callback(shared, &ctx, handle);
        record_err_callback(shared, keys[0], &callback);
        if total == 0 {
            (*callback)(Ok(()));
            return Ok(handle);
        }
        let completion = Completion::new(total as u32, callback);

        let request_q = dispatch::alltoall_request_stages(use_pull);
        let response_q = dispatch::alltoall_response_stages(
            use_pull,
            args.output_size_unknown,
            config.disable_p2p_ack,
        );

        let output_device = if recv_on_gpu {
            Device::Gpu(0)
        } else {
            Device::Cpu
        };
        let base = TensorTask {
            name: format!("{}_request", session_name),
            key: request_keys[my_rank],
            context: ctx.clone(),
            priority: args.priority,
            version: args.version,
            input: args.input.clone(),
            output: args.output.clone(),
            ready_event: args.ready_event.clone(),
            device: args
                .input
                .as_ref()
                .map_or(Device::Cpu, |t| t.device()),
            reduce_op: ReduceOp::Sum,
            offset: 0,
            len: 0,
            stage_list: request_q.iter().copied().collect(),
            completion,
            push_pull_counter: Arc::new(AtomicI32::new(0)),
            cpu_buf: None,
            gpu_buf: None,
            pcie_bufs: Vec::new(),
            numa_bufs: Vec::new(),
            compressor: None,
            compressed: None,
            p2p: Some(Box::new(P2pExt {
                key_list: request_keys.to_vec(),
                offset_list: request_begin.iter().map(|&b| b * unit).collect(),
                peer_bufs: peer_bufs.clone(),
                shape_list: Vec::new(),
                request_counter: Arc::new(AtomicI32::new(num_ps_requests as i32)),
                local_root_counter: Arc::new(AtomicI32::new(0)),
                aux_output: None,
                output_device,
                output_size_unknown: args.output_size_unknown,
                group_inputs: args.group_inputs.clone(),
                group_outputs: args.group_outputs.clone(),
            })),
        };

        if request_partnum > 0 {
            let task = Box::new(base.clone());
            shared.queue(request_q[0]).add_task(task);
        }

        if resp_partnum > 0 {
            let mut resp_base = base.clone();
            resp_base.stage_list = response_q.iter().copied().collect();
            {
                let ext = resp_base.p2p_mut();
                ext.key_list = resp_keys.to_vec();
                ext.offset_list = resp_begin.iter().map(|&b| b * unit).collect();
                ext.aux_output = args.size_output.clone();
            }
            if args.output_size_unknown {
                let group_key = key::alltoall_tensor_id(resp_keys[0]);
                let mut satisfied = shared.pending.expect_group(group_key, num_ranks - 1);
                // chunks from fast peers may have landed before the group
                // expectation existed
                for peer in 0..num_ranks {
                    if peer == my_rank {
                        continue;
                    }
                    if let Some(early) = shared.pending.take_data(resp_keys[peer]) {
                        satisfied |=
                            shared.pending.group_push(group_key, resp_keys[peer], early);
                    }
                }
                let mut task = resp_base.clone();
                task.name = format!("{}_resp", session_name);
                task.key = group_key;
                task.offset = request_begin[my_rank] * unit;
                task.len = request_sizes[my_rank];
                shared.queue(response_q[0]).add_task(Box::new(task));
                if satisfied {
                    shared.table_ready(
                        &shared.tables.p2p_group_copy,
                        StageKind::P2pGroupCopyH2D,
                        group_key,
                    );
                }
            } else {
                for peer in 0..num_ranks {
                    if resp_sizes[peer] == 0 {
                        continue;
                    }
                    let mut task = resp_base.clone();
                    task.name =
                        format!("{}_request_{}_resp_{}", session_name, peer, my_rank);
                    task.key = resp_keys[peer];
                    task.len = resp_sizes[peer];
                    task.offset = if !args.group_outputs.is_empty() {
                        0
                    } else {
                        task.p2p().offset_list[peer]
                    };
                    if peer == my_rank {
                        // local short-circuit: remember where the self
                        // chunk starts in the input
                        task.offset = request_begin[peer] * unit;
                        shared.queue(response_q[0]).add_task(Box::new(task));
                        let table = if use_pull {
                            &shared.tables.p2p_pull_response
                        } else {
                            &shared.tables.p2p_copy
                        };
                        shared.table_ready(table, response_q[0], resp_keys[peer]);
                    } else {
                        shared.queue(response_q[0]).add_task(Box::new(task));
                    }
                }
            }
        }
        log::trace!(
            "alltoall enqueued: {} rank={} request_partnum={} resp_partnum={} ps_requests={}",
            session_name,
            my_rank,
            request_partnum,
            resp_partnum,
            num_ps_requests
        );
        Ok(handle)
    }
}

/// First-use initialization: freezes per-peer buffer bounds, generates the
/// request/response key halves, and registers push-mode staging buffers.
fn init_tensor_alltoall(
    shared: &RuntimeShared,
    ctx: &Arc<CommContext>,
    request_sizes: &[usize],
    resp_sizes: &[usize],
    use_pull: bool,
    _recv_on_gpu: bool,
) -> Status {
    let config = &shared.config;
    let my_rank = config.rank;
    ctx.init_once(|state| {
        let floor = config.alltoall_buff_bytes as u32;
        let factor = config.alltoall_mem_factor;
        let mut bounds = Vec::with_capacity(request_sizes.len());
        for peer in 0..request_sizes.len() {
            let needed = request_sizes[peer].max(resp_sizes[peer]) as f64 * factor;
            bounds.push((needed as u32).max(floor));
        }
        log::debug!(
            "alltoall buffer bounds for {}: floor={} factor={} bounds={:?}",
            ctx.base_name,
            floor,
            factor,
            bounds
        );

        let declared = ctx.declared_id as u16;
        for _ in 0..request_sizes.len() {
            state.keys.push(key::encode_alltoall(declared, my_rank as u16));
        }
        for peer in 0..request_sizes.len() {
            state.keys.push(key::encode_alltoall(declared, peer as u16));
        }

        for peer in 0..request_sizes.len() {
            if use_pull {
                state.peer_bufs.push(None);
            } else {
                let buf = crate::buffer::SharedRegion::new(bounds[peer] as usize);
                if peer != my_rank {
                    let routed =
                        shared
                            .router
                            .route_to(state.keys[peer], bounds[peer] as usize, peer)?;
                    // blocking push doubles as the rendezvous barrier
                    shared
                        .collab
                        .ps
                        .register(routed, Bytes::from(vec![0u8; bounds[peer] as usize]))?;
                }
                state.peer_bufs.push(Some(buf));
            }
        }
        for _ in 0..resp_sizes.len() {
            state.peer_bufs.push(None);
        }
        state.alltoall_bounds = bounds;
        Ok(())
    })
}
