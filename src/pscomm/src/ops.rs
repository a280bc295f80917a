//! Public operations: declaration-checked enqueue paths that expand a user
//! call into partitioned tasks and feed the first stage queue, plus the
//! exactly-once tensor initialization against the PS substrate.

use std::sync::Arc;

use bytes::Bytes;

use crate::context::CommContext;
use crate::dispatch::{self, StageKind};
use crate::key::{self, OpType};
use crate::partition::{partition_tensor, PartitionParams};
use crate::runtime::{Runtime, RuntimeShared};
use crate::status::{CommError, Status, StatusCallback};
use crate::task::{align, Completion, Device, ReadyEvent, ReduceOp, Tensor, TensorTask};
use crate::trace::now_micros;

impl Runtime {
    pub(crate) fn check_ready(&self) -> Status {
        if !self.is_initialized() {
            return Err(crate::status::not_initialized());
        }
        if self.shared.should_shutdown() {
            return Err(CommError::Aborted("runtime is shutting down".into()));
        }
        Ok(())
    }

    /// All-reduce through the parameter server. Returns a handle to poll
    /// or wait on.
    #[allow(clippy::too_many_arguments)]
    pub fn push_pull(
        &self,
        input: Arc<dyn Tensor>,
        output: Arc<dyn Tensor>,
        name: &str,
        reduce_op: ReduceOp,
        version: i32,
        priority: i32,
        ready_event: Option<Arc<dyn ReadyEvent>>,
    ) -> Result<u64, CommError> {
        self.check_ready()?;
        let shared = &self.shared;
        let ctx = shared.registry.lookup(name)?;
        if ctx.op_type != OpType::PushPull {
            return Err(CommError::InvalidArgument(format!(
                "{} was declared as {:?}, not push_pull",
                name, ctx.op_type
            )));
        }
        if input.size() != output.size() {
            return Err(CommError::InvalidArgument(format!(
                "{}: output tensor size does not match input ({} vs {})",
                name,
                output.size(),
                input.size()
            )));
        }
        let size = input.size();
        if size == 0 {
            return Err(CommError::InvalidArgument(format!("{}: empty tensor", name)));
        }
        let device = input.device();
        init_tensor_push_pull(shared, &ctx, size, input.dtype(), device)?;

        let bound = shared.config.partition_bound();
        let total = ctx.partition_count();
        if total != (size + bound - 1) / bound {
            return Err(CommError::InvalidArgument(format!(
                "{}: partition count changed since init ({} vs {})",
                name,
                (size + bound - 1) / bound,
                total
            )));
        }

        let step = ctx.next_step();
        update_profile_window(shared, &ctx, step);

        let compression = ctx.with_state(|s| !s.compressors.is_empty());
        let stages = dispatch::push_pull_stages(device, &shared.modes, compression);
        let handle = shared.handles.allocate();
        let callback = completion_callback(shared, &ctx, handle);
        if stages.is_empty() {
            log::trace!("{}: no stages for this mode, completing in place", name);
            (*callback)(Ok(()));
            return Ok(handle);
        }

        let (keys, cpu_buf, pcie_bufs, numa_bufs) = ctx.with_state(|s| {
            (
                s.keys.clone(),
                s.cpu_buf.clone(),
                s.pcie_bufs.clone(),
                s.numa_bufs.clone(),
            )
        });
        record_err_callback(shared, keys[0], &callback);
        let base = TensorTask {
            name: ctx.name.clone(),
            key: 0,
            context: ctx.clone(),
            priority,
            version,
            input: Some(input),
            output: Some(output),
            ready_event,
            device,
            reduce_op,
            offset: 0,
            len: 0,
            stage_list: stages.iter().copied().collect(),
            completion: Completion::new(total as u32, callback),
            push_pull_counter: Arc::new(std::sync::atomic::AtomicI32::new(0)),
            cpu_buf,
            gpu_buf: None,
            pcie_bufs,
            numa_bufs,
            compressor: None,
            compressed: None,
            p2p: None,
        };
        let params = PartitionParams {
            bound,
            num_phy_nodes: shared.config.num_phy_nodes,
            skip_input_copy: shared.config.skip_input_copy,
        };
        for (index, mut task) in partition_tensor(&base, &params).into_iter().enumerate() {
            task.key = keys[index];
            reroute_small_gdr(shared, &mut task, device);
            log::trace!(
                "enqueue {}: key={} offset={} len={}",
                task.name,
                task.key,
                task.offset,
                task.len
            );
            let first = task.stage_list[0];
            shared.queue(first).add_task(Box::new(task));
        }
        Ok(handle)
    }

    /// Point-to-point send of a declared p2p tensor.
    pub fn send(
        &self,
        tensor: Arc<dyn Tensor>,
        name: &str,
        version: i32,
        priority: i32,
    ) -> Result<u64, CommError> {
        self.p2p_transfer(tensor, name, version, priority, true)
    }

    /// Point-to-point receive into a pre-allocated tensor.
    pub fn recv(
        &self,
        tensor: Arc<dyn Tensor>,
        name: &str,
        version: i32,
        priority: i32,
    ) -> Result<u64, CommError> {
        self.p2p_transfer(tensor, name, version, priority, false)
    }

    fn p2p_transfer(
        &self,
        tensor: Arc<dyn Tensor>,
        name: &str,
        version: i32,
        priority: i32,
        sending: bool,
    ) -> Result<u64, CommError> {
        self.check_ready()?;
        let shared = &self.shared;
        if !shared.config.joint {
            return Err(CommError::Precondition(
                "send/recv is only supported in joint mode".into(),
            ));
        }
        if shared.config.disable_p2p || shared.config.disable_send_recv {
            return Err(CommError::Precondition("send/recv is disabled".into()));
        }
        let ctx = shared.registry.lookup(name)?;
        if ctx.op_type != OpType::P2p {
            return Err(CommError::InvalidArgument(format!(
                "{} was not declared as a p2p tensor",
                name
            )));
        }
        let size = tensor.size();
        if size == 0 {
            return Err(CommError::InvalidArgument(format!("{}: empty tensor", name)));
        }
        let bound = shared.config.partition_bound();
        if ctx.is_initialized() && ctx.partition_count() != (size + bound - 1) / bound {
            return Err(CommError::InvalidArgument(format!(
                "{}: tensor grew past its initialized partition count",
                name
            )));
        }
        init_tensor_p2p(shared, &ctx, size, tensor.dtype(), sending)?;

        let step = ctx.next_step();
        update_profile_window(shared, &ctx, step);

        let stages = if sending {
            dispatch::send_stages()
        } else {
            dispatch::recv_stages()
        };
        let total = ctx.partition_count();
        let handle = shared.handles.allocate();
        let callback = completion_callback(shared, &ctx, handle);
        let keys = ctx.with_state(|s| s.keys.clone());
        record_err_callback(shared, keys[0], &callback);
        let base = TensorTask {
            name: ctx.name.clone(),
            key: 0,
            context: ctx.clone(),
            priority,
            version,
            input: sending.then(|| tensor.clone()),
            output: (!sending).then(|| tensor.clone()),
            ready_event: None,
            device: tensor.device(),
            reduce_op: ReduceOp::Sum,
            offset: 0,
            len: 0,
            stage_list: stages.iter().copied().collect(),
            completion: Completion::new(total as u32, callback),
            push_pull_counter: Arc::new(std::sync::atomic::AtomicI32::new(0)),
            cpu_buf: None,
            gpu_buf: None,
            pcie_bufs: Vec::new(),
            numa_bufs: Vec::new(),
            compressor: None,
            compressed: None,
            p2p: None,
        };
        let params = PartitionParams {
            bound,
            num_phy_nodes: shared.config.num_phy_nodes,
            skip_input_copy: shared.config.skip_input_copy,
        };
        for (index, mut task) in partition_tensor(&base, &params).into_iter().enumerate() {
            task.key = keys[index];
            let first = task.stage_list[0];
            shared.queue(first).add_task(Box::new(task));
        }
        Ok(handle)
    }

    pub fn session_size(&self) -> u32 {
        self.shared.config.alltoall_session_size
    }

    pub fn session_id(&self, name: &str) -> u64 {
        self.shared.registry.session_id(name)
    }

    pub fn mark_done(&self, name: &str) {
        self.shared.registry.mark_done(name);
    }

    /// Error-handler hook: on a PS transport failure for `key`, re-fires
    /// the callback recorded at enqueue time.
    pub fn handle_transport_error(&self, failed_key: u64, reason: &str) {
        if !self.shared.config.enable_err_handling {
            return;
        }
        let recorded = self
            .shared
            .err_callbacks
            .get(&failed_key)
            .map(|entry| entry.value().clone());
        if let Some(callback) = recorded {
            log::error!("transport error for key {}: {}", failed_key, reason);
            (*callback)(Err(CommError::Unknown(reason.to_string())));
        }
    }
}

/// Rewrites small GPU partitions onto the single-stage GDR fast path.
fn reroute_small_gdr(shared: &RuntimeShared, task: &mut TensorTask, device: Device) {
    let config = &shared.config;
    if !device.is_cpu()
        && shared.modes.multi_node
        && shared.modes.gdr_allreduce
        && shared.modes.gdr_gpu2gpu
        && task.len <= config.gdr_phase1_tensor_thresh
        && config.reduce_roots.is_empty()
    {
        task.stage_list.clear();
        task.stage_list.push_back(StageKind::GdrV2PushPull);
    }
}

pub(crate) fn completion_callback(
    shared: &Arc<RuntimeShared>,
    ctx: &Arc<CommContext>,
    handle: u64,
) -> StatusCallback {
    let handles = shared.handles.clone();
    let trace = shared.trace.clone();
    let profiling = ctx.profiling();
    let base_name = ctx.base_name.clone();
    let start_us = now_micros();
    Arc::new(move |status: Status| {
        if profiling {
            if let Some(trace) = &trace {
                trace.record_total(&base_name, start_us, now_micros().saturating_sub(start_us));
            }
        }
        handles.mark_done(handle, status);
    })
}

pub(crate) fn update_profile_window(shared: &RuntimeShared, ctx: &Arc<CommContext>, step: u64) {
    if !shared.config.trace_on {
        return;
    }
    if step == shared.config.trace_start_step {
        ctx.set_profiling(true);
    } else if step == shared.config.trace_end_step {
        ctx.set_profiling(false);
        if let Some(trace) = &shared.trace {
            trace.flush();
        }
    }
}

pub(crate) fn record_err_callback(shared: &RuntimeShared, first_key: u64, callback: &StatusCallback) {
    if shared.config.enable_err_handling {
        shared.err_callbacks.insert(first_key, callback.clone());
    }
}

fn init_tensor_push_pull(
    shared: &RuntimeShared,
    ctx: &Arc<CommContext>,
    size: usize,
    dtype: crate::task::DataType,
    device: Device,
) -> Status {
    let config = &shared.config;
    ctx.init_once(|state| {
        let bound = config.partition_bound();
        let mut keys = Vec::new();
        let mut accumulated = 0usize;
        while accumulated < size {
            keys.push(key::encode_push_pull(
                ctx.declared_id as u16,
                keys.len() as u16,
            ));
            accumulated += bound.min(size - accumulated);
        }
        log::debug!(
            "{} partitioned to {} part(s), total_len={}, key_range=[{}, {}]",
            ctx.name,
            keys.len(),
            size,
            keys.first().unwrap(),
            keys.last().unwrap()
        );

        let aligned = align(size, dtype);
        match device {
            Device::Cpu => {
                let root = config.effective_worker_local_root();
                for local in 0..config.local_size {
                    let prefix = if local == root {
                        format!("PSC_ShM_{}_", config.job_id)
                    } else {
                        format!("PSC_ShM_{}__Numa_{}_", config.job_id, local)
                    };
                    state
                        .numa_bufs
                        .push(shared.collab.shm.open(&prefix, keys[0], aligned, false)?);
                }
                state.cpu_buf = Some(state.numa_bufs[config.local_rank].clone());
            }
            Device::Gpu(_) if config.use_gdr_allreduce => {}
            Device::Gpu(_) => {
                if shared.modes.cross_pcie_switch {
                    let switches =
                        config.local_size / shared.collab.reducer.group_size().max(1);
                    state.pcie_bufs = shared.collab.shm.open_pcie(
                        &format!("PSC_Pcie_{}_", config.job_id),
                        keys[0],
                        aligned,
                        switches,
                    )?;
                    state.cpu_buf = state.pcie_bufs.last().cloned();
                } else {
                    state.cpu_buf = Some(shared.collab.shm.open(
                        &format!("PSC_ShM_{}_", config.job_id),
                        keys[0],
                        aligned,
                        true,
                    )?);
                }
            }
        }

        let should_init_push =
            shared.modes.root_device && (device.is_cpu() || !config.use_gdr_allreduce);
        if shared.modes.distributed && should_init_push {
            let mut accumulated = 0usize;
            for k in &keys {
                let len = bound.min(size - accumulated);
                let routed = shared.router.route(*k, len);
                // the blocking first push doubles as a rendezvous barrier
                shared
                    .collab
                    .ps
                    .register(routed, Bytes::from(vec![0u8; len]))?;
                accumulated += len;
            }
        }

        let kwargs = ctx.kwargs.lock().unwrap().clone();
        if shared.modes.root_device
            && !config.disable_compress
            && !kwargs.is_empty()
            && size >= config.min_compress_bytes
        {
            let mut accumulated = 0usize;
            for _ in &keys {
                let len = bound.min(size - accumulated);
                state.compressors.push(shared.collab.compressors.create(
                    &kwargs,
                    align(len, dtype),
                    dtype,
                )?);
                accumulated += len;
            }
        }

        state.keys = keys;
        Ok(())
    })
}

fn init_tensor_p2p(
    shared: &RuntimeShared,
    ctx: &Arc<CommContext>,
    size: usize,
    _dtype: crate::task::DataType,
    sending: bool,
) -> Status {
    let config = &shared.config;
    ctx.init_once(|state| {
        let bound = config.partition_bound();
        let sender = ctx.sender.max(0) as u16;
        let mut keys = Vec::new();
        let mut accumulated = 0usize;
        while accumulated < size {
            keys.push(key::encode_p2p(
                sender,
                ctx.declared_id as u16,
                keys.len() as u16,
            ));
            accumulated += bound.min(size - accumulated);
        }
        log::debug!(
            "{} partitioned to {} part(s), total_len={}, sender={}, receiver={}",
            ctx.name,
            keys.len(),
            size,
            ctx.sender,
            ctx.receiver
        );
        for k in &keys {
            if sending && ctx.sender != ctx.receiver && !config.skip_input_copy {
                let buf = crate::buffer::SharedRegion::new(bound);
                let routed =
                    shared
                        .router
                        .route_to(*k, bound, ctx.receiver.max(0) as usize)?;
                shared
                    .collab
                    .ps
                    .register(routed, Bytes::from(vec![0u8; bound.min(size)]))?;
                state.peer_bufs.push(Some(buf));
            } else {
                state.peer_bufs.push(None);
            }
        }
        state.keys = keys;
        Ok(())
    })
}
