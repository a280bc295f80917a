//! Processors for the push-pull (all-reduce) pipeline, both the GPU path
//! (ring reduce, host staging, PS push/pull, broadcast) and the pure-CPU
//! path, plus the GDR variants.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::collab::{CoordSignal, CopyStream};
use crate::runtime::RuntimeShared;
use crate::status::{CommError, Status};
use crate::task::{DataType, ReduceOp, Tensor, TensorTask};

fn input_of(task: &TensorTask) -> Result<&Arc<dyn Tensor>, CommError> {
    task.input
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: task has no input tensor", task.name)))
}

fn output_of(task: &TensorTask) -> Result<&Arc<dyn Tensor>, CommError> {
    task.output
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: task has no output tensor", task.name)))
}

fn cpu_buf_of(task: &TensorTask) -> Result<&crate::buffer::SharedRegion, CommError> {
    task.cpu_buf
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: task has no host buffer", task.name)))
}

fn dtype_of(task: &TensorTask) -> DataType {
    task.input
        .as_ref()
        .or(task.output.as_ref())
        .map_or(DataType::Float32, |t| t.dtype())
}

/// Non-root ranks announce readiness to the local root's table.
pub(crate) fn coordinate(
    shared: &RuntimeShared,
    task: &TensorTask,
    signal: CoordSignal,
) -> Status {
    shared.collab.node_comm.send_to_root(signal, task.key)
}

pub(crate) fn reduce(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let input = input_of(task)?;
    shared
        .collab
        .reducer
        .reduce(task.key, input, task.offset, task.len, dtype_of(task))
}

pub(crate) fn copy_d2h(shared: &RuntimeShared, task: &TensorTask) -> Status {
    if !shared.modes.root_device {
        return Ok(());
    }
    let input = input_of(task)?;
    let cpu_buf = cpu_buf_of(task)?;
    shared.collab.copier.d2h(
        CopyStream::D2H,
        input,
        task.offset,
        cpu_buf,
        task.offset,
        task.len,
    )
}

/// Merges the per-switch staging buffers into the final host buffer (the
/// last entry, aliased by `cpu_buf`).
pub(crate) fn pcie_reduce(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let cpu_buf = cpu_buf_of(task)?;
    let dtype = dtype_of(task);
    if task.pcie_bufs.len() < 2 {
        return Ok(());
    }
    for buf in &task.pcie_bufs[..task.pcie_bufs.len() - 1] {
        let contribution = buf.snapshot(task.offset, task.len);
        cpu_buf.with_mut(task.offset, task.len, |dst| {
            shared.collab.cpu_reducer.sum(dst, &contribution, dtype)
        })?;
    }
    Ok(())
}

pub(crate) fn compress(_shared: &RuntimeShared, task: &mut TensorTask) -> Status {
    let compressor = task
        .compressor
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: no compressor bound", task.name)))?;
    let raw = cpu_buf_of(task)?.snapshot(task.offset, task.len);
    task.compressed = Some(compressor.compress(&raw));
    Ok(())
}

pub(crate) fn push(shared: &RuntimeShared, task: &mut TensorTask) -> Status {
    if !shared.modes.distributed {
        // cross-switch mode reaches this stage as a dummy barrier
        return Ok(());
    }
    let data = match task.compressed.take() {
        Some(compressed) => compressed,
        None => cpu_buf_of(task)?.snapshot(task.offset, task.len),
    };
    let routed = shared.router.route(task.key, data.len());
    shared.collab.ps.push(routed, data, dtype_of(task), true)
}

pub(crate) fn pull(shared: &RuntimeShared, task: &mut TensorTask) -> Status {
    let routed = shared.router.route(task.key, task.len);
    let data = shared.collab.ps.pull(routed, task.len)?;
    if task.compressor.is_some() {
        task.compressed = Some(data);
    } else {
        cpu_buf_of(task)?.write_at(task.offset, &data);
    }
    Ok(())
}

pub(crate) fn decompress(_shared: &RuntimeShared, task: &mut TensorTask) -> Status {
    let compressor = task
        .compressor
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: no compressor bound", task.name)))?;
    let data = task
        .compressed
        .take()
        .ok_or_else(|| CommError::DataLoss(format!("{}: compressed payload missing", task.name)))?;
    cpu_buf_of(task)?.with_mut(task.offset, task.len, |out| compressor.decompress(&data, out))
}

pub(crate) fn copy_h2d(shared: &RuntimeShared, task: &TensorTask) -> Status {
    if !shared.modes.root_device {
        return Ok(());
    }
    let output = output_of(task)?;
    let cpu_buf = cpu_buf_of(task)?;
    shared.collab.copier.h2d(
        CopyStream::H2D,
        cpu_buf,
        task.offset,
        output,
        task.offset,
        task.len,
    )?;
    if shared.config.local_size > 1 {
        shared
            .collab
            .node_comm
            .broadcast(CoordSignal::CopyH2dReady, task.key)?;
    }
    Ok(())
}

pub(crate) fn broadcast(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let output = output_of(task)?;
    if shared.collab.reducer.is_signal_root() {
        // without a pull phase the reduced data still sits in the root's
        // input tensor
        if !shared.modes.distributed || shared.modes.gdr_allreduce {
            let input = input_of(task)?;
            let mut staging = vec![0u8; task.len];
            input.read_at(task.offset, &mut staging);
            output.write_at(task.offset, &staging);
        }
        if task.reduce_op == ReduceOp::Average && shared.config.size > 1 {
            let mut staging = vec![0u8; task.len];
            output.read_at(task.offset, &mut staging);
            shared.collab.cpu_reducer.scale(
                &mut staging,
                dtype_of(task),
                1.0 / shared.config.size as f64,
            )?;
            output.write_at(task.offset, &staging);
        }
    }
    shared
        .collab
        .reducer
        .broadcast(task.key, output, task.offset, task.len, dtype_of(task))
}

pub(crate) fn gdr_push_pull(shared: &RuntimeShared, task: &TensorTask) -> Status {
    if !shared.collab.reducer.is_signal_root() {
        return Ok(());
    }
    let input = input_of(task)?;
    let mut data = vec![0u8; task.len];
    input.read_at(task.offset, &mut data);
    shared
        .collab
        .ps
        .gdr_exchange(task.key, Bytes::from(data), dtype_of(task))?;
    if task.stage_list.len() == 1 {
        // small-tensor fast path has no wait stage behind it: block for
        // the reduced result here
        loop {
            if let Some(reduced) = shared.pending.take_data(task.key) {
                input.write_at(task.offset, &reduced);
                if let Some(table) = &shared.tables.gdr {
                    // consume the countdown the delivery hook added
                    table.is_ready(task.key);
                }
                task.push_pull_counter.store(0, Ordering::Release);
                return Ok(());
            }
            if shared.should_shutdown() {
                return Err(CommError::Aborted(format!(
                    "{}: shutdown during gdr exchange",
                    task.name
                )));
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }
    Ok(())
}

pub(crate) fn gdr_wait(shared: &RuntimeShared, task: &TensorTask) -> Status {
    if !shared.collab.reducer.is_signal_root() {
        return Ok(());
    }
    let reduced = shared.pending.take_data(task.key).ok_or_else(|| {
        CommError::DataLoss(format!("{}: reduced gdr payload missing", task.name))
    })?;
    input_of(task)?.write_at(task.offset, &reduced);
    task.push_pull_counter.store(0, Ordering::Release);
    Ok(())
}

pub(crate) fn cpu_copy(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let input = input_of(task)?;
    let my_buf = task
        .numa_bufs
        .get(shared.config.local_rank)
        .ok_or_else(|| CommError::Unknown(format!("{}: numa buffer missing", task.name)))?;
    let mut staging = vec![0u8; task.len];
    input.read_at(task.offset, &mut staging);
    my_buf.write_at(task.offset, &staging);
    Ok(())
}

pub(crate) fn cpu_reduce(shared: &RuntimeShared, task: &TensorTask) -> Status {
    if !shared.modes.root_device {
        shared
            .collab
            .node_comm
            .send_to_root(CoordSignal::CpuReduceReady, task.key)?;
        if shared.modes.distributed || shared.modes.cross_pcie_switch {
            // the root's push queue waits on every local rank
            shared
                .collab
                .node_comm
                .send_to_root(CoordSignal::PushReady, task.key)?;
        }
        return Ok(());
    }
    let root_local = shared.config.effective_worker_local_root();
    let dst = task
        .numa_bufs
        .get(root_local)
        .ok_or_else(|| CommError::Unknown(format!("{}: root numa buffer missing", task.name)))?;
    let dtype = dtype_of(task);
    for (local_rank, buf) in task.numa_bufs.iter().enumerate() {
        if local_rank == root_local {
            continue;
        }
        let contribution = buf.snapshot(task.offset, task.len);
        dst.with_mut(task.offset, task.len, |acc| {
            shared.collab.cpu_reducer.sum(acc, &contribution, dtype)
        })?;
    }
    Ok(())
}

pub(crate) fn cpu_bcast(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let root_local = shared.config.effective_worker_local_root();
    let root_buf = task
        .numa_bufs
        .get(root_local)
        .ok_or_else(|| CommError::Unknown(format!("{}: root numa buffer missing", task.name)))?;
    let output = output_of(task)?;
    if shared.modes.root_device {
        if task.reduce_op == ReduceOp::Average && shared.config.size > 1 {
            root_buf.with_mut(task.offset, task.len, |buf| {
                shared
                    .collab
                    .cpu_reducer
                    .scale(buf, dtype_of(task), 1.0 / shared.config.size as f64)
            })?;
        }
        if shared.config.local_size > 1 {
            shared
                .collab
                .node_comm
                .broadcast(CoordSignal::CpuBcastReady, task.key)?;
        }
        let data = root_buf.snapshot(task.offset, task.len);
        output.write_at(task.offset, &data);
        Ok(())
    } else {
        let data = root_buf.snapshot(task.offset, task.len);
        output.write_at(task.offset, &data);
        shared
            .collab
            .node_comm
            .send_to_root(CoordSignal::CpuBcastFinishReady, task.key)
    }
}

pub(crate) fn cpu_bcast_finish(_shared: &RuntimeShared, _task: &TensorTask) -> Status {
    Ok(())
}
