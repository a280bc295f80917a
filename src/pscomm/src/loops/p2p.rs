//! Processors for peer-to-peer send/recv and the alltoall request/response
//! stages (push mode, pull mode, and the unknown-size grouped copy).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::key::{self, OpType};
use crate::runtime::RuntimeShared;
use crate::status::{CommError, Status};
use crate::task::{Tensor, TensorTask};

fn read_tensor(tensor: &Arc<dyn Tensor>, offset: usize, len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    tensor.read_at(offset, &mut buf);
    Bytes::from(buf)
}

fn read_whole(tensor: &Arc<dyn Tensor>) -> Bytes {
    read_tensor(tensor, 0, tensor.size())
}

fn peer_size(offset_list: &[usize], peer: usize) -> usize {
    offset_list[peer + 1] - offset_list[peer]
}

pub(crate) fn send(shared: &RuntimeShared, task: &TensorTask) -> Status {
    match task.context.op_type {
        OpType::P2p => send_p2p(shared, task),
        OpType::Alltoall => send_alltoall_request(shared, task),
        other => Err(CommError::Unknown(format!(
            "{}: send stage does not handle {:?}",
            task.name, other
        ))),
    }
}

fn send_p2p(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let input = task
        .input
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: send without input", task.name)))?;
    let receiver = task.context.receiver;
    if receiver < 0 {
        return Err(CommError::InvalidArgument(format!(
            "{}: send without receiver",
            task.name
        )));
    }
    // stage through the aligned buffer unless the input copy is skipped
    let data = match &task.cpu_buf {
        Some(cpu_buf) => {
            let staged = read_tensor(input, task.offset, task.len);
            cpu_buf.write_at(0, &staged);
            cpu_buf.snapshot(0, task.len)
        }
        None => read_tensor(input, task.offset, task.len),
    };
    shared.collab.ps.send(receiver as usize, task.key, data)
}

fn send_alltoall_request(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let p2p = task.p2p();
    let my_rank = shared.config.rank;
    let num_ranks = p2p.key_list.len();
    for peer in 0..num_ranks {
        if peer == my_rank {
            continue;
        }
        let size = peer_size(&p2p.offset_list, peer);
        if size == 0 && !p2p.output_size_unknown {
            continue;
        }
        let data = if !p2p.group_inputs.is_empty() {
            read_whole(&p2p.group_inputs[peer])
        } else if size == 0 {
            Bytes::new()
        } else {
            let input = task.input.as_ref().ok_or_else(|| {
                CommError::Unknown(format!("{}: alltoall request without input", task.name))
            })?;
            read_tensor(input, p2p.offset_list[peer], size)
        };
        // push mode stages through the peer's aligned buffer
        let payload = match p2p.peer_bufs.get(peer).and_then(|b| b.as_ref()) {
            Some(staging) if !data.is_empty() => {
                staging.write_at(0, &data);
                staging.snapshot(0, data.len())
            }
            _ => data,
        };
        shared.collab.ps.send(peer, task.key, payload)?;
        p2p.request_counter.fetch_sub(1, Ordering::AcqRel);
    }
    Ok(())
}

pub(crate) fn recv(shared: &RuntimeShared, task: &TensorTask) -> Status {
    match task.context.op_type {
        OpType::P2p => recv_p2p(shared, task),
        OpType::Alltoall => recv_alltoall_response(shared, task),
        other => Err(CommError::Unknown(format!(
            "{}: recv stage does not handle {:?}",
            task.name, other
        ))),
    }
}

fn recv_p2p(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let output = task
        .output
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: recv without output", task.name)))?;
    let data = shared.pending.take_data(task.key).ok_or_else(|| {
        CommError::DataLoss(format!("{}: received payload missing", task.name))
    })?;
    output.write_at(task.offset, &data[..task.len.min(data.len())]);
    Ok(())
}

/// Push-mode alltoall response: copies one peer's chunk into the output.
/// The self peer short-circuits to a local copy from the input tensor.
fn recv_alltoall_response(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let p2p = task.p2p();
    let my_rank = shared.config.rank;
    let peer = key::decode(task.key)
        .map(|parts| parts.partition as usize)
        .ok_or_else(|| CommError::Unknown(format!("{}: malformed key", task.name)))?;
    let data = if peer == my_rank {
        if !p2p.group_inputs.is_empty() {
            read_whole(&p2p.group_inputs[peer])
        } else {
            let input = task.input.as_ref().ok_or_else(|| {
                CommError::Unknown(format!("{}: self copy without input", task.name))
            })?;
            read_tensor(input, task.offset, task.len)
        }
    } else {
        shared.pending.take_data(task.key).ok_or_else(|| {
            CommError::DataLoss(format!("{}: alltoall chunk missing", task.name))
        })?
    };
    if !p2p.group_outputs.is_empty() {
        p2p.group_outputs[peer].write_at(0, &data);
    } else {
        let output = task
            .output
            .as_ref()
            .ok_or_else(|| CommError::Unknown(format!("{}: response without output", task.name)))?;
        let dst = if peer == my_rank {
            p2p.offset_list[peer]
        } else {
            task.offset
        };
        output.write_at(dst, &data);
    }
    Ok(())
}

/// Pull-mode alltoall request: pulls this rank's chunks from every peer
/// with a non-empty contribution, then acks each response.
pub(crate) fn pull_request(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let p2p = task.p2p();
    let my_rank = shared.config.rank;
    let num_ranks = p2p.key_list.len();
    for peer in 0..num_ranks {
        if peer == my_rank {
            continue;
        }
        let size = peer_size(&p2p.offset_list, peer);
        if size == 0 {
            continue;
        }
        let data = shared.collab.ps.pull_from(peer, task.key)?;
        if !p2p.group_outputs.is_empty() {
            p2p.group_outputs[peer].write_at(0, &data);
        } else {
            let output = task.output.as_ref().ok_or_else(|| {
                CommError::Unknown(format!("{}: pull without output", task.name))
            })?;
            output.write_at(p2p.offset_list[peer], &data);
        }
        if !shared.config.disable_p2p_ack {
            shared.collab.ps.ack(peer, task.key)?;
        }
        p2p.request_counter.fetch_sub(1, Ordering::AcqRel);
    }
    Ok(())
}

/// Pull-mode alltoall response: answers the requester identified by the
/// task key with this rank's chunk for it.
pub(crate) fn pull_response(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let p2p = task.p2p();
    let my_rank = shared.config.rank;
    let requester = key::decode(task.key)
        .map(|parts| parts.partition as usize)
        .ok_or_else(|| CommError::Unknown(format!("{}: malformed key", task.name)))?;
    if requester == my_rank {
        // local short-circuit: input chunk straight into the output
        let data = if !p2p.group_inputs.is_empty() {
            read_whole(&p2p.group_inputs[requester])
        } else {
            let input = task.input.as_ref().ok_or_else(|| {
                CommError::Unknown(format!("{}: self copy without input", task.name))
            })?;
            read_tensor(input, p2p.offset_list[requester], task.len)
        };
        if !p2p.group_outputs.is_empty() {
            p2p.group_outputs[requester].write_at(0, &data);
        } else {
            let output = task.output.as_ref().ok_or_else(|| {
                CommError::Unknown(format!("{}: self copy without output", task.name))
            })?;
            output.write_at(task.offset, &data);
        }
        return Ok(());
    }
    let data = if !p2p.group_inputs.is_empty() {
        read_whole(&p2p.group_inputs[requester])
    } else {
        let input = task.input.as_ref().ok_or_else(|| {
            CommError::Unknown(format!("{}: response without input", task.name))
        })?;
        read_tensor(input, p2p.offset_list[requester], task.len)
    };
    shared.collab.ps.respond(requester, task.key, data)
}

pub(crate) fn wait_ack(_shared: &RuntimeShared, _task: &TensorTask) -> Status {
    Ok(())
}

/// Unknown-size alltoall: all peer chunks have arrived; size the outputs,
/// fill the auxiliary size tensor, and copy everything in rank order in
/// groups of the configured copy group size.
pub(crate) fn group_copy_h2d(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let p2p = task.p2p();
    let my_rank = shared.config.rank;
    let num_ranks = p2p.key_list.len();
    let unit = task
        .input
        .as_ref()
        .map(|t| t.dtype())
        .or_else(|| p2p.group_inputs.first().map(|t| t.dtype()))
        .map_or(4, |d| d.size_of());

    let parts = shared.pending.take_group(task.key);
    let mut chunks: Vec<Option<Bytes>> = vec![None; num_ranks];
    for (part_key, data) in parts {
        let Some(peer) = key::decode(part_key).map(|p| p.partition as usize) else {
            continue;
        };
        chunks[peer] = Some(data);
    }
    for (peer, chunk) in chunks.iter_mut().enumerate() {
        if peer != my_rank && chunk.is_none() {
            *chunk = shared.pending.take_data(p2p.key_list[peer]);
        }
    }
    // the self chunk never went through the transport
    chunks[my_rank] = Some(if !p2p.group_inputs.is_empty() {
        read_whole(&p2p.group_inputs[my_rank])
    } else {
        let input = task.input.as_ref().ok_or_else(|| {
            CommError::Unknown(format!("{}: group copy without input", task.name))
        })?;
        read_tensor(input, task.offset, task.len)
    });

    let sizes: Vec<usize> = chunks
        .iter()
        .map(|c| c.as_ref().map_or(0, |d| d.len()))
        .collect();
    let total: usize = sizes.iter().sum();

    if let Some(aux) = &p2p.aux_output {
        aux.resize(num_ranks * 4);
        for (peer, size) in sizes.iter().enumerate() {
            aux.write_at(peer * 4, &((size / unit) as i32).to_le_bytes());
        }
    }

    let group_size = shared.config.alltoall_copy_group_size.max(1);
    if !p2p.group_outputs.is_empty() {
        for batch in (0..num_ranks).collect::<Vec<_>>().chunks(group_size) {
            for &peer in batch {
                let out = &p2p.group_outputs[peer];
                out.resize(sizes[peer]);
                if let Some(data) = &chunks[peer] {
                    out.write_at(0, data);
                }
            }
            log::trace!("{}: grouped copy of {} outputs", task.name, batch.len());
        }
    } else {
        let output = task.output.as_ref().ok_or_else(|| {
            CommError::Unknown(format!("{}: group copy without output", task.name))
        })?;
        output.resize(total);
        let mut offset = 0usize;
        for batch in (0..num_ranks).collect::<Vec<_>>().chunks(group_size) {
            for &peer in batch {
                if let Some(data) = &chunks[peer] {
                    output.write_at(offset, data);
                    offset += data.len();
                }
            }
        }
    }
    Ok(())
}
