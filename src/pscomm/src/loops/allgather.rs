//! Processors for the allgather pipeline. Cross-node transfer runs as a
//! two-lane pull per peer node: the low half of a node's slice is served
//! by the node's local-rank-0, the high half by its signal root.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::collab::{CoordSignal, CopyStream};
use crate::dispatch::StageKind;
use crate::key;
use crate::runtime::RuntimeShared;
use crate::status::{CommError, Status};
use crate::task::{Tensor, TensorTask};

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

/// Byte range of one physical node's slice of the gathered output.
fn node_bounds(offset_list: &[usize], phy: usize, local_size: usize) -> (usize, usize) {
    let begin = offset_list[phy * local_size];
    let end = offset_list[(phy + 1) * local_size];
    (begin, end - begin)
}

/// Length of the worker-local-root lane's half, rounded down to elements.
fn low_half(len: usize, unit: usize) -> usize {
    len / 2 / unit * unit
}

fn read_tensor(tensor: &Arc<dyn Tensor>, offset: usize, len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    tensor.read_at(offset, &mut buf);
    Bytes::from(buf)
}

/// Announces that this node's slice is staged and peers may pull it.
fn publish_resp_ready(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let p2p = task.p2p();
    let my_phy = shared.config.phy_node_id;
    for (phy, lane_key) in p2p.key_list.iter().enumerate() {
        if phy == my_phy {
            continue;
        }
        shared.table_ready(
            &shared.tables.allgather_pull_resp,
            StageKind::AllgatherPullResp,
            *lane_key,
        );
        if shared.modes.local_rank0 {
            shared.table_ready(
                &shared.tables.allgather_wlr_resp,
                StageKind::AllgatherPullWorkerLocalRootResp,
                *lane_key,
            );
        }
        if shared.config.local_size > 1 {
            shared
                .collab
                .node_comm
                .broadcast(CoordSignal::AllgatherRespReady, *lane_key)?;
        }
    }
    Ok(())
}

pub(crate) fn allgather(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let p2p = task.p2p();
    let rank = shared.config.rank;
    let input = task
        .input
        .as_ref()
        .ok_or_else(|| CommError::Unknown(format!("{}: allgather without input", task.name)))?;
    let output = output_of(task)?;
    let dst_offset = p2p.offset_list[rank];
    let len = p2p.offset_list[rank + 1] - dst_offset;
    shared
        .collab
        .reducer
        .allgather(task.key, input, output, dst_offset, len)?;
    if shared.modes.multi_node && shared.modes.gdr_allgather && shared.modes.root_device {
        publish_resp_ready(shared, task)?;
    }
    Ok(())
}

pub(crate) fn copy_d2h(shared: &RuntimeShared, task: &TensorTask) -> Status {
    if !shared.modes.root_device {
        return Ok(());
    }
    let output = output_of(task)?;
    let cpu_buf = cpu_buf_of(task)?;
    let (begin, len) = node_bounds(
        &task.p2p().offset_list,
        shared.config.phy_node_id,
        shared.config.local_size,
    );
    shared
        .collab
        .copier
        .d2h(CopyStream::AllgatherD2H, output, begin, cpu_buf, begin, len)?;
    publish_resp_ready(shared, task)
}

fn pull_lane(
    shared: &RuntimeShared,
    task: &TensorTask,
    wlr_lane: bool,
) -> Status {
    let p2p = task.p2p();
    let config = &shared.config;
    let unit = task
        .input
        .as_ref()
        .map_or(4, |t| t.dtype().size_of());
    let counter = if wlr_lane {
        &p2p.local_root_counter
    } else {
        &p2p.request_counter
    };
    for phy in 0..config.num_phy_nodes {
        if phy == config.phy_node_id {
            continue;
        }
        let (begin, len) = node_bounds(&p2p.offset_list, phy, config.local_size);
        let low = low_half(len, unit);
        let (dst, _pull_len, responder_local, wire_key) = if wlr_lane {
            (begin, low, 0, task.key | 1)
        } else {
            (
                begin + low,
                len - low,
                config.effective_worker_local_root(),
                task.key,
            )
        };
        let target = phy * config.local_size + responder_local;
        let data = shared.collab.ps.pull_from(target, wire_key)?;
        if shared.modes.gdr_allgather {
            output_of(task)?.write_at(dst, &data);
        } else {
            cpu_buf_of(task)?.write_at(dst, &data);
        }
        if !config.disable_p2p_ack {
            shared.collab.ps.ack(target, wire_key)?;
        }
        counter.fetch_sub(1, Ordering::AcqRel);
    }
    Ok(())
}

pub(crate) fn pull_worker_local_root(shared: &RuntimeShared, task: &TensorTask) -> Status {
    pull_lane(shared, task, true)
}

pub(crate) fn pull(shared: &RuntimeShared, task: &TensorTask) -> Status {
    pull_lane(shared, task, false)
}

pub(crate) fn copy_h2d(shared: &RuntimeShared, task: &TensorTask) -> Status {
    if !shared.modes.root_device {
        return Ok(());
    }
    let output = output_of(task)?;
    let cpu_buf = cpu_buf_of(task)?;
    for phy in 0..shared.config.num_phy_nodes {
        if phy == shared.config.phy_node_id {
            continue;
        }
        let (begin, len) = node_bounds(&task.p2p().offset_list, phy, shared.config.local_size);
        shared
            .collab
            .copier
            .h2d(CopyStream::AllgatherH2D, cpu_buf, begin, output, begin, len)?;
    }
    if shared.config.local_size > 1 {
        shared
            .collab
            .node_comm
            .broadcast(CoordSignal::AllgatherCopyH2dReady, task.key)?;
    }
    Ok(())
}

pub(crate) fn bcast(shared: &RuntimeShared, task: &TensorTask) -> Status {
    let output = output_of(task)?;
    let total = *task.p2p().offset_list.last().unwrap_or(&0);
    shared
        .collab
        .reducer
        .broadcast(task.key, output, 0, total, output.dtype())
}

fn respond_lane(shared: &RuntimeShared, task: &TensorTask, wlr_lane: bool) -> Status {
    let config = &shared.config;
    let requester_phy = key::decode(task.key)
        .map(|parts| parts.sender as usize)
        .ok_or_else(|| CommError::Unknown(format!("{}: malformed key", task.name)))?;
    let unit = task
        .input
        .as_ref()
        .map_or(4, |t| t.dtype().size_of());
    let (begin, len) = node_bounds(
        &task.p2p().offset_list,
        config.phy_node_id,
        config.local_size,
    );
    let low = low_half(len, unit);
    let (src, resp_len, wire_key) = if wlr_lane {
        (begin, low, task.key | 1)
    } else {
        (begin + low, len - low, task.key)
    };
    let data = if shared.modes.gdr_allgather {
        read_tensor(output_of(task)?, src, resp_len)
    } else {
        cpu_buf_of(task)?.snapshot(src, resp_len)
    };
    // both pull lanes are issued by the peer node's worker-local root
    let requester = requester_phy * config.local_size + config.effective_worker_local_root();
    shared.collab.ps.respond(requester, wire_key, data)
}

pub(crate) fn worker_local_root_resp(shared: &RuntimeShared, task: &TensorTask) -> Status {
    respond_lane(shared, task, true)
}

pub(crate) fn pull_resp(shared: &RuntimeShared, task: &TensorTask) -> Status {
    respond_lane(shared, task, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_bounds_follow_offset_list() {
        // 2 nodes x 2 ranks, uneven rank sizes
        let offsets = vec![0, 8, 24, 40, 64];
        assert_eq!(node_bounds(&offsets, 0, 2), (0, 24));
        assert_eq!(node_bounds(&offsets, 1, 2), (24, 40));
    }

    #[test]
    fn low_half_is_element_aligned() {
        assert_eq!(low_half(40, 4), 20);
        assert_eq!(low_half(12, 8), 0);
        assert_eq!(low_half(0, 4), 0);
    }
}
