//! Stage-list composition. Builders are pure: given the device, operation
//! and mode flags they return the full ordered sub-pipeline for a task.
//! All runtime variations (compression, coordinate stages, cross-switch
//! reduce) happen here, never by mutating a list in flight.

use strum::{AsRefStr, EnumCount, EnumIter};

use crate::task::Device;

/// One named step in a tensor's pipeline, backed by one worker and one
/// scheduled queue. Closed set; workers dispatch on the tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumCount, AsRefStr)]
pub enum StageKind {
    CoordinateReduce,
    Reduce,
    CopyD2H,
    PcieReduce,
    CoordinatePush,
    Compress,
    Push,
    Pull,
    GdrV1PushPull,
    GdrV2PushPull,
    GdrWaitPushPull,
    Decompress,
    CopyH2D,
    CoordinateBroadcast,
    Broadcast,
    Send,
    Recv,
    P2pGroupCopyH2D,
    P2pPull,
    P2pPullResponse,
    P2pWaitAck,
    CpuCopy,
    CpuReduce,
    CpuBcast,
    CpuBcastFinish,
    Allgather,
    CoordinateAllgather,
    AllgatherPull,
    AllgatherPullResp,
    AllgatherBcast,
    CoordinateAllgatherBcast,
    AllgatherPullAck,
    AllgatherCopyD2H,
    AllgatherCopyH2D,
    AllgatherPullWorkerLocalRoot,
    AllgatherPullWorkerLocalRootResp,
    AllgatherPullWorkerLocalRootAck,
}

impl StageKind {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Mode flags consumed by the builders, derived once from config and
/// topology at init.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineModes {
    pub distributed: bool,
    pub cross_pcie_switch: bool,
    /// This rank is the worker-local root of its node.
    pub root_device: bool,
    /// This rank is the signal root of the intra-node reducer.
    pub signal_root: bool,
    pub local_rank0: bool,
    pub multi_node: bool,
    pub gdr_allreduce: bool,
    pub gdr_gpu2gpu: bool,
    pub gdr_allgather: bool,
    pub alltoall_use_pull: bool,
    pub p2p_ack_disabled: bool,
}

fn push_stages_gpu(modes: &PipelineModes, out: &mut Vec<StageKind>) {
    if !modes.signal_root {
        out.push(StageKind::CoordinateReduce);
    }
    out.push(StageKind::Reduce);
    if modes.distributed || modes.cross_pcie_switch {
        out.push(StageKind::CopyD2H);
        if modes.cross_pcie_switch {
            out.push(StageKind::PcieReduce);
        }
        // In cross-switch mode PUSH runs as a dummy barrier.
        if modes.root_device {
            out.push(StageKind::Push);
        } else {
            out.push(StageKind::CoordinatePush);
        }
    }
}

fn pull_stages_gpu(modes: &PipelineModes, out: &mut Vec<StageKind>) {
    if modes.distributed && modes.root_device {
        out.push(StageKind::Pull);
    }
    if modes.distributed || modes.cross_pcie_switch {
        out.push(StageKind::CopyH2D);
    }
    if !modes.signal_root {
        out.push(StageKind::CoordinateBroadcast);
    }
    out.push(StageKind::Broadcast);
}

fn push_stages_cpu(modes: &PipelineModes, out: &mut Vec<StageKind>) {
    out.push(StageKind::CpuCopy);
    out.push(StageKind::CpuReduce);
    if (modes.distributed || modes.cross_pcie_switch) && modes.root_device {
        out.push(StageKind::Push);
    }
}

fn pull_stages_cpu(modes: &PipelineModes, out: &mut Vec<StageKind>) {
    if modes.distributed && modes.root_device {
        out.push(StageKind::Pull);
    }
    out.push(StageKind::CpuBcast);
    if modes.root_device {
        out.push(StageKind::CpuBcastFinish);
    }
}

fn push_stages_gdr(modes: &PipelineModes, out: &mut Vec<StageKind>) {
    if !modes.signal_root {
        out.push(StageKind::CoordinateReduce);
    }
    out.push(StageKind::Reduce);
    if modes.multi_node {
        if modes.gdr_gpu2gpu {
            out.push(StageKind::GdrV2PushPull);
        } else {
            out.push(StageKind::GdrV1PushPull);
        }
        out.push(StageKind::GdrWaitPushPull);
    }
}

fn pull_stages_gdr(modes: &PipelineModes, out: &mut Vec<StageKind>) {
    if modes.multi_node {
        if !modes.signal_root {
            out.push(StageKind::CoordinateBroadcast);
        }
        out.push(StageKind::Broadcast);
    }
}

/// The full push-pull sub-pipeline: push part followed by pull part, with
/// Compress/Decompress injected around Push/Pull on the root device when
/// the context carries compressors.
pub fn push_pull_stages(
    device: Device,
    modes: &PipelineModes,
    compression: bool,
) -> Vec<StageKind> {
    let mut list = Vec::new();
    match device {
        Device::Cpu => {
            push_stages_cpu(modes, &mut list);
            pull_stages_cpu(modes, &mut list);
        }
        Device::Gpu(_) if modes.gdr_allreduce => {
            push_stages_gdr(modes, &mut list);
            pull_stages_gdr(modes, &mut list);
        }
        Device::Gpu(_) => {
            push_stages_gpu(modes, &mut list);
            pull_stages_gpu(modes, &mut list);
        }
    }
    if compression && modes.root_device {
        if let Some(pos) = list.iter().position(|&s| s == StageKind::Push) {
            list.insert(pos, StageKind::Compress);
        }
        if let Some(pos) = list.iter().position(|&s| s == StageKind::Pull) {
            list.insert(pos + 1, StageKind::Decompress);
        }
    }
    list
}

pub fn send_stages() -> Vec<StageKind> {
    vec![StageKind::Send]
}

pub fn recv_stages() -> Vec<StageKind> {
    vec![StageKind::Recv]
}

pub fn alltoall_request_stages(use_pull: bool) -> Vec<StageKind> {
    if use_pull {
        vec![StageKind::P2pPull]
    } else {
        vec![StageKind::Send]
    }
}

pub fn alltoall_response_stages(
    use_pull: bool,
    output_size_unknown: bool,
    ack_disabled: bool,
) -> Vec<StageKind> {
    if use_pull {
        if ack_disabled {
            vec![StageKind::P2pPullResponse]
        } else {
            vec![StageKind::P2pPullResponse, StageKind::P2pWaitAck]
        }
    } else if output_size_unknown {
        vec![StageKind::P2pGroupCopyH2D]
    } else {
        vec![StageKind::Recv]
    }
}

pub fn allgather_request_stages(modes: &PipelineModes) -> Vec<StageKind> {
    let mut list = Vec::new();
    if !modes.signal_root {
        list.push(StageKind::CoordinateAllgather);
    }
    list.push(StageKind::Allgather);
    if modes.multi_node {
        if !modes.gdr_allgather {
            list.push(StageKind::AllgatherCopyD2H);
        }
        if modes.root_device {
            list.push(StageKind::AllgatherPullWorkerLocalRoot);
            list.push(StageKind::AllgatherPull);
        }
        if !modes.gdr_allgather {
            list.push(StageKind::AllgatherCopyH2D);
        }
        if !modes.signal_root {
            list.push(StageKind::CoordinateAllgatherBcast);
        }
        list.push(StageKind::AllgatherBcast);
    }
    list
}

pub fn allgather_response_stages(modes: &PipelineModes) -> Vec<StageKind> {
    let mut list = Vec::new();
    if modes.multi_node {
        if modes.local_rank0 {
            list.push(StageKind::AllgatherPullWorkerLocalRootResp);
            if !modes.p2p_ack_disabled {
                list.push(StageKind::AllgatherPullWorkerLocalRootAck);
            }
        }
        if modes.root_device {
            list.push(StageKind::AllgatherPullResp);
            if !modes.p2p_ack_disabled {
                list.push(StageKind::AllgatherPullAck);
            }
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use StageKind::*;

    fn dist_root_signal() -> PipelineModes {
        PipelineModes {
            distributed: true,
            root_device: true,
            signal_root: true,
            multi_node: true,
            ..Default::default()
        }
    }

    #[test]
    fn gpu_distributed_root_list() {
        let list = push_pull_stages(Device::Gpu(0), &dist_root_signal(), false);
        assert_eq!(
            list,
            vec![Reduce, CopyD2H, Push, Pull, CopyH2D, Broadcast]
        );
    }

    #[test]
    fn gpu_non_root_gets_coordinate_stages() {
        let modes = PipelineModes {
            distributed: true,
            root_device: false,
            signal_root: false,
            multi_node: true,
            ..Default::default()
        };
        let list = push_pull_stages(Device::Gpu(0), &modes, false);
        assert_eq!(
            list,
            vec![
                CoordinateReduce,
                Reduce,
                CopyD2H,
                CoordinatePush,
                CopyH2D,
                CoordinateBroadcast,
                Broadcast,
            ]
        );
    }

    #[test]
    fn compression_wraps_push_and_pull() {
        let list = push_pull_stages(Device::Gpu(0), &dist_root_signal(), true);
        assert_eq!(
            list,
            vec![Reduce, CopyD2H, Compress, Push, Pull, Decompress, CopyH2D, Broadcast]
        );
    }

    #[test]
    fn cross_pcie_inserts_pcie_reduce() {
        let modes = PipelineModes {
            cross_pcie_switch: true,
            root_device: true,
            signal_root: true,
            ..Default::default()
        };
        let list = push_pull_stages(Device::Gpu(0), &modes, false);
        assert_eq!(
            list,
            vec![Reduce, CopyD2H, PcieReduce, Push, CopyH2D, Broadcast]
        );
    }

    #[test]
    fn cpu_root_list() {
        let list = push_pull_stages(Device::Cpu, &dist_root_signal(), false);
        assert_eq!(
            list,
            vec![CpuCopy, CpuReduce, Push, Pull, CpuBcast, CpuBcastFinish]
        );
    }

    #[test]
    fn cpu_non_root_list() {
        let modes = PipelineModes {
            distributed: true,
            ..Default::default()
        };
        let list = push_pull_stages(Device::Cpu, &modes, false);
        assert_eq!(list, vec![CpuCopy, CpuReduce, CpuBcast]);
    }

    #[test]
    fn gdr_gpu2gpu_list() {
        let modes = PipelineModes {
            distributed: true,
            root_device: true,
            signal_root: true,
            multi_node: true,
            gdr_allreduce: true,
            gdr_gpu2gpu: true,
            ..Default::default()
        };
        let list = push_pull_stages(Device::Gpu(0), &modes, false);
        assert_eq!(
            list,
            vec![Reduce, GdrV2PushPull, GdrWaitPushPull, Broadcast]
        );
    }

    #[test]
    fn alltoall_lists() {
        assert_eq!(alltoall_request_stages(true), vec![P2pPull]);
        assert_eq!(alltoall_request_stages(false), vec![Send]);
        assert_eq!(
            alltoall_response_stages(true, false, false),
            vec![P2pPullResponse, P2pWaitAck]
        );
        assert_eq!(
            alltoall_response_stages(false, true, false),
            vec![P2pGroupCopyH2D]
        );
        assert_eq!(alltoall_response_stages(false, false, false), vec![Recv]);
    }

    #[test]
    fn allgather_root_request_list() {
        let modes = PipelineModes {
            distributed: true,
            root_device: true,
            signal_root: true,
            multi_node: true,
            ..Default::default()
        };
        let list = allgather_request_stages(&modes);
        assert_eq!(
            list,
            vec![
                Allgather,
                AllgatherCopyD2H,
                AllgatherPullWorkerLocalRoot,
                AllgatherPull,
                AllgatherCopyH2D,
                AllgatherBcast,
            ]
        );
    }

    #[test]
    fn allgather_response_lists_by_role() {
        let root = PipelineModes {
            multi_node: true,
            root_device: true,
            ..Default::default()
        };
        assert_eq!(
            allgather_response_stages(&root),
            vec![AllgatherPullResp, AllgatherPullAck]
        );
        let rank0 = PipelineModes {
            multi_node: true,
            local_rank0: true,
            p2p_ack_disabled: true,
            ..Default::default()
        };
        assert_eq!(
            allgather_response_stages(&rank0),
            vec![AllgatherPullWorkerLocalRootResp]
        );
    }
}
