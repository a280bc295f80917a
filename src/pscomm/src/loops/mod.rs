//! Stage workers. One long-lived thread per stage drains the stage's
//! scheduled queue, invokes the collaborator behind the stage, and either
//! hands the task to the next stage's queue or retires its partition on
//! the shared completion token.

pub(crate) mod allgather;
pub(crate) mod p2p;
pub(crate) mod pushpull;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::collab::CoordSignal;
use crate::dispatch::StageKind;
use crate::runtime::RuntimeShared;
use crate::status::Status;
use crate::task::TensorTask;
use crate::trace::now_micros;

pub(crate) fn worker_mainloop(shared: Arc<RuntimeShared>, stage: StageKind) {
    log::debug!(
        "{} loop started, local_rank={}",
        stage.as_ref(),
        shared.config.local_rank
    );
    loop {
        let Some(mut task) = shared.queue(stage).get_task(&shared.shutdown) else {
            break;
        };
        let start_us = now_micros();
        let started = Instant::now();
        let result = process(&shared, stage, &mut task);
        let dur_us = started.elapsed().as_micros() as u64;
        shared.queue(stage).release_credit(task.len);
        match result {
            Ok(()) => finish_stage(&shared, task, stage, start_us, dur_us),
            Err(err) => {
                log::error!(
                    "{} failed for {} (key {}): {}",
                    stage.as_ref(),
                    task.name,
                    task.key,
                    err
                );
                task.completion.record_error(err);
                task.completion.finish_partition();
            }
        }
    }
    shared.joined_threads.fetch_add(1, Ordering::AcqRel);
    log::debug!("{} loop joined", stage.as_ref());
}

fn finish_stage(
    shared: &RuntimeShared,
    mut task: Box<TensorTask>,
    stage: StageKind,
    start_us: u64,
    dur_us: u64,
) {
    let popped = task.stage_list.pop_front();
    debug_assert_eq!(popped, Some(stage));
    if task.context.profiling() {
        if let Some(trace) = &shared.trace {
            trace.record_stage(
                &task.context.base_name,
                stage.as_ref(),
                task.key,
                start_us,
                dur_us,
            );
        }
    }
    if let Some(sample) = shared.config.debug_sample_tensor {
        if sample == task.key {
            log::info!(
                "sampled key {}: finished {} offset={} len={} in {}us",
                task.key,
                stage.as_ref(),
                task.offset,
                task.len,
                dur_us
            );
        }
    }
    match task.stage_list.front() {
        Some(&next) => shared.queue(next).add_task(task),
        None => {
            task.completion.finish_partition();
        }
    }
}

fn process(shared: &RuntimeShared, stage: StageKind, task: &mut TensorTask) -> Status {
    use StageKind::*;
    match stage {
        CoordinateReduce => pushpull::coordinate(shared, task, CoordSignal::ReduceReady),
        CoordinatePush => pushpull::coordinate(shared, task, CoordSignal::PushReady),
        CoordinateBroadcast => pushpull::coordinate(shared, task, CoordSignal::BcastReady),
        CoordinateAllgather => pushpull::coordinate(shared, task, CoordSignal::AllgatherReady),
        CoordinateAllgatherBcast => {
            pushpull::coordinate(shared, task, CoordSignal::AllgatherBcastReady)
        }
        Reduce => pushpull::reduce(shared, task),
        CopyD2H => pushpull::copy_d2h(shared, task),
        PcieReduce => pushpull::pcie_reduce(shared, task),
        Compress => pushpull::compress(shared, task),
        Push => pushpull::push(shared, task),
        Pull => pushpull::pull(shared, task),
        Decompress => pushpull::decompress(shared, task),
        CopyH2D => pushpull::copy_h2d(shared, task),
        Broadcast => pushpull::broadcast(shared, task),
        GdrV1PushPull | GdrV2PushPull => pushpull::gdr_push_pull(shared, task),
        GdrWaitPushPull => pushpull::gdr_wait(shared, task),
        CpuCopy => pushpull::cpu_copy(shared, task),
        CpuReduce => pushpull::cpu_reduce(shared, task),
        CpuBcast => pushpull::cpu_bcast(shared, task),
        CpuBcastFinish => pushpull::cpu_bcast_finish(shared, task),
        Send => p2p::send(shared, task),
        Recv => p2p::recv(shared, task),
        P2pPull => p2p::pull_request(shared, task),
        P2pPullResponse => p2p::pull_response(shared, task),
        P2pWaitAck => p2p::wait_ack(shared, task),
        P2pGroupCopyH2D => p2p::group_copy_h2d(shared, task),
        Allgather => allgather::allgather(shared, task),
        AllgatherCopyD2H => allgather::copy_d2h(shared, task),
        AllgatherPullWorkerLocalRoot => allgather::pull_worker_local_root(shared, task),
        AllgatherPull => allgather::pull(shared, task),
        AllgatherCopyH2D => allgather::copy_h2d(shared, task),
        AllgatherBcast => allgather::bcast(shared, task),
        AllgatherPullWorkerLocalRootResp => allgather::worker_local_root_resp(shared, task),
        AllgatherPullResp => allgather::pull_resp(shared, task),
        AllgatherPullAck | AllgatherPullWorkerLocalRootAck => Ok(()),
    }
}
