//! Harness for multi-rank tests: all ranks of an in-process cluster run in
//! scoped threads against one shared `LocalCluster` substrate.

use std::sync::Arc;

use pscomm::collab::local::LocalCluster;
use pscomm::{Config, Runtime};

/// Base config for `rank` in a cluster of `num_ranks` over `num_nodes`
/// physical nodes, joint mode.
#[allow(dead_code)]
pub fn cluster_config(rank: usize, num_ranks: usize, num_nodes: usize) -> Config {
    let local_size = num_ranks / num_nodes;
    Config {
        rank,
        local_rank: rank % local_size,
        size: num_ranks,
        local_size,
        worker_id: rank,
        phy_node_id: rank / local_size,
        num_phy_nodes: num_nodes,
        num_worker: num_ranks,
        num_server: num_ranks,
        joint: true,
        force_distributed: num_ranks > 1,
        // keep staging buffers small for in-process runs
        alltoall_buff_bytes: 4096,
        ..Config::default()
    }
}

/// Spawns one runtime per rank and runs `body` on each; shuts all ranks
/// down once every body returns.
#[allow(dead_code)]
pub fn run_cluster<C, B>(num_ranks: usize, num_nodes: usize, make_config: C, body: B)
where
    C: Fn(usize) -> Config + Send + Sync,
    B: Fn(usize, &Runtime) + Send + Sync,
{
    let cluster = Arc::new(LocalCluster::new(num_ranks, num_nodes));
    let make_config = &make_config;
    let body = &body;
    std::thread::scope(|scope| {
        for rank in 0..num_ranks {
            let cluster = cluster.clone();
            scope.spawn(move || {
                let runtime = Runtime::init(make_config(rank), cluster.collaborators(rank))
                    .expect("runtime init");
                body(rank, &runtime);
                runtime.shutdown();
            });
        }
    });
}
