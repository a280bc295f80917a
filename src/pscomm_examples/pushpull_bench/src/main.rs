use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use structopt::StructOpt;

use chrono::Timelike;
use std::io::Write;

use pscomm::collab::local::{HeapTensor, LocalCluster};
use pscomm::{Config, Device, ReduceOp, Runtime};

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "pushpull_bench")]
struct Opts {
    /// Number of in-process ranks
    #[structopt(short, long, default_value = "4")]
    ranks: usize,
    /// Tensor size in f32 elements
    #[structopt(short, long, default_value = "1048576")]
    elements: usize,
    /// Iterations to run after warmup
    #[structopt(short, long, default_value = "20")]
    iters: usize,
}

fn rank_config(opts: &Opts, rank: usize) -> Config {
    Config {
        rank,
        local_rank: rank,
        size: opts.ranks,
        local_size: opts.ranks,
        worker_id: rank,
        num_worker: opts.ranks,
        num_server: opts.ranks.max(1),
        force_distributed: true,
        monitor_interval_secs: 0,
        ..Config::default()
    }
}

fn main() -> Result<()> {
    let opts = Opts::from_args();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let time = chrono::Local::now();
            writeln!(
                buf,
                "[{:02}:{:02}:{:02}.{:03} {} {}] {}",
                time.hour() % 24,
                time.minute(),
                time.second(),
                time.timestamp_subsec_millis(),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .init();

    let cluster = Arc::new(LocalCluster::new(opts.ranks, 1));
    let bytes = opts.elements * 4;
    log::info!(
        "pushpull bench: {} ranks, {} MiB per tensor, {} iters",
        opts.ranks,
        bytes as f64 / (1 << 20) as f64,
        opts.iters
    );

    std::thread::scope(|scope| {
        for rank in 0..opts.ranks {
            let cluster = cluster.clone();
            let opts = opts.clone();
            scope.spawn(move || {
                let runtime =
                    Runtime::init(rank_config(&opts, rank), cluster.collaborators(rank))
                        .expect("runtime init");
                runtime.declare("bench_grad", -1).expect("declare");

                let values = vec![rank as f32; opts.elements];
                let run_once = || {
                    let input = HeapTensor::from_f32(&values, Device::Cpu);
                    let output = HeapTensor::zeros(bytes, pscomm::DataType::Float32, Device::Cpu);
                    let handle = runtime
                        .push_pull(
                            input,
                            output.clone(),
                            "bench_grad",
                            ReduceOp::Average,
                            0,
                            0,
                            None,
                        )
                        .expect("enqueue");
                    runtime.wait(handle, false).expect("push_pull");
                    output
                };

                // warmup doubles as tensor init
                let output = run_once();
                let expected = (0..opts.ranks).sum::<usize>() as f32 / opts.ranks as f32;
                assert_eq!(output.to_f32_vec()[0], expected);

                let start = Instant::now();
                for _ in 0..opts.iters {
                    run_once();
                }
                let elapsed = start.elapsed();
                if rank == 0 {
                    let per_iter = elapsed / opts.iters as u32;
                    let gbps = bytes as f64 / per_iter.as_secs_f64() / 1e9;
                    log::info!("{:?} per all-reduce, {:.3} GB/s algorithm bandwidth", per_iter, gbps);
                }
                runtime.shutdown();
            });
        }
    });
    Ok(())
}
