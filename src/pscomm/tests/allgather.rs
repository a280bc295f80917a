mod common;

use std::sync::Arc;

use common::{cluster_config, run_cluster};
use pscomm::collab::local::{HeapTensor, LocalCluster};
use pscomm::{DataType, Device, Runtime};

#[test]
fn single_node_allgather() {
    run_cluster(2, 1, |rank| cluster_config(rank, 2, 1), |rank, runtime| {
        runtime.declare_allgather("gather", -1).unwrap();
        let input = HeapTensor::from_f32(&[rank as f32; 4], Device::Gpu(rank as i32));
        let output = HeapTensor::zeros(32, DataType::Float32, Device::Gpu(rank as i32));
        let handle = runtime
            .allgather(input, output.clone(), Vec::new(), "gather", 0, 0, None)
            .unwrap();
        runtime.wait(handle, false).unwrap();
        let mut expected = vec![0.0f32; 4];
        expected.extend(vec![1.0f32; 4]);
        assert_eq!(output.to_f32_vec(), expected);
    });
}

/// Four ranks over two physical nodes: roots pull peer-node slices over
/// the two lanes, then broadcast inside the node. Every rank ends with
/// the concatenation in rank order.
#[test]
fn two_node_allgather() {
    run_cluster(4, 2, |rank| cluster_config(rank, 4, 2), |rank, runtime| {
        runtime.declare_allgather("gather", -1).unwrap();
        let local = (rank % 2) as i32;
        let input = HeapTensor::from_f32(&[(rank * 10) as f32; 4], Device::Gpu(local));
        let output = HeapTensor::zeros(64, DataType::Float32, Device::Gpu(local));
        let handle = runtime
            .allgather(input, output.clone(), Vec::new(), "gather", 0, 0, None)
            .unwrap();
        runtime.wait(handle, false).unwrap();
        let mut expected = Vec::new();
        for r in 0..4 {
            expected.extend(vec![(r * 10) as f32; 4]);
        }
        assert_eq!(output.to_f32_vec(), expected, "rank {}", rank);
    });
}

/// Same exchange with the worker-local root moved off its default: the
/// pull lanes must follow `worker_local_root`, not the last local rank.
#[test]
fn two_node_allgather_with_non_default_root() {
    let cluster = Arc::new(LocalCluster::with_root(4, 2, 0));
    std::thread::scope(|scope| {
        for rank in 0..4usize {
            let cluster = cluster.clone();
            scope.spawn(move || {
                let mut config = cluster_config(rank, 4, 2);
                config.worker_local_root = 0;
                let runtime = Runtime::init(config, cluster.collaborators(rank))
                    .expect("runtime init");
                runtime.declare_allgather("gather_root0", -1).unwrap();
                let local = (rank % 2) as i32;
                let input = HeapTensor::from_f32(&[(rank * 10) as f32; 4], Device::Gpu(local));
                let output = HeapTensor::zeros(64, DataType::Float32, Device::Gpu(local));
                let handle = runtime
                    .allgather(input, output.clone(), Vec::new(), "gather_root0", 0, 0, None)
                    .unwrap();
                runtime.wait(handle, false).unwrap();
                let mut expected = Vec::new();
                for r in 0..4 {
                    expected.extend(vec![(r * 10) as f32; 4]);
                }
                assert_eq!(output.to_f32_vec(), expected, "rank {}", rank);
                runtime.shutdown();
            });
        }
    });
}

#[test]
fn uneven_allgather_with_shape_list() {
    run_cluster(2, 2, |rank| cluster_config(rank, 2, 2), |rank, runtime| {
        runtime.declare_allgather("gatherv", -1).unwrap();
        let sizes = [2usize, 6];
        let values: Vec<f32> = (0..sizes[rank]).map(|i| (rank * 100 + i) as f32).collect();
        let input = HeapTensor::from_f32(&values, Device::Gpu(0));
        let output = HeapTensor::zeros(32, DataType::Float32, Device::Gpu(0));
        let handle = runtime
            .allgather(
                input,
                output.clone(),
                sizes.to_vec(),
                "gatherv",
                0,
                0,
                None,
            )
            .unwrap();
        runtime.wait(handle, false).unwrap();
        let mut expected = Vec::new();
        for r in 0..2 {
            expected.extend((0..sizes[r]).map(|i| (r * 100 + i) as f32));
        }
        assert_eq!(output.to_f32_vec(), expected);
    });
}

#[test]
fn allgather_output_size_must_match() {
    run_cluster(1, 1, |rank| cluster_config(rank, 1, 1), |_, runtime| {
        runtime.declare_allgather("bad_gather", -1).unwrap();
        let input = HeapTensor::from_f32(&[1.0; 4], Device::Gpu(0));
        let output = HeapTensor::zeros(4, DataType::Float32, Device::Gpu(0));
        let err = runtime
            .allgather(input, output, Vec::new(), "bad_gather", 0, 0, None)
            .unwrap_err();
        assert!(matches!(err, pscomm::CommError::InvalidArgument(_)));
    });
}
