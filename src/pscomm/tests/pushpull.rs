mod common;

use common::{cluster_config, run_cluster};
use pscomm::collab::local::HeapTensor;
use pscomm::{DataType, Device, ReduceOp};

#[test]
fn small_tensor_single_worker() {
    // force the distributed path so the single partition still walks
    // through Push and Pull
    let make_config = |rank| {
        let mut config = cluster_config(rank, 1, 1);
        config.force_distributed = true;
        config
    };
    run_cluster(1, 1, make_config, |_, runtime| {
        runtime.declare("grad", -1).unwrap();
        let input = HeapTensor::from_f32(&[1.0, 2.0, 3.0, 4.0], Device::Cpu);
        let output = HeapTensor::zeros(16, DataType::Float32, Device::Cpu);
        let handle = runtime
            .push_pull(input, output.clone(), "grad", ReduceOp::Average, 0, 0, None)
            .unwrap();
        runtime.wait(handle, false).unwrap();
        // a single worker averages to its own input
        assert_eq!(output.to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    });
}

#[test]
fn cpu_allreduce_averages_across_local_ranks() {
    run_cluster(4, 1, |rank| cluster_config(rank, 4, 1), |rank, runtime| {
        runtime.declare("grad", -1).unwrap();
        let input = HeapTensor::from_f32(&[rank as f32; 8], Device::Cpu);
        let output = HeapTensor::zeros(32, DataType::Float32, Device::Cpu);
        let handle = runtime
            .push_pull(input, output.clone(), "grad", ReduceOp::Average, 0, 0, None)
            .unwrap();
        runtime.wait(handle, false).unwrap();
        // (0 + 1 + 2 + 3) / 4
        assert_eq!(output.to_f32_vec(), vec![1.5; 8]);
    });
}

#[test]
fn cpu_allreduce_sum_keeps_totals() {
    run_cluster(2, 1, |rank| cluster_config(rank, 2, 1), |rank, runtime| {
        runtime.declare("grad_sum", -1).unwrap();
        let input = HeapTensor::from_f32(&[(rank + 1) as f32; 4], Device::Cpu);
        let output = HeapTensor::zeros(16, DataType::Float32, Device::Cpu);
        let handle = runtime
            .push_pull(input, output.clone(), "grad_sum", ReduceOp::Sum, 0, 0, None)
            .unwrap();
        runtime.wait(handle, false).unwrap();
        assert_eq!(output.to_f32_vec(), vec![3.0; 4]);
    });
}

#[test]
fn partitioned_tensor_completes_all_parts() {
    // 3,000,000 bytes against a 1,024,000-byte bound: three partitions
    // sharing one completion counter
    let make_config = |rank| {
        let mut config = cluster_config(rank, 1, 1);
        config.partition_bytes = 1_024_000;
        config.force_distributed = true;
        config
    };
    run_cluster(1, 1, make_config, |_, runtime| {
        runtime.declare("big_grad", -1).unwrap();
        let elements = 750_000;
        let input = HeapTensor::from_f32(&vec![0.5f32; elements], Device::Cpu);
        let output = HeapTensor::zeros(elements * 4, DataType::Float32, Device::Cpu);
        let handle = runtime
            .push_pull(input, output.clone(), "big_grad", ReduceOp::Sum, 0, 0, None)
            .unwrap();
        runtime.wait(handle, false).unwrap();
        let result = output.to_f32_vec();
        assert_eq!(result.len(), elements);
        assert!(result.iter().all(|&v| v == 0.5));
    });
}

#[test]
fn gpu_allreduce_with_coordinate_stages() {
    run_cluster(2, 1, |rank| cluster_config(rank, 2, 1), |rank, runtime| {
        runtime.declare("gpu_grad", -1).unwrap();
        let input = HeapTensor::from_f32(&[(rank * 10) as f32; 6], Device::Gpu(rank as i32));
        let output = HeapTensor::zeros(24, DataType::Float32, Device::Gpu(rank as i32));
        let handle = runtime
            .push_pull(input, output.clone(), "gpu_grad", ReduceOp::Average, 0, 0, None)
            .unwrap();
        runtime.wait(handle, false).unwrap();
        assert_eq!(output.to_f32_vec(), vec![5.0; 6]);
    });
}

#[test]
fn undeclared_tensor_is_invalid_argument() {
    run_cluster(1, 1, |rank| cluster_config(rank, 1, 1), |_, runtime| {
        let input = HeapTensor::from_f32(&[1.0], Device::Cpu);
        let output = HeapTensor::zeros(4, DataType::Float32, Device::Cpu);
        let err = runtime
            .push_pull(input, output, "nope", ReduceOp::Sum, 0, 0, None)
            .unwrap_err();
        assert!(matches!(err, pscomm::CommError::InvalidArgument(_)));
    });
}

#[test]
fn mismatched_output_size_is_rejected() {
    run_cluster(1, 1, |rank| cluster_config(rank, 1, 1), |_, runtime| {
        runtime.declare("grad_mismatch", -1).unwrap();
        let input = HeapTensor::from_f32(&[1.0, 2.0], Device::Cpu);
        let output = HeapTensor::zeros(4, DataType::Float32, Device::Cpu);
        let err = runtime
            .push_pull(input, output, "grad_mismatch", ReduceOp::Sum, 0, 0, None)
            .unwrap_err();
        assert!(matches!(err, pscomm::CommError::InvalidArgument(_)));
    });
}
