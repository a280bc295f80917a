mod common;

use std::sync::Arc;

use common::{cluster_config, run_cluster};
use pscomm::collab::local::HeapTensor;
use pscomm::{AlltoallArgs, DataType, Device, Tensor};

fn f32_tensor(values: &[f32]) -> Arc<HeapTensor> {
    HeapTensor::from_f32(values, Device::Cpu)
}

fn begins_to_args(
    name: &str,
    input: Arc<HeapTensor>,
    output: Arc<HeapTensor>,
    send_begin: Vec<usize>,
    recv_begin: Vec<usize>,
) -> AlltoallArgs {
    AlltoallArgs {
        name: name.to_string(),
        input: Some(input),
        group_inputs: Vec::new(),
        output: Some(output),
        group_outputs: Vec::new(),
        size_output: None,
        send_begin,
        recv_begin,
        priority: 0,
        version: 0,
        output_size_unknown: false,
        ready_event: None,
    }
}

/// Uneven exchange across four ranks. Rank 0 uses the begin lists from the
/// reference scenario: send sizes [2,0,3,1], recv sizes [1,2,0,3]; the
/// self chunk is one element read at input offset 0.
#[test]
fn uneven_exchange_four_ranks() {
    let send_begins: [Vec<usize>; 4] = [
        vec![0, 2, 2, 5, 6],
        vec![0, 2, 3, 4, 5],
        vec![0, 0, 1, 2, 3],
        vec![0, 3, 4, 5, 6],
    ];
    let recv_begins: [Vec<usize>; 4] = [
        vec![0, 1, 3, 3, 6],
        vec![0, 0, 1, 2, 3],
        vec![0, 3, 4, 5, 6],
        vec![0, 1, 2, 3, 4],
    ];
    run_cluster(4, 4, |rank| cluster_config(rank, 4, 4), move |rank, runtime| {
        let send_begin = send_begins[rank].clone();
        let recv_begin = recv_begins[rank].clone();
        let send_total = *send_begin.last().unwrap();
        let recv_total = *recv_begin.last().unwrap();
        // element value encodes (sender, position)
        let values: Vec<f32> = (0..send_total)
            .map(|i| (rank * 100 + i) as f32)
            .collect();
        let input = f32_tensor(&values);
        let output = HeapTensor::zeros(recv_total * 4, DataType::Float32, Device::Cpu);
        let handle = runtime
            .alltoall(begins_to_args(
                "shuffle",
                input,
                output.clone(),
                send_begin.clone(),
                recv_begin.clone(),
            ))
            .unwrap();
        runtime.wait(handle, false).unwrap();

        let result = output.to_f32_vec();
        for peer in 0..4usize {
            let dst = recv_begin[peer]..recv_begin[peer + 1];
            let expected: Vec<f32> = if peer == rank {
                // local short-circuit copies from the send-side offset
                let src = send_begins[rank][rank];
                (0..dst.len()).map(|i| (rank * 100 + src + i) as f32).collect()
            } else {
                let src = send_begins[peer][rank];
                (0..dst.len()).map(|i| (peer * 100 + src + i) as f32).collect()
            };
            assert_eq!(
                &result[dst.clone()],
                expected.as_slice(),
                "rank {} chunk from {}",
                rank,
                peer
            );
        }
    });
}

/// After the first call freezes per-peer bounds at max(sizes) * factor, a
/// larger follow-up call must be rejected.
#[test]
fn frozen_bounds_reject_oversized_calls() {
    let make_config = |rank| {
        let mut config = cluster_config(rank, 4, 4);
        config.alltoall_buff_bytes = 8;
        config.alltoall_mem_factor = 1.5;
        config.alltoall_session_size = 1;
        config
    };
    run_cluster(4, 4, make_config, |_, runtime| {
        // 25 elements x 4 bytes = 100 bytes per peer; bound = 150
        let even: Vec<usize> = (0..=4).map(|i| i * 25).collect();
        let input = f32_tensor(&vec![1.0; 100]);
        let output = HeapTensor::zeros(400, DataType::Float32, Device::Cpu);
        let handle = runtime
            .alltoall(begins_to_args(
                "bounded",
                input,
                output,
                even.clone(),
                even.clone(),
            ))
            .unwrap();
        runtime.wait(handle, false).unwrap();

        // 50 elements = 200 bytes per peer exceeds the frozen bound of 150
        let big: Vec<usize> = (0..=4).map(|i| i * 50).collect();
        let input = f32_tensor(&vec![1.0; 200]);
        let output = HeapTensor::zeros(800, DataType::Float32, Device::Cpu);
        let err = runtime
            .alltoall(begins_to_args("bounded", input, output, big.clone(), big))
            .unwrap_err();
        assert!(matches!(err, pscomm::CommError::InvalidArgument(_)));
    });
}

#[test]
fn pull_mode_exchange() {
    let make_config = |rank| {
        let mut config = cluster_config(rank, 2, 2);
        config.alltoall_use_pull = true;
        config
    };
    run_cluster(2, 2, make_config, |rank, runtime| {
        let begin = vec![0usize, 4, 8];
        let values: Vec<f32> = (0..8).map(|i| (rank * 1000 + i) as f32).collect();
        let input = f32_tensor(&values);
        let output = HeapTensor::zeros(32, DataType::Float32, Device::Cpu);
        let handle = runtime
            .alltoall(begins_to_args(
                "pulled",
                input,
                output.clone(),
                begin.clone(),
                begin.clone(),
            ))
            .unwrap();
        runtime.wait(handle, false).unwrap();

        let result = output.to_f32_vec();
        for peer in 0..2usize {
            let expected: Vec<f32> = (0..4)
                .map(|i| (peer * 1000 + rank * 4 + i) as f32)
                .collect();
            assert_eq!(&result[peer * 4..(peer + 1) * 4], expected.as_slice());
        }
    });
}

#[test]
fn unknown_output_size_resizes_and_reports() {
    run_cluster(2, 2, |rank| cluster_config(rank, 2, 2), |rank, runtime| {
        // rank r sends r + 1 elements to every peer
        let per_peer = rank + 1;
        let send_begin: Vec<usize> = (0..=2).map(|i| i * per_peer).collect();
        let values: Vec<f32> = (0..2 * per_peer)
            .map(|i| (rank * 10 + i) as f32)
            .collect();
        let input = f32_tensor(&values);
        let output = HeapTensor::zeros(0, DataType::Float32, Device::Cpu);
        let size_output = HeapTensor::zeros(8, DataType::Int32, Device::Cpu);
        let args = AlltoallArgs {
            name: "sized".to_string(),
            input: Some(input),
            group_inputs: Vec::new(),
            output: Some(output.clone()),
            group_outputs: Vec::new(),
            size_output: Some(size_output.clone()),
            send_begin,
            recv_begin: vec![0, 0, 0],
            priority: 0,
            version: 0,
            output_size_unknown: true,
            ready_event: None,
        };
        let handle = runtime.alltoall(args).unwrap();
        runtime.wait(handle, false).unwrap();

        // recv sizes: 1 element from rank 0, 2 from rank 1
        let raw = size_output.to_vec();
        let sizes: Vec<i32> = raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(sizes, vec![1, 2]);
        assert_eq!(output.size(), 12);
        let result = output.to_f32_vec();
        // chunk from rank 0 starts at its slice for `rank`, likewise rank 1
        let expected: Vec<f32> = vec![
            (rank) as f32,
            (10 + rank * 2) as f32,
            (10 + rank * 2 + 1) as f32,
        ];
        assert_eq!(result, expected);
    });
}
