mod common;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use common::cluster_config;
use pscomm::collab::local::{HeapTensor, LocalCluster};
use pscomm::collab::{Delivery, PsClient};
use pscomm::key::RoutedKey;
use pscomm::status::{CommError, Status};
use pscomm::{DataType, Device, ReduceOp, Runtime};

/// PS stub that records the call sequence while delegating to the local
/// substrate.
struct RecordingPs {
    inner: Arc<dyn PsClient>,
    events: Arc<Mutex<Vec<(&'static str, u64)>>>,
}

impl RecordingPs {
    fn record(&self, what: &'static str, key: u64) {
        self.events.lock().unwrap().push((what, key));
    }
}

impl PsClient for RecordingPs {
    fn register(&self, routed: RoutedKey, init: Bytes) -> Status {
        self.record("register", routed.ps_key);
        self.inner.register(routed, init)
    }

    fn push(&self, routed: RoutedKey, data: Bytes, dtype: DataType, aggregate: bool) -> Status {
        self.record("push", routed.ps_key);
        self.inner.push(routed, data, dtype, aggregate)
    }

    fn pull(&self, routed: RoutedKey, len: usize) -> Result<Bytes, CommError> {
        self.record("pull", routed.ps_key);
        self.inner.pull(routed, len)
    }

    fn send(&self, receiver: usize, key: u64, data: Bytes) -> Status {
        self.record("send", key);
        self.inner.send(receiver, key, data)
    }

    fn pull_from(&self, target: usize, key: u64) -> Result<Bytes, CommError> {
        self.record("pull_from", key);
        self.inner.pull_from(target, key)
    }

    fn respond(&self, requester: usize, key: u64, data: Bytes) -> Status {
        self.inner.respond(requester, key, data)
    }

    fn ack(&self, target: usize, key: u64) -> Status {
        self.inner.ack(target, key)
    }

    fn gdr_exchange(&self, key: u64, data: Bytes, dtype: DataType) -> Status {
        self.inner.gdr_exchange(key, data, dtype)
    }

    fn set_delivery(&self, delivery: Arc<dyn Delivery>) {
        self.inner.set_delivery(delivery)
    }

    fn finalize(&self) -> Status {
        self.inner.finalize()
    }
}

fn recording_runtime() -> (Runtime, Arc<Mutex<Vec<(&'static str, u64)>>>) {
    let cluster = LocalCluster::new(1, 1);
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut collab = cluster.collaborators(0);
    collab.ps = Arc::new(RecordingPs {
        inner: collab.ps.clone(),
        events: events.clone(),
    });
    let mut config = cluster_config(0, 1, 1);
    config.force_distributed = true;
    let runtime = Runtime::init(config, collab).unwrap();
    (runtime, events)
}

/// Concurrent first-touch enqueues run the init side effects exactly once,
/// every callback fires, and each partition pushes before it pulls.
#[test]
fn concurrent_first_touch_inits_once() {
    let (runtime, events) = recording_runtime();
    runtime.declare("shared_grad", -1).unwrap();
    let runtime = Arc::new(runtime);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let runtime = runtime.clone();
            scope.spawn(move || {
                let input = HeapTensor::from_f32(&[1.0; 16], Device::Cpu);
                let output = HeapTensor::zeros(64, DataType::Float32, Device::Cpu);
                let handle = runtime
                    .push_pull(input, output, "shared_grad", ReduceOp::Sum, 0, 0, None)
                    .unwrap();
                runtime.wait(handle, false).unwrap();
            });
        }
    });

    let events = events.lock().unwrap();
    let registers = events.iter().filter(|(w, _)| *w == "register").count();
    let pushes = events.iter().filter(|(w, _)| *w == "push").count();
    let pulls = events.iter().filter(|(w, _)| *w == "pull").count();
    // one partition, initialized exactly once despite four first-touches
    assert_eq!(registers, 1);
    assert_eq!(pushes, 4);
    assert_eq!(pulls, 4);
    // per round the push always precedes its pull
    let mut outstanding: i64 = 0;
    for (what, _) in events.iter() {
        match *what {
            "push" => outstanding += 1,
            "pull" => {
                outstanding -= 1;
                assert!(outstanding >= 0, "pull observed before its push");
            }
            _ => {}
        }
    }
    Arc::try_unwrap(runtime).ok().unwrap().shutdown();
}

/// The alltoall self path never touches the transport.
#[test]
fn alltoall_self_path_stays_local() {
    let (runtime, events) = recording_runtime();
    let input = HeapTensor::from_f32(&[5.0, 6.0], Device::Cpu);
    let output = HeapTensor::zeros(8, DataType::Float32, Device::Cpu);
    let args = pscomm::AlltoallArgs {
        name: "self_only".to_string(),
        input: Some(input),
        group_inputs: Vec::new(),
        output: Some(output.clone()),
        group_outputs: Vec::new(),
        size_output: None,
        send_begin: vec![0, 2],
        recv_begin: vec![0, 2],
        priority: 0,
        version: 0,
        output_size_unknown: false,
        ready_event: None,
    };
    let handle = runtime.alltoall(args).unwrap();
    runtime.wait(handle, false).unwrap();
    assert_eq!(output.to_f32_vec(), vec![5.0, 6.0]);
    let events = events.lock().unwrap();
    assert!(
        events
            .iter()
            .all(|(w, _)| *w != "send" && *w != "pull_from"),
        "self-only alltoall must not produce transport traffic: {:?}",
        *events
    );
    drop(events);
    runtime.shutdown();
}
