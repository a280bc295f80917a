//! Communication timeline in the chrome-trace format. Stage workers record
//! one event per stage transition while a context's step counter sits in
//! the configured window; the collector thread writes
//! `<trace_dir>/<rank>/comm.json` when flushed.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{unbounded, Sender};
use serde::Serialize;

#[derive(Serialize)]
struct TraceArgs {
    name: String,
}

#[derive(Serialize)]
struct TraceEvent {
    ph: &'static str,
    ts: u64,
    dur: u64,
    tid: String,
    pid: String,
    cat: &'static str,
    name: String,
    args: TraceArgs,
}

#[derive(Serialize)]
struct TraceFile {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<TraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: &'static str,
}

enum TraceMsg {
    Event(TraceEvent),
    Flush,
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

pub struct TraceCollector {
    tx: Sender<TraceMsg>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TraceCollector {
    pub fn new(trace_dir: &str, rank: usize) -> Self {
        let path: PathBuf = [trace_dir, &rank.to_string(), "comm.json"].iter().collect();
        let (tx, rx) = unbounded::<TraceMsg>();
        let worker = std::thread::spawn(move || {
            let mut events = Vec::new();
            loop {
                match rx.recv() {
                    Ok(TraceMsg::Event(event)) => events.push(event),
                    Ok(TraceMsg::Flush) => write_trace(&path, &events),
                    Err(_) => {
                        if !events.is_empty() {
                            write_trace(&path, &events);
                        }
                        break;
                    }
                }
            }
        });
        TraceCollector {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// One completed stage for one partition of `tensor_name`.
    pub fn record_stage(&self, tensor_name: &str, stage: &str, key: u64, start_us: u64, dur_us: u64) {
        let para_name = format!("Comm.{}", tensor_name);
        let event = TraceEvent {
            ph: "X",
            ts: start_us,
            dur: dur_us,
            tid: key.to_string(),
            pid: para_name.clone(),
            cat: "Comm",
            name: format!("{}.{}", para_name, stage),
            args: TraceArgs { name: para_name },
        };
        let _ = self.tx.send(TraceMsg::Event(event));
    }

    /// Aggregate event covering the whole op for one tensor.
    pub fn record_total(&self, tensor_name: &str, start_us: u64, dur_us: u64) {
        let para_name = format!("Comm.{}", tensor_name);
        let event = TraceEvent {
            ph: "X",
            ts: start_us,
            dur: dur_us,
            tid: "total".to_string(),
            pid: para_name.clone(),
            cat: "Comm",
            name: para_name.clone(),
            args: TraceArgs { name: para_name },
        };
        let _ = self.tx.send(TraceMsg::Event(event));
    }

    pub fn flush(&self) {
        let _ = self.tx.send(TraceMsg::Flush);
    }
}

impl Drop for TraceCollector {
    fn drop(&mut self) {
        // closing the channel makes the worker write any pending events
        let (replacement, _) = unbounded();
        drop(std::mem::replace(&mut self.tx, replacement));
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn write_trace(path: &PathBuf, events: &[TraceEvent]) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            log::warn!("cannot create trace dir {:?}: {}", parent, e);
            return;
        }
    }
    let file = TraceFile {
        trace_events: events.iter().map(clone_event).collect(),
        display_time_unit: "ms",
    };
    match serde_json::to_string_pretty(&file) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                log::warn!("cannot write trace {:?}: {}", path, e);
            } else {
                log::info!("communication trace written to {:?}", path);
            }
        }
        Err(e) => log::warn!("cannot serialize trace: {}", e),
    }
}

fn clone_event(event: &TraceEvent) -> TraceEvent {
    TraceEvent {
        ph: event.ph,
        ts: event.ts,
        dur: event.dur,
        tid: event.tid.clone(),
        pid: event.pid.clone(),
        cat: event.cat,
        name: event.name.clone(),
        args: TraceArgs {
            name: event.args.name.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_file_lands_under_rank_dir() {
        let dir = tempfile::tempdir().unwrap();
        let collector = TraceCollector::new(dir.path().to_str().unwrap(), 3);
        collector.record_stage("grad0", "PUSH", 42, 1000, 250);
        collector.record_total("grad0", 1000, 900);
        collector.flush();
        drop(collector);

        let path = dir.path().join("3").join("comm.json");
        let content = fs::read_to_string(path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        let events = parsed["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["cat"], "Comm");
        assert_eq!(events[0]["name"], "Comm.grad0.PUSH");
        assert_eq!(events[0]["args"]["name"], "Comm.grad0");
        assert_eq!(events[1]["tid"], "total");
        assert_eq!(parsed["displayTimeUnit"], "ms");
    }
}
