use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::key::HashKind;
use crate::status::CommError;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
});

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // cluster topology
    pub rank: usize,
    pub local_rank: usize,
    pub size: usize,
    pub local_size: usize,
    pub worker_id: usize,
    pub phy_node_id: usize,
    pub num_phy_nodes: usize,
    /// -1 resolves to local_size - 1.
    pub worker_local_root: i32,
    pub server_local_root: i32,
    pub num_worker: usize,
    pub num_server: usize,
    pub force_distributed: bool,
    /// Joint mode: every worker co-hosts a server instance.
    pub joint: bool,
    pub job_id: String,

    // partitioning and buffers
    pub partition_bytes: usize,
    pub alltoall_buff_bytes: usize,
    pub alltoall_mem_factor: f64,
    pub alltoall_session_size: u32,
    pub alltoall_copy_group_size: usize,
    pub min_compress_bytes: usize,
    /// Byte budget for the push queue; 0 disables credit scheduling.
    pub scheduling_credit: usize,

    // server routing
    pub key_hash_fn: String,
    pub built_in_hash_coefficient: u64,
    pub mixed_mode: bool,
    pub mixed_mode_bound: u64,
    pub reduce_roots: Vec<i32>,

    // GDR allreduce
    pub use_gdr_allreduce: bool,
    /// 0 = GPU->CPU, 1 = GPU->GPU.
    pub gdr_allreduce_level: u32,
    pub gdr_phase1_tensor_thresh: usize,
    pub gdr_phase2_tensor_thresh: usize,
    pub use_gdr_allgather: bool,

    // feature flags
    pub disable_p2p: bool,
    pub disable_send_recv: bool,
    pub disable_compress: bool,
    pub disable_cpu_allreduce: bool,
    pub disable_gpu_allreduce: bool,
    pub disable_gpu_allgather: bool,
    pub alltoall_use_pull: bool,
    pub disable_p2p_ack: bool,
    pub skip_h2d: bool,
    pub skip_input_copy: bool,

    // profiling window
    pub trace_on: bool,
    pub trace_start_step: u64,
    pub trace_end_step: u64,
    pub trace_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_sample_tensor: Option<u64>,

    // lifecycle
    pub monitor_interval_secs: u64,
    pub abort_on_timeout: bool,
    pub enable_err_handling: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rank: 0,
            local_rank: 0,
            size: 1,
            local_size: 1,
            worker_id: 0,
            phy_node_id: 0,
            num_phy_nodes: 1,
            worker_local_root: -1,
            server_local_root: -1,
            num_worker: 1,
            num_server: 0,
            force_distributed: false,
            joint: false,
            job_id: "0".to_string(),
            partition_bytes: 4096000,
            alltoall_buff_bytes: 4096000,
            alltoall_mem_factor: 1.5,
            alltoall_session_size: 2,
            alltoall_copy_group_size: 16,
            min_compress_bytes: 1 << 16,
            scheduling_credit: 0,
            key_hash_fn: "djb2".to_string(),
            built_in_hash_coefficient: 1,
            mixed_mode: false,
            mixed_mode_bound: 101,
            reduce_roots: Vec::new(),
            use_gdr_allreduce: false,
            gdr_allreduce_level: 1,
            gdr_phase1_tensor_thresh: 102400,
            gdr_phase2_tensor_thresh: 1024000,
            use_gdr_allgather: false,
            disable_p2p: false,
            disable_send_recv: false,
            disable_compress: true,
            disable_cpu_allreduce: false,
            disable_gpu_allreduce: false,
            disable_gpu_allgather: false,
            alltoall_use_pull: false,
            disable_p2p_ack: false,
            skip_h2d: false,
            skip_input_copy: false,
            trace_on: false,
            trace_start_step: 10,
            trace_end_step: 20,
            trace_dir: "./trace".to_string(),
            debug_sample_tensor: None,
            monitor_interval_secs: 300,
            abort_on_timeout: false,
            enable_err_handling: false,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(value) = env::var(name) {
        if let Ok(parsed) = value.parse::<T>() {
            *slot = parsed;
        } else {
            log::warn!("ignoring unparsable {}={}", name, value);
        }
    }
}

fn parse_env_flag(name: &str, slot: &mut bool) {
    if let Ok(value) = env::var(name) {
        *slot = value != "0" && !value.eq_ignore_ascii_case("false");
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, CommError> {
        let content = fs::read_to_string(path)
            .map_err(|e| CommError::InvalidArgument(format!("cannot read config: {}", e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| CommError::InvalidArgument(format!("cannot parse config: {}", e)))?;
        Ok(config)
    }

    /// Builds a config from `PSC_*` environment variables layered over the
    /// defaults.
    pub fn from_env() -> Self {
        let mut c = Config::default();
        parse_env("PSC_RANK", &mut c.rank);
        parse_env("PSC_LOCAL_RANK", &mut c.local_rank);
        parse_env("PSC_SIZE", &mut c.size);
        parse_env("PSC_LOCAL_SIZE", &mut c.local_size);
        parse_env("PSC_WORKER_ID", &mut c.worker_id);
        parse_env("PSC_PHY_NODE_ID", &mut c.phy_node_id);
        parse_env("PSC_NUM_PHY_NODE", &mut c.num_phy_nodes);
        parse_env("PSC_WORKER_LOCAL_ROOT", &mut c.worker_local_root);
        parse_env("PSC_SERVER_LOCAL_ROOT", &mut c.server_local_root);
        parse_env("PSC_NUM_WORKER", &mut c.num_worker);
        parse_env("PSC_NUM_SERVER", &mut c.num_server);
        parse_env_flag("PSC_FORCE_DISTRIBUTED", &mut c.force_distributed);
        parse_env_flag("PSC_JOINT", &mut c.joint);
        parse_env("PSC_JOB_ID", &mut c.job_id);
        parse_env("PSC_PARTITION_BYTES", &mut c.partition_bytes);
        parse_env("PSC_ALLTOALL_BUFF_BYTES", &mut c.alltoall_buff_bytes);
        parse_env("PSC_ALLTOALL_MEM_FACTOR", &mut c.alltoall_mem_factor);
        parse_env("PSC_ALLTOALL_SESSION_SIZE", &mut c.alltoall_session_size);
        parse_env("PSC_ALLTOALL_COPY_GROUP_SIZE", &mut c.alltoall_copy_group_size);
        parse_env("PSC_MIN_COMPRESS_BYTES", &mut c.min_compress_bytes);
        parse_env("PSC_SCHEDULING_CREDIT", &mut c.scheduling_credit);
        parse_env("PSC_KEY_HASH_FN", &mut c.key_hash_fn);
        parse_env("PSC_BUILT_IN_HASH_COEF", &mut c.built_in_hash_coefficient);
        parse_env_flag("PSC_ENABLE_MIXED_MODE", &mut c.mixed_mode);
        parse_env("PSC_MIXED_MODE_BOUND", &mut c.mixed_mode_bound);
        if let Ok(roots) = env::var("PSC_REDUCE_ROOTS") {
            c.reduce_roots = roots
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        parse_env_flag("PSC_USE_GDR_ALLREDUCE", &mut c.use_gdr_allreduce);
        parse_env("PSC_GDR_ALLREDUCE_LEVEL", &mut c.gdr_allreduce_level);
        parse_env("PSC_GDR_PHASE1_TENSOR_THRESH", &mut c.gdr_phase1_tensor_thresh);
        parse_env("PSC_GDR_PHASE2_TENSOR_THRESH", &mut c.gdr_phase2_tensor_thresh);
        parse_env_flag("PSC_USE_GDR_ALLGATHER", &mut c.use_gdr_allgather);
        parse_env_flag("PSC_DISABLE_P2P", &mut c.disable_p2p);
        parse_env_flag("PSC_DISABLE_SEND_RECV", &mut c.disable_send_recv);
        parse_env_flag("PSC_DISABLE_COMPRESS", &mut c.disable_compress);
        parse_env_flag("PSC_DISABLE_CPU_ALLREDUCE", &mut c.disable_cpu_allreduce);
        parse_env_flag("PSC_DISABLE_GPU_ALLREDUCE", &mut c.disable_gpu_allreduce);
        parse_env_flag("PSC_DISABLE_GPU_ALLGATHER", &mut c.disable_gpu_allgather);
        parse_env_flag("PSC_ALL2ALL_USE_PULL", &mut c.alltoall_use_pull);
        parse_env_flag("PSC_DISABLE_P2P_ACK", &mut c.disable_p2p_ack);
        parse_env_flag("PSC_P2P_SKIP_H2D", &mut c.skip_h2d);
        parse_env_flag("PSC_P2P_SKIP_INPUT_COPY", &mut c.skip_input_copy);
        parse_env_flag("PSC_TRACE_ON", &mut c.trace_on);
        parse_env("PSC_TRACE_START_STEP", &mut c.trace_start_step);
        parse_env("PSC_TRACE_END_STEP", &mut c.trace_end_step);
        parse_env("PSC_TRACE_DIR", &mut c.trace_dir);
        if let Ok(key) = env::var("PSC_DEBUG_SAMPLE_TENSOR") {
            c.debug_sample_tensor = key.parse().ok();
        }
        parse_env("PSC_MONITOR_INTERVAL", &mut c.monitor_interval_secs);
        parse_env_flag("PSC_ABORT_ON_TIMEOUT", &mut c.abort_on_timeout);
        parse_env_flag("PSC_ENABLE_ERR_HANDLING", &mut c.enable_err_handling);
        c
    }

    pub fn validate(&self) -> Result<(), CommError> {
        self.key_hash_fn.parse::<HashKind>()?;
        if self.use_gdr_allreduce && self.gdr_allreduce_level > 1 {
            return Err(CommError::InvalidArgument(
                "gdr_allreduce_level must be 0 (GPU->CPU) or 1 (GPU->GPU)".into(),
            ));
        }
        if self.use_gdr_allreduce
            && self.gdr_allreduce_level == 1
            && self.gdr_phase1_tensor_thresh >= self.gdr_phase2_tensor_thresh
        {
            return Err(CommError::InvalidArgument(
                "gdr phase-1 threshold must be smaller than the phase-2 threshold".into(),
            ));
        }
        if self.is_distributed() && self.num_server == 0 {
            return Err(CommError::Precondition(
                "distributed job launched without num_server".into(),
            ));
        }
        if self.trace_on && (self.trace_start_step < 1 || self.trace_end_step <= self.trace_start_step)
        {
            return Err(CommError::InvalidArgument(
                "trace window requires 1 <= start_step < end_step".into(),
            ));
        }
        if self.alltoall_mem_factor <= 0.0 {
            return Err(CommError::InvalidArgument(
                "alltoall_mem_factor must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn is_distributed(&self) -> bool {
        if self.force_distributed {
            return true;
        }
        if self.joint {
            self.num_worker > self.local_size
        } else {
            self.num_worker > 1
        }
    }

    pub fn hash_kind(&self) -> Result<HashKind, CommError> {
        if self.mixed_mode {
            return Ok(HashKind::Mixed);
        }
        if self.joint && self.key_hash_fn == "djb2" {
            return Ok(HashKind::Djb2Colocate);
        }
        self.key_hash_fn.parse()
    }

    pub fn effective_worker_local_root(&self) -> usize {
        if self.worker_local_root >= 0 {
            self.worker_local_root as usize
        } else {
            self.local_size - 1
        }
    }

    pub fn effective_server_local_root(&self) -> usize {
        if self.server_local_root >= 0 {
            self.server_local_root as usize
        } else {
            self.local_size - 1
        }
    }

    pub fn is_root_device(&self) -> bool {
        self.local_rank == self.effective_worker_local_root()
    }

    pub fn gdr_gpu2gpu(&self) -> bool {
        self.gdr_allreduce_level == 1
    }

    /// Maximum partition length, rounded up so partitions stay page
    /// aligned across all local ranks.
    pub fn partition_bound(&self) -> usize {
        round_up(self.partition_bytes, self.local_size * *PAGE_SIZE)
    }

    pub fn page_size() -> usize {
        *PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.partition_bytes, 4096000);
        assert_eq!(c.alltoall_mem_factor, 1.5);
        assert_eq!(c.alltoall_session_size, 2);
        assert_eq!(c.alltoall_copy_group_size, 16);
        assert_eq!(c.min_compress_bytes, 65536);
        assert_eq!(c.monitor_interval_secs, 300);
        assert!(c.disable_compress);
        assert!(!c.is_distributed());
        c.validate().unwrap();
    }

    #[test]
    fn partition_bound_is_page_aligned() {
        let c = Config {
            local_size: 4,
            ..Config::default()
        };
        let bound = c.partition_bound();
        assert!(bound >= c.partition_bytes);
        assert_eq!(bound % (4 * Config::page_size()), 0);
    }

    #[test]
    fn gdr_thresholds_are_ordered() {
        let c = Config {
            use_gdr_allreduce: true,
            gdr_allreduce_level: 1,
            gdr_phase1_tensor_thresh: 5000,
            gdr_phase2_tensor_thresh: 4000,
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn distributed_without_servers_is_precondition() {
        let c = Config {
            num_worker: 4,
            num_server: 0,
            ..Config::default()
        };
        let err = c.validate().unwrap_err();
        assert!(matches!(err, CommError::Precondition(_)));
    }

    #[test]
    fn toml_round_trip() {
        let c = Config::default();
        let text = toml::to_string(&c).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.partition_bytes, c.partition_bytes);
        assert_eq!(parsed.key_hash_fn, c.key_hash_fn);
    }
}
