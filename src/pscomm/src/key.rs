//! 64-bit PS key codec and worker-side server routing.
//!
//! The low 48 bits of a key are divided into four fields (MSB to LSB):
//! 16-bit sender, 16-bit declared id, 6-bit op type, 10-bit partition.
//! The bits above the encoded fields stay clear so that the routed key can
//! be rebased into a server's key range.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

use crate::status::CommError;

const DECLARED_SHIFT: u32 = 16;
const OP_SHIFT: u32 = 10;
const SENDER_SHIFT: u32 = 32;
const PARTITION_MASK: u64 = (1 << OP_SHIFT) - 1;
const OP_MASK: u64 = (1 << 6) - 1;
const FIELD_MASK: u64 = (1 << 16) - 1;

/// Operation type encoded into the 6-bit field. The discriminants are part
/// of the wire key layout and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpType {
    PushPull = 1,
    P2p = 2,
    Alltoall = 3,
    Allgather = 4,
}

impl OpType {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            1 => Some(OpType::PushPull),
            2 => Some(OpType::P2p),
            3 => Some(OpType::Alltoall),
            4 => Some(OpType::Allgather),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyParts {
    pub sender: u16,
    pub declared_id: u16,
    pub op: OpType,
    pub partition: u16,
}

pub fn encode(parts: KeyParts) -> u64 {
    debug_assert!(parts.partition < (1 << OP_SHIFT));
    ((parts.sender as u64) << SENDER_SHIFT)
        | ((parts.declared_id as u64) << DECLARED_SHIFT)
        | ((parts.op as u64) << OP_SHIFT)
        | parts.partition as u64
}

pub fn decode(key: u64) -> Option<KeyParts> {
    let op = OpType::from_bits((key >> OP_SHIFT) & OP_MASK)?;
    Some(KeyParts {
        sender: ((key >> SENDER_SHIFT) & FIELD_MASK) as u16,
        declared_id: ((key >> DECLARED_SHIFT) & FIELD_MASK) as u16,
        op,
        partition: (key & PARTITION_MASK) as u16,
    })
}

pub fn encode_push_pull(declared_id: u16, partition: u16) -> u64 {
    encode(KeyParts {
        sender: 0,
        declared_id,
        op: OpType::PushPull,
        partition,
    })
}

pub fn encode_p2p(sender: u16, declared_id: u16, partition: u16) -> u64 {
    encode(KeyParts {
        sender,
        declared_id,
        op: OpType::P2p,
        partition,
    })
}

/// Allgather uses one key per physical node, carried in the sender field.
pub fn encode_allgather(phy_node: u16, declared_id: u16) -> u64 {
    encode(KeyParts {
        sender: phy_node,
        declared_id,
        op: OpType::Allgather,
        partition: 0,
    })
}

/// Alltoall keys carry the peer rank in the partition bits.
pub fn encode_alltoall(declared_id: u16, peer_rank: u16) -> u64 {
    encode(KeyParts {
        sender: 0,
        declared_id,
        op: OpType::Alltoall,
        partition: peer_rank,
    })
}

/// Strips the peer bits of an alltoall key, leaving the per-tensor id used
/// by group-copy readiness tracking.
pub fn alltoall_tensor_id(key: u64) -> u64 {
    key & !PARTITION_MASK
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashKind {
    Djb2,
    Djb2Colocate,
    Sdbm,
    Naive,
    BuiltIn,
    Mixed,
}

impl FromStr for HashKind {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, CommError> {
        match s {
            "djb2" => Ok(HashKind::Djb2),
            "djb2-colocate" => Ok(HashKind::Djb2Colocate),
            "sdbm" => Ok(HashKind::Sdbm),
            "naive" => Ok(HashKind::Naive),
            "built_in" => Ok(HashKind::BuiltIn),
            "mixed" => Ok(HashKind::Mixed),
            other => Err(CommError::InvalidArgument(format!(
                "unsupported key hash fn {:?}, must be one of \
                 [djb2, djb2-colocate, sdbm, naive, built_in, mixed]",
                other
            ))),
        }
    }
}

/// All string hashes operate on the decimal representation of the key,
/// held in an owned buffer.
fn hash_djb2(key: u64) -> u64 {
    let mut hash: u64 = 5381;
    for c in key.to_string().bytes() {
        // hash(i) = hash(i-1) * 33 ^ str[i]
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(c as u64);
    }
    hash
}

fn hash_sdbm(key: u64) -> u64 {
    let mut hash: u64 = 0;
    for c in key.to_string().bytes() {
        // hash(i) = hash(i-1) * 65599 + str[i]
        hash = (c as u64)
            .wrapping_add(hash.wrapping_shl(6))
            .wrapping_add(hash.wrapping_shl(16))
            .wrapping_sub(hash);
    }
    hash
}

fn hash_naive(key: u64) -> u64 {
    ((key >> 16).wrapping_add(key % 65536)).wrapping_mul(9973)
}

fn hash_built_in(key: u64, coefficient: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    key.to_string().hash(&mut hasher);
    hasher.finish().wrapping_mul(coefficient)
}

#[derive(Clone, Copy, Debug)]
pub struct RoutedKey {
    pub server: usize,
    pub ps_key: u64,
    pub len: usize,
}

/// Maps keys to servers and rebases them into the server's key range.
/// Routed keys are cached; re-routing with a new non-zero length updates
/// the cached length in place.
#[derive(Debug)]
pub struct KeyRouter {
    hash: HashKind,
    num_servers: usize,
    num_phy_nodes: usize,
    local_size: usize,
    server_local_root: usize,
    built_in_coefficient: u64,
    // mixed mode only
    mixed_threshold: f64,
    mixed_bound: u64,
    num_noncolocate: usize,
    num_colocate: usize,

    cache: DashMap<u64, RoutedKey>,
    server_load: Mutex<Vec<u64>>,
    total_load: AtomicU64,
}

impl KeyRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hash: HashKind,
        num_servers: usize,
        num_workers: usize,
        num_phy_nodes: usize,
        local_size: usize,
        server_local_root: usize,
        built_in_coefficient: u64,
        mixed_bound: u64,
    ) -> Result<Self, CommError> {
        if num_servers == 0 {
            return Err(CommError::Precondition(
                "key routing requires at least one server".into(),
            ));
        }
        let mut mixed_threshold = 0.0;
        let mut num_noncolocate = 0;
        let mut num_colocate = 0;
        if hash == HashKind::Mixed {
            if mixed_bound < num_servers as u64 {
                return Err(CommError::InvalidArgument(format!(
                    "mixed mode bound {} is below the server count {}",
                    mixed_bound, num_servers
                )));
            }
            if num_servers < num_workers {
                return Err(CommError::InvalidArgument(
                    "mixed mode requires at least one server per worker".into(),
                ));
            }
            num_noncolocate = num_servers - num_workers;
            num_colocate = num_workers;
            let n_nc = num_noncolocate as f64;
            let w = num_workers as f64;
            let ratio = (2.0 * n_nc * (w - 1.0)) / (w * (w + n_nc) - 2.0 * n_nc);
            if !(0.0..=1.0).contains(&ratio) {
                return Err(CommError::InvalidArgument(format!(
                    "mixed mode ratio {} out of range; more non-colocated \
                     servers than workers is not permitted",
                    ratio
                )));
            }
            mixed_threshold = ratio * mixed_bound as f64;
        }
        Ok(KeyRouter {
            hash,
            num_servers,
            num_phy_nodes,
            local_size,
            server_local_root,
            built_in_coefficient,
            mixed_threshold,
            mixed_bound,
            num_noncolocate,
            num_colocate,
            cache: DashMap::new(),
            server_load: Mutex::new(vec![0; num_servers]),
            total_load: AtomicU64::new(0),
        })
    }

    fn range_width(&self) -> u64 {
        u64::MAX / self.num_servers as u64
    }

    fn pick_server(&self, key: u64) -> usize {
        match self.hash {
            HashKind::Djb2 => (hash_djb2(key) % self.num_servers as u64) as usize,
            HashKind::Sdbm => (hash_sdbm(key) % self.num_servers as u64) as usize,
            HashKind::Naive => (hash_naive(key) % self.num_servers as u64) as usize,
            HashKind::BuiltIn => {
                (hash_built_in(key, self.built_in_coefficient) % self.num_servers as u64) as usize
            }
            HashKind::Djb2Colocate => {
                let node = (hash_djb2(key) % self.num_phy_nodes as u64) as usize;
                node * self.local_size + self.server_local_root
            }
            HashKind::Mixed => {
                let hash_res = hash_djb2(key) % self.mixed_bound;
                if (hash_res as f64) < self.mixed_threshold {
                    (hash_djb2(hash_res) % self.num_noncolocate as u64) as usize
                } else {
                    self.num_noncolocate
                        + (hash_djb2(hash_res) % self.num_colocate as u64) as usize
                }
            }
        }
    }

    pub fn route(&self, key: u64, len: usize) -> RoutedKey {
        if let Some(mut cached) = self.cache.get_mut(&key) {
            if len > 0 && cached.len != len {
                cached.len = len;
            }
            return *cached;
        }
        let server = self.pick_server(key);
        debug_assert!(server < self.num_servers);
        let routed = RoutedKey {
            server,
            ps_key: self.range_width() * server as u64 + key,
            len,
        };
        let accumulated = {
            let mut load = self.server_load.lock().unwrap();
            load[server] += len as u64;
            load[server]
        };
        let total = self.total_load.fetch_add(len as u64, Ordering::Relaxed) + len as u64;
        log::debug!(
            "key {} assigned to server {}, accumulated workload {} ({:.1}%)",
            key,
            server,
            accumulated,
            100.0 * accumulated as f64 / total.max(1) as f64
        );
        self.cache.insert(key, routed);
        routed
    }

    /// P2P keys bypass the hash and target the receiver's server directly.
    pub fn route_to(&self, key: u64, len: usize, receiver: usize) -> Result<RoutedKey, CommError> {
        if receiver >= self.num_servers {
            return Err(CommError::InvalidArgument(format!(
                "receiver {} out of range, num_servers={}",
                receiver, self.num_servers
            )));
        }
        Ok(RoutedKey {
            server: receiver,
            ps_key: self.range_width() * receiver as u64 + key,
            len,
        })
    }
}
