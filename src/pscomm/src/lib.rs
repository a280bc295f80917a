//! pscomm: the communication core of a parameter-server based collective
//! library. User calls expand into partitioned multi-stage tasks executed
//! by per-stage background workers and synchronized through scheduled
//! queues and keyed ready tables.

pub mod allgather;
pub mod alltoall;
pub mod buffer;
pub mod collab;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod handle;
pub mod key;
pub mod loops;
pub mod ops;
pub mod partition;
pub mod queue;
pub mod ready_table;
pub mod runtime;
pub mod status;
pub mod task;
pub mod trace;

pub use alltoall::AlltoallArgs;
pub use config::Config;
pub use runtime::{Runtime, SuspendedState};
pub use status::{CommError, Status};
pub use task::{DataType, Device, ReadyEvent, ReduceOp, Tensor};
