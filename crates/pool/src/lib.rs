pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
mod queue;
pub mod registry;
pub mod trace;
pub mod work;
pub mod worker;

pub use clock::Deadline;
pub use config::PoolConfig;
pub use error::PoolError;
pub use manager::{start_pool, PoolHandle, QueueManager, WorkerCounts};
pub use registry::{spawn_stats_server, PoolIntrospect, PoolRegistry, PoolStats};
pub use trace::{TraceReport, TraceSession};
pub use work::{DeliveryKind, ReplySlot};
pub use worker::{spawn_worker, Delivery, WorkRequest, WorkerId, WorkerPort};
