//! Stitch sessions: groups hits into proto-sessions and closes them on an
//! event-time timing wheel.

#![forbid(unsafe_code)]

pub mod batched;
pub mod closer;
pub mod conflicts;
pub mod dedup;
mod errors;
pub mod eviction;
pub mod isolation;
pub mod meta;
pub mod naive;
pub mod orchestrator;
pub mod testing;
pub mod wheel;
pub mod wheel_state;
pub mod worker;

pub use batched::{BatchedBackend, ConflictCheck, ConflictRequest, Identifier, IdentifierKind, RebindIdentifier};
pub use closer::{ChannelRequeuer, Closer, LoggingCloser, Requeuer, ShardingCloser};
pub use dedup::DeduplicatingBackend;
pub use errors::{BackendError, ProtosessionError};
pub use eviction::EvictionStrategy;
pub use isolation::{DefaultIsolationFactory, IsolationGuard, IsolationGuardFactory, NoIsolationFactory};
pub use naive::NaiveBackend;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, StatsSnapshot};
pub use wheel::{BucketLocks, TickOutcome, TickReport, TimingWheel};
pub use wheel_state::{KvWheelState, WheelStateBackend};
pub use worker::{ping_task, Task, TaskError, Worker};
