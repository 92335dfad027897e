//! Trellis Executor
//!
//! Drives graph executions to completion.
//!
//! ```text
//! ExecutionManager::add_execution
//!   ├─ validate input against every starting node
//!   ├─ create the run and its seed node executions (store)
//!   └─ push a GraphExecution onto the GraphQueue
//!
//! ExecutionManager::run  (bounded by num_graph_workers)
//!   └─ GraphOrchestrator::run  (one per run)
//!        ├─ NodeQueue seeded with the starting executions
//!        ├─ at most one in-flight execution per node
//!        └─ execute_node  (bounded by num_node_workers)
//!             ├─ stream block outputs, persist each one
//!             └─ fan out along output links, queue what became ready
//! ```
//!
//! Workers share nothing but the [`Store`](trellis_store::Store) and the
//! run's queue. The only cross-worker coordination is the store lock taken
//! while a downstream node's input is accumulated.

mod config;
mod context;
mod error;
mod events;
mod execution;
mod input;
mod lock;
mod manager;
mod node;
mod orchestrator;
mod queue;

pub use config::ExecutorConfig;
pub use context::WorkerContext;
pub use error::{ExecutorError, NotFoundKind, ValidationError, ValidationKind};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use execution::{GraphExecution, NodeExecution};
pub use input::{
  DICT_SPLIT, LIST_SPLIT, MAX_DYNAMIC_LIST_LEN, OBJC_SPLIT, merge_execution_input,
  parse_execution_output, validate_exec,
};
pub use lock::{synchronized, upsert_lock_key};
pub use manager::{ExecutionHandle, ExecutionManager};
pub use node::{NodeRunSummary, enqueue_next_nodes, execute_node};
pub use orchestrator::{GraphOrchestrator, RunSummary};
pub use queue::{ExecutionQueue, GraphQueue, NodeQueue, QueueItem};
