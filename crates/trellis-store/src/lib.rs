//! Trellis Store
//!
//! This crate provides the storage trait and implementations the scheduler
//! coordinates through. Data is kept in memory ([`MemoryStore`]) or persisted
//! to SQLite ([`SqliteStore`]).
//!
//! The [`Store`] trait defines operations for:
//! - Storing and loading versioned graph definitions
//! - Creating graph executions together with their seed node executions
//! - Accumulating node inputs and recording node outputs
//! - Advancing execution statuses (forward only)
//! - Named mutual-exclusion locks shared by every worker using the store

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{ExecutionStatus, GraphExecutionRecord, NodeExecutionRecord, check_transition};

use async_trait::async_trait;
use serde_json::Value;
use trellis_graph::{BlockInput, Graph};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A status change that would move a record backward.
  #[error("invalid status transition for '{id}': {from} -> {to}")]
  InvalidTransition {
    id: String,
    from: ExecutionStatus,
    to: ExecutionStatus,
  },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Storage trait for graphs, executions, and locks.
#[async_trait]
pub trait Store: Send + Sync {
  /// Store a graph definition. Replaces a definition with the same id and version.
  async fn create_graph(&self, graph: &Graph) -> Result<(), Error>;

  /// Get a graph by id, optionally at a specific version.
  /// If version is None, returns the latest stored version.
  async fn get_graph(&self, graph_id: &str, version: Option<u32>) -> Result<Option<Graph>, Error>;

  /// Atomically create a graph execution and one `INCOMPLETE` node execution
  /// per `(node_id, input)` seed.
  async fn create_graph_execution(
    &self,
    graph_id: &str,
    graph_version: u32,
    nodes_input: Vec<(String, BlockInput)>,
  ) -> Result<(GraphExecutionRecord, Vec<NodeExecutionRecord>), Error>;

  /// Get a graph execution by ID.
  async fn get_graph_execution(&self, graph_exec_id: &str) -> Result<GraphExecutionRecord, Error>;

  /// List executions of a graph, newest first.
  async fn list_graph_executions(&self, graph_id: &str) -> Result<Vec<GraphExecutionRecord>, Error>;

  /// Advance the status of a graph execution.
  async fn update_graph_execution_status(
    &self,
    graph_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<(), Error>;

  /// Write `data` under `input_name` into the oldest `INCOMPLETE` execution of
  /// `node_id` in the run that does not hold that pin yet, creating a new
  /// `INCOMPLETE` execution if there is none. Returns its node_exec_id.
  async fn upsert_execution_input(
    &self,
    node_id: &str,
    graph_exec_id: &str,
    input_name: &str,
    data: Value,
  ) -> Result<String, Error>;

  /// Get a node execution by ID, with its outputs.
  async fn get_node_execution(&self, node_exec_id: &str) -> Result<NodeExecutionRecord, Error>;

  /// Get the accumulated input of a node execution.
  async fn get_execution_input(&self, node_exec_id: &str) -> Result<BlockInput, Error>;

  /// List node executions of a run, in creation order.
  async fn list_node_executions(&self, graph_exec_id: &str) -> Result<Vec<NodeExecutionRecord>, Error>;

  /// Append an output value. Values of the same pin accumulate in call order.
  async fn upsert_execution_output(
    &self,
    node_exec_id: &str,
    output_name: &str,
    data: Value,
  ) -> Result<(), Error>;

  /// Compare-and-advance the status of a node execution.
  ///
  /// Returns `true` if this call moved the status, `false` if the execution
  /// already had `status`. Moving backward is an error.
  async fn update_execution_status(
    &self,
    node_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<bool, Error>;

  /// Acquire a named lock, waiting until it is free.
  async fn acquire_lock(&self, key: &str) -> Result<(), Error>;

  /// Release a named lock. Releasing a free lock is a no-op.
  async fn release_lock(&self, key: &str) -> Result<(), Error>;
}
