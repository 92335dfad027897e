use serde::{Deserialize, Serialize};
use trellis_graph::BlockInput;

/// A ready node execution: a work unit for a node worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
  pub graph_exec_id: String,
  pub node_exec_id: String,
  pub node_id: String,
  /// Validated input, dynamic pins already merged.
  pub data: BlockInput,
}

/// A run waiting for a graph worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExecution {
  pub graph_exec_id: String,
  pub graph_id: String,
  pub graph_version: u32,
  pub start_node_execs: Vec<NodeExecution>,
}
