use std::collections::BTreeSet;
use std::fmt;

use trellis_graph::GraphError;

/// Why an input map was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
  /// A pin fed by an incoming link has no value yet.
  MissingUpstream,
  /// A field required by the block schema is absent after merging defaults.
  MissingRequired,
  /// A value has the wrong type for its schema property.
  SchemaMismatch,
  /// A dynamic list pin with a non-numeric index.
  InvalidDynamicPin,
  /// The node's block is not registered.
  UnknownBlock,
}

/// An input map that is incomplete or does not match the block schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
  pub node_id: String,
  pub kind: ValidationKind,
  /// Offending fields, sorted.
  pub fields: BTreeSet<String>,
  pub message: String,
}

impl ValidationError {
  pub(crate) fn new(
    node_id: &str,
    kind: ValidationKind,
    fields: BTreeSet<String>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      node_id: node_id.to_string(),
      kind,
      fields,
      message: message.into(),
    }
  }
}

/// What kind of reference could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
  Graph,
  Node,
  Block,
}

impl fmt::Display for NotFoundKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NotFoundKind::Graph => f.write_str("graph"),
      NotFoundKind::Node => f.write_str("node"),
      NotFoundKind::Block => f.write_str("block"),
    }
  }
}

/// Errors that can occur while scheduling or executing graphs.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  /// A graph, node, or block reference could not be resolved.
  #[error("{kind} '{id}' not found")]
  NotFound { kind: NotFoundKind, id: String },

  #[error("input validation failed for node '{}': {}", .0.node_id, .0.message)]
  Validation(#[from] ValidationError),

  /// The block raised while producing output.
  #[error("block execution failed for node '{node_id}': {category}: {message}")]
  BlockExecution {
    node_id: String,
    category: String,
    message: String,
  },

  #[error("store error: {0}")]
  Store(#[from] trellis_store::Error),

  #[error("invalid graph: {0}")]
  Graph(#[from] GraphError),

  #[error("invalid configuration: {message}")]
  Config { message: String },

  /// A node worker task panicked or was aborted.
  #[error("worker for node '{node_id}' failed: {message}")]
  Worker { node_id: String, message: String },
}

impl ExecutorError {
  pub(crate) fn not_found(kind: NotFoundKind, id: impl Into<String>) -> Self {
    ExecutorError::NotFound {
      kind,
      id: id.into(),
    }
  }
}
