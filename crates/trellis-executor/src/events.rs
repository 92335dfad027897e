//! Execution events and notifiers for observability.
//!
//! Events are emitted while graphs run so consumers can observe progress,
//! stream it to a UI, or wait for a run to finish. The store remains the
//! source of truth; events are best-effort.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during graph execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// A graph worker picked up the run.
  GraphStarted {
    graph_exec_id: String,
    graph_id: String,
  },

  /// A node execution received all of its inputs and was queued.
  NodeQueued {
    graph_exec_id: String,
    node_exec_id: String,
    node_id: String,
  },

  /// A node has started executing.
  NodeStarted {
    graph_exec_id: String,
    node_exec_id: String,
    node_id: String,
  },

  /// A node produced one output.
  NodeOutput {
    graph_exec_id: String,
    node_exec_id: String,
    node_id: String,
    output_name: String,
    data: serde_json::Value,
  },

  /// A node's block finished without error.
  NodeCompleted {
    graph_exec_id: String,
    node_exec_id: String,
    node_id: String,
  },

  /// A node has failed.
  NodeFailed {
    graph_exec_id: String,
    node_exec_id: String,
    node_id: String,
    error: String,
  },

  /// The run drained with no failed node.
  GraphCompleted { graph_exec_id: String },

  /// The run drained with at least one failed node, or could not start.
  GraphFailed {
    graph_exec_id: String,
    failed_nodes: usize,
  },
}

impl ExecutionEvent {
  pub fn graph_exec_id(&self) -> &str {
    match self {
      ExecutionEvent::GraphStarted { graph_exec_id, .. }
      | ExecutionEvent::NodeQueued { graph_exec_id, .. }
      | ExecutionEvent::NodeStarted { graph_exec_id, .. }
      | ExecutionEvent::NodeOutput { graph_exec_id, .. }
      | ExecutionEvent::NodeCompleted { graph_exec_id, .. }
      | ExecutionEvent::NodeFailed { graph_exec_id, .. }
      | ExecutionEvent::GraphCompleted { graph_exec_id }
      | ExecutionEvent::GraphFailed { graph_exec_id, .. } => graph_exec_id,
    }
  }

  /// Whether this event ends a run.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ExecutionEvent::GraphCompleted { .. } | ExecutionEvent::GraphFailed { .. }
    )
  }
}

/// Trait for receiving execution events.
///
/// Workers call `notify` for each event - implementations decide what to do
/// with them (broadcast, log, ignore, etc.).
pub trait ExecutionNotifier: Send + Sync {
  /// Called when an execution event occurs.
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  /// Create a new channel notifier.
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }

  /// Create a notifier together with the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
