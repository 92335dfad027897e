use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;

/// Upper bound for both worker pool sizes.
pub const MAX_WORKERS: usize = 100;

/// Configuration for the execution manager and its workers.
///
/// ```json
/// { "num_graph_workers": 4, "num_node_workers": 8 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  /// Graph executions running at once.
  pub num_graph_workers: usize,
  /// Node executions running at once within one graph execution.
  pub num_node_workers: usize,
  /// How long the orchestrator waits on an in-flight node before it
  /// re-checks its queue. Never cancels the node.
  pub node_wait_timeout_ms: u64,
  /// Poll interval for stores whose locks are polled (SQLite).
  pub lock_poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      num_graph_workers: 1,
      num_node_workers: 1,
      node_wait_timeout_ms: 3000,
      lock_poll_interval_ms: 25,
    }
  }
}

impl ExecutorConfig {
  pub fn validate(&self) -> Result<(), ExecutorError> {
    check_workers("num_graph_workers", self.num_graph_workers)?;
    check_workers("num_node_workers", self.num_node_workers)?;

    if self.node_wait_timeout_ms == 0 {
      return Err(ExecutorError::Config {
        message: "node_wait_timeout_ms must be greater than 0".to_string(),
      });
    }
    if self.lock_poll_interval_ms == 0 {
      return Err(ExecutorError::Config {
        message: "lock_poll_interval_ms must be greater than 0".to_string(),
      });
    }
    Ok(())
  }

  pub fn node_wait_timeout(&self) -> Duration {
    Duration::from_millis(self.node_wait_timeout_ms)
  }

  pub fn lock_poll_interval(&self) -> Duration {
    Duration::from_millis(self.lock_poll_interval_ms)
  }
}

fn check_workers(name: &str, value: usize) -> Result<(), ExecutorError> {
  if (1..=MAX_WORKERS).contains(&value) {
    Ok(())
  } else {
    Err(ExecutorError::Config {
      message: format!("{name} must be between 1 and {MAX_WORKERS}, got {value}"),
    })
  }
}
