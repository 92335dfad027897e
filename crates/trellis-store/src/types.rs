use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trellis_graph::BlockInput;

use crate::Error;

/// Status of a graph or node execution.
///
/// Statuses only move forward:
/// `INCOMPLETE -> QUEUED -> RUNNING -> {COMPLETED | FAILED}`.
/// Graph executions start at `QUEUED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
  /// Still accumulating inputs.
  Incomplete,
  Queued,
  Running,
  Completed,
  Failed,
}

impl ExecutionStatus {
  fn rank(self) -> u8 {
    match self {
      ExecutionStatus::Incomplete => 0,
      ExecutionStatus::Queued => 1,
      ExecutionStatus::Running => 2,
      ExecutionStatus::Completed | ExecutionStatus::Failed => 3,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ExecutionStatus::Incomplete => "INCOMPLETE",
      ExecutionStatus::Queued => "QUEUED",
      ExecutionStatus::Running => "RUNNING",
      ExecutionStatus::Completed => "COMPLETED",
      ExecutionStatus::Failed => "FAILED",
    }
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Decide whether `from -> to` is a legal status change for record `id`.
///
/// Returns `Ok(true)` when the status advances, `Ok(false)` when `to` equals
/// `from`, and [`Error::InvalidTransition`] for backward or sideways moves.
pub fn check_transition(id: &str, from: ExecutionStatus, to: ExecutionStatus) -> Result<bool, Error> {
  if from == to {
    return Ok(false);
  }
  if to.rank() <= from.rank() {
    return Err(Error::InvalidTransition {
      id: id.to_string(),
      from,
      to,
    });
  }
  Ok(true)
}

/// Timestamps after moving to `to`, given the current ones.
pub(crate) fn transition_timestamps(
  to: ExecutionStatus,
  started_at: Option<DateTime<Utc>>,
  ended_at: Option<DateTime<Utc>>,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
  let now = Utc::now();
  let started_at = match to {
    ExecutionStatus::Running => Some(now),
    _ if to.is_terminal() => started_at.or(Some(now)),
    _ => started_at,
  };
  let ended_at = if to.is_terminal() { Some(now) } else { ended_at };
  (started_at, ended_at)
}

/// One run of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GraphExecutionRecord {
  pub graph_exec_id: String,
  pub graph_id: String,
  pub graph_version: u32,
  pub status: ExecutionStatus,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
}

/// One run of a node within a graph execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
  pub node_exec_id: String,
  pub graph_exec_id: String,
  pub node_id: String,
  pub status: ExecutionStatus,
  /// Accumulated input, keyed by input pin.
  pub input_data: BlockInput,
  /// Produced outputs, keyed by output pin, in production order.
  pub output_data: BTreeMap<String, Vec<serde_json::Value>>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub ended_at: Option<DateTime<Utc>>,
}

pub(crate) fn new_id() -> String {
  uuid::Uuid::new_v4().to_string()
}
