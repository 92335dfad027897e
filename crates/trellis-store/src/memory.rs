use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use trellis_graph::{BlockInput, Graph};

use crate::types::{check_transition, new_id, transition_timestamps};
use crate::{Error, ExecutionStatus, GraphExecutionRecord, NodeExecutionRecord, Store};

#[derive(Default)]
struct State {
  /// (graph_id, version) -> graph
  graphs: BTreeMap<(String, u32), Graph>,
  graph_executions: HashMap<String, GraphExecutionRecord>,
  node_executions: HashMap<String, NodeExecutionRecord>,
  /// node_exec_ids in creation order.
  node_order: Vec<String>,
}

/// In-process store.
///
/// Locks are only exclusive between tasks sharing this instance.
#[derive(Default)]
pub struct MemoryStore {
  state: Mutex<State>,
  locks: Mutex<HashSet<String>>,
  lock_released: Notify,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn locks(&self) -> MutexGuard<'_, HashSet<String>> {
    self.locks.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn new_node_execution(graph_exec_id: &str, node_id: &str, input_data: BlockInput) -> NodeExecutionRecord {
  NodeExecutionRecord {
    node_exec_id: new_id(),
    graph_exec_id: graph_exec_id.to_string(),
    node_id: node_id.to_string(),
    status: ExecutionStatus::Incomplete,
    input_data,
    output_data: BTreeMap::new(),
    created_at: Utc::now(),
    started_at: None,
    ended_at: None,
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_graph(&self, graph: &Graph) -> Result<(), Error> {
    self
      .state()
      .graphs
      .insert((graph.id().to_string(), graph.version()), graph.clone());
    Ok(())
  }

  async fn get_graph(&self, graph_id: &str, version: Option<u32>) -> Result<Option<Graph>, Error> {
    let state = self.state();
    let graph = match version {
      Some(version) => state.graphs.get(&(graph_id.to_string(), version)),
      None => state
        .graphs
        .range((graph_id.to_string(), 0)..=(graph_id.to_string(), u32::MAX))
        .next_back()
        .map(|(_, graph)| graph),
    };
    Ok(graph.cloned())
  }

  async fn create_graph_execution(
    &self,
    graph_id: &str,
    graph_version: u32,
    nodes_input: Vec<(String, BlockInput)>,
  ) -> Result<(GraphExecutionRecord, Vec<NodeExecutionRecord>), Error> {
    let graph_exec = GraphExecutionRecord {
      graph_exec_id: new_id(),
      graph_id: graph_id.to_string(),
      graph_version,
      status: ExecutionStatus::Queued,
      created_at: Utc::now(),
      started_at: None,
      ended_at: None,
    };

    let seeds: Vec<NodeExecutionRecord> = nodes_input
      .into_iter()
      .map(|(node_id, input)| new_node_execution(&graph_exec.graph_exec_id, &node_id, input))
      .collect();

    let mut state = self.state();
    state
      .graph_executions
      .insert(graph_exec.graph_exec_id.clone(), graph_exec.clone());
    for seed in &seeds {
      state.node_order.push(seed.node_exec_id.clone());
      state
        .node_executions
        .insert(seed.node_exec_id.clone(), seed.clone());
    }

    Ok((graph_exec, seeds))
  }

  async fn get_graph_execution(&self, graph_exec_id: &str) -> Result<GraphExecutionRecord, Error> {
    self
      .state()
      .graph_executions
      .get(graph_exec_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("graph execution {graph_exec_id}")))
  }

  async fn list_graph_executions(&self, graph_id: &str) -> Result<Vec<GraphExecutionRecord>, Error> {
    let mut executions: Vec<GraphExecutionRecord> = self
      .state()
      .graph_executions
      .values()
      .filter(|exec| exec.graph_id == graph_id)
      .cloned()
      .collect();
    executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(executions)
  }

  async fn update_graph_execution_status(
    &self,
    graph_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<(), Error> {
    let mut state = self.state();
    let exec = state
      .graph_executions
      .get_mut(graph_exec_id)
      .ok_or_else(|| Error::NotFound(format!("graph execution {graph_exec_id}")))?;

    if check_transition(graph_exec_id, exec.status, status)? {
      let (started_at, ended_at) = transition_timestamps(status, exec.started_at, exec.ended_at);
      exec.status = status;
      exec.started_at = started_at;
      exec.ended_at = ended_at;
    }
    Ok(())
  }

  async fn upsert_execution_input(
    &self,
    node_id: &str,
    graph_exec_id: &str,
    input_name: &str,
    data: Value,
  ) -> Result<String, Error> {
    let mut state = self.state();
    if !state.graph_executions.contains_key(graph_exec_id) {
      return Err(Error::NotFound(format!("graph execution {graph_exec_id}")));
    }

    let existing = state
      .node_order
      .iter()
      .find(|id| {
        state.node_executions.get(*id).is_some_and(|exec| {
          exec.graph_exec_id == graph_exec_id
            && exec.node_id == node_id
            && exec.status == ExecutionStatus::Incomplete
            && !exec.input_data.contains_key(input_name)
        })
      })
      .cloned();

    if let Some(node_exec_id) = existing {
      if let Some(exec) = state.node_executions.get_mut(&node_exec_id) {
        exec.input_data.insert(input_name.to_string(), data);
      }
      return Ok(node_exec_id);
    }

    let mut input = BlockInput::new();
    input.insert(input_name.to_string(), data);
    let exec = new_node_execution(graph_exec_id, node_id, input);
    let node_exec_id = exec.node_exec_id.clone();
    state.node_order.push(node_exec_id.clone());
    state.node_executions.insert(node_exec_id.clone(), exec);
    Ok(node_exec_id)
  }

  async fn get_node_execution(&self, node_exec_id: &str) -> Result<NodeExecutionRecord, Error> {
    self
      .state()
      .node_executions
      .get(node_exec_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("node execution {node_exec_id}")))
  }

  async fn get_execution_input(&self, node_exec_id: &str) -> Result<BlockInput, Error> {
    self
      .get_node_execution(node_exec_id)
      .await
      .map(|exec| exec.input_data)
  }

  async fn list_node_executions(&self, graph_exec_id: &str) -> Result<Vec<NodeExecutionRecord>, Error> {
    let state = self.state();
    Ok(
      state
        .node_order
        .iter()
        .filter_map(|id| state.node_executions.get(id))
        .filter(|exec| exec.graph_exec_id == graph_exec_id)
        .cloned()
        .collect(),
    )
  }

  async fn upsert_execution_output(
    &self,
    node_exec_id: &str,
    output_name: &str,
    data: Value,
  ) -> Result<(), Error> {
    let mut state = self.state();
    let exec = state
      .node_executions
      .get_mut(node_exec_id)
      .ok_or_else(|| Error::NotFound(format!("node execution {node_exec_id}")))?;
    exec
      .output_data
      .entry(output_name.to_string())
      .or_default()
      .push(data);
    Ok(())
  }

  async fn update_execution_status(
    &self,
    node_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<bool, Error> {
    let mut state = self.state();
    let exec = state
      .node_executions
      .get_mut(node_exec_id)
      .ok_or_else(|| Error::NotFound(format!("node execution {node_exec_id}")))?;

    if !check_transition(node_exec_id, exec.status, status)? {
      return Ok(false);
    }
    let (started_at, ended_at) = transition_timestamps(status, exec.started_at, exec.ended_at);
    exec.status = status;
    exec.started_at = started_at;
    exec.ended_at = ended_at;
    Ok(true)
  }

  async fn acquire_lock(&self, key: &str) -> Result<(), Error> {
    loop {
      let released = self.lock_released.notified();
      tokio::pin!(released);
      // Register interest before checking so a release in between is not missed.
      released.as_mut().enable();

      if self.locks().insert(key.to_string()) {
        return Ok(());
      }
      released.await;
    }
  }

  async fn release_lock(&self, key: &str) -> Result<(), Error> {
    if self.locks().remove(key) {
      self.lock_released.notify_waiters();
    }
    Ok(())
  }
}
