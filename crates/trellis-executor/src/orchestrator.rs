//! Graph worker: schedules the node executions of one run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, instrument, warn};
use trellis_graph::Graph;
use trellis_store::{Error as StoreError, ExecutionStatus};

use crate::context::WorkerContext;
use crate::error::{ExecutorError, NotFoundKind};
use crate::events::ExecutionEvent;
use crate::execution::{GraphExecution, NodeExecution};
use crate::node::{NodeRunSummary, execute_node};
use crate::queue::NodeQueue;

/// Outcome of a drained run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
  pub graph_exec_id: String,
  pub status: ExecutionStatus,
  /// Node executions that completed.
  pub completed: usize,
  /// Node executions that failed or could not run.
  pub failed: usize,
}

type NodeTaskResult = Result<NodeRunSummary, ExecutorError>;

/// Node executions currently dispatched, at most one per node.
#[derive(Default)]
struct InFlight {
  /// task id -> (node_id, node_exec_id)
  tasks: HashMap<Id, (String, String)>,
  nodes: HashSet<String>,
}

impl InFlight {
  fn insert(&mut self, id: Id, exec: &NodeExecution) {
    self.nodes.insert(exec.node_id.clone());
    self
      .tasks
      .insert(id, (exec.node_id.clone(), exec.node_exec_id.clone()));
  }

  fn remove(&mut self, id: Id) -> Option<(String, String)> {
    let entry = self.tasks.remove(&id)?;
    self.nodes.remove(&entry.0);
    Some(entry)
  }

  fn contains_node(&self, node_id: &str) -> bool {
    self.nodes.contains(node_id)
  }
}

#[derive(Default)]
struct Tally {
  completed: usize,
  failed: usize,
}

/// Runs one graph execution to completion.
///
/// Ready executions are dispatched to spawned node tasks, bounded by a pool
/// of `num_node_workers` permits. Two executions of the same node never run
/// at once: a ready execution whose node is busy waits for it (bounded by
/// `node_wait_timeout_ms`) and is then put back on the queue. The run is
/// drained when the queue is empty and no node task is left.
pub struct GraphOrchestrator {
  ctx: Arc<WorkerContext>,
  node_pool: Arc<Semaphore>,
}

impl GraphOrchestrator {
  pub fn new(ctx: Arc<WorkerContext>) -> Self {
    let node_pool = Arc::new(Semaphore::new(ctx.config.num_node_workers));
    Self { ctx, node_pool }
  }

  #[instrument(
    name = "graph_execute",
    skip(self, job),
    fields(
      graph_exec_id = %job.graph_exec_id,
      graph_id = %job.graph_id,
    )
  )]
  pub async fn run(&self, job: GraphExecution) -> Result<RunSummary, ExecutorError> {
    let graph_exec_id = job.graph_exec_id.clone();
    let result = self.drive(job).await;
    if result.is_err() {
      self.abort(&graph_exec_id).await;
    }
    result
  }

  /// Every error returned from here leaves the run without a terminal event;
  /// [`Self::run`] records it as failed.
  async fn drive(&self, job: GraphExecution) -> Result<RunSummary, ExecutorError> {
    let graph = match self
      .ctx
      .store
      .get_graph(&job.graph_id, Some(job.graph_version))
      .await?
    {
      Some(graph) => Arc::new(graph),
      None => {
        error!(graph_version = job.graph_version, "graph not found");
        return Err(ExecutorError::not_found(NotFoundKind::Graph, &job.graph_id));
      }
    };

    self
      .ctx
      .store
      .update_graph_execution_status(&job.graph_exec_id, ExecutionStatus::Running)
      .await?;
    info!(start_nodes = job.start_node_execs.len(), "graph_started");
    self.ctx.notifier.notify(ExecutionEvent::GraphStarted {
      graph_exec_id: job.graph_exec_id.clone(),
      graph_id: job.graph_id.clone(),
    });

    let queue = Arc::new(NodeQueue::new());
    for exec in job.start_node_execs {
      queue.add(exec);
    }

    let mut tasks: JoinSet<NodeTaskResult> = JoinSet::new();
    let mut in_flight = InFlight::default();
    let mut tally = Tally::default();
    let wait_timeout = self.ctx.config.node_wait_timeout();

    loop {
      while let Some(joined) = tasks.try_join_next_with_id() {
        self.record(joined, &mut in_flight, &mut tally).await;
      }

      if let Some(exec) = queue.try_get() {
        if in_flight.contains_node(&exec.node_id) {
          self
            .wait_for_node(&exec.node_id, &mut tasks, &mut in_flight, &mut tally)
            .await;
          debug!(node_id = %exec.node_id, node_exec_id = %exec.node_exec_id, "re-enqueueing");
          queue.add(exec);
          continue;
        }

        let handle = tasks.spawn(self.node_task(graph.clone(), queue.clone(), exec.clone()));
        in_flight.insert(handle.id(), &exec);
        continue;
      }

      if tasks.is_empty() {
        break;
      }

      // Queue is empty but nodes are still running. Waiting never cancels a
      // node; it only wakes the loop to look at the queue again.
      tokio::select! {
        Some(joined) = tasks.join_next_with_id() => {
          self.record(joined, &mut in_flight, &mut tally).await;
        }
        _ = queue.wait_for_item() => {}
        _ = tokio::time::sleep(wait_timeout) => {
          debug!(running = in_flight.nodes.len(), "waiting for running nodes");
        }
      }
    }

    let status = if tally.failed > 0 {
      ExecutionStatus::Failed
    } else {
      ExecutionStatus::Completed
    };
    self
      .ctx
      .store
      .update_graph_execution_status(&job.graph_exec_id, status)
      .await?;

    if status == ExecutionStatus::Completed {
      info!(completed = tally.completed, "graph_completed");
      self.ctx.notifier.notify(ExecutionEvent::GraphCompleted {
        graph_exec_id: job.graph_exec_id.clone(),
      });
    } else {
      warn!(completed = tally.completed, failed = tally.failed, "graph_failed");
      self.ctx.notifier.notify(ExecutionEvent::GraphFailed {
        graph_exec_id: job.graph_exec_id.clone(),
        failed_nodes: tally.failed,
      });
    }

    Ok(RunSummary {
      graph_exec_id: job.graph_exec_id,
      status,
      completed: tally.completed,
      failed: tally.failed,
    })
  }

  /// Build the task running one node execution under a pool permit.
  fn node_task(
    &self,
    graph: Arc<Graph>,
    queue: Arc<NodeQueue>,
    exec: NodeExecution,
  ) -> impl std::future::Future<Output = NodeTaskResult> + Send + 'static {
    let ctx = self.ctx.clone();
    let pool = self.node_pool.clone();
    async move {
      let _permit = pool
        .acquire_owned()
        .await
        .map_err(|e| ExecutorError::Worker {
          node_id: exec.node_id.clone(),
          message: e.to_string(),
        })?;
      execute_node(&ctx, &graph, &queue, exec).await
    }
    .in_current_span()
  }

  /// Wait for the in-flight execution of `node_id`, up to the node wait
  /// timeout. Other executions finishing meanwhile are recorded too.
  async fn wait_for_node(
    &self,
    node_id: &str,
    tasks: &mut JoinSet<NodeTaskResult>,
    in_flight: &mut InFlight,
    tally: &mut Tally,
  ) {
    let deadline = tokio::time::Instant::now() + self.ctx.config.node_wait_timeout();
    while in_flight.contains_node(node_id) {
      match tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
        Ok(Some(joined)) => self.record(joined, in_flight, tally).await,
        Ok(None) => break,
        Err(_) => {
          debug!(node_id = %node_id, "node still running");
          break;
        }
      }
    }
  }

  async fn record(
    &self,
    joined: Result<(Id, NodeTaskResult), JoinError>,
    in_flight: &mut InFlight,
    tally: &mut Tally,
  ) {
    let (id, outcome) = match joined {
      Ok((id, result)) => (id, result),
      Err(join_err) => {
        let id = join_err.id();
        let message = if join_err.is_panic() {
          "node worker panicked".to_string()
        } else {
          join_err.to_string()
        };
        let node_id = in_flight
          .tasks
          .get(&id)
          .map(|(node_id, _)| node_id.clone())
          .unwrap_or_default();
        (id, Err(ExecutorError::Worker { node_id, message }))
      }
    };

    let Some((node_id, node_exec_id)) = in_flight.remove(id) else {
      warn!(task_id = %id, "finished task was not tracked");
      return;
    };

    match outcome {
      Ok(summary) => {
        debug!(node_id = %node_id, outputs = summary.outputs, "node finished");
        tally.completed += 1;
      }
      // Already persisted as FAILED by the node worker.
      Err(ExecutorError::BlockExecution { .. }) => {
        tally.failed += 1;
      }
      Err(e) => {
        error!(node_id = %node_id, node_exec_id = %node_exec_id, error = %e, "node execution aborted");
        tally.failed += 1;
        self.mark_failed(&node_id, &node_exec_id, &e).await;
      }
    }
  }

  /// Best-effort: record a failure the node worker could not record itself.
  async fn mark_failed(&self, node_id: &str, node_exec_id: &str, err: &ExecutorError) {
    let store = &self.ctx.store;
    let message = err.to_string();

    if let Err(e) = store
      .upsert_execution_output(node_exec_id, "error", message.clone().into())
      .await
    {
      warn!(node_exec_id = %node_exec_id, error = %e, "failed to persist error output");
    }
    match store
      .update_execution_status(node_exec_id, ExecutionStatus::Failed)
      .await
    {
      Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
      Err(e) => warn!(node_exec_id = %node_exec_id, error = %e, "failed to mark execution failed"),
    }

    if let Ok(record) = store.get_node_execution(node_exec_id).await {
      self.ctx.notifier.notify(ExecutionEvent::NodeFailed {
        graph_exec_id: record.graph_exec_id,
        node_exec_id: node_exec_id.to_string(),
        node_id: node_id.to_string(),
        error: message,
      });
    }
  }

  /// Best-effort: fail a run that could not be driven to its end.
  async fn abort(&self, graph_exec_id: &str) {
    if let Err(e) = self
      .ctx
      .store
      .update_graph_execution_status(graph_exec_id, ExecutionStatus::Failed)
      .await
    {
      warn!(error = %e, "failed to mark graph execution failed");
    }
    self.ctx.notifier.notify(ExecutionEvent::GraphFailed {
      graph_exec_id: graph_exec_id.to_string(),
      failed_nodes: 0,
    });
  }
}
