//! Execution manager: accepts runs and feeds them to graph workers.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, instrument, warn};
use trellis_graph::{BlockInput, Graph, GraphDef};
use trellis_store::{ExecutionStatus, NodeExecutionRecord};

use crate::context::WorkerContext;
use crate::error::{ExecutorError, NotFoundKind};
use crate::execution::{GraphExecution, NodeExecution};
use crate::input::validate_exec;
use crate::orchestrator::GraphOrchestrator;
use crate::queue::GraphQueue;

/// Returned by [`ExecutionManager::add_execution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
  pub graph_exec_id: String,
}

/// Entry point for scheduling graph executions.
///
/// `add_execution` validates and persists a run, then queues it. `run` is the
/// service loop that hands queued runs to at most `num_graph_workers`
/// [`GraphOrchestrator`]s at a time.
pub struct ExecutionManager {
  ctx: Arc<WorkerContext>,
  queue: Arc<GraphQueue>,
}

impl ExecutionManager {
  pub fn new(ctx: WorkerContext) -> Self {
    Self {
      ctx: Arc::new(ctx),
      queue: Arc::new(GraphQueue::new()),
    }
  }

  pub fn context(&self) -> &WorkerContext {
    &self.ctx
  }

  /// Validate a graph definition against the registry and store it.
  pub async fn add_graph(&self, def: GraphDef) -> Result<Graph, ExecutorError> {
    let graph = Graph::new(def)?;
    graph.validate_blocks(&self.ctx.registry)?;
    self.ctx.store.create_graph(&graph).await?;
    info!(graph_id = %graph.id(), version = graph.version(), "graph_stored");
    Ok(graph)
  }

  /// Create a run of the latest version of `graph_id` and queue it.
  ///
  /// Every starting node receives `input` and must accept it. Nothing is
  /// persisted if the graph is unknown or any starting node rejects it. A run
  /// whose starting nodes cannot be queued is left `FAILED`.
  #[instrument(name = "add_execution", skip_all, fields(graph_id = %graph_id))]
  pub async fn add_execution(
    &self,
    graph_id: &str,
    input: BlockInput,
  ) -> Result<ExecutionHandle, ExecutorError> {
    let Some(graph) = self.ctx.store.get_graph(graph_id, None).await? else {
      return Err(ExecutorError::not_found(NotFoundKind::Graph, graph_id));
    };

    let mut seeds = Vec::with_capacity(graph.starting_nodes().len());
    for node_id in graph.starting_nodes() {
      let node = graph
        .node(node_id)
        .ok_or_else(|| ExecutorError::not_found(NotFoundKind::Node, node_id))?;
      let data = validate_exec(node, &self.ctx.registry, &input, true)?;
      seeds.push((node_id.clone(), data));
    }

    let (record, seed_records) = self
      .ctx
      .store
      .create_graph_execution(graph.id(), graph.version(), seeds)
      .await?;

    let mut start_node_execs = Vec::with_capacity(seed_records.len());
    for seed in seed_records {
      if let Err(e) = self
        .ctx
        .store
        .update_execution_status(&seed.node_exec_id, ExecutionStatus::Queued)
        .await
      {
        error!(graph_exec_id = %record.graph_exec_id, error = %e, "failed to queue starting node");
        self.abandon(&record.graph_exec_id).await;
        return Err(e.into());
      }
      start_node_execs.push(NodeExecution {
        graph_exec_id: record.graph_exec_id.clone(),
        node_exec_id: seed.node_exec_id,
        node_id: seed.node_id,
        data: seed.input_data,
      });
    }

    info!(
      graph_exec_id = %record.graph_exec_id,
      start_nodes = start_node_execs.len(),
      "execution_queued"
    );
    self.queue.add(GraphExecution {
      graph_exec_id: record.graph_exec_id.clone(),
      graph_id: record.graph_id,
      graph_version: record.graph_version,
      start_node_execs,
    });

    Ok(ExecutionHandle {
      graph_exec_id: record.graph_exec_id,
    })
  }

  /// Best-effort: fail a persisted run that never reached the queue.
  async fn abandon(&self, graph_exec_id: &str) {
    if let Err(e) = self
      .ctx
      .store
      .update_graph_execution_status(graph_exec_id, ExecutionStatus::Failed)
      .await
    {
      warn!(graph_exec_id = %graph_exec_id, error = %e, "failed to mark graph execution failed");
    }
  }

  /// Persisted node executions of a run, in creation order.
  pub async fn get_results(
    &self,
    graph_exec_id: &str,
  ) -> Result<Vec<NodeExecutionRecord>, ExecutorError> {
    Ok(self.ctx.store.list_node_executions(graph_exec_id).await?)
  }

  /// Runs waiting for a graph worker.
  pub fn pending(&self) -> usize {
    self.queue.len()
  }

  /// Serve queued runs until `cancel` fires.
  ///
  /// Cancellation stops the intake only. Runs already handed to a graph
  /// worker are awaited before this returns.
  pub async fn run(&self, cancel: CancellationToken) {
    let pool = Arc::new(Semaphore::new(self.ctx.config.num_graph_workers));
    let mut runs: JoinSet<()> = JoinSet::new();
    info!(
      graph_workers = self.ctx.config.num_graph_workers,
      node_workers = self.ctx.config.num_node_workers,
      "execution_manager_started"
    );

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        Some(joined) = runs.join_next(), if !runs.is_empty() => {
          if let Err(e) = joined {
            error!(error = %e, "graph worker panicked");
          }
        }
        job = self.queue.get() => {
          let permit = tokio::select! {
            _ = cancel.cancelled() => {
              self.queue.add(job);
              break;
            }
            permit = pool.clone().acquire_owned() => permit,
          };
          let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
              error!(error = %e, "graph worker pool closed");
              self.queue.add(job);
              break;
            }
          };

          let orchestrator = GraphOrchestrator::new(self.ctx.clone());
          runs.spawn(
            async move {
              let _permit = permit;
              let graph_exec_id = job.graph_exec_id.clone();
              if let Err(e) = orchestrator.run(job).await {
                warn!(graph_exec_id = %graph_exec_id, error = %e, "graph execution aborted");
              }
            }
            .in_current_span(),
          );
        }
      }
    }

    info!(in_flight = runs.len(), "execution_manager_stopping");
    while let Some(joined) = runs.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "graph worker panicked");
      }
    }
  }
}
