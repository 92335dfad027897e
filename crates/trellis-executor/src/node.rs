//! Node worker: runs one node execution and fans its outputs out downstream.

use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};
use trellis_graph::{BlockData, BlockError, Graph, Link, Node};
use trellis_store::{Error as StoreError, ExecutionStatus};

use crate::context::WorkerContext;
use crate::error::{ExecutorError, NotFoundKind, ValidationKind};
use crate::events::ExecutionEvent;
use crate::execution::NodeExecution;
use crate::input::{parse_execution_output, validate_exec};
use crate::lock::{synchronized, upsert_lock_key};
use crate::queue::NodeQueue;

/// Outcome of a successful node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRunSummary {
  pub node_exec_id: String,
  pub node_id: String,
  /// Outputs the block produced.
  pub outputs: usize,
  /// Downstream executions this run made ready.
  pub enqueued: usize,
}

/// Execute a ready node execution.
///
/// Each output is persisted, then fanned out along the node's output links;
/// downstream executions that became ready are pushed onto `queue` right
/// away. The execution is marked `COMPLETED` once the block's stream ends.
/// If the block fails, an `error` output is persisted, the execution is
/// marked `FAILED`, and [`ExecutorError::BlockExecution`] is returned.
#[instrument(
  name = "node_execute",
  skip(ctx, graph, queue, exec),
  fields(
    graph_exec_id = %exec.graph_exec_id,
    node_exec_id = %exec.node_exec_id,
    node_id = %exec.node_id,
  )
)]
pub async fn execute_node(
  ctx: &WorkerContext,
  graph: &Graph,
  queue: &NodeQueue,
  exec: NodeExecution,
) -> Result<NodeRunSummary, ExecutorError> {
  let Some(node) = graph.node(&exec.node_id) else {
    error!("node not found");
    return Err(ExecutorError::not_found(NotFoundKind::Node, &exec.node_id));
  };
  let Some(block) = ctx.registry.get(&node.block_id) else {
    error!(block_id = %node.block_id, "block not found");
    return Err(ExecutorError::not_found(NotFoundKind::Block, &node.block_id));
  };

  // Dynamic pins were merged when the execution became ready.
  let input = match validate_exec(node, &ctx.registry, &exec.data, false) {
    Ok(input) => input,
    Err(e) => {
      error!(error = %e, "skipping execution, input validation failed");
      return Err(e.into());
    }
  };

  ctx
    .store
    .update_execution_status(&exec.node_exec_id, ExecutionStatus::Running)
    .await?;
  info!(block = %block.name(), "node_started");
  ctx.notifier.notify(ExecutionEvent::NodeStarted {
    graph_exec_id: exec.graph_exec_id.clone(),
    node_exec_id: exec.node_exec_id.clone(),
    node_id: exec.node_id.clone(),
  });

  let mut outputs = block.execute(input);
  let mut produced = 0;
  let mut enqueued = 0;

  while let Some(item) = outputs.next().await {
    let (output_name, data) = match item {
      Ok(output) => output,
      Err(err) => return Err(fail_node(ctx, &exec, err).await),
    };

    debug!(output_name = %output_name, data = %data, "node_output");
    ctx
      .store
      .upsert_execution_output(&exec.node_exec_id, &output_name, data.clone())
      .await?;
    ctx.notifier.notify(ExecutionEvent::NodeOutput {
      graph_exec_id: exec.graph_exec_id.clone(),
      node_exec_id: exec.node_exec_id.clone(),
      node_id: exec.node_id.clone(),
      output_name: output_name.clone(),
      data: data.clone(),
    });
    produced += 1;

    let output = (output_name, data);
    for next in enqueue_next_nodes(ctx, graph, node, &exec.graph_exec_id, &output).await {
      queue.add(next);
      enqueued += 1;
    }
  }

  ctx
    .store
    .update_execution_status(&exec.node_exec_id, ExecutionStatus::Completed)
    .await?;
  info!(outputs = produced, enqueued, "node_completed");
  ctx.notifier.notify(ExecutionEvent::NodeCompleted {
    graph_exec_id: exec.graph_exec_id.clone(),
    node_exec_id: exec.node_exec_id.clone(),
    node_id: exec.node_id.clone(),
  });

  Ok(NodeRunSummary {
    node_exec_id: exec.node_exec_id,
    node_id: exec.node_id,
    outputs: produced,
    enqueued,
  })
}

/// Persist a block failure and build the error reported to the orchestrator.
async fn fail_node(ctx: &WorkerContext, exec: &NodeExecution, err: BlockError) -> ExecutorError {
  let message = err.to_string();
  error!(error = %message, "node_failed");

  if let Err(e) = ctx
    .store
    .upsert_execution_output(&exec.node_exec_id, "error", message.clone().into())
    .await
  {
    error!(error = %e, "failed to persist error output");
  }
  if let Err(e) = ctx
    .store
    .update_execution_status(&exec.node_exec_id, ExecutionStatus::Failed)
    .await
  {
    error!(error = %e, "failed to mark execution failed");
  }

  ctx.notifier.notify(ExecutionEvent::NodeFailed {
    graph_exec_id: exec.graph_exec_id.clone(),
    node_exec_id: exec.node_exec_id.clone(),
    node_id: exec.node_id.clone(),
    error: message,
  });

  ExecutorError::BlockExecution {
    node_id: exec.node_id.clone(),
    category: err.category,
    message: err.message,
  }
}

/// Deliver one output along every matching output link of `node` and
/// return the downstream executions that became ready.
///
/// A failing link is logged and skipped; the others are unaffected.
pub async fn enqueue_next_nodes(
  ctx: &WorkerContext,
  graph: &Graph,
  node: &Node,
  graph_exec_id: &str,
  output: &BlockData,
) -> Vec<NodeExecution> {
  let mut ready = Vec::new();
  for link in &node.output_links {
    match register_next_execution(ctx, graph, link, graph_exec_id, output).await {
      Ok(Some(next)) => ready.push(next),
      Ok(None) => {}
      Err(e) => {
        warn!(
          sink_id = %link.sink_id,
          sink_name = %link.sink_name,
          error = %e,
          "failed to deliver output downstream"
        );
      }
    }
  }
  ready
}

async fn register_next_execution(
  ctx: &WorkerContext,
  graph: &Graph,
  link: &Link,
  graph_exec_id: &str,
  output: &BlockData,
) -> Result<Option<NodeExecution>, ExecutorError> {
  let Some(data) = parse_execution_output(output, &link.source_name) else {
    return Ok(None);
  };

  let next_node = graph
    .node(&link.sink_id)
    .ok_or_else(|| ExecutorError::not_found(NotFoundKind::Node, &link.sink_id))?;

  let key = upsert_lock_key(&next_node.id, graph_exec_id);
  let next_exec_id = synchronized(
    ctx.store.as_ref(),
    &key,
    ctx
      .store
      .upsert_execution_input(&next_node.id, graph_exec_id, &link.sink_name, data),
  )
  .await??;

  let accumulated = ctx.store.get_execution_input(&next_exec_id).await?;
  let link_desc = format!("{}>{}~{}", link.source_name, link.sink_name, next_node.id);

  let data = match validate_exec(next_node, &ctx.registry, &accumulated, true) {
    Ok(data) => data,
    Err(e) if e.kind == ValidationKind::MissingUpstream => {
      debug!(link = %link_desc, reason = %e, "downstream input incomplete");
      return Ok(None);
    }
    Err(e) => {
      warn!(link = %link_desc, reason = %e, "skipped queueing downstream node");
      return Ok(None);
    }
  };

  match ctx
    .store
    .update_execution_status(&next_exec_id, ExecutionStatus::Queued)
    .await
  {
    Ok(true) => {}
    // Another upstream completed the same input first and queued it.
    Ok(false) | Err(StoreError::InvalidTransition { .. }) => return Ok(None),
    Err(e) => return Err(e.into()),
  }

  info!(link = %link_desc, node_exec_id = %next_exec_id, "node_enqueued");
  ctx.notifier.notify(ExecutionEvent::NodeQueued {
    graph_exec_id: graph_exec_id.to_string(),
    node_exec_id: next_exec_id.clone(),
    node_id: next_node.id.clone(),
  });

  Ok(Some(NodeExecution {
    graph_exec_id: graph_exec_id.to_string(),
    node_exec_id: next_exec_id,
    node_id: next_node.id.clone(),
    data,
  }))
}
