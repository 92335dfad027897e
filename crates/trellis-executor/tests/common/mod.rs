#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trellis_executor::{
  ChannelNotifier, ExecutionEvent, ExecutionHandle, ExecutionManager, ExecutorConfig,
  WorkerContext,
};
use trellis_graph::{
  Block, BlockData, BlockError, BlockInput, BlockOutput, BlockRegistry, BlockSchema, Graph, GraphDef,
  Link, NodeDef,
};
use trellis_store::{
  Error as StoreError, ExecutionStatus, GraphExecutionRecord, MemoryStore, NodeExecutionRecord, Store,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Records what a test block saw.
#[derive(Default)]
pub struct Stats {
  current: AtomicUsize,
  max: AtomicUsize,
  inputs: Mutex<Vec<BlockInput>>,
}

impl Stats {
  fn enter(&self, input: &BlockInput) {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.max.fetch_max(now, Ordering::SeqCst);
    self.inputs.lock().unwrap().push(input.clone());
  }

  fn exit(&self) {
    self.current.fetch_sub(1, Ordering::SeqCst);
  }

  pub fn max_concurrency(&self) -> usize {
    self.max.load(Ordering::SeqCst)
  }

  pub fn inputs(&self) -> Vec<BlockInput> {
    self.inputs.lock().unwrap().clone()
  }

  pub fn runs(&self) -> usize {
    self.inputs.lock().unwrap().len()
  }
}

fn schema(value: Value) -> BlockSchema {
  BlockSchema::new(value)
}

/// Forwards `value` on `output` after sleeping `delay_ms`.
struct ProbeBlock {
  stats: Arc<Stats>,
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl ProbeBlock {
  fn new(stats: Arc<Stats>) -> Self {
    Self {
      stats,
      input_schema: schema(json!({
        "properties": { "value": {}, "delay_ms": { "type": "integer" } },
        "required": ["value"]
      })),
      output_schema: schema(json!({ "properties": { "output": {} } })),
    }
  }
}

impl Block for ProbeBlock {
  fn id(&self) -> &str {
    "probe"
  }

  fn name(&self) -> &str {
    "Probe"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, input: BlockInput) -> BlockOutput {
    let stats = self.stats.clone();
    futures::stream::once(async move {
      stats.enter(&input);
      let delay = input.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
      tokio::time::sleep(Duration::from_millis(delay)).await;
      stats.exit();
      Ok(("output".to_string(), input["value"].clone()))
    })
    .boxed()
  }
}

/// Emits `[left, right]` on `output`.
struct PairBlock {
  stats: Arc<Stats>,
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl PairBlock {
  fn new(stats: Arc<Stats>) -> Self {
    Self {
      stats,
      input_schema: schema(json!({
        "properties": { "left": {}, "right": {} },
        "required": ["left", "right"]
      })),
      output_schema: schema(json!({ "properties": { "output": { "type": "array" } } })),
    }
  }
}

impl Block for PairBlock {
  fn id(&self) -> &str {
    "pair"
  }

  fn name(&self) -> &str {
    "Pair"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, input: BlockInput) -> BlockOutput {
    self.stats.enter(&input);
    self.stats.exit();
    let pair = json!([input["left"], input["right"]]);
    futures::stream::iter([Ok(("output".to_string(), pair))]).boxed()
  }
}

/// Emits `value` on `output`, `times` times.
struct RepeatBlock {
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl RepeatBlock {
  fn new() -> Self {
    Self {
      input_schema: schema(json!({
        "properties": { "value": {}, "times": { "type": "integer" } },
        "required": ["value", "times"]
      })),
      output_schema: schema(json!({ "properties": { "output": {} } })),
    }
  }
}

impl Block for RepeatBlock {
  fn id(&self) -> &str {
    "repeat"
  }

  fn name(&self) -> &str {
    "Repeat"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, input: BlockInput) -> BlockOutput {
    let times = input["times"].as_u64().unwrap_or(0) as usize;
    let value = input["value"].clone();
    futures::stream::iter((0..times).map(move |_| Ok(("output".to_string(), value.clone()))))
      .boxed()
  }
}

/// Always fails with `ValueError: boom`.
struct FailBlock {
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl Block for FailBlock {
  fn id(&self) -> &str {
    "fail"
  }

  fn name(&self) -> &str {
    "Fail"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, _input: BlockInput) -> BlockOutput {
    futures::stream::iter([Err(BlockError::new("ValueError", "boom"))]).boxed()
  }
}

/// Panics when polled.
struct PanicBlock {
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl Block for PanicBlock {
  fn id(&self) -> &str {
    "panic"
  }

  fn name(&self) -> &str {
    "Panic"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, _input: BlockInput) -> BlockOutput {
    futures::stream::poll_fn(|_| -> Poll<Option<Result<BlockData, BlockError>>> {
      panic!("block exploded")
    })
    .boxed()
  }
}

/// Emits `value` on `first`, waits for the gate, then emits it on `second`.
struct GatedBlock {
  gate: Arc<Notify>,
  input_schema: BlockSchema,
  output_schema: BlockSchema,
}

impl Block for GatedBlock {
  fn id(&self) -> &str {
    "gated"
  }

  fn name(&self) -> &str {
    "Gated"
  }

  fn input_schema(&self) -> &BlockSchema {
    &self.input_schema
  }

  fn output_schema(&self) -> &BlockSchema {
    &self.output_schema
  }

  fn execute(&self, input: BlockInput) -> BlockOutput {
    let value = input.get("value").cloned().unwrap_or(Value::Null);
    let gate = self.gate.clone();
    let first = futures::stream::iter([Ok(("first".to_string(), value.clone()))]);
    let second = futures::stream::once(async move {
      gate.notified().await;
      Ok(("second".to_string(), value))
    });
    first.chain(second).boxed()
  }
}

/// A [`MemoryStore`] that refuses to move records into chosen statuses.
#[derive(Default)]
pub struct FaultyStore {
  pub inner: MemoryStore,
  /// Graph execution status writes that fail.
  pub graph_status: Option<ExecutionStatus>,
  /// Node execution status writes that fail.
  pub node_status: Option<ExecutionStatus>,
}

fn refused(status: ExecutionStatus) -> StoreError {
  StoreError::NotFound(format!("refused status write: {status}"))
}

#[async_trait]
impl Store for FaultyStore {
  async fn create_graph(&self, graph: &Graph) -> Result<(), StoreError> {
    self.inner.create_graph(graph).await
  }

  async fn get_graph(&self, graph_id: &str, version: Option<u32>) -> Result<Option<Graph>, StoreError> {
    self.inner.get_graph(graph_id, version).await
  }

  async fn create_graph_execution(
    &self,
    graph_id: &str,
    graph_version: u32,
    nodes_input: Vec<(String, BlockInput)>,
  ) -> Result<(GraphExecutionRecord, Vec<NodeExecutionRecord>), StoreError> {
    self
      .inner
      .create_graph_execution(graph_id, graph_version, nodes_input)
      .await
  }

  async fn get_graph_execution(&self, graph_exec_id: &str) -> Result<GraphExecutionRecord, StoreError> {
    self.inner.get_graph_execution(graph_exec_id).await
  }

  async fn list_graph_executions(
    &self,
    graph_id: &str,
  ) -> Result<Vec<GraphExecutionRecord>, StoreError> {
    self.inner.list_graph_executions(graph_id).await
  }

  async fn update_graph_execution_status(
    &self,
    graph_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<(), StoreError> {
    if self.graph_status == Some(status) {
      return Err(refused(status));
    }
    self
      .inner
      .update_graph_execution_status(graph_exec_id, status)
      .await
  }

  async fn upsert_execution_input(
    &self,
    node_id: &str,
    graph_exec_id: &str,
    input_name: &str,
    data: Value,
  ) -> Result<String, StoreError> {
    self
      .inner
      .upsert_execution_input(node_id, graph_exec_id, input_name, data)
      .await
  }

  async fn get_node_execution(&self, node_exec_id: &str) -> Result<NodeExecutionRecord, StoreError> {
    self.inner.get_node_execution(node_exec_id).await
  }

  async fn get_execution_input(&self, node_exec_id: &str) -> Result<BlockInput, StoreError> {
    self.inner.get_execution_input(node_exec_id).await
  }

  async fn list_node_executions(
    &self,
    graph_exec_id: &str,
  ) -> Result<Vec<NodeExecutionRecord>, StoreError> {
    self.inner.list_node_executions(graph_exec_id).await
  }

  async fn upsert_execution_output(
    &self,
    node_exec_id: &str,
    output_name: &str,
    data: Value,
  ) -> Result<(), StoreError> {
    self
      .inner
      .upsert_execution_output(node_exec_id, output_name, data)
      .await
  }

  async fn update_execution_status(
    &self,
    node_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<bool, StoreError> {
    if self.node_status == Some(status) {
      return Err(refused(status));
    }
    self.inner.update_execution_status(node_exec_id, status).await
  }

  async fn acquire_lock(&self, key: &str) -> Result<(), StoreError> {
    self.inner.acquire_lock(key).await
  }

  async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
    self.inner.release_lock(key).await
  }
}

pub struct Harness {
  pub manager: Arc<ExecutionManager>,
  pub events: mpsc::UnboundedReceiver<ExecutionEvent>,
  pub probe: Arc<Stats>,
  pub pair: Arc<Stats>,
  pub gate: Arc<Notify>,
}

impl Harness {
  pub fn new(config: ExecutorConfig) -> Self {
    Self::with_store(Arc::new(MemoryStore::new()), config)
  }

  pub fn with_store(store: Arc<dyn Store>, config: ExecutorConfig) -> Self {
    let probe = Arc::new(Stats::default());
    let pair = Arc::new(Stats::default());
    let gate = Arc::new(Notify::new());

    let mut registry: BlockRegistry = trellis_blocks::builtin_registry().unwrap();
    registry.register(ProbeBlock::new(probe.clone())).unwrap();
    registry.register(PairBlock::new(pair.clone())).unwrap();
    registry.register(RepeatBlock::new()).unwrap();
    registry
      .register(FailBlock {
        input_schema: schema(json!({ "properties": { "value": {} } })),
        output_schema: BlockSchema::empty(),
      })
      .unwrap();
    registry
      .register(PanicBlock {
        input_schema: schema(json!({ "properties": { "value": {} } })),
        output_schema: BlockSchema::empty(),
      })
      .unwrap();
    registry
      .register(GatedBlock {
        gate: gate.clone(),
        input_schema: schema(json!({ "properties": { "value": {} } })),
        output_schema: schema(json!({ "properties": { "first": {}, "second": {} } })),
      })
      .unwrap();

    let (notifier, events) = ChannelNotifier::channel();
    let ctx = WorkerContext::new(store, Arc::new(registry), config)
      .unwrap()
      .with_notifier(notifier);

    Self {
      manager: Arc::new(ExecutionManager::new(ctx)),
      events,
      probe,
      pair,
      gate,
    }
  }

  pub fn store(&self) -> Arc<dyn Store> {
    self.manager.context().store.clone()
  }

  /// Start the service loop in the background.
  pub fn start(&self) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let manager = self.manager.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { manager.run(token).await });
    (cancel, handle)
  }

  /// Wait for the next event matching `pred`, returning everything seen.
  pub async fn wait_for(
    &mut self,
    mut pred: impl FnMut(&ExecutionEvent) -> bool,
  ) -> Vec<ExecutionEvent> {
    let mut seen = Vec::new();
    loop {
      let event = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed");
      let done = pred(&event);
      seen.push(event);
      if done {
        return seen;
      }
    }
  }

  /// Serve until every run in `handles` has finished, then stop the manager.
  pub async fn run_until_done(&mut self, handles: &[ExecutionHandle]) -> Vec<ExecutionEvent> {
    let (cancel, task) = self.start();
    let mut pending: HashSet<String> = handles.iter().map(|h| h.graph_exec_id.clone()).collect();

    let mut events = Vec::new();
    while !pending.is_empty() {
      let seen = self.wait_for(|e| e.is_terminal()).await;
      if let Some(last) = seen.last() {
        pending.remove(last.graph_exec_id());
      }
      events.extend(seen);
    }

    cancel.cancel();
    tokio::time::timeout(EVENT_TIMEOUT, task)
      .await
      .expect("manager did not stop")
      .unwrap();
    events
  }
}

pub fn config(graph_workers: usize, node_workers: usize) -> ExecutorConfig {
  ExecutorConfig {
    num_graph_workers: graph_workers,
    num_node_workers: node_workers,
    node_wait_timeout_ms: 200,
    lock_poll_interval_ms: 5,
  }
}

pub fn node(id: &str, block_id: &str) -> NodeDef {
  node_with(id, block_id, json!({}))
}

pub fn node_with(id: &str, block_id: &str, defaults: Value) -> NodeDef {
  NodeDef {
    id: id.to_string(),
    block_id: block_id.to_string(),
    input_default: input(defaults),
  }
}

pub fn link(source_id: &str, source_name: &str, sink_id: &str, sink_name: &str) -> Link {
  Link {
    source_id: source_id.to_string(),
    source_name: source_name.to_string(),
    sink_id: sink_id.to_string(),
    sink_name: sink_name.to_string(),
  }
}

pub fn graph(id: &str, nodes: Vec<NodeDef>, links: Vec<Link>) -> GraphDef {
  GraphDef {
    id: id.to_string(),
    version: 1,
    name: id.to_string(),
    description: String::new(),
    nodes,
    links,
  }
}

pub fn input(value: Value) -> BlockInput {
  match value {
    Value::Object(map) => map,
    other => panic!("expected a JSON object, got {other}"),
  }
}

/// Records of `node_id`, in creation order.
pub fn records_of<'a>(
  records: &'a [NodeExecutionRecord],
  node_id: &str,
) -> Vec<&'a NodeExecutionRecord> {
  records.iter().filter(|r| r.node_id == node_id).collect()
}

/// `A -> {B, C} -> D`: B and C forward A's value into D's `left` and `right`.
pub fn diamond(id: &str) -> GraphDef {
  graph(
    id,
    vec![
      node("a", "value"),
      node_with("b", "probe", json!({ "delay_ms": 20 })),
      node_with("c", "probe", json!({ "delay_ms": 20 })),
      node("d", "pair"),
    ],
    vec![
      link("a", "output", "b", "value"),
      link("a", "output", "c", "value"),
      link("b", "output", "d", "left"),
      link("c", "output", "d", "right"),
    ],
  )
}
