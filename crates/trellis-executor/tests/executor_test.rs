mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use trellis_executor::{ExecutionEvent, ExecutorError, NotFoundKind, ValidationKind};
use trellis_store::{ExecutionStatus, SqliteStore};

use common::{
  FaultyStore, Harness, config, diamond, graph, input, link, node, node_with, records_of,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_diamond_joins_once() {
  let mut h = Harness::new(config(1, 4));
  h.manager.add_graph(diamond("diamond")).await.unwrap();

  let handle = h
    .manager
    .add_execution("diamond", input(json!({ "value": 5 })))
    .await
    .unwrap();
  let events = h.run_until_done(&[handle.clone()]).await;

  assert!(matches!(
    events.last(),
    Some(ExecutionEvent::GraphCompleted { graph_exec_id }) if *graph_exec_id == handle.graph_exec_id
  ));

  // D saw both inputs in a single execution.
  let pair_inputs = h.pair.inputs();
  assert_eq!(pair_inputs.len(), 1);
  assert_eq!(pair_inputs[0]["left"], json!(5));
  assert_eq!(pair_inputs[0]["right"], json!(5));

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  assert_eq!(records.len(), 4);
  assert!(records.iter().all(|r| r.status == ExecutionStatus::Completed));

  let d = records_of(&records, "d");
  assert_eq!(d.len(), 1);
  assert_eq!(d[0].output_data["output"], vec![json!([5, 5])]);

  let run = h.store().get_graph_execution(&handle.graph_exec_id).await.unwrap();
  assert_eq!(run.status, ExecutionStatus::Completed);
  assert!(run.started_at.is_some());
  assert!(run.ended_at.is_some());
}

#[tokio::test]
async fn test_unknown_graph_is_rejected() {
  let h = Harness::new(config(1, 1));

  let err = h
    .manager
    .add_execution("nope", input(json!({})))
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    ExecutorError::NotFound { kind: NotFoundKind::Graph, ref id } if id == "nope"
  ));
  assert!(h.store().list_graph_executions("nope").await.unwrap().is_empty());
  assert_eq!(h.manager.pending(), 0);
}

#[tokio::test]
async fn test_invalid_run_input_persists_nothing() {
  let h = Harness::new(config(1, 1));
  h.manager
    .add_graph(graph("strict", vec![node("a", "list_collect")], vec![]))
    .await
    .unwrap();

  let err = h
    .manager
    .add_execution("strict", input(json!({ "items": "not a list" })))
    .await
    .unwrap_err();
  match err {
    ExecutorError::Validation(e) => {
      assert_eq!(e.kind, ValidationKind::SchemaMismatch);
      assert!(e.fields.contains("items"));
    }
    other => panic!("unexpected error: {other}"),
  }
  assert!(h.store().list_graph_executions("strict").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_required_field_stays_incomplete() {
  let mut h = Harness::new(config(1, 2));
  // `d` gets `values` from `a` but no node ever provides `format`.
  h.manager
    .add_graph(graph(
      "partial",
      vec![
        node("a", "value"),
        node("b", "probe"),
        node("d", "text_format"),
      ],
      vec![
        link("a", "output", "b", "value"),
        link("a", "output", "d", "values"),
      ],
    ))
    .await
    .unwrap();

  let handle = h
    .manager
    .add_execution("partial", input(json!({ "value": { "name": "x" } })))
    .await
    .unwrap();
  let events = h.run_until_done(&[handle.clone()]).await;
  assert!(matches!(events.last(), Some(ExecutionEvent::GraphCompleted { .. })));

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  assert_eq!(records_of(&records, "a")[0].status, ExecutionStatus::Completed);
  assert_eq!(records_of(&records, "b")[0].status, ExecutionStatus::Completed);

  let d = records_of(&records, "d");
  assert_eq!(d.len(), 1);
  assert_eq!(d[0].status, ExecutionStatus::Incomplete);
  assert_eq!(d[0].input_data["values"], json!({ "name": "x" }));
  assert!(d[0].output_data.is_empty());
}

#[tokio::test]
async fn test_failing_block_fails_the_run() {
  let mut h = Harness::new(config(1, 1));
  h.manager
    .add_graph(graph(
      "failing",
      vec![node("a", "value"), node("f", "fail"), node("g", "probe")],
      vec![
        link("a", "output", "f", "value"),
        link("f", "output", "g", "value"),
      ],
    ))
    .await
    .unwrap();

  let handle = h
    .manager
    .add_execution("failing", input(json!({ "value": 1 })))
    .await
    .unwrap();
  let events = h.run_until_done(&[handle.clone()]).await;

  assert!(events.iter().any(|e| matches!(
    e,
    ExecutionEvent::NodeFailed { node_id, error, .. } if node_id == "f" && error == "ValueError: boom"
  )));
  assert!(matches!(
    events.last(),
    Some(ExecutionEvent::GraphFailed { failed_nodes: 1, .. })
  ));

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  let f = records_of(&records, "f");
  assert_eq!(f[0].status, ExecutionStatus::Failed);
  assert_eq!(f[0].output_data["error"], vec![json!("ValueError: boom")]);
  assert!(f[0].ended_at.is_some());
  assert!(records_of(&records, "g").is_empty());
  assert_eq!(h.probe.runs(), 0);

  let run = h.store().get_graph_execution(&handle.graph_exec_id).await.unwrap();
  assert_eq!(run.status, ExecutionStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_block_is_reported_failed() {
  let mut h = Harness::new(config(1, 2));
  h.manager
    .add_graph(graph(
      "panicky",
      vec![node("a", "value"), node("p", "panic")],
      vec![link("a", "output", "p", "value")],
    ))
    .await
    .unwrap();

  let handle = h
    .manager
    .add_execution("panicky", input(json!({ "value": 1 })))
    .await
    .unwrap();
  let events = h.run_until_done(&[handle.clone()]).await;
  assert!(matches!(events.last(), Some(ExecutionEvent::GraphFailed { .. })));

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  let p = records_of(&records, "p");
  assert_eq!(p[0].status, ExecutionStatus::Failed);
  let error = p[0].output_data["error"][0].as_str().unwrap();
  assert!(error.contains("panicked"), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_node_never_runs_concurrently() {
  let mut h = Harness::new(config(1, 4));
  h.manager
    .add_graph(graph(
      "fan",
      vec![
        node_with("r", "repeat", json!({ "times": 3 })),
        node_with("p", "probe", json!({ "delay_ms": 50 })),
      ],
      vec![link("r", "output", "p", "value")],
    ))
    .await
    .unwrap();

  let handle = h
    .manager
    .add_execution("fan", input(json!({ "value": "x" })))
    .await
    .unwrap();
  h.run_until_done(&[handle.clone()]).await;

  assert_eq!(h.probe.runs(), 3);
  assert_eq!(h.probe.max_concurrency(), 1);

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  let p = records_of(&records, "p");
  assert_eq!(p.len(), 3);
  assert!(p.iter().all(|r| r.status == ExecutionStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_completed_only_after_stream_ends() {
  let mut h = Harness::new(config(1, 2));
  h.manager
    .add_graph(graph(
      "gated",
      vec![node("g", "gated"), node("p", "probe")],
      vec![link("g", "first", "p", "value")],
    ))
    .await
    .unwrap();

  let handle = h
    .manager
    .add_execution("gated", input(json!({ "value": 7 })))
    .await
    .unwrap();
  let (cancel, task) = h.start();

  // Downstream work finishes while the producer is still streaming.
  h.wait_for(|e| matches!(e, ExecutionEvent::NodeCompleted { node_id, .. } if node_id == "p"))
    .await;
  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  let g = records_of(&records, "g")[0].clone();
  assert_eq!(g.status, ExecutionStatus::Running);
  assert_eq!(g.output_data["first"], vec![json!(7)]);
  assert!(!g.output_data.contains_key("second"));

  h.gate.notify_one();
  h.wait_for(|e| e.is_terminal()).await;

  let g = h.store().get_node_execution(&g.node_exec_id).await.unwrap();
  assert_eq!(g.status, ExecutionStatus::Completed);
  assert_eq!(g.output_data["second"], vec![json!(7)]);

  cancel.cancel();
  task.await.unwrap();
}

#[tokio::test]
async fn test_long_chain_terminates() {
  let mut h = Harness::new(config(1, 1));
  let mut nodes = vec![node("n0", "value")];
  let mut links = Vec::new();
  for i in 1..20 {
    nodes.push(node(&format!("n{i}"), "probe"));
    links.push(link(&format!("n{}", i - 1), "output", &format!("n{i}"), "value"));
  }
  h.manager.add_graph(graph("chain", nodes, links)).await.unwrap();

  let handle = h
    .manager
    .add_execution("chain", input(json!({ "value": "baton" })))
    .await
    .unwrap();
  h.run_until_done(&[handle.clone()]).await;

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  assert_eq!(records.len(), 20);
  assert!(records.iter().all(|r| r.status == ExecutionStatus::Completed));
  assert_eq!(records_of(&records, "n19")[0].output_data["output"], vec![json!("baton")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graph_workers_are_bounded() {
  let mut h = Harness::new(config(2, 1));
  h.manager
    .add_graph(graph(
      "slow",
      vec![node_with("p", "probe", json!({ "delay_ms": 50 }))],
      vec![],
    ))
    .await
    .unwrap();

  let mut handles = Vec::new();
  for i in 0..5 {
    handles.push(
      h.manager
        .add_execution("slow", input(json!({ "value": i })))
        .await
        .unwrap(),
    );
  }
  assert_eq!(h.manager.pending(), 5);
  h.run_until_done(&handles).await;

  assert_eq!(h.probe.runs(), 5);
  assert!(h.probe.max_concurrency() <= 2);
  for handle in &handles {
    let run = h.store().get_graph_execution(&handle.graph_exec_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Completed);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_node_workers_bound_sibling_nodes() {
  let mut h = Harness::new(config(1, 2));
  let mut nodes = vec![node("a", "value")];
  let mut links = Vec::new();
  for i in 0..4 {
    let id = format!("p{i}");
    nodes.push(node_with(&id, "probe", json!({ "delay_ms": 100 })));
    links.push(link("a", "output", &id, "value"));
  }
  h.manager.add_graph(graph("wide", nodes, links)).await.unwrap();

  let handle = h
    .manager
    .add_execution("wide", input(json!({ "value": 1 })))
    .await
    .unwrap();
  let events = h.run_until_done(&[handle.clone()]).await;
  assert!(matches!(events.last(), Some(ExecutionEvent::GraphCompleted { .. })));

  // Siblings overlap, but never more than the pool allows.
  assert_eq!(h.probe.runs(), 4);
  assert_eq!(h.probe.max_concurrency(), 2);
}

#[tokio::test]
async fn test_unqueueable_run_is_failed() {
  let store = FaultyStore {
    node_status: Some(ExecutionStatus::Queued),
    ..Default::default()
  };
  let h = Harness::with_store(Arc::new(store), config(1, 1));
  h.manager
    .add_graph(graph("single", vec![node("p", "probe")], vec![]))
    .await
    .unwrap();

  let err = h
    .manager
    .add_execution("single", input(json!({ "value": 1 })))
    .await
    .unwrap_err();
  assert!(matches!(err, ExecutorError::Store(_)));
  assert_eq!(h.manager.pending(), 0);

  let runs = h.store().list_graph_executions("single").await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_store_error_mid_run_emits_graph_failed() {
  let store = FaultyStore {
    graph_status: Some(ExecutionStatus::Running),
    ..Default::default()
  };
  let mut h = Harness::with_store(Arc::new(store), config(1, 1));
  h.manager
    .add_graph(graph("single", vec![node("p", "probe")], vec![]))
    .await
    .unwrap();

  let handle = h
    .manager
    .add_execution("single", input(json!({ "value": 1 })))
    .await
    .unwrap();
  let events = h.run_until_done(&[handle.clone()]).await;

  assert!(matches!(
    events.last(),
    Some(ExecutionEvent::GraphFailed { graph_exec_id, failed_nodes: 0 })
      if *graph_exec_id == handle.graph_exec_id
  ));
  assert_eq!(h.probe.runs(), 0);

  let run = h.store().get_graph_execution(&handle.graph_exec_id).await.unwrap();
  assert_eq!(run.status, ExecutionStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dynamic_list_pins_are_merged() {
  let mut h = Harness::new(config(1, 3));
  h.manager
    .add_graph(graph(
      "collect",
      vec![
        node_with("x0", "value", json!({ "value": "a" })),
        node_with("x1", "value", json!({ "value": "b" })),
        node_with("x2", "value", json!({ "value": "c" })),
        node("list", "list_collect"),
      ],
      vec![
        link("x0", "output", "list", "items_$_0"),
        link("x1", "output", "list", "items_$_1"),
        link("x2", "output", "list", "items_$_2"),
      ],
    ))
    .await
    .unwrap();

  let handle = h
    .manager
    .add_execution("collect", input(json!({})))
    .await
    .unwrap();
  h.run_until_done(&[handle.clone()]).await;

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  let list = records_of(&records, "list");
  assert_eq!(list.len(), 1);
  assert_eq!(list[0].status, ExecutionStatus::Completed);
  assert_eq!(list[0].output_data["list"], vec![json!(["a", "b", "c"])]);
  assert_eq!(list[0].output_data["count"], vec![json!(3)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_backed_run() {
  let dir = tempfile::tempdir().unwrap();
  let store = SqliteStore::connect(dir.path().join("trellis.db"))
    .await
    .unwrap()
    .with_lock_poll_interval(Duration::from_millis(5));
  store.migrate().await.unwrap();

  let mut h = Harness::with_store(Arc::new(store), config(1, 4));
  h.manager.add_graph(diamond("diamond")).await.unwrap();

  let handle = h
    .manager
    .add_execution("diamond", input(json!({ "value": "s" })))
    .await
    .unwrap();
  h.run_until_done(&[handle.clone()]).await;

  let records = h.manager.get_results(&handle.graph_exec_id).await.unwrap();
  assert_eq!(records.len(), 4);
  assert!(records.iter().all(|r| r.status == ExecutionStatus::Completed));
  assert_eq!(
    records_of(&records, "d")[0].output_data["output"],
    vec![json!(["s", "s"])]
  );
}

#[tokio::test]
async fn test_run_returns_on_cancel() {
  let h = Harness::new(config(1, 1));
  let cancel = CancellationToken::new();
  cancel.cancel();
  tokio::time::timeout(Duration::from_secs(1), h.manager.run(cancel))
    .await
    .unwrap();
}
