use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use trellis_graph::{BlockInput, Graph};

use crate::types::{check_transition, new_id, transition_timestamps};
use crate::{Error, ExecutionStatus, GraphExecutionRecord, NodeExecutionRecord, Store};

const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// SQLite-based store implementation.
///
/// Locks are rows in `execution_locks`, so they are exclusive across every
/// process sharing the database file. Waiters poll for release.
pub struct SqliteStore {
  pool: SqlitePool,
  lock_poll_interval: Duration,
}

#[derive(FromRow)]
struct NodeExecutionRow {
  node_exec_id: String,
  graph_exec_id: String,
  node_id: String,
  status: ExecutionStatus,
  input_data: Json<BlockInput>,
  created_at: DateTime<Utc>,
  started_at: Option<DateTime<Utc>>,
  ended_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRow {
  fn into_record(self, output_data: BTreeMap<String, Vec<Value>>) -> NodeExecutionRecord {
    NodeExecutionRecord {
      node_exec_id: self.node_exec_id,
      graph_exec_id: self.graph_exec_id,
      node_id: self.node_id,
      status: self.status,
      input_data: self.input_data.0,
      output_data,
      created_at: self.created_at,
      started_at: self.started_at,
      ended_at: self.ended_at,
    }
  }
}

#[derive(FromRow)]
struct OutputRow {
  node_exec_id: String,
  output_name: String,
  data: Json<Value>,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self {
      pool,
      lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
    }
  }

  /// Open (creating if needed) the database file at `path`.
  pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(30))
      .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
      .max_connections(8)
      .connect_with(options)
      .await?;

    Ok(Self::new(pool))
  }

  /// Set how often a waiting `acquire_lock` re-checks the lock.
  pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
    self.lock_poll_interval = interval;
    self
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  async fn graph_execution_exists(&self, graph_exec_id: &str) -> Result<bool, Error> {
    let row: Option<(i64,)> = sqlx::query_as(
      r#"
      SELECT 1 FROM graph_executions WHERE graph_exec_id = ?
      "#,
    )
    .bind(graph_exec_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.is_some())
  }

  async fn insert_node_execution(
    &self,
    graph_exec_id: &str,
    node_id: &str,
    input: &BlockInput,
  ) -> Result<String, Error> {
    let node_exec_id = new_id();
    sqlx::query(
      r#"
      INSERT INTO node_executions (node_exec_id, graph_exec_id, node_id, status, input_data, created_at)
      VALUES (?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&node_exec_id)
    .bind(graph_exec_id)
    .bind(node_id)
    .bind(ExecutionStatus::Incomplete)
    .bind(Json(input))
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;
    Ok(node_exec_id)
  }

  async fn outputs_for(&self, node_exec_id: &str) -> Result<BTreeMap<String, Vec<Value>>, Error> {
    let rows: Vec<OutputRow> = sqlx::query_as(
      r#"
      SELECT node_exec_id, output_name, data
      FROM node_execution_outputs
      WHERE node_exec_id = ?
      ORDER BY seq ASC
      "#,
    )
    .bind(node_exec_id)
    .fetch_all(&self.pool)
    .await?;

    let mut outputs: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for row in rows {
      outputs.entry(row.output_name).or_default().push(row.data.0);
    }
    Ok(outputs)
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_graph(&self, graph: &Graph) -> Result<(), Error> {
    sqlx::query(
      r#"
      INSERT INTO graphs (graph_id, version, definition, created_at)
      VALUES (?, ?, ?, ?)
      ON CONFLICT (graph_id, version) DO UPDATE SET definition = excluded.definition
      "#,
    )
    .bind(graph.id())
    .bind(graph.version())
    .bind(Json(graph))
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_graph(&self, graph_id: &str, version: Option<u32>) -> Result<Option<Graph>, Error> {
    let row: Option<(Json<Graph>,)> = match version {
      Some(version) => {
        sqlx::query_as(
          r#"
          SELECT definition FROM graphs
          WHERE graph_id = ? AND version = ?
          "#,
        )
        .bind(graph_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
      }
      None => {
        sqlx::query_as(
          r#"
          SELECT definition FROM graphs
          WHERE graph_id = ?
          ORDER BY version DESC
          LIMIT 1
          "#,
        )
        .bind(graph_id)
        .fetch_optional(&self.pool)
        .await?
      }
    };

    Ok(row.map(|(graph,)| graph.0))
  }

  async fn create_graph_execution(
    &self,
    graph_id: &str,
    graph_version: u32,
    nodes_input: Vec<(String, BlockInput)>,
  ) -> Result<(GraphExecutionRecord, Vec<NodeExecutionRecord>), Error> {
    let now = Utc::now();
    let graph_exec = GraphExecutionRecord {
      graph_exec_id: new_id(),
      graph_id: graph_id.to_string(),
      graph_version,
      status: ExecutionStatus::Queued,
      created_at: now,
      started_at: None,
      ended_at: None,
    };

    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
      INSERT INTO graph_executions (graph_exec_id, graph_id, graph_version, status, created_at)
      VALUES (?, ?, ?, ?, ?)
      "#,
    )
    .bind(&graph_exec.graph_exec_id)
    .bind(&graph_exec.graph_id)
    .bind(graph_exec.graph_version)
    .bind(graph_exec.status)
    .bind(graph_exec.created_at)
    .execute(&mut *tx)
    .await?;

    let mut seeds = Vec::with_capacity(nodes_input.len());
    for (node_id, input_data) in nodes_input {
      let seed = NodeExecutionRecord {
        node_exec_id: new_id(),
        graph_exec_id: graph_exec.graph_exec_id.clone(),
        node_id,
        status: ExecutionStatus::Incomplete,
        input_data,
        output_data: BTreeMap::new(),
        created_at: now,
        started_at: None,
        ended_at: None,
      };

      sqlx::query(
        r#"
        INSERT INTO node_executions (node_exec_id, graph_exec_id, node_id, status, input_data, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
      )
      .bind(&seed.node_exec_id)
      .bind(&seed.graph_exec_id)
      .bind(&seed.node_id)
      .bind(seed.status)
      .bind(Json(&seed.input_data))
      .bind(seed.created_at)
      .execute(&mut *tx)
      .await?;

      seeds.push(seed);
    }

    tx.commit().await?;

    Ok((graph_exec, seeds))
  }

  async fn get_graph_execution(&self, graph_exec_id: &str) -> Result<GraphExecutionRecord, Error> {
    sqlx::query_as(
      r#"
      SELECT graph_exec_id, graph_id, graph_version, status, created_at, started_at, ended_at
      FROM graph_executions
      WHERE graph_exec_id = ?
      "#,
    )
    .bind(graph_exec_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("graph execution {graph_exec_id}")))
  }

  async fn list_graph_executions(&self, graph_id: &str) -> Result<Vec<GraphExecutionRecord>, Error> {
    let executions = sqlx::query_as(
      r#"
      SELECT graph_exec_id, graph_id, graph_version, status, created_at, started_at, ended_at
      FROM graph_executions
      WHERE graph_id = ?
      ORDER BY created_at DESC
      "#,
    )
    .bind(graph_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(executions)
  }

  async fn update_graph_execution_status(
    &self,
    graph_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<(), Error> {
    loop {
      let current = self.get_graph_execution(graph_exec_id).await?;
      if !check_transition(graph_exec_id, current.status, status)? {
        return Ok(());
      }

      let (started_at, ended_at) = transition_timestamps(status, current.started_at, current.ended_at);
      let result = sqlx::query(
        r#"
        UPDATE graph_executions
        SET status = ?, started_at = ?, ended_at = ?
        WHERE graph_exec_id = ? AND status = ?
        "#,
      )
      .bind(status)
      .bind(started_at)
      .bind(ended_at)
      .bind(graph_exec_id)
      .bind(current.status)
      .execute(&self.pool)
      .await?;

      if result.rows_affected() == 1 {
        return Ok(());
      }
    }
  }

  async fn upsert_execution_input(
    &self,
    node_id: &str,
    graph_exec_id: &str,
    input_name: &str,
    data: Value,
  ) -> Result<String, Error> {
    if !self.graph_execution_exists(graph_exec_id).await? {
      return Err(Error::NotFound(format!("graph execution {graph_exec_id}")));
    }

    loop {
      let incomplete: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT node_exec_id, input_data
        FROM node_executions
        WHERE graph_exec_id = ? AND node_id = ? AND status = ?
        ORDER BY seq ASC
        "#,
      )
      .bind(graph_exec_id)
      .bind(node_id)
      .bind(ExecutionStatus::Incomplete)
      .fetch_all(&self.pool)
      .await?;

      let mut candidate = None;
      for (node_exec_id, raw) in incomplete {
        let input: BlockInput = serde_json::from_str(&raw)?;
        if !input.contains_key(input_name) {
          candidate = Some((node_exec_id, raw, input));
          break;
        }
      }

      let Some((node_exec_id, raw, mut input)) = candidate else {
        let mut input = BlockInput::new();
        input.insert(input_name.to_string(), data);
        return self.insert_node_execution(graph_exec_id, node_id, &input).await;
      };

      input.insert(input_name.to_string(), data.clone());
      let result = sqlx::query(
        r#"
        UPDATE node_executions
        SET input_data = ?
        WHERE node_exec_id = ? AND status = ? AND input_data = ?
        "#,
      )
      .bind(Json(&input))
      .bind(&node_exec_id)
      .bind(ExecutionStatus::Incomplete)
      .bind(&raw)
      .execute(&self.pool)
      .await?;

      if result.rows_affected() == 1 {
        return Ok(node_exec_id);
      }
      // The record changed underneath us; look again.
    }
  }

  async fn get_node_execution(&self, node_exec_id: &str) -> Result<NodeExecutionRecord, Error> {
    let row: NodeExecutionRow = sqlx::query_as(
      r#"
      SELECT node_exec_id, graph_exec_id, node_id, status, input_data, created_at, started_at, ended_at
      FROM node_executions
      WHERE node_exec_id = ?
      "#,
    )
    .bind(node_exec_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("node execution {node_exec_id}")))?;

    let outputs = self.outputs_for(node_exec_id).await?;
    Ok(row.into_record(outputs))
  }

  async fn get_execution_input(&self, node_exec_id: &str) -> Result<BlockInput, Error> {
    let row: Option<(Json<BlockInput>,)> = sqlx::query_as(
      r#"
      SELECT input_data FROM node_executions WHERE node_exec_id = ?
      "#,
    )
    .bind(node_exec_id)
    .fetch_optional(&self.pool)
    .await?;

    row
      .map(|(input,)| input.0)
      .ok_or_else(|| Error::NotFound(format!("node execution {node_exec_id}")))
  }

  async fn list_node_executions(&self, graph_exec_id: &str) -> Result<Vec<NodeExecutionRecord>, Error> {
    let rows: Vec<NodeExecutionRow> = sqlx::query_as(
      r#"
      SELECT node_exec_id, graph_exec_id, node_id, status, input_data, created_at, started_at, ended_at
      FROM node_executions
      WHERE graph_exec_id = ?
      ORDER BY seq ASC
      "#,
    )
    .bind(graph_exec_id)
    .fetch_all(&self.pool)
    .await?;

    let output_rows: Vec<OutputRow> = sqlx::query_as(
      r#"
      SELECT o.node_exec_id, o.output_name, o.data
      FROM node_execution_outputs o
      JOIN node_executions n ON n.node_exec_id = o.node_exec_id
      WHERE n.graph_exec_id = ?
      ORDER BY o.seq ASC
      "#,
    )
    .bind(graph_exec_id)
    .fetch_all(&self.pool)
    .await?;

    let mut outputs: HashMap<String, BTreeMap<String, Vec<Value>>> = HashMap::new();
    for row in output_rows {
      outputs
        .entry(row.node_exec_id)
        .or_default()
        .entry(row.output_name)
        .or_default()
        .push(row.data.0);
    }

    Ok(
      rows
        .into_iter()
        .map(|row| {
          let output_data = outputs.remove(&row.node_exec_id).unwrap_or_default();
          row.into_record(output_data)
        })
        .collect(),
    )
  }

  async fn upsert_execution_output(
    &self,
    node_exec_id: &str,
    output_name: &str,
    data: Value,
  ) -> Result<(), Error> {
    let exists: Option<(i64,)> = sqlx::query_as(
      r#"
      SELECT 1 FROM node_executions WHERE node_exec_id = ?
      "#,
    )
    .bind(node_exec_id)
    .fetch_optional(&self.pool)
    .await?;
    if exists.is_none() {
      return Err(Error::NotFound(format!("node execution {node_exec_id}")));
    }

    sqlx::query(
      r#"
      INSERT INTO node_execution_outputs (node_exec_id, output_name, data, created_at)
      VALUES (?, ?, ?, ?)
      "#,
    )
    .bind(node_exec_id)
    .bind(output_name)
    .bind(Json(&data))
    .bind(Utc::now())
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn update_execution_status(
    &self,
    node_exec_id: &str,
    status: ExecutionStatus,
  ) -> Result<bool, Error> {
    loop {
      let current: Option<(ExecutionStatus, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> =
        sqlx::query_as(
          r#"
          SELECT status, started_at, ended_at
          FROM node_executions
          WHERE node_exec_id = ?
          "#,
        )
        .bind(node_exec_id)
        .fetch_optional(&self.pool)
        .await?;

      let (from, started_at, ended_at) =
        current.ok_or_else(|| Error::NotFound(format!("node execution {node_exec_id}")))?;

      if !check_transition(node_exec_id, from, status)? {
        return Ok(false);
      }

      let (started_at, ended_at) = transition_timestamps(status, started_at, ended_at);
      let result = sqlx::query(
        r#"
        UPDATE node_executions
        SET status = ?, started_at = ?, ended_at = ?
        WHERE node_exec_id = ? AND status = ?
        "#,
      )
      .bind(status)
      .bind(started_at)
      .bind(ended_at)
      .bind(node_exec_id)
      .bind(from)
      .execute(&self.pool)
      .await?;

      if result.rows_affected() == 1 {
        return Ok(true);
      }
    }
  }

  async fn acquire_lock(&self, key: &str) -> Result<(), Error> {
    loop {
      let result = sqlx::query(
        r#"
        INSERT INTO execution_locks (lock_key, acquired_at)
        VALUES (?, ?)
        ON CONFLICT (lock_key) DO NOTHING
        "#,
      )
      .bind(key)
      .bind(Utc::now())
      .execute(&self.pool)
      .await?;

      if result.rows_affected() == 1 {
        return Ok(());
      }
      tokio::time::sleep(self.lock_poll_interval).await;
    }
  }

  async fn release_lock(&self, key: &str) -> Result<(), Error> {
    sqlx::query(
      r#"
      DELETE FROM execution_locks WHERE lock_key = ?
      "#,
    )
    .bind(key)
    .execute(&self.pool)
    .await?;

    Ok(())
  }
}
