use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trellis_blocks::builtin_registry;
use trellis_executor::{ChannelNotifier, ExecutionEvent, ExecutionManager, ExecutorConfig, WorkerContext};
use trellis_graph::{BlockInput, Graph, GraphDef};
use trellis_store::{MemoryStore, SqliteStore, Store};

/// Trellis - a graph execution scheduler
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.trellis)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a graph once, reading the run input JSON from stdin
  Run {
    /// Path to the graph definition (JSON)
    graph_file: PathBuf,

    /// Keep executions in memory instead of the data directory database
    #[arg(long)]
    memory: bool,

    /// Path to an executor config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Graph executions running at once
    #[arg(long)]
    graph_workers: Option<usize>,

    /// Node executions running at once within a graph execution
    #[arg(long)]
    node_workers: Option<usize>,
  },

  /// Check a graph definition against the builtin blocks
  Validate {
    /// Path to the graph definition (JSON)
    graph_file: PathBuf,
  },

  /// List the builtin blocks
  Blocks,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .with_target(false)
    .init();

  let cli = Cli::parse();

  match cli.command {
    Some(Commands::Run {
      graph_file,
      memory,
      config,
      graph_workers,
      node_workers,
    }) => {
      let mut config = load_config(config.as_deref())?;
      if let Some(n) = graph_workers {
        config.num_graph_workers = n;
      }
      if let Some(n) = node_workers {
        config.num_node_workers = n;
      }
      let data_dir = if memory {
        None
      } else {
        Some(resolve_data_dir(cli.data_dir)?)
      };

      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run_graph(graph_file, data_dir, config))?;
    }
    Some(Commands::Validate { graph_file }) => validate_graph(&graph_file)?,
    Some(Commands::Blocks) => list_blocks()?,
    None => {
      println!("trellis - use --help to see available commands");
    }
  }

  Ok(())
}

fn resolve_data_dir(data_dir: Option<PathBuf>) -> Result<PathBuf> {
  match data_dir {
    Some(dir) => Ok(dir),
    None => Ok(
      dirs::home_dir()
        .context("could not determine home directory")?
        .join(".trellis"),
    ),
  }
}

fn load_config(path: Option<&Path>) -> Result<ExecutorConfig> {
  let Some(path) = path else {
    return Ok(ExecutorConfig::default());
  };
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read config file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse config file: {}", path.display()))
}

fn load_graph_def(graph_file: &Path) -> Result<GraphDef> {
  let content = std::fs::read_to_string(graph_file)
    .with_context(|| format!("failed to read graph file: {}", graph_file.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse graph file: {}", graph_file.display()))
}

async fn open_store(data_dir: Option<PathBuf>, config: &ExecutorConfig) -> Result<Arc<dyn Store>> {
  let Some(data_dir) = data_dir else {
    return Ok(Arc::new(MemoryStore::new()));
  };

  tokio::fs::create_dir_all(&data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  let db_path = data_dir.join("trellis.db");
  let store = SqliteStore::connect(&db_path)
    .await
    .with_context(|| format!("failed to open database: {}", db_path.display()))?
    .with_lock_poll_interval(config.lock_poll_interval());
  store.migrate().await.context("failed to migrate database")?;
  Ok(Arc::new(store))
}

async fn run_graph(graph_file: PathBuf, data_dir: Option<PathBuf>, config: ExecutorConfig) -> Result<()> {
  let graph_def = load_graph_def(&graph_file)?;
  let input = read_input_from_stdin()?;

  let store = open_store(data_dir, &config).await?;
  let registry = Arc::new(builtin_registry().context("failed to register builtin blocks")?);
  let (notifier, mut events) = ChannelNotifier::channel();
  let ctx = WorkerContext::new(store, registry, config)
    .context("invalid executor config")?
    .with_notifier(notifier);
  let manager = Arc::new(ExecutionManager::new(ctx));

  let graph = manager
    .add_graph(graph_def)
    .await
    .context("failed to store graph")?;
  eprintln!("Loaded graph: {} (version {})", graph.id(), graph.version());

  let handle = manager
    .add_execution(graph.id(), input)
    .await
    .context("failed to start execution")?;
  eprintln!("Execution queued: {}", handle.graph_exec_id);

  let cancel = CancellationToken::new();
  let service = {
    let manager = manager.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { manager.run(cancel).await })
  };

  let mut finished = None;
  while let Some(event) = events.recv().await {
    if event.is_terminal() && event.graph_exec_id() == handle.graph_exec_id {
      finished = Some(event);
      break;
    }
  }
  cancel.cancel();
  service.await.context("execution manager stopped unexpectedly")?;

  let records = manager
    .get_results(&handle.graph_exec_id)
    .await
    .context("failed to load results")?;
  println!("{}", serde_json::to_string_pretty(&records)?);

  match finished {
    Some(ExecutionEvent::GraphCompleted { .. }) => {
      eprintln!("Execution completed: {}", handle.graph_exec_id);
      Ok(())
    }
    Some(ExecutionEvent::GraphFailed { failed_nodes, .. }) => {
      bail!("execution {} failed: {failed_nodes} node(s) failed", handle.graph_exec_id)
    }
    _ => bail!("execution {} did not finish", handle.graph_exec_id),
  }
}

fn validate_graph(graph_file: &Path) -> Result<()> {
  let graph = Graph::new(load_graph_def(graph_file)?).context("invalid graph")?;
  let registry = builtin_registry().context("failed to register builtin blocks")?;
  graph
    .validate_blocks(&registry)
    .context("graph references unknown blocks")?;

  println!(
    "{} (version {}): {} nodes, {} links",
    graph.id(),
    graph.version(),
    graph.nodes().len(),
    graph.links().len()
  );
  println!("starting nodes: {}", graph.starting_nodes().join(", "));
  Ok(())
}

fn list_blocks() -> Result<()> {
  let registry = builtin_registry().context("failed to register builtin blocks")?;
  for block in registry.list() {
    println!("{} ({})", block.id(), block.name());
    println!("  input:  {}", block.input_schema().as_json());
    println!("  output: {}", block.output_schema().as_json());
  }
  Ok(())
}

fn read_input_from_stdin() -> Result<BlockInput> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(BlockInput::new());
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read run input from stdin")?;

  if input.trim().is_empty() {
    Ok(BlockInput::new())
  } else {
    serde_json::from_str(&input).context("failed to parse run input JSON from stdin (expected an object)")
  }
}
