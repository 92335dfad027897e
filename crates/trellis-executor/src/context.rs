use std::sync::Arc;

use trellis_graph::BlockRegistry;
use trellis_store::Store;

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::events::{ExecutionNotifier, NoopNotifier};

/// Everything a graph or node worker needs, built once per process and
/// shared by `Arc`.
#[derive(Clone)]
pub struct WorkerContext {
  pub store: Arc<dyn Store>,
  pub registry: Arc<BlockRegistry>,
  pub notifier: Arc<dyn ExecutionNotifier>,
  pub config: ExecutorConfig,
}

impl WorkerContext {
  /// Create a context with no-op notifications. Fails on invalid config.
  pub fn new(
    store: Arc<dyn Store>,
    registry: Arc<BlockRegistry>,
    config: ExecutorConfig,
  ) -> Result<Self, ExecutorError> {
    config.validate()?;
    Ok(Self {
      store,
      registry,
      notifier: Arc::new(NoopNotifier),
      config,
    })
  }

  pub fn with_notifier(mut self, notifier: impl ExecutionNotifier + 'static) -> Self {
    self.notifier = Arc::new(notifier);
    self
  }
}
