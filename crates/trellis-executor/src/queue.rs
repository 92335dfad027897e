//! Typed FIFO queues carrying work units between schedulers and workers.
//!
//! A queue only accepts the two work unit types, [`NodeExecution`] and
//! [`GraphExecution`]. Both are serializable so a queue could be backed by
//! an out-of-process broker without changing its callers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use crate::execution::{GraphExecution, NodeExecution};

mod sealed {
  pub trait Sealed {}
}

/// Work units that may travel through an [`ExecutionQueue`].
pub trait QueueItem: sealed::Sealed + Serialize + DeserializeOwned + Send + 'static {}

impl sealed::Sealed for NodeExecution {}
impl QueueItem for NodeExecution {}

impl sealed::Sealed for GraphExecution {}
impl QueueItem for GraphExecution {}

/// FIFO with blocking and non-blocking retrieval.
///
/// Queue position implies nothing about execution order.
pub struct ExecutionQueue<T: QueueItem> {
  items: Mutex<VecDeque<T>>,
  added: Notify,
}

/// Ready node executions of one run.
pub type NodeQueue = ExecutionQueue<NodeExecution>;

/// Runs waiting for a graph worker.
pub type GraphQueue = ExecutionQueue<GraphExecution>;

impl<T: QueueItem> ExecutionQueue<T> {
  pub fn new() -> Self {
    Self {
      items: Mutex::new(VecDeque::new()),
      added: Notify::new(),
    }
  }

  fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
    self.items.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn add(&self, item: T) {
    self.items().push_back(item);
    self.added.notify_waiters();
  }

  /// Take the oldest item, waiting until one is available.
  pub async fn get(&self) -> T {
    loop {
      let added = self.added.notified();
      tokio::pin!(added);
      added.as_mut().enable();

      if let Some(item) = self.try_get() {
        return item;
      }
      added.await;
    }
  }

  /// Take the oldest item if there is one.
  pub fn try_get(&self) -> Option<T> {
    self.items().pop_front()
  }

  /// Wait until the queue holds at least one item, without taking it.
  pub async fn wait_for_item(&self) {
    loop {
      let added = self.added.notified();
      tokio::pin!(added);
      added.as_mut().enable();

      if !self.is_empty() {
        return;
      }
      added.await;
    }
  }

  pub fn is_empty(&self) -> bool {
    self.items().is_empty()
  }

  pub fn len(&self) -> usize {
    self.items().len()
  }
}

impl<T: QueueItem> Default for ExecutionQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}
