use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use trellis_store::Store;

use crate::error::ExecutorError;

/// Lock guarding accumulation of one node's input within one run.
pub fn upsert_lock_key(node_id: &str, graph_exec_id: &str) -> String {
  format!("upsert_input:{node_id}:{graph_exec_id}")
}

/// Run `body` while holding the store lock `key`.
///
/// The lock is released however `body` ends, including by panicking; the
/// panic is resumed after release.
pub async fn synchronized<F, T>(store: &dyn Store, key: &str, body: F) -> Result<T, ExecutorError>
where
  F: Future<Output = T>,
{
  store.acquire_lock(key).await?;
  let outcome = AssertUnwindSafe(body).catch_unwind().await;
  let released = store.release_lock(key).await;

  match outcome {
    Ok(value) => {
      released?;
      Ok(value)
    }
    Err(panic) => std::panic::resume_unwind(panic),
  }
}
