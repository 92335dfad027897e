//! The block contract.
//!
//! A block is a registered unit of computation. Given a validated input map it
//! produces a lazy, finite stream of `(output pin, value)` pairs. The stream is
//! consumed once; a block that fails yields an `Err` item and produces nothing
//! further.

use std::pin::Pin;

use futures::Stream;

use crate::schema::BlockSchema;

/// Input map handed to a block, keyed by input pin name.
pub type BlockInput = serde_json::Map<String, serde_json::Value>;

/// A single `(output pin, value)` pair produced by a block.
pub type BlockData = (String, serde_json::Value);

/// A boxed stream of block outputs.
pub type BlockOutput = Pin<Box<dyn Stream<Item = Result<BlockData, BlockError>> + Send>>;

/// Failure raised by a block while producing output.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{category}: {message}")]
pub struct BlockError {
  /// Failure category, e.g. "ValueError" or "TimeoutError".
  pub category: String,
  /// Human-readable failure message.
  pub message: String,
}

impl BlockError {
  pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      category: category.into(),
      message: message.into(),
    }
  }
}

/// A registered computation unit.
///
/// Implementations must be cheap to share: the registry hands out
/// `Arc<dyn Block>` and `execute` may be called concurrently for different
/// node executions.
pub trait Block: Send + Sync {
  /// Unique block id used by nodes to reference this block.
  fn id(&self) -> &str;

  /// Display name used in logs.
  fn name(&self) -> &str;

  /// Schema the input map is validated against before execution.
  fn input_schema(&self) -> &BlockSchema;

  /// Schema describing the output pins this block produces.
  fn output_schema(&self) -> &BlockSchema;

  /// Start executing with a validated input.
  fn execute(&self, input: BlockInput) -> BlockOutput;
}
