//! Trellis Blocks
//!
//! Builtin blocks that make graphs runnable out of the box:
//!
//! | id | inputs | outputs |
//! |---|---|---|
//! | `value` | `value` | `output` |
//! | `text_format` | `format`, `values` | `output` |
//! | `list_collect` | `items` | `list`, `count` |
//! | `json_path` | `data`, `path` | `output` |
//!
//! `list_collect` is meant to be fed through dynamic list pins
//! (`items_$_0`, `items_$_1`, ...).

mod json_path;
mod list_collect;
mod text_format;
mod value;

pub use json_path::JsonPathBlock;
pub use list_collect::ListCollectBlock;
pub use text_format::TextFormatBlock;
pub use value::ValueBlock;

use trellis_graph::{BlockRegistry, GraphError};

/// Register every builtin block.
pub fn register_builtin_blocks(registry: &mut BlockRegistry) -> Result<(), GraphError> {
  registry.register(ValueBlock::new())?;
  registry.register(TextFormatBlock::new())?;
  registry.register(ListCollectBlock::new())?;
  registry.register(JsonPathBlock::new())?;
  Ok(())
}

/// A registry holding only the builtin blocks.
pub fn builtin_registry() -> Result<BlockRegistry, GraphError> {
  let mut registry = BlockRegistry::new();
  register_builtin_blocks(&mut registry)?;
  Ok(registry)
}
