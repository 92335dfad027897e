use std::collections::HashMap;
use std::sync::Arc;

use crate::block::Block;
use crate::error::GraphError;

/// Registry resolving block ids to their implementations.
#[derive(Default, Clone)]
pub struct BlockRegistry {
  blocks: HashMap<String, Arc<dyn Block>>,
}

impl BlockRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a block. Fails if a block with the same id already exists.
  pub fn register<B: Block + 'static>(&mut self, block: B) -> Result<(), GraphError> {
    self.register_arc(Arc::new(block))
  }

  pub fn register_arc(&mut self, block: Arc<dyn Block>) -> Result<(), GraphError> {
    let id = block.id().to_string();
    if self.blocks.contains_key(&id) {
      return Err(GraphError::DuplicateBlock(id));
    }
    self.blocks.insert(id, block);
    Ok(())
  }

  /// Get a block by id.
  pub fn get(&self, block_id: &str) -> Option<Arc<dyn Block>> {
    self.blocks.get(block_id).cloned()
  }

  pub fn contains(&self, block_id: &str) -> bool {
    self.blocks.contains_key(block_id)
  }

  /// All registered blocks, sorted by id.
  pub fn list(&self) -> Vec<Arc<dyn Block>> {
    let mut blocks: Vec<_> = self.blocks.values().cloned().collect();
    blocks.sort_by(|a, b| a.id().cmp(b.id()));
    blocks
  }

  pub fn len(&self) -> usize {
    self.blocks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }
}

impl std::fmt::Debug for BlockRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut ids: Vec<&String> = self.blocks.keys().collect();
    ids.sort();
    f.debug_struct("BlockRegistry").field("blocks", &ids).finish()
  }
}
