use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("duplicate node id: {0}")]
  DuplicateNode(String),

  #[error("link references unknown node: {source_id}.{source_name} -> {sink_id}.{sink_name}")]
  InvalidLink {
    source_id: String,
    source_name: String,
    sink_id: String,
    sink_name: String,
  },

  #[error("no starting nodes found (all nodes have incoming links)")]
  NoStartingNodes,

  #[error("block already registered: {0}")]
  DuplicateBlock(String),

  #[error("node '{node_id}' references unknown block '{block_id}'")]
  UnknownBlock { node_id: String, block_id: String },
}
