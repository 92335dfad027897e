use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::block::BlockInput;
use crate::error::GraphError;
use crate::registry::BlockRegistry;

/// Directed data-flow edge from one node's output pin to another node's input pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
  pub source_id: String,
  pub source_name: String,
  pub sink_id: String,
  pub sink_name: String,
}

/// Serializable node definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  pub id: String,
  pub block_id: String,
  #[serde(default)]
  pub input_default: BlockInput,
}

/// Serializable graph definition, as loaded from JSON or a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
  pub id: String,
  #[serde(default = "default_version")]
  pub version: u32,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub description: String,
  pub nodes: Vec<NodeDef>,
  #[serde(default)]
  pub links: Vec<Link>,
}

fn default_version() -> u32 {
  1
}

/// A block instance inside a validated graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
  pub id: String,
  pub block_id: String,
  pub input_default: BlockInput,
  /// Links whose sink is this node.
  pub input_links: Vec<Link>,
  /// Links whose source is this node.
  pub output_links: Vec<Link>,
}

impl Node {
  /// Distinct sink pin names across the node's incoming links.
  pub fn required_upstream_pins(&self) -> BTreeSet<String> {
    self
      .input_links
      .iter()
      .map(|link| link.sink_name.clone())
      .collect()
  }
}

/// A validated, indexed graph.
///
/// Built from a [`GraphDef`]. Every link references existing nodes, node ids
/// are unique, and at least one node has no incoming links. Cycles are
/// permitted; loop-back edges simply start a new execution record for the
/// re-entered node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphDef", into = "GraphDef")]
pub struct Graph {
  id: String,
  version: u32,
  name: String,
  description: String,
  /// Nodes in definition order.
  nodes: Vec<Node>,
  /// node_id -> position in `nodes`.
  index: HashMap<String, usize>,
  links: Vec<Link>,
  /// Nodes with no incoming links.
  starting_nodes: Vec<String>,
}

impl Graph {
  /// Validate a definition and build the graph.
  pub fn new(def: GraphDef) -> Result<Self, GraphError> {
    let mut nodes = Vec::with_capacity(def.nodes.len());
    let mut index = HashMap::with_capacity(def.nodes.len());

    for node_def in def.nodes {
      if index.contains_key(&node_def.id) {
        return Err(GraphError::DuplicateNode(node_def.id));
      }
      index.insert(node_def.id.clone(), nodes.len());
      nodes.push(Node {
        id: node_def.id,
        block_id: node_def.block_id,
        input_default: node_def.input_default,
        input_links: Vec::new(),
        output_links: Vec::new(),
      });
    }

    for link in &def.links {
      let (Some(&source), Some(&sink)) = (index.get(&link.source_id), index.get(&link.sink_id))
      else {
        return Err(GraphError::InvalidLink {
          source_id: link.source_id.clone(),
          source_name: link.source_name.clone(),
          sink_id: link.sink_id.clone(),
          sink_name: link.sink_name.clone(),
        });
      };
      nodes[source].output_links.push(link.clone());
      nodes[sink].input_links.push(link.clone());
    }

    let starting_nodes: Vec<String> = nodes
      .iter()
      .filter(|node| node.input_links.is_empty())
      .map(|node| node.id.clone())
      .collect();

    if starting_nodes.is_empty() {
      return Err(GraphError::NoStartingNodes);
    }

    Ok(Self {
      id: def.id,
      version: def.version,
      name: def.name,
      description: def.description,
      nodes,
      index,
      links: def.links,
      starting_nodes,
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  /// Look up a node by id.
  pub fn node(&self, node_id: &str) -> Option<&Node> {
    self.index.get(node_id).map(|&i| &self.nodes[i])
  }

  /// All nodes, in definition order.
  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn links(&self) -> &[Link] {
    &self.links
  }

  /// Ids of nodes with no incoming links.
  pub fn starting_nodes(&self) -> &[String] {
    &self.starting_nodes
  }

  /// Check that every node references a registered block.
  pub fn validate_blocks(&self, registry: &BlockRegistry) -> Result<(), GraphError> {
    for node in &self.nodes {
      if !registry.contains(&node.block_id) {
        return Err(GraphError::UnknownBlock {
          node_id: node.id.clone(),
          block_id: node.block_id.clone(),
        });
      }
    }
    Ok(())
  }
}

impl TryFrom<GraphDef> for Graph {
  type Error = GraphError;

  fn try_from(def: GraphDef) -> Result<Self, Self::Error> {
    Graph::new(def)
  }
}

impl From<Graph> for GraphDef {
  fn from(graph: Graph) -> Self {
    GraphDef {
      id: graph.id,
      version: graph.version,
      name: graph.name,
      description: graph.description,
      nodes: graph
        .nodes
        .into_iter()
        .map(|node| NodeDef {
          id: node.id,
          block_id: node.block_id,
          input_default: node.input_default,
        })
        .collect(),
      links: graph.links,
    }
  }
}
