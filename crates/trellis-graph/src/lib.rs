//! Trellis Graph
//!
//! This crate provides the static description of what the scheduler runs:
//! graphs of nodes connected by links, and the blocks those nodes wrap.
//!
//! Key pieces:
//! - [`GraphDef`] is the serializable definition (loaded from JSON or a store)
//! - [`Graph`] is the validated form: links are checked, every node knows its
//!   incoming and outgoing links, and starting nodes are identified
//! - [`Block`] is the unit of computation a node wraps; it consumes a validated
//!   input map and streams `(pin, value)` pairs
//! - [`BlockRegistry`] resolves a block id to its implementation
//!
//! The graph model is read-only to the scheduler.

mod block;
mod error;
mod graph;
mod registry;
mod schema;

pub use block::{Block, BlockData, BlockError, BlockInput, BlockOutput};
pub use error::GraphError;
pub use graph::{Graph, GraphDef, Link, Node, NodeDef};
pub use registry::BlockRegistry;
pub use schema::{BlockSchema, SchemaType, SchemaViolation};
