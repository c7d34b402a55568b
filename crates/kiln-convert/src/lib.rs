//! Translator from computation graphs to inference-engine networks.
//!
//! The entry point is [`converter::convert_graph_to_network`], which walks a
//! topologically ordered [`kiln_graph::ir::GraphDef`] whose boundary nodes
//! follow the engine naming convention and produces a [`network::Network`]
//! plus the weight arena backing its constant buffers.
//!
//! Under the hood every graph op is handled by an entry of the op-conversion
//! catalog in [`ops`]. The same catalog backs [`validator::NodeValidator`],
//! which answers "would this node convert?" without building a network, and
//! [`segment::convert_segment_to_graph`] carves a candidate subgraph out of
//! a larger graph into a form the converter accepts.
//!
//! The engine model has an implicit leading batch axis: tensor shapes inside
//! the network exclude the batch dimension and a single batch size is
//! enforced across the whole network. Conversions that would touch the batch
//! axis are rejected.

pub mod converter;
pub mod logger;
pub mod network;
pub mod ops;
pub mod segment;
pub mod shape;
pub mod validator;
pub mod value;
pub mod weights;

mod error;

pub use error::{ConversionError, Result};
