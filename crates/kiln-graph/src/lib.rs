#![warn(missing_docs)]

//! Framework-neutral computation graph IR.
//!
//! A [`ir::GraphDef`] is a flat, topologically ordered list of
//! [`ir::NodeDef`]s. Nodes reference their producers by name through string
//! input references (`"name"`, `"name:2"`, `"^name"` for control
//! dependencies), carry a typed attribute map, and may embed dense tensor
//! literals for constants.
//!
//! The [`oracle`] module defines the [`oracle::GraphProperties`] interface
//! through which a consumer asks for the statically inferred dtype and
//! partial shape of any tensor in the graph.

pub mod ir;
pub mod oracle;

mod error;

pub use error::GraphError;
pub use ir::*;
