//! Shape and dtype oracle.
//!
//! Consumers of a graph (translators, segmenters) need the statically
//! inferred type and shape of arbitrary tensors without re-running shape
//! inference themselves. [`GraphProperties`] is that interface; how the
//! properties were obtained is the provider's business.

use std::collections::HashMap;

use crate::ir::{DataType, PartialShape};

/// Inferred dtype and shape of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct TensorProperties {
    /// Element type.
    pub dtype: DataType,
    /// Possibly incomplete shape, including the batch axis.
    pub shape: PartialShape,
}

/// Query interface for statically inferred tensor properties.
///
/// Both sides of a node are addressable: `output_properties` describes what
/// a node produces at an output port, `input_properties` describes what it
/// receives at an input slot. Either query returns `None` when the provider
/// has no record for that tensor.
pub trait GraphProperties {
    /// Properties of output `port` of node `node`.
    fn output_properties(&self, node: &str, port: usize) -> Option<TensorProperties>;

    /// Properties of input slot `port` of node `node`.
    fn input_properties(&self, node: &str, port: usize) -> Option<TensorProperties>;
}

/// Map-backed [`GraphProperties`] provider.
///
/// Useful when the properties come precomputed from an external inference
/// pass, and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProperties {
    outputs: HashMap<(String, usize), TensorProperties>,
    inputs: HashMap<(String, usize), TensorProperties>,
}

impl StaticProperties {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the properties of an output port.
    pub fn set_output(&mut self, node: impl Into<String>, port: usize, props: TensorProperties) {
        self.outputs.insert((node.into(), port), props);
    }

    /// Records the properties of an input slot.
    pub fn set_input(&mut self, node: impl Into<String>, port: usize, props: TensorProperties) {
        self.inputs.insert((node.into(), port), props);
    }
}

impl GraphProperties for StaticProperties {
    fn output_properties(&self, node: &str, port: usize) -> Option<TensorProperties> {
        self.outputs.get(&(node.to_string(), port)).cloned()
    }

    fn input_properties(&self, node: &str, port: usize) -> Option<TensorProperties> {
        self.inputs.get(&(node.to_string(), port)).cloned()
    }
}
