//! Node and edge admission checks.
//!
//! Segment selection runs before conversion and must predict which nodes
//! the converter will accept. [`NodeValidator`] replays a node through the
//! validator registered for its op in validation mode, with a throwaway
//! weight arena and no network. The edge validators decide which graph
//! edges may become segment inputs and outputs.

use std::collections::HashMap;

use kiln_graph::ir::{DataType, Edge, GraphDef, NodeDef, PartialShape};
use kiln_graph::oracle::GraphProperties;

use crate::converter::{OpConverter, OpConverterParams};
use crate::error::ConversionError;
use crate::network::{ElemType, MAX_DIMS};
use crate::ops;
use crate::value::{TensorOrWeights, WeightStore};
use crate::Result;

/// Checks that a tensor of `shape` and `dtype` can become an engine input.
///
/// The rank must be known and at most [`MAX_DIMS`] plus the batch axis, and
/// every non-batch axis must have a known size.
pub fn validate_input_properties(shape: &PartialShape, dtype: DataType) -> Result<ElemType> {
    let elem = ops::elem_type(dtype)?;
    let Some(dims) = shape.dims() else {
        return Err(ConversionError::InvalidArgument(
            "input tensor rank is unknown".to_string(),
        ));
    };
    if dims.len() > MAX_DIMS + 1 {
        return Err(ConversionError::OutOfRange(
            "input tensor rank is greater than 8".to_string(),
        ));
    }
    for (d, size) in dims.iter().enumerate().skip(1) {
        if *size < 0 {
            return Err(ConversionError::InvalidArgument(format!(
                "input tensor with shape {shape} has an unknown non-batch dimension at dim {d}"
            )));
        }
    }
    Ok(elem)
}

/// Dry-runs op preconditions against candidate nodes.
pub struct NodeValidator {
    op_validators: HashMap<&'static str, OpConverter>,
    weight_store: WeightStore,
}

impl NodeValidator {
    /// Validator with the built-in per-op registry.
    pub fn new() -> Self {
        Self {
            op_validators: ops::register_op_validators(),
            weight_store: WeightStore::new(),
        }
    }

    /// Scratch arena for building weight stand-ins for `inputs`.
    pub fn weight_store_mut(&mut self) -> &mut WeightStore {
        &mut self.weight_store
    }

    /// Runs the validator registered for the node's op, if any.
    ///
    /// Ops without a registered validator pass; actual conversion may still
    /// reject them. `inputs` carry shapes and constants only, no tensor has
    /// to be materialized.
    pub fn validate_node(&mut self, node: &NodeDef, inputs: Vec<TensorOrWeights>) -> Result<()> {
        let Some(validator) = self.op_validators.get(node.op.as_str()).copied() else {
            return Ok(());
        };
        let mut params =
            OpConverterParams::new(node, inputs, true, None, &mut self.weight_store, false);
        validator(&mut params)
    }
}

impl Default for NodeValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `edge` may become a data input of a segment.
///
/// The producer side must have known properties that pass
/// [`validate_input_properties`], and unless the producer is a constant it
/// must carry at least a batch and one data axis.
pub fn input_edge_valid(graph: &GraphDef, properties: &dyn GraphProperties, edge: &Edge) -> bool {
    if edge.control {
        return true;
    }
    let Some(props) = properties.output_properties(&edge.src, edge.src_port) else {
        log::debug!(
            "need to remove input node {}: no inferred properties for {}:{}",
            edge.dst,
            edge.src,
            edge.src_port
        );
        return false;
    };
    if let Err(e) = validate_input_properties(&props.shape, props.dtype) {
        log::debug!("need to remove input node {}: {e}", edge.dst);
        return false;
    }
    let src_is_const = graph.node(&edge.src).is_some_and(|n| n.op == "Const");
    if !src_is_const && props.shape.rank().unwrap_or(0) < 2 {
        log::debug!(
            "need to remove input node {} which has an input at port {} with rank < 2 \
             and is not a const: {}",
            edge.dst,
            edge.dst_port,
            props.shape
        );
        return false;
    }
    true
}

/// Whether `edge` may become a data output of a segment.
pub fn output_edge_valid(graph: &GraphDef, edge: &Edge) -> bool {
    if edge.control {
        return true;
    }
    if graph.node(&edge.src).is_some_and(|n| n.op == "Const") {
        log::debug!("need to remove output node {} which is a const", edge.src);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use kiln_graph::ir::{AttributeValue, LiteralData, TensorLiteral};
    use kiln_graph::oracle::{StaticProperties, TensorProperties};

    use crate::network::Dims;

    use super::*;

    #[test]
    fn test_validate_input_properties() {
        let elem =
            validate_input_properties(&PartialShape::new(vec![-1, 3, 5]), DataType::Float32)
                .unwrap();
        assert_eq!(elem, ElemType::Float32);

        let err =
            validate_input_properties(&PartialShape::unknown(), DataType::Float32).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: input tensor rank is unknown");

        let err = validate_input_properties(&PartialShape::new(vec![1; 10]), DataType::Float32)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "out of range: input tensor rank is greater than 8"
        );

        let err =
            validate_input_properties(&PartialShape::new(vec![4, 3, -1]), DataType::Float32)
                .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument: input tensor with shape [4,3,?] has an unknown non-batch dimension at dim 2"
        );

        let err =
            validate_input_properties(&PartialShape::new(vec![4, 3]), DataType::Bool).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: unsupported data type Bool");
    }

    #[test]
    fn test_validate_node_without_registered_validator() {
        let mut validator = NodeValidator::new();
        let node = NodeDef::new("act", "Relu");
        validator.validate_node(&node, vec![]).unwrap();
    }

    #[test]
    fn test_validate_transpose_node() {
        let mut validator = NodeValidator::new();
        let node = NodeDef::new("t", "Transpose")
            .with_input("in")
            .with_input("perm");
        let perm = validator.weight_store_mut().insert(
            Dims::new(vec![4]),
            crate::value::WeightBuf::I32(vec![0, 3, 1, 2]),
        );
        let inputs = vec![
            TensorOrWeights::shape_only(Dims::new(vec![2, 3, 5]), -1),
            TensorOrWeights::Weights(perm),
        ];
        validator.validate_node(&node, inputs).unwrap();

        // Batch permutation is rejected already during validation.
        let perm = validator.weight_store_mut().insert(
            Dims::new(vec![4]),
            crate::value::WeightBuf::I32(vec![1, 0, 2, 3]),
        );
        let inputs = vec![
            TensorOrWeights::shape_only(Dims::new(vec![2, 3, 5]), -1),
            TensorOrWeights::Weights(perm),
        ];
        let err = validator.validate_node(&node, inputs).unwrap_err();
        assert!(matches!(err, ConversionError::Unimplemented(_)));
    }

    #[test]
    fn test_validate_const_node() {
        let mut validator = NodeValidator::new();
        let node = NodeDef::new("c", "Const")
            .with_attr("dtype", AttributeValue::Type(DataType::Float32))
            .with_attr(
                "value",
                AttributeValue::Tensor(TensorLiteral {
                    dtype: DataType::Float32,
                    shape: vec![2],
                    data: LiteralData::Floats(vec![1.0, 2.0]),
                }),
            );
        validator.validate_node(&node, vec![]).unwrap();
        // The stand-in weights land in the validator's own arena.
        assert!(!validator.weight_store_mut().is_empty());
    }

    fn edge(src: &str, dst: &str, control: bool) -> Edge {
        Edge::new(src.to_string(), 0, dst.to_string(), 0, control)
    }

    fn graph_with_const_and_op() -> GraphDef {
        let mut graph = GraphDef::new(vec![]);
        graph.add_node(NodeDef::new("weights", "Const"));
        graph.add_node(NodeDef::new("act", "Relu"));
        graph
    }

    #[test]
    fn test_input_edge_valid() {
        let graph = graph_with_const_and_op();
        let mut props = StaticProperties::default();
        props.set_output(
            "act",
            0,
            TensorProperties::new(DataType::Float32, PartialShape::new(vec![-1, 3, 5])),
        );
        props.set_output(
            "weights",
            0,
            TensorProperties::new(DataType::Float32, PartialShape::new(vec![5])),
        );
        props.set_output(
            "rank1",
            0,
            TensorProperties::new(DataType::Float32, PartialShape::new(vec![5])),
        );

        assert!(input_edge_valid(&graph, &props, &edge("act", "dst", false)));
        // Constants are exempt from the rank requirement.
        assert!(input_edge_valid(&graph, &props, &edge("weights", "dst", false)));
        assert!(!input_edge_valid(&graph, &props, &edge("rank1", "dst", false)));
        // No inferred properties at all.
        assert!(!input_edge_valid(&graph, &props, &edge("ghost", "dst", false)));
        assert!(input_edge_valid(&graph, &props, &edge("ghost", "dst", true)));
    }

    #[test]
    fn test_output_edge_valid() {
        let graph = graph_with_const_and_op();
        assert!(output_edge_valid(&graph, &edge("act", "dst", false)));
        assert!(!output_edge_valid(&graph, &edge("weights", "dst", false)));
        assert!(output_edge_valid(&graph, &edge("weights", "dst", true)));
    }
}
