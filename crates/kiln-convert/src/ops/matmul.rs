use kiln_graph::DataType;

use crate::converter::{self, layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::{Dims, ElemType};
use crate::value::{ShapedWeights, TensorOrWeights};
use crate::weights;

fn check_matmul_type(node: &kiln_graph::NodeDef) -> Result<()> {
    let dtype = node.attr_dtype("T")?;
    if dtype != DataType::Float32 && dtype != DataType::Float16 {
        return Err(ConversionError::Unimplemented(format!(
            "data type is not supported, for node {} got {}",
            node.name, dtype
        )));
    }
    Ok(())
}

/// Emits a fully connected layer computing `input * kernel`.
///
/// The kernel arrives CK from the graph unless the op already transposes it.
/// Inputs below rank 3 are padded with trailing unit axes, and the
/// `(noutput, 1, 1)` layer output is flattened back to one axis.
fn matmul_helper(
    params: &mut OpConverterParams,
    tensor_input: &TensorOrWeights,
    kernel: ShapedWeights,
    transpose_weight: bool,
) -> Result<()> {
    let node = params.node;
    if !tensor_input.is_tensor() {
        return Err(ConversionError::InvalidArgument(format!(
            "input 0 expects tensor, at {}",
            node.name
        )));
    }
    if kernel.dims.rank() != 2 {
        return Err(ConversionError::InvalidArgument(format!(
            "fully connected kernel must have rank 2, at {}",
            node.name
        )));
    }
    if kernel.dtype != ElemType::Float32 && kernel.dtype != ElemType::Float16 {
        return Err(ConversionError::Unimplemented(format!(
            "only float32 or float16 kernel data type is supported, for node {} got {}",
            node.name, kernel.dtype
        )));
    }
    let input_dims = tensor_input.dims().clone();
    if input_dims.rank() > 3 {
        return Err(ConversionError::InvalidArgument(format!(
            "fully connected input must have rank 3 or less, at {}",
            node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let kernel = if transpose_weight {
        kernel
    } else {
        weights::reorder_ck_to_kc(params.weight_store, &kernel)
    };
    let noutput = kernel.dims.d[0];

    let mut padded = input_dims;
    while padded.rank() != 3 {
        padded.d.push(1);
    }
    let input_id =
        converter::prepare_tensor_for_shape(params.network()?, tensor_input, &padded, node)?;
    let network = params.network()?;
    let out = network
        .add_fully_connected(input_id, noutput, kernel, None)
        .ok_or_else(|| layer_failure(node))?;
    let fc_value = TensorOrWeights::from_network(network, out);

    let flat = Dims::new(vec![noutput]);
    let out = converter::prepare_tensor_for_shape(params.network()?, &fc_value, &flat, node)?;
    let value = TensorOrWeights::from_network(params.network()?, out);
    params.outputs.push(value);
    Ok(())
}

/// Two-dimensional matrix product against a constant kernel.
///
/// Also serves as the validator entry for the op, so every precondition is
/// checked before anything touches the network.
pub(crate) fn convert_matmul(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2
        || !params.inputs[0].is_tensor()
        || !params.inputs[1].is_weights()
    {
        return Err(ConversionError::InvalidArgument(format!(
            "input expects tensor and weights, at {}",
            node.name
        )));
    }
    check_matmul_type(node)?;
    let transpose_a = node.attr_bool("transpose_a")?;
    let transpose_b = node.attr_bool("transpose_b")?;
    if transpose_a {
        return Err(ConversionError::Internal(format!(
            "transpose_a is not supported for fully connected layer, at: {}",
            node.name
        )));
    }
    let input0 = params.inputs[0].clone();
    if let Some(kernel) = params.inputs[1].as_weights().cloned() {
        return matmul_helper(params, &input0, kernel, transpose_b);
    }
    Err(ConversionError::InvalidArgument(format!(
        "input expects tensor and weights, at {}",
        node.name
    )))
}

/// Batched matrix product.
///
/// A rank-1 first operand degenerates to the fully connected path. Constant
/// operands must carry a leading unit axis standing in for the batch, which
/// is stripped before the layer broadcast.
pub(crate) fn convert_batch_matmul(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2 {
        return Err(ConversionError::FailedPrecondition(format!(
            "batch matmul requires two inputs, at {}",
            node.name
        )));
    }
    check_matmul_type(node)?;
    let transpose_a = node.attr_bool("adj_x")?;
    let transpose_b = node.attr_bool("adj_y")?;

    if params.inputs[0].dims().rank() == 1 {
        // A vector times a constant matrix only works as fully connected.
        if !transpose_a && params.inputs[0].is_tensor() {
            if let Some(kernel) = params.inputs[1].as_weights().cloned() {
                let input0 = params.inputs[0].clone();
                return matmul_helper(params, &input0, kernel, transpose_b);
            }
        }
        return Err(ConversionError::InvalidArgument(format!(
            "invalid configuration for batch matmul, at: {}",
            node.name
        )));
    }

    let mut dims_l = params.inputs[0].dims().clone();
    let mut dims_r = params.inputs[1].dims().clone();
    for (index, dims) in [(0usize, &mut dims_l), (1, &mut dims_r)] {
        if params.inputs[index].is_weights() {
            if dims.d.first() != Some(&1) {
                return Err(ConversionError::InvalidArgument(format!(
                    "input {index} as weight assumes broadcast across batch for matmul, at: {}",
                    node.name
                )));
            }
            dims.d.remove(0);
        }
    }
    if params.validation_only {
        return Ok(());
    }

    let first = params.inputs[0].clone();
    let second = params.inputs[1].clone();
    let tensor_l = converter::prepare_tensor_for_shape(params.network()?, &first, &dims_l, node)?;
    let tensor_r = converter::prepare_tensor_for_shape(params.network()?, &second, &dims_r, node)?;
    let network = params.network()?;
    let out = network
        .add_matrix_multiply(tensor_l, transpose_a, tensor_r, transpose_b)
        .ok_or_else(|| layer_failure(node))?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_graph::{AttributeValue, NodeDef};

    use super::*;
    use crate::network::LayerKind;
    use crate::ops::testing::OpHarness;

    fn matmul_node(transpose_a: bool, transpose_b: bool) -> NodeDef {
        NodeDef::new("mm", "MatMul")
            .with_attr("T", AttributeValue::Type(DataType::Float32))
            .with_attr("transpose_a", AttributeValue::Bool(transpose_a))
            .with_attr("transpose_b", AttributeValue::Bool(transpose_b))
    }

    fn batch_matmul_node(adj_x: bool, adj_y: bool) -> NodeDef {
        NodeDef::new("bmm", "BatchMatMul")
            .with_attr("T", AttributeValue::Type(DataType::Float32))
            .with_attr("adj_x", AttributeValue::Bool(adj_x))
            .with_attr("adj_y", AttributeValue::Bool(adj_y))
    }

    #[test]
    fn test_matmul_reorders_ck_kernel() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![6]);
        let kernel = harness.weights_f32(vec![6, 4], vec![0.5; 24]);

        let outputs = harness
            .convert(&matmul_node(false, false), vec![input, kernel])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![4]);
        // Reshape in, fully connected, flatten out.
        assert_eq!(harness.network.num_layers(), 3);
        let LayerKind::FullyConnected {
            noutput, kernel, ..
        } = &harness.network.layers()[1].kind
        else {
            panic!("expected a fully connected layer");
        };
        assert_eq!(*noutput, 4);
        assert_eq!(kernel.dims.d, vec![4, 6]);
    }

    #[test]
    fn test_matmul_transposed_kernel_is_used_as_is() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![6]);
        let kernel = harness.weights_f32(vec![4, 6], vec![0.5; 24]);

        let outputs = harness
            .convert(&matmul_node(false, true), vec![input, kernel])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![4]);
        let LayerKind::FullyConnected { kernel, .. } = &harness.network.layers()[1].kind
        else {
            panic!("expected a fully connected layer");
        };
        assert_eq!(kernel.dims.d, vec![4, 6]);
    }

    #[test]
    fn test_matmul_rejects_transpose_a() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![6]);
        let kernel = harness.weights_f32(vec![6, 4], vec![0.5; 24]);

        let err = harness
            .convert(&matmul_node(true, false), vec![input, kernel])
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "internal: transpose_a is not supported for fully connected layer, at: mm"
        );
    }

    #[test]
    fn test_matmul_rejects_integer_type() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![6]);
        let kernel = harness.weights_f32(vec![6, 4], vec![0.5; 24]);
        let node = NodeDef::new("mm", "MatMul")
            .with_attr("T", AttributeValue::Type(DataType::Int32))
            .with_attr("transpose_a", AttributeValue::Bool(false))
            .with_attr("transpose_b", AttributeValue::Bool(false));

        let err = harness.convert(&node, vec![input, kernel]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: data type is not supported, for node mm got Int32"
        );
    }

    #[test]
    fn test_matmul_rejects_tensor_kernel() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![6]);
        let b = harness.input("b", vec![6, 4]);

        let err = harness
            .convert(&matmul_node(false, false), vec![a, b])
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: input expects tensor and weights, at mm"
        );
    }

    #[test]
    fn test_batch_matmul_of_two_tensors() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![2, 3, 4]);
        let b = harness.input("b", vec![2, 4, 5]);

        let outputs = harness
            .convert(&batch_matmul_node(false, false), vec![a, b])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 3, 5]);
        assert_eq!(
            harness.network.layers()[0].kind,
            LayerKind::MatrixMultiply {
                transpose_a: false,
                transpose_b: false,
            }
        );
    }

    #[test]
    fn test_batch_matmul_strips_unit_batch_from_weights() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![3, 4]);
        let b = harness.weights_f32(vec![1, 4, 5], vec![0.1; 20]);

        let outputs = harness
            .convert(&batch_matmul_node(false, false), vec![a, b])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![3, 5]);
        // The constant tensor is materialized without its unit batch axis.
        let constant = &harness.network.layers()[0];
        assert!(matches!(constant.kind, LayerKind::Constant { .. }));
        assert_eq!(
            harness.network.tensor_dims(constant.outputs[0]).d,
            vec![4, 5]
        );
    }

    #[test]
    fn test_batch_matmul_rejects_weights_without_unit_batch() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![3, 4]);
        let b = harness.weights_f32(vec![2, 4, 5], vec![0.1; 40]);

        let err = harness
            .convert(&batch_matmul_node(false, false), vec![a, b])
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: input 1 as weight assumes broadcast across batch \
             for matmul, at: bmm"
        );
    }

    #[test]
    fn test_batch_matmul_vector_input_uses_fully_connected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![6]);
        let kernel = harness.weights_f32(vec![6, 4], vec![0.5; 24]);

        let outputs = harness
            .convert(&batch_matmul_node(false, false), vec![input, kernel])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![4]);
        assert!(matches!(
            harness.network.layers()[1].kind,
            LayerKind::FullyConnected { .. }
        ));
    }

    #[test]
    fn test_batch_matmul_vector_against_tensor_is_rejected() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![6]);
        let b = harness.input("b", vec![6, 4]);

        let err = harness
            .convert(&batch_matmul_node(false, false), vec![a, b])
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: invalid configuration for batch matmul, at: bmm"
        );
    }
}
