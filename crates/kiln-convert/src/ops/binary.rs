use crate::converter::{self, layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::{ElemType, ElementWiseOp, ScaleMode, UnaryOp};
use crate::ops;
use crate::shape;
use crate::value::{ShapedWeights, TensorOrWeights};
use crate::weights::{self, FoldOp};

/// Converts the arithmetic binary ops.
///
/// A constant operand is first tried as a scale layer, which covers the
/// common bias and normalization patterns with one fused layer. When the
/// operand shapes or the op fall outside what a scale layer can express,
/// the conversion falls back to a broadcast elementwise layer.
pub(crate) fn convert_binary(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2 {
        return Err(ConversionError::FailedPrecondition(format!(
            "binary ops require two inputs, at {}",
            node.name
        )));
    }
    if params.inputs[0].is_weights() && params.inputs[1].is_weights() {
        return Err(ConversionError::Unimplemented(format!(
            "binary op received both input as constant, at: {}",
            node.name
        )));
    }

    if params.inputs[0].is_weights() != params.inputs[1].is_weights() {
        let swapped = params.inputs[0].is_weights();
        let (tensor_index, weight_index) = if swapped { (1, 0) } else { (0, 1) };
        let tensor_value = params.inputs[tensor_index].clone();
        if let Some(constant) = params.inputs[weight_index].as_weights().cloned() {
            match binary_tensor_op_weight(params, &tensor_value, constant, swapped) {
                Ok(()) => return Ok(()),
                Err(err) => log::debug!("failed to add scale layer: {err}"),
            }
        }
    }
    binary_tensor_op_tensor(params)
}

/// Scale-layer rendition of tensor-and-constant arithmetic.
fn binary_tensor_op_weight(
    params: &mut OpConverterParams,
    tensor_value: &TensorOrWeights,
    constant: ShapedWeights,
    swapped_inputs: bool,
) -> Result<()> {
    let node = params.node;
    match node.op.as_str() {
        "Sub" | "Add" | "Mul" | "Div" | "RealDiv" => {}
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "op not supported: {other}, at: {}",
                node.name
            )));
        }
    }
    let dims_t = tensor_value.dims().clone();
    if dims_t.rank() != 3 {
        return Err(ConversionError::Unimplemented(format!(
            "scale layer requires tensor with rank 3, at {}",
            node.name
        )));
    }
    if constant.dtype != ElemType::Float32 && constant.dtype != ElemType::Float16 {
        return Err(ConversionError::Unimplemented(format!(
            "scale layer supports only float weights, at {}",
            node.name
        )));
    }

    let mut dims_w = constant.dims.clone();
    let mut scale_mode = ScaleMode::ElementWise;
    let mut permutation_flag = false;
    if constant.count() == 1 {
        scale_mode = ScaleMode::Uniform;
    } else {
        log::trace!(
            "scale broadcast, weights rank {} tensor rank {}",
            dims_w.rank(),
            dims_t.rank()
        );
        if dims_w.rank() == dims_t.rank() + 1 {
            if dims_w.d.first() == Some(&1) {
                dims_w.d.remove(0);
            } else {
                return Err(ConversionError::InvalidArgument(format!(
                    "binary op cannot operate on batch, at {}",
                    node.name
                )));
            }
        }
        if dims_w.rank() == dims_t.rank() && dims_w.d.first() == dims_t.d.first() {
            for i in 1..dims_w.rank() {
                if dims_w.d[i] != dims_t.d[i] {
                    scale_mode = ScaleMode::Channel;
                    break;
                }
            }
            // A channel candidate must be a pure per-channel vector.
            if scale_mode == ScaleMode::Channel {
                for i in 1..dims_w.rank() {
                    if dims_w.d[i] != 1 {
                        return Err(ConversionError::InvalidArgument(format!(
                            "weight shape not compatible, at {}",
                            node.name
                        )));
                    }
                }
            }
        } else if dims_w.rank() == 1 && dims_w.d[0] == dims_t.d[dims_t.rank() - 1] {
            // Trailing-axis broadcast: swap that axis into the channel slot.
            permutation_flag = true;
            scale_mode = ScaleMode::Channel;
        } else {
            return Err(ConversionError::InvalidArgument(format!(
                "weight shape not compatible, at {}",
                node.name
            )));
        }
    }
    if permutation_flag && dims_t.rank() <= 1 {
        return Err(ConversionError::InvalidArgument(format!(
            "transpose cannot be applied, at {}",
            node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let mut tensor = ops::tensor_id(tensor_value)?;
    let rank = dims_t.rank();
    let mut permutation: Vec<i64> = (0..=rank as i64).collect();
    if permutation_flag {
        permutation[1] = rank as i64;
        permutation[rank] = 1;
        tensor = converter::transpose_tensor(params.network()?, tensor, &permutation, node)?;
    }

    let mut constant = constant;
    if params.fp16 && constant.dtype == ElemType::Float32 {
        constant = weights::convert_fp32_to_fp16(params.weight_store, &constant);
    }

    let mut shift = None;
    let mut scale = None;
    match node.op.as_str() {
        "Sub" => {
            if swapped_inputs {
                shift = Some(constant);
                let network = params.network()?;
                tensor = network
                    .add_unary(tensor, UnaryOp::Neg)
                    .ok_or_else(|| layer_failure(node))?;
            } else {
                shift = Some(weights::unary_compute(
                    params.weight_store,
                    &constant,
                    FoldOp::Neg,
                )?);
            }
        }
        "Div" | "RealDiv" => {
            if swapped_inputs {
                scale = Some(constant);
                let network = params.network()?;
                tensor = network
                    .add_unary(tensor, UnaryOp::Recip)
                    .ok_or_else(|| layer_failure(node))?;
            } else {
                scale = Some(weights::unary_compute(
                    params.weight_store,
                    &constant,
                    FoldOp::Recip,
                )?);
            }
        }
        "Mul" => scale = Some(constant),
        "Add" => shift = Some(constant),
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "binary op not supported: {other}, at {}",
                node.name
            )));
        }
    }

    let network = params.network()?;
    let mut out = network
        .add_scale(tensor, scale_mode, shift, scale, None)
        .ok_or_else(|| layer_failure(node))?;
    if permutation_flag {
        out = converter::transpose_tensor(params.network()?, out, &permutation, node)?;
    }
    let value = TensorOrWeights::from_network(params.network()?, out);
    params.outputs.push(value);
    Ok(())
}

/// Elementwise-layer rendition, broadcasting both operands to a common rank.
fn binary_tensor_op_tensor(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    let op = match node.op.as_str() {
        "Add" => ElementWiseOp::Sum,
        "Mul" => ElementWiseOp::Prod,
        "Sub" => ElementWiseOp::Sub,
        "Div" | "RealDiv" => ElementWiseOp::Div,
        "Minimum" => ElementWiseOp::Min,
        "Maximum" => ElementWiseOp::Max,
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "binary op: {other} not supported at: {}",
                node.name
            )));
        }
    };
    let dtype = ops::elem_type(node.attr_dtype("T")?)?;
    let (dims_l, dims_r) = shape::broadcast_shapes(
        params.inputs[0].dims(),
        params.inputs[0].is_tensor(),
        params.inputs[1].dims(),
        params.inputs[1].is_tensor(),
    )
    .ok_or_else(|| {
        ConversionError::InvalidArgument(format!(
            "binary op broadcast scheme not supported by this op: {}, at: {}",
            node.op, node.name
        ))
    })?;
    if params.validation_only {
        return Ok(());
    }

    let first = params.inputs[0].clone();
    let second = params.inputs[1].clone();
    let tensor_l = converter::prepare_tensor_for_shape(params.network()?, &first, &dims_l, node)?;
    let tensor_r = converter::prepare_tensor_for_shape(params.network()?, &second, &dims_r, node)?;
    let network = params.network()?;
    for id in [tensor_l, tensor_r] {
        let got = network.tensor_dtype(id);
        if got != dtype {
            return Err(ConversionError::InvalidArgument(format!(
                "mismatched data type for binary op: expected {dtype} got {got}, at {}",
                node.name
            )));
        }
    }
    let out = network
        .add_elementwise(tensor_l, tensor_r, op)
        .ok_or_else(|| layer_failure(node))?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_graph::{AttributeValue, DataType, NodeDef};

    use super::*;
    use crate::network::LayerKind;
    use crate::ops::testing::OpHarness;

    fn binary_node(op: &str) -> NodeDef {
        NodeDef::new("bin", op).with_attr("T", AttributeValue::Type(DataType::Float32))
    }

    #[test]
    fn test_mul_uniform_weights_becomes_scale() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 2, 2]);
        let constant = harness.weights_f32(vec![1], vec![2.0]);

        let outputs = harness
            .convert(&binary_node("Mul"), vec![input, constant])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 2, 2]);
        assert_eq!(harness.network.num_layers(), 1);
        assert!(matches!(
            harness.network.layers()[0].kind,
            LayerKind::Scale {
                mode: ScaleMode::Uniform,
                shift: None,
                scale: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_sub_weights_are_negated_into_shift() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 2, 2]);
        let constant = harness.weights_f32(vec![1], vec![3.0]);

        harness
            .convert(&binary_node("Sub"), vec![input, constant])
            .unwrap();

        let LayerKind::Scale {
            shift: Some(shift), ..
        } = &harness.network.layers()[0].kind
        else {
            panic!("expected a scale layer");
        };
        assert_eq!(harness.store.values(shift).as_f32s().unwrap(), &[-3.0]);
    }

    #[test]
    fn test_swapped_sub_negates_the_tensor() {
        let mut harness = OpHarness::new();
        let constant = harness.weights_f32(vec![1], vec![3.0]);
        let input = harness.input("in", vec![2, 2, 2]);

        harness
            .convert(&binary_node("Sub"), vec![constant, input])
            .unwrap();

        assert_eq!(harness.network.num_layers(), 2);
        assert_eq!(
            harness.network.layers()[0].kind,
            LayerKind::Unary { op: UnaryOp::Neg }
        );
        let LayerKind::Scale {
            shift: Some(shift), ..
        } = &harness.network.layers()[1].kind
        else {
            panic!("expected a scale layer");
        };
        assert_eq!(harness.store.values(shift).as_f32s().unwrap(), &[3.0]);
    }

    #[test]
    fn test_swapped_div_takes_reciprocal_of_the_tensor() {
        let mut harness = OpHarness::new();
        let constant = harness.weights_f32(vec![1], vec![4.0]);
        let input = harness.input("in", vec![1, 2, 2]);

        harness
            .convert(&binary_node("RealDiv"), vec![constant, input])
            .unwrap();

        assert_eq!(
            harness.network.layers()[0].kind,
            LayerKind::Unary {
                op: UnaryOp::Recip
            }
        );
        assert!(matches!(
            harness.network.layers()[1].kind,
            LayerKind::Scale {
                scale: Some(_),
                shift: None,
                ..
            }
        ));
    }

    #[test]
    fn test_trailing_axis_weights_transpose_into_channel() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 3, 4]);
        let constant = harness.weights_f32(vec![4], vec![1.0, 2.0, 3.0, 4.0]);

        let outputs = harness
            .convert(&binary_node("Mul"), vec![input, constant])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 3, 4]);
        assert_eq!(harness.network.num_layers(), 3);
        assert!(matches!(
            harness.network.layers()[0].kind,
            LayerKind::Shuffle { .. }
        ));
        assert!(matches!(
            harness.network.layers()[1].kind,
            LayerKind::Scale {
                mode: ScaleMode::Channel,
                ..
            }
        ));
        assert!(matches!(
            harness.network.layers()[2].kind,
            LayerKind::Shuffle { .. }
        ));
    }

    #[test]
    fn test_rank_two_tensor_falls_back_to_elementwise() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 3]);
        let constant = harness.weights_f32(vec![1], vec![2.0]);

        let outputs = harness
            .convert(&binary_node("Mul"), vec![input, constant])
            .unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 3]);
        let kinds: Vec<_> = harness.network.layers().iter().map(|l| &l.kind).collect();
        assert!(matches!(kinds[0], LayerKind::Constant { .. }));
        assert!(matches!(
            kinds[1],
            LayerKind::ElementWise {
                op: ElementWiseOp::Prod
            }
        ));
    }

    #[test]
    fn test_two_tensors_add_elementwise() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![2, 3]);
        let b = harness.input("b", vec![2, 3]);

        let outputs = harness.convert(&binary_node("Add"), vec![a, b]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 3]);
        assert_eq!(harness.network.num_layers(), 1);
        assert_eq!(
            harness.network.layers()[0].kind,
            LayerKind::ElementWise {
                op: ElementWiseOp::Sum
            }
        );
    }

    #[test]
    fn test_maximum_maps_to_max() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![2]);
        let b = harness.input("b", vec![2]);

        harness
            .convert(&binary_node("Maximum"), vec![a, b])
            .unwrap();

        assert_eq!(
            harness.network.layers()[0].kind,
            LayerKind::ElementWise {
                op: ElementWiseOp::Max
            }
        );
    }

    #[test]
    fn test_both_constant_inputs_are_rejected() {
        let mut harness = OpHarness::new();
        let a = harness.weights_f32(vec![1], vec![1.0]);
        let b = harness.weights_f32(vec![1], vec![2.0]);

        let err = harness
            .convert(&binary_node("Add"), vec![a, b])
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: binary op received both input as constant, at: bin"
        );
    }

    #[test]
    fn test_incompatible_broadcast_is_rejected() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![2, 3]);
        let b = harness.input("b", vec![4, 5]);

        let err = harness
            .convert(&binary_node("Add"), vec![a, b])
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: binary op broadcast scheme not supported by this op: \
             Add, at: bin"
        );
    }

    #[test]
    fn test_operand_type_must_match_attribute() {
        let mut harness = OpHarness::new();
        let a = harness.input_typed("a", ElemType::Int32, vec![2]);
        let b = harness.input_typed("b", ElemType::Int32, vec![2]);

        let err = harness
            .convert(&binary_node("Sub"), vec![a, b])
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: mismatched data type for binary op: \
             expected Float32 got Int32, at bin"
        );
    }

    #[test]
    fn test_single_input_is_rejected() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![2]);

        let err = harness.convert(&binary_node("Add"), vec![a]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed precondition: binary ops require two inputs, at bin"
        );
    }
}
