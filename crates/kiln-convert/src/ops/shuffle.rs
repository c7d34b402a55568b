use crate::converter::{prepare_tensor_for_shape, transpose_tensor, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::Dims;
use crate::ops;
use crate::value::TensorOrWeights;

/// Emits a shuffle layer permuting the input by the second input's values.
///
/// The permutation includes the batch axis as slot 0, which must stay in
/// place.
pub(crate) fn convert_transpose(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2 || !params.inputs[0].is_tensor() || !params.inputs[1].is_weights()
    {
        return Err(ConversionError::InvalidArgument(format!(
            "input expects tensor and weights, at {}",
            node.name
        )));
    }
    let perm_weights = params.inputs[1].as_weights().cloned().ok_or_else(|| {
        ConversionError::InvalidArgument(format!(
            "permutation is expected to be weights, at {}",
            node.name
        ))
    })?;
    let Some(perm_values) = params.weight_store.values(&perm_weights).as_i32s() else {
        return Err(ConversionError::InvalidArgument(format!(
            "permutation must be int32, at {}",
            node.name
        )));
    };
    let order: Vec<i64> = perm_values.iter().map(|v| i64::from(*v)).collect();
    let rank = params.inputs[0].dims().rank();
    if order.len() != rank + 1 {
        return Err(ConversionError::InvalidArgument(
            "rank of permutation for transpose does not match with that of the input".to_string(),
        ));
    }
    if order.first() != Some(&0) {
        return Err(ConversionError::Unimplemented(
            "transpose at batch dimension is not supported".to_string(),
        ));
    }
    if params.validation_only {
        return Ok(());
    }

    let input = ops::tensor_id(&params.inputs[0])?;
    let network = params.network()?;
    let out = transpose_tensor(network, input, &order, node)?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}

/// Emits a reshape, rejecting any target that could change the batch size.
///
/// The target shape includes the batch axis as slot 0; `-1` there defers to
/// the input's batch. Non-batch axes must be fixed and preserve the element
/// count.
pub(crate) fn convert_reshape(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2 || !params.inputs[1].is_weights() {
        return Err(ConversionError::InvalidArgument(format!(
            "input expects weights for shape, at {}",
            node.name
        )));
    }
    let shape_weights = params.inputs[1].as_weights().cloned().ok_or_else(|| {
        ConversionError::InvalidArgument(format!(
            "shape is expected to be weights, at {}",
            node.name
        ))
    })?;
    if shape_weights.count() == 0 {
        return Err(ConversionError::Unimplemented(format!(
            "reshape to shape=[] is not supported, at {}",
            node.name
        )));
    }
    let Some(shape_values) = params.weight_store.values(&shape_weights).as_i32s() else {
        return Err(ConversionError::InvalidArgument(format!(
            "shape must be int32, at {}",
            node.name
        )));
    };

    let input = params.inputs[0].clone();
    let input_batch_dim = input.batch_size();
    let reshape_batch_dim = i64::from(shape_values[0]);
    let reshape_dims = Dims::new(shape_values[1..].iter().map(|v| i64::from(*v)).collect());
    let input_dims = input.dims().clone();

    // Only the batch slot may defer its value. A sentinel anywhere else
    // would ask for per-axis inference.
    if reshape_dims.d.iter().any(|&d| d < 0) {
        return Err(ConversionError::Unimplemented(format!(
            "reshape with inferred non-batch dimension is not supported, at {}",
            node.name
        )));
    }

    let mut may_change_batch = false;
    if input_batch_dim > 0 {
        if reshape_batch_dim == -1 {
            // Infers the batch; the rest must account for every element.
            if !input_dims.is_static()
                || reshape_dims.num_elements() != input_dims.num_elements()
            {
                may_change_batch = true;
            }
        } else if reshape_batch_dim != input_batch_dim {
            may_change_batch = true;
        }
    } else if input_dims.is_static() {
        if !reshape_dims.is_static() || reshape_dims.num_elements() != input_dims.num_elements()
        {
            may_change_batch = true;
        }
    } else {
        may_change_batch = true;
    }
    log::debug!(
        "reshape at {}: input batch dim {input_batch_dim}, target batch dim {reshape_batch_dim}",
        node.name
    );
    if may_change_batch {
        return Err(ConversionError::Unimplemented(format!(
            "reshape on batch dimension is not supported, at {}",
            node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let network = params.network()?;
    let out = prepare_tensor_for_shape(network, &input, &reshape_dims, node)?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_graph::NodeDef;

    use super::*;
    use crate::ops::testing::OpHarness;

    #[test]
    fn test_transpose_permutes_non_batch_axes() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 3, 4]);
        let perm = harness.weights_i32(vec![4], vec![0, 3, 1, 2]);
        let node = NodeDef::new("t", "Transpose");

        let outputs = harness.convert(&node, vec![input, perm]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![4, 2, 3]);
    }

    #[test]
    fn test_transpose_batch_axis_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 3]);
        let perm = harness.weights_i32(vec![3], vec![1, 0, 2]);
        let node = NodeDef::new("t", "Transpose");

        let err = harness.convert(&node, vec![input, perm]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: transpose at batch dimension is not supported"
        );
    }

    #[test]
    fn test_transpose_rank_mismatch() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 3]);
        let perm = harness.weights_i32(vec![2], vec![0, 1]);
        let node = NodeDef::new("t", "Transpose");

        let err = harness.convert(&node, vec![input, perm]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: rank of permutation for transpose does not match with that of the input"
        );
    }

    #[test]
    fn test_transpose_requires_int32_permutation() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 3]);
        let perm = harness.weights_f32(vec![3], vec![0.0, 2.0, 1.0]);
        let node = NodeDef::new("t", "Transpose");

        let err = harness.convert(&node, vec![input, perm]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: permutation must be int32, at t"
        );
    }

    #[test]
    fn test_reshape_keeps_pinned_batch() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 12]);
        let id = input.tensor_id().unwrap();
        let input = TensorOrWeights::tensor(id, Dims::new(vec![2, 12]), 4);
        let shape = harness.weights_i32(vec![2], vec![4, 24]);
        let node = NodeDef::new("r", "Reshape");

        let outputs = harness.convert(&node, vec![input, shape]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![24]);
        assert_eq!(harness.network.num_layers(), 1);
    }

    #[test]
    fn test_reshape_inferred_batch_slot() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 12]);
        let id = input.tensor_id().unwrap();
        let input = TensorOrWeights::tensor(id, Dims::new(vec![2, 12]), 4);
        let shape = harness.weights_i32(vec![3], vec![-1, 6, 4]);
        let node = NodeDef::new("r", "Reshape");

        let outputs = harness.convert(&node, vec![input, shape]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![6, 4]);
    }

    #[test]
    fn test_reshape_inferring_non_batch_axis_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 12]);
        let id = input.tensor_id().unwrap();
        let input = TensorOrWeights::tensor(id, Dims::new(vec![2, 12]), 4);
        let shape = harness.weights_i32(vec![3], vec![4, -1, 6]);
        let node = NodeDef::new("r", "Reshape");

        let err = harness.convert(&node, vec![input, shape]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: reshape with inferred non-batch dimension is not supported, at r"
        );
    }

    #[test]
    fn test_reshape_changing_batch_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 12]);
        let id = input.tensor_id().unwrap();
        let input = TensorOrWeights::tensor(id, Dims::new(vec![2, 12]), 4);
        let shape = harness.weights_i32(vec![2], vec![8, 12]);
        let node = NodeDef::new("r", "Reshape");

        let err = harness.convert(&node, vec![input, shape]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: reshape on batch dimension is not supported, at r"
        );
    }

    #[test]
    fn test_reshape_unknown_batch_keeps_element_count() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![4, 6]);
        let shape = harness.weights_i32(vec![3], vec![1, 3, 8]);
        let node = NodeDef::new("r", "Reshape");

        let outputs = harness.convert(&node, vec![input, shape]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![3, 8]);
    }

    #[test]
    fn test_reshape_element_count_change_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![4, 6]);
        let shape = harness.weights_i32(vec![2], vec![0, 5]);
        let node = NodeDef::new("r", "Reshape");

        let err = harness.convert(&node, vec![input, shape]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: reshape on batch dimension is not supported, at r"
        );
    }

    #[test]
    fn test_reshape_empty_shape_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![4]);
        let shape = harness.weights_i32(vec![0], vec![]);
        let node = NodeDef::new("r", "Reshape");

        let err = harness.convert(&node, vec![input, shape]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: reshape to shape=[] is not supported, at r"
        );
    }
}
