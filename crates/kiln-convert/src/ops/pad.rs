use kiln_graph::DataType;

use crate::converter::{layer_failure, transpose_tensor, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::ops;
use crate::value::TensorOrWeights;

/// Emits a padding layer from explicit per-axis pad amounts.
///
/// The engine pads the two innermost axes only, so a pad on axis 1 is
/// wrapped in a transpose pair swapping axes 1 and 3. Padding the batch
/// axis, more than two axes, or axes 1 and 3 together is rejected.
pub(crate) fn convert_pad(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2 || !params.inputs[0].is_tensor() || !params.inputs[1].is_weights()
    {
        return Err(ConversionError::InvalidArgument(format!(
            "input expects tensor and weights, at {}",
            node.name
        )));
    }
    let dims = params.inputs[0].dims().clone();
    let nb_dims = dims.rank() + 1;
    let pads = params.inputs[1].as_weights().cloned().ok_or_else(|| {
        ConversionError::InvalidArgument(format!(
            "pad amounts are expected to be weights, at {}",
            node.name
        ))
    })?;
    if nb_dims != 4 || pads.dims.d != [nb_dims as i64, 2] {
        return Err(ConversionError::InvalidArgument(format!(
            "pad only supports explicit padding on 4 dimensional tensor, at {}",
            node.name
        )));
    }
    if node.attr_dtype("Tpaddings")? != DataType::Int32 {
        return Err(ConversionError::Unimplemented(format!(
            "Tpaddings supports only int32, at {}",
            node.name
        )));
    }
    let Some(pad_data) = params.weight_store.values(&pads).as_i32s() else {
        return Err(ConversionError::InvalidArgument(format!(
            "pad amounts must be int32, at {}",
            node.name
        )));
    };

    let mut pad_index = Vec::new();
    for i in 0..nb_dims {
        if pad_data[2 * i] != 0 || pad_data[2 * i + 1] != 0 {
            pad_index.push(i);
        }
    }
    if pad_index.is_empty() {
        if !params.validation_only {
            let input = params.inputs[0].clone();
            params.outputs.push(input);
        }
        return Ok(());
    }
    if pad_index.len() > 2 {
        return Err(ConversionError::InvalidArgument(format!(
            "padding layer does not support padding on more than two axes, at {}",
            node.name
        )));
    }
    if pad_index[0] == 0 {
        return Err(ConversionError::InvalidArgument(format!(
            "padding layer does not support padding on batch dimension, at {}",
            node.name
        )));
    }
    if pad_index == [1, 3] {
        return Err(ConversionError::Unimplemented(format!(
            "padding layer does not support padding on dimension 1 and 3 together, at {}",
            node.name
        )));
    }
    let pad_data: Vec<i64> = pad_data.iter().map(|v| i64::from(*v)).collect();
    if params.validation_only {
        return Ok(());
    }

    let mut tensor = ops::tensor_id(&params.inputs[0])?;
    let mut legit_pad = true;
    let mut permuted = pad_index.clone();
    if pad_index[0] == 1 {
        legit_pad = false;
        tensor = transpose_tensor(params.network()?, tensor, &[0, 3, 2, 1], node)?;
        permuted[0] = 3;
    }

    let mut pre = (0i64, 0i64);
    let mut post = (0i64, 0i64);
    for (i, &index) in pad_index.iter().enumerate() {
        if permuted[i] == 2 {
            pre.0 = pad_data[2 * index];
            post.0 = pad_data[2 * index + 1];
        } else if permuted[i] == 3 {
            pre.1 = pad_data[2 * index];
            post.1 = pad_data[2 * index + 1];
        }
    }

    let network = params.network()?;
    let mut out = network
        .add_padding(tensor, pre, post)
        .ok_or_else(|| layer_failure(node))?;
    if !legit_pad {
        out = transpose_tensor(network, out, &[0, 3, 2, 1], node)?;
    }
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_graph::{AttributeValue, NodeDef};

    use super::*;
    use crate::ops::testing::OpHarness;

    fn pad_node() -> NodeDef {
        NodeDef::new("pad", "Pad").with_attr("Tpaddings", AttributeValue::Type(DataType::Int32))
    }

    #[test]
    fn test_pad_innermost_axes() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 5, 5]);
        let pads = harness.weights_i32(vec![4, 2], vec![0, 0, 0, 0, 1, 1, 2, 2]);

        let outputs = harness.convert(&pad_node(), vec![input, pads]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 7, 9]);
        assert_eq!(harness.network.num_layers(), 1);
    }

    #[test]
    fn test_pad_axis_one_wraps_in_transposes() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![5, 5, 2]);
        let pads = harness.weights_i32(vec![4, 2], vec![0, 0, 1, 2, 0, 0, 0, 0]);

        let outputs = harness.convert(&pad_node(), vec![input, pads]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![8, 5, 2]);
        // Shuffle in, padding, shuffle out.
        assert_eq!(harness.network.num_layers(), 3);
    }

    #[test]
    fn test_pad_of_zero_forwards_input() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 5, 5]);
        let pads = harness.weights_i32(vec![4, 2], vec![0; 8]);

        let outputs = harness
            .convert(&pad_node(), vec![input.clone(), pads])
            .unwrap();

        assert_eq!(outputs, vec![input]);
        assert_eq!(harness.network.num_layers(), 0);
    }

    #[test]
    fn test_pad_batch_axis_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 5, 5]);
        let pads = harness.weights_i32(vec![4, 2], vec![1, 0, 0, 0, 0, 0, 0, 0]);

        let err = harness.convert(&pad_node(), vec![input, pads]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: padding layer does not support padding on batch dimension, at pad"
        );
    }

    #[test]
    fn test_pad_three_axes_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 5, 5]);
        let pads = harness.weights_i32(vec![4, 2], vec![0, 0, 1, 0, 1, 0, 1, 0]);

        let err = harness.convert(&pad_node(), vec![input, pads]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: padding layer does not support padding on more than two axes, at pad"
        );
    }

    #[test]
    fn test_pad_axes_one_and_three_rejected() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 5, 5]);
        let pads = harness.weights_i32(vec![4, 2], vec![0, 0, 1, 0, 0, 0, 0, 1]);

        let err = harness.convert(&pad_node(), vec![input, pads]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: padding layer does not support padding on dimension 1 and 3 together, at pad"
        );
    }

    #[test]
    fn test_pad_requires_rank_three_input() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![5, 5]);
        let pads = harness.weights_i32(vec![3, 2], vec![0, 0, 1, 1, 1, 1]);

        let err = harness.convert(&pad_node(), vec![input, pads]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: pad only supports explicit padding on 4 dimensional tensor, at pad"
        );
    }

    #[test]
    fn test_pad_requires_int32_tpaddings() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 5, 5]);
        let pads = harness.weights_i32(vec![4, 2], vec![0; 8]);
        let node = NodeDef::new("pad", "Pad")
            .with_attr("Tpaddings", AttributeValue::Type(DataType::Int64));

        let err = harness.convert(&node, vec![input, pads]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "unimplemented: Tpaddings supports only int32, at pad"
        );
    }
}
