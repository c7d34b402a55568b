use kiln_graph::DataType;

use crate::converter::{layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::ReduceOp;
use crate::ops;
use crate::value::TensorOrWeights;

/// Emits a reduce layer over the axes named by the second input.
///
/// Axis indices count the batch axis as 0 and may be negative. Reducing the
/// batch axis itself is rejected.
pub(crate) fn convert_reduce(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2 || !params.inputs[0].is_tensor() || !params.inputs[1].is_weights()
    {
        return Err(ConversionError::InvalidArgument(format!(
            "input expects tensor and weights, at {}",
            node.name
        )));
    }
    if node.attr_dtype("Tidx")? != DataType::Int32 {
        return Err(ConversionError::Unimplemented(format!(
            "Tidx supports only int32, at {}",
            node.name
        )));
    }
    let index_list = params.inputs[1].as_weights().cloned().ok_or_else(|| {
        ConversionError::InvalidArgument(format!(
            "axis indices are expected to be weights, at {}",
            node.name
        ))
    })?;
    let Some(index_values) = params.weight_store.values(&index_list).as_i32s() else {
        return Err(ConversionError::InvalidArgument(format!(
            "axis indices must be int32, at {}",
            node.name
        )));
    };
    if index_values.is_empty() {
        return Err(ConversionError::InvalidArgument(format!(
            "cannot support reduce on all (batch) dimensions, at {}",
            node.name
        )));
    }

    let rank = params.inputs[0].dims().rank() as i64;
    let mut axes = 0u32;
    for &raw in index_values {
        let mut axis = i64::from(raw);
        if axis < 0 {
            axis += rank + 1;
        }
        if axis == 0 {
            return Err(ConversionError::InvalidArgument(format!(
                "cannot reduce at batch dimension, at {}",
                node.name
            )));
        }
        if axis < 0 || axis > rank {
            return Err(ConversionError::InvalidArgument(format!(
                "axis {raw} is out of range for input of rank {rank}, at {}",
                node.name
            )));
        }
        axes |= 1 << (axis - 1);
    }
    let op = match node.op.as_str() {
        "Sum" => ReduceOp::Sum,
        "Prod" => ReduceOp::Prod,
        "Max" => ReduceOp::Max,
        "Min" => ReduceOp::Min,
        "Mean" => ReduceOp::Avg,
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "op not supported: {other}, at {}",
                node.name
            )));
        }
    };
    let keep_dims = node.attr_bool("keep_dims")?;
    if params.validation_only {
        return Ok(());
    }

    let input = ops::tensor_id(&params.inputs[0])?;
    let network = params.network()?;
    let out = network
        .add_reduce(input, op, axes, keep_dims)
        .ok_or_else(|| layer_failure(node))?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}
