use crate::converter::{layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::TopKOp;
use crate::ops;
use crate::value::TensorOrWeights;

/// Emits a top-k layer over the innermost axis, producing the selected
/// values and their indices.
pub(crate) fn convert_topk(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 2 || !params.inputs[0].is_tensor() || !params.inputs[1].is_weights()
    {
        return Err(ConversionError::InvalidArgument(format!(
            "input expects tensor and weights, at {}",
            node.name
        )));
    }
    let rank = params.inputs[0].dims().rank();
    if rank == 0 {
        return Err(ConversionError::InvalidArgument(format!(
            "top-k cannot apply on batch dimension, at {}",
            node.name
        )));
    }
    let op = match node.op.as_str() {
        "TopKV2" => TopKOp::Max,
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "operation: {other} not implemented, at: {}",
                node.name
            )));
        }
    };
    let k_weights = params.inputs[1].as_weights().cloned().ok_or_else(|| {
        ConversionError::InvalidArgument(format!("k is expected to be weights, at {}", node.name))
    })?;
    let k = match params.weight_store.values(&k_weights).as_i32s() {
        Some([k, ..]) => i64::from(*k),
        _ => {
            return Err(ConversionError::InvalidArgument(format!(
                "k must be a single int32 value, at {}",
                node.name
            )));
        }
    };
    if params.validation_only {
        return Ok(());
    }

    let input = ops::tensor_id(&params.inputs[0])?;
    let network = params.network()?;
    let (values, indices) = network
        .add_topk(input, op, k, 1 << (rank - 1))
        .ok_or_else(|| layer_failure(node))?;
    let values = TensorOrWeights::from_network(network, values);
    let indices = TensorOrWeights::from_network(network, indices);
    params.outputs.push(values);
    params.outputs.push(indices);
    Ok(())
}
