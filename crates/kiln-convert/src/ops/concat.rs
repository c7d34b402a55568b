use kiln_graph::DataType;

use crate::converter::{layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::value::TensorOrWeights;

/// Emits a concatenation layer along the axis named by the last input.
///
/// The axis counts the batch axis as 0 and may be negative. Concatenating
/// on the batch axis is rejected.
pub(crate) fn convert_concat(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() < 2 {
        return Err(ConversionError::InvalidArgument(format!(
            "concat expects at least one value and an axis, at {}",
            node.name
        )));
    }
    let input_size = params.inputs.len() - 1;
    if !params.inputs[0].is_tensor() {
        return Err(ConversionError::InvalidArgument(format!(
            "concat supports only tensor inputs, at {}",
            node.name
        )));
    }
    let axis_weights = params.inputs[input_size].as_weights().cloned().ok_or_else(|| {
        ConversionError::InvalidArgument(format!(
            "concat axis is expected to be weights, at {}",
            node.name
        ))
    })?;
    if node.attr_dtype("Tidx")? != DataType::Int32 {
        return Err(ConversionError::Unimplemented(format!(
            "Tidx supports only int32, at {}",
            node.name
        )));
    }
    let index = match params.weight_store.values(&axis_weights).as_i32s() {
        Some([index, ..]) => i64::from(*index),
        _ => {
            return Err(ConversionError::InvalidArgument(format!(
                "concat axis must be a single int32 value, at {}",
                node.name
            )));
        }
    };

    let dim = params.inputs[0].dims().clone();
    let rank = dim.rank() as i64;
    let out_of_range = || {
        ConversionError::InvalidArgument(format!(
            "concatenate on axis out of dimension range, at {}",
            node.name
        ))
    };
    let on_batch = || {
        ConversionError::InvalidArgument(format!(
            "concatenate on batch dimension is not supported, at {}",
            node.name
        ))
    };
    let mut index = index;
    if index > rank {
        return Err(out_of_range());
    }
    if index == 0 {
        return Err(on_batch());
    }
    if index < 0 {
        index += rank + 1;
        if index == 0 {
            return Err(on_batch());
        }
        if index < 0 {
            return Err(out_of_range());
        }
    }
    let axis = (index - 1) as usize;

    let mut ids = Vec::with_capacity(input_size);
    for value in &params.inputs[..input_size] {
        if !value.is_tensor() {
            return Err(ConversionError::InvalidArgument(format!(
                "concat supports only tensor inputs, at {}",
                node.name
            )));
        }
        let other = value.dims();
        if other.rank() != dim.rank() {
            return Err(ConversionError::InvalidArgument(format!(
                "concatenate receives inputs with inconsistent rank, at {}",
                node.name
            )));
        }
        for (i, (a, b)) in dim.d.iter().zip(other.d.iter()).enumerate() {
            if i != axis && a != b {
                return Err(ConversionError::InvalidArgument(format!(
                    "concatenate receives inputs with inconsistent shape, at {}",
                    node.name
                )));
            }
        }
        ids.push(value.tensor_id());
    }
    if params.validation_only {
        return Ok(());
    }

    let ids = ids
        .into_iter()
        .map(|id| {
            id.ok_or_else(|| {
                ConversionError::Internal("value has no network tensor".to_string())
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let network = params.network()?;
    let out = network
        .add_concatenation(&ids, axis)
        .ok_or_else(|| layer_failure(node))?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}
