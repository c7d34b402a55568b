use crate::converter::{layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::{Dims, ElemType, ScaleMode};
use crate::ops::{self, DataFormat};
use crate::value::TensorOrWeights;
use crate::weights;

/// Emits a scale layer shifting the input by a per-channel bias.
///
/// The scale layer works on rank 3 with the channel axis leading, so other
/// layouts are wrapped in a shuffle pair moving the channel axis to the
/// front and restoring the original shape afterwards.
pub(crate) fn convert_scale(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    let unsupported = || {
        ConversionError::Unimplemented(format!(
            "bias add only supports tensor and weights inputs, at {}",
            node.name
        ))
    };
    if params.inputs.len() != 2 || !params.inputs[0].is_tensor() {
        return Err(unsupported());
    }
    let Some(bias) = params.inputs[1].as_weights().cloned() else {
        return Err(unsupported());
    };
    let data_format = ops::data_format(node)?;
    let dims = params.inputs[0].dims().clone();
    let rank = dims.rank();
    let channel_index = match data_format {
        DataFormat::Nhwc => rank as i64 - 1,
        DataFormat::Nchw => 0,
    };
    if channel_index < 0 {
        return Err(ConversionError::Unimplemented(format!(
            "cannot apply bias add on batch dimension, at {}",
            node.name
        )));
    }
    let channel_index = channel_index as usize;
    if params.validation_only {
        return Ok(());
    }

    let mut bias = bias;
    if params.fp16 && bias.dtype == ElemType::Float32 {
        bias = weights::convert_fp32_to_fp16(params.weight_store, &bias);
    }
    let mut tensor = ops::tensor_id(&params.inputs[0])?;
    let needs_shuffle = channel_index != 0 || rank != 3;
    let mut permutation: Vec<i64> = (0..rank as i64).collect();
    if channel_index != 0 {
        permutation[0] = channel_index as i64;
        permutation[channel_index] = 0;
    }
    if needs_shuffle {
        let first = (channel_index != 0).then(|| permutation.clone());
        let reshape = Dims::new(vec![
            0,
            if rank >= 2 { 0 } else { 1 },
            if rank >= 3 { -1 } else { 1 },
        ]);
        let network = params.network()?;
        tensor = network
            .add_shuffle(tensor, first, Some(reshape), None)
            .ok_or_else(|| layer_failure(node))?;
    }

    let mode = match bias.dims.d.first() {
        None | Some(&1) => ScaleMode::Uniform,
        Some(_) => ScaleMode::Channel,
    };
    let network = params.network()?;
    let mut out = network
        .add_scale(tensor, mode, Some(bias), None, None)
        .ok_or_else(|| layer_failure(node))?;
    if needs_shuffle {
        let mut restore = dims;
        restore.d.swap(0, channel_index);
        let second = (channel_index != 0).then(|| permutation.clone());
        out = network
            .add_shuffle(out, None, Some(restore), second)
            .ok_or_else(|| layer_failure(node))?;
    }
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}
