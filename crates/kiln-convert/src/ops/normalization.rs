use half::f16;

use crate::converter::{layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::{ElemType, ScaleMode};
use crate::ops::{self, DataFormat};
use crate::value::{ShapedWeights, TensorOrWeights, WeightBuf, WeightStore};

/// Folds an inference-time batch norm into a single scale layer.
///
/// With the statistics frozen, `(x - mean) / sqrt(variance + eps) * gamma +
/// beta` collapses to one multiplier and one shift per channel, computed here
/// at build time.
pub(crate) fn convert_fused_batch_norm(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 5
        || !params.inputs[0].is_tensor()
        || params.inputs[1..].iter().any(|input| !input.is_weights())
    {
        return Err(ConversionError::Unimplemented(format!(
            "batch norm expects one tensor input and four constant parameters, at {}",
            node.name
        )));
    }
    let epsilon = node.attr_float("epsilon")?;
    if ops::data_format(node)? != DataFormat::Nchw {
        return Err(ConversionError::Unimplemented(format!(
            "only data_format=NCHW is supported, at {}",
            node.name
        )));
    }
    if node.attr_bool("is_training")? {
        return Err(ConversionError::Unimplemented(format!(
            "only is_training=false is supported, at {}",
            node.name
        )));
    }

    // Order fixed by the op: gamma, beta, moving mean, moving variance.
    let parameters: Vec<ShapedWeights> = params.inputs[1..]
        .iter()
        .filter_map(|input| input.as_weights().cloned())
        .collect();
    let parameter_type = parameters[0].dtype;
    if parameter_type != ElemType::Float32 && parameter_type != ElemType::Float16 {
        return Err(ConversionError::Unimplemented(format!(
            "only float32 or float16 weight data type is supported, for node {} got {}",
            node.name, parameter_type
        )));
    }
    if parameters.iter().any(|w| w.dtype != parameter_type) {
        return Err(ConversionError::Unimplemented(format!(
            "inconsistent parameter type for batch norm, at: {}",
            node.name
        )));
    }
    let mut nweight = 0i64;
    let mut template = &parameters[0];
    for parameter in &parameters {
        if parameter.count() > nweight {
            nweight = parameter.count();
            template = parameter;
        }
    }
    if parameters
        .iter()
        .any(|w| w.count() != nweight && w.count() != 1)
    {
        return Err(ConversionError::InvalidArgument(format!(
            "inconsistent batch norm parameter count, at: {}",
            node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let read_f32 = |store: &WeightStore, weights: &ShapedWeights| -> Result<Vec<f32>> {
        match store.values(weights) {
            WeightBuf::F32(values) => Ok(values.clone()),
            WeightBuf::F16(values) => Ok(values.iter().map(|v| v.to_f32()).collect()),
            other => Err(ConversionError::Internal(format!(
                "unexpected batch norm parameter type {}, at: {}",
                other.elem_type(),
                node.name
            ))),
        }
    };
    let gamma = read_f32(params.weight_store, &parameters[0])?;
    let beta = read_f32(params.weight_store, &parameters[1])?;
    let mean = read_f32(params.weight_store, &parameters[2])?;
    let variance = read_f32(params.weight_store, &parameters[3])?;

    let index = |count: i64, i: usize| if count == 1 { 0 } else { i };
    let mut combined_scale = Vec::with_capacity(nweight as usize);
    let mut combined_offset = Vec::with_capacity(nweight as usize);
    for i in 0..nweight as usize {
        let scale = gamma[index(parameters[0].count(), i)]
            / (variance[index(parameters[3].count(), i)] + epsilon).sqrt();
        combined_scale.push(scale);
        combined_offset
            .push(beta[index(parameters[1].count(), i)] - mean[index(parameters[2].count(), i)] * scale);
    }

    let dims = template.dims.clone();
    let (scale_weights, offset_weights) = if parameter_type == ElemType::Float16 {
        let halves = |values: Vec<f32>| {
            WeightBuf::F16(values.into_iter().map(f16::from_f32).collect())
        };
        (
            params.weight_store.insert(dims.clone(), halves(combined_scale)),
            params.weight_store.insert(dims, halves(combined_offset)),
        )
    } else {
        (
            params
                .weight_store
                .insert(dims.clone(), WeightBuf::F32(combined_scale)),
            params
                .weight_store
                .insert(dims, WeightBuf::F32(combined_offset)),
        )
    };

    let mode = if nweight == 1 {
        ScaleMode::Uniform
    } else {
        ScaleMode::Channel
    };
    let tensor = ops::tensor_id(&params.inputs[0])?;
    let network = params.network()?;
    let out = network
        .add_scale(tensor, mode, Some(offset_weights), Some(scale_weights), None)
        .ok_or_else(|| layer_failure(node))?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}
