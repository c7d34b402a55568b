use crate::converter::{layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::ActivationType;
use crate::ops;
use crate::value::TensorOrWeights;

/// Emits a pointwise activation layer.
pub(crate) fn convert_activation(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 1 || !params.inputs[0].is_tensor() {
        return Err(ConversionError::InvalidArgument(format!(
            "activation expects a single tensor input, at {}",
            node.name
        )));
    }
    let activation = match node.op.as_str() {
        "Relu" => ActivationType::Relu,
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "activation {other} not supported, at {}",
                node.name
            )));
        }
    };
    if params.validation_only {
        return Ok(());
    }

    let input = ops::tensor_id(&params.inputs[0])?;
    let network = params.network()?;
    let out = network
        .add_activation(input, activation)
        .ok_or_else(|| layer_failure(node))?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}
