use crate::converter::OpConverterParams;
use crate::error::{ConversionError, Result};

/// Forwards the input value unchanged, without emitting a layer.
pub(crate) fn convert_identity(params: &mut OpConverterParams) -> Result<()> {
    if params.inputs.len() != 1 {
        return Err(ConversionError::InvalidArgument(format!(
            "identity expects a single input, at {}",
            params.node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }
    let input = params.inputs[0].clone();
    params.outputs.push(input);
    Ok(())
}
