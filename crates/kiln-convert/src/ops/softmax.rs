use crate::converter::{layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::ops;
use crate::value::TensorOrWeights;

/// Emits a softmax layer over the innermost axis.
pub(crate) fn convert_softmax(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 1 || !params.inputs[0].is_tensor() {
        return Err(ConversionError::InvalidArgument(format!(
            "softmax expects a single tensor input, at {}",
            node.name
        )));
    }
    let rank = params.inputs[0].dims().rank();
    if rank == 0 {
        return Err(ConversionError::InvalidArgument(format!(
            "softmax cannot apply on batch dimension, at {}",
            node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let input = ops::tensor_id(&params.inputs[0])?;
    let network = params.network()?;
    let out = network
        .add_softmax(input, 1 << (rank - 1))
        .ok_or_else(|| layer_failure(node))?;
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_graph::NodeDef;

    use super::*;
    use crate::network::LayerKind;
    use crate::ops::testing::OpHarness;

    #[test]
    fn test_softmax_targets_innermost_axis() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![4, 10]);
        let node = NodeDef::new("probs", "Softmax");

        let outputs = harness.convert(&node, vec![input]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![4, 10]);
        assert_eq!(
            harness.network.layers()[0].kind,
            LayerKind::Softmax { axes: 1 << 1 }
        );
    }

    #[test]
    fn test_softmax_rejects_rank_zero() {
        let mut harness = OpHarness::new();
        let input = TensorOrWeights::shape_only(crate::network::Dims::new(vec![]), 1);
        let node = NodeDef::new("probs", "Softmax");

        let err = harness.validate(&node, vec![input]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: softmax cannot apply on batch dimension, at probs"
        );
    }
}
