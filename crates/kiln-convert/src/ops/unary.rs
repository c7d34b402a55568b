use crate::converter::{layer_failure, prepare_tensor_for_shape, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::UnaryOp;
use crate::value::TensorOrWeights;

/// Emits a pointwise unary layer. `Rsqrt` becomes square root followed by
/// reciprocal.
pub(crate) fn convert_unary(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 1 {
        return Err(ConversionError::FailedPrecondition(format!(
            "unary ops require a single input, at {}",
            node.name
        )));
    }
    let op = match node.op.as_str() {
        "Rsqrt" => None,
        "Neg" => Some(UnaryOp::Neg),
        "Exp" => Some(UnaryOp::Exp),
        "Log" => Some(UnaryOp::Log),
        "Sqrt" => Some(UnaryOp::Sqrt),
        "Abs" => Some(UnaryOp::Abs),
        "Reciprocal" => Some(UnaryOp::Recip),
        other => {
            return Err(ConversionError::InvalidArgument(format!(
                "unary op: {other} not supported, at {}",
                node.name
            )));
        }
    };
    if params.validation_only {
        return Ok(());
    }

    // Weights inputs are materialized as a constant layer first.
    let value = params.inputs[0].clone();
    let dims = value.dims().clone();
    let tensor = prepare_tensor_for_shape(params.network()?, &value, &dims, node)?;
    let network = params.network()?;
    let out = match op {
        Some(op) => network
            .add_unary(tensor, op)
            .ok_or_else(|| layer_failure(node))?,
        None => {
            let sqrt = network
                .add_unary(tensor, UnaryOp::Sqrt)
                .ok_or_else(|| layer_failure(node))?;
            network
                .add_unary(sqrt, UnaryOp::Recip)
                .ok_or_else(|| layer_failure(node))?
        }
    };
    let value = TensorOrWeights::from_network(network, out);
    params.outputs.push(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_graph::NodeDef;

    use super::*;
    use crate::converter::OpConverterParams;
    use crate::network::LayerKind;
    use crate::ops::testing::OpHarness;

    #[test]
    fn test_neg_keeps_shape() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2, 3]);
        let node = NodeDef::new("neg", "Neg");

        let outputs = harness.convert(&node, vec![input]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 3]);
        assert_eq!(harness.network.num_layers(), 1);
        assert_eq!(
            harness.network.layers()[0].kind,
            LayerKind::Unary { op: UnaryOp::Neg }
        );
    }

    #[test]
    fn test_rsqrt_chains_sqrt_and_recip() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![4]);
        let node = NodeDef::new("rsqrt", "Rsqrt");

        harness.convert(&node, vec![input]).unwrap();

        let kinds: Vec<_> = harness
            .network
            .layers()
            .iter()
            .map(|layer| layer.kind.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                LayerKind::Unary { op: UnaryOp::Sqrt },
                LayerKind::Unary { op: UnaryOp::Recip },
            ]
        );
    }

    #[test]
    fn test_unary_materializes_weights_input() {
        let mut harness = OpHarness::new();
        let weights = harness.weights_f32(vec![2, 2], vec![1.0, 4.0, 9.0, 16.0]);
        let node = NodeDef::new("sqrt", "Sqrt");

        let outputs = harness.convert(&node, vec![weights]).unwrap();

        assert_eq!(outputs[0].dims().d, vec![2, 2]);
        // Constant layer then the unary itself.
        assert_eq!(harness.network.num_layers(), 2);
        assert!(matches!(
            harness.network.layers()[0].kind,
            LayerKind::Constant { .. }
        ));
    }

    #[test]
    fn test_unary_unknown_op() {
        let mut harness = OpHarness::new();
        let input = harness.input("in", vec![2]);
        let node = NodeDef::new("u", "Erf");
        let mut params = OpConverterParams::new(
            &node,
            vec![input],
            false,
            Some(&mut harness.network),
            &mut harness.store,
            false,
        );

        let err = convert_unary(&mut params).unwrap_err();

        assert_eq!(
            err.to_string(),
            "invalid argument: unary op: Erf not supported, at u"
        );
    }

    #[test]
    fn test_unary_requires_single_input() {
        let mut harness = OpHarness::new();
        let a = harness.input("a", vec![2]);
        let b = harness.input("b", vec![2]);
        let node = NodeDef::new("neg", "Neg");

        let err = harness.convert(&node, vec![a, b]).unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed precondition: unary ops require a single input, at neg"
        );
    }
}
