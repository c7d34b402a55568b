//! Per-op converter catalog.
//!
//! Each entry receives the [`OpConverterParams`](crate::converter::OpConverterParams)
//! of one node, checks the node against the already converted input values,
//! and either returns early (validation mode) or emits the layers realizing
//! the op. A layer builder refusing its configuration surfaces as an
//! internal error.

mod activation;
mod binary;
mod concat;
mod constant;
mod conv;
mod identity;
mod matmul;
mod normalization;
mod pad;
mod pool;
mod reduce;
mod scale;
mod shuffle;
mod softmax;
mod topk;
mod unary;

use std::collections::HashMap;

use kiln_graph::{DataType, NodeDef};
use strum::{Display, EnumString};

use crate::converter::OpConverter;
use crate::error::{ConversionError, Result};
use crate::network::{ElemType, TensorId};
use crate::value::TensorOrWeights;

/// Axis layout of an image-like tensor, batch axis included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum DataFormat {
    /// Batch, height, width, channels.
    #[strum(serialize = "NHWC")]
    Nhwc,
    /// Batch, channels, height, width.
    #[strum(serialize = "NCHW")]
    Nchw,
}

/// Padding scheme of a convolution or pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum PaddingScheme {
    /// Pad so that with stride 1 the output keeps the input size.
    #[strum(serialize = "SAME")]
    Same,
    /// No padding.
    #[strum(serialize = "VALID")]
    Valid,
}

/// Built-in converters, keyed by graph op name.
pub(crate) fn register_op_converters() -> HashMap<&'static str, OpConverter> {
    let mut registry: HashMap<&'static str, OpConverter> = HashMap::new();
    registry.insert("Conv2D", conv::convert_conv2d);
    registry.insert("DepthwiseConv2dNative", conv::convert_conv2d_depthwise);
    registry.insert("Relu", activation::convert_activation);
    registry.insert("MaxPool", pool::convert_pool);
    registry.insert("AvgPool", pool::convert_pool);
    registry.insert("BiasAdd", scale::convert_scale);
    registry.insert("Const", constant::convert_const);
    registry.insert("Identity", identity::convert_identity);
    registry.insert("Snapshot", identity::convert_identity);
    for op in ["Add", "Mul", "Sub", "Div", "RealDiv", "Maximum", "Minimum"] {
        registry.insert(op, binary::convert_binary);
    }
    registry.insert("Pad", pad::convert_pad);
    registry.insert("ConcatV2", concat::convert_concat);
    registry.insert("FusedBatchNorm", normalization::convert_fused_batch_norm);
    registry.insert("FusedBatchNormV2", normalization::convert_fused_batch_norm);
    for op in ["Rsqrt", "Reciprocal", "Exp", "Log", "Sqrt", "Abs", "Neg"] {
        registry.insert(op, unary::convert_unary);
    }
    registry.insert("Transpose", shuffle::convert_transpose);
    registry.insert("Reshape", shuffle::convert_reshape);
    for op in ["Sum", "Prod", "Max", "Min", "Mean"] {
        registry.insert(op, reduce::convert_reduce);
    }
    registry.insert("Softmax", softmax::convert_softmax);
    registry.insert("MatMul", matmul::convert_matmul);
    registry.insert("BatchMatMul", matmul::convert_batch_matmul);
    registry.insert("TopKV2", topk::convert_topk);
    registry
}

/// Converters that double as validators, keyed by graph op name.
///
/// Ops absent here pass node validation unchecked and are vetted during
/// conversion proper.
pub(crate) fn register_op_validators() -> HashMap<&'static str, OpConverter> {
    let mut registry: HashMap<&'static str, OpConverter> = HashMap::new();
    registry.insert("Const", constant::convert_const);
    registry.insert("Transpose", shuffle::convert_transpose);
    registry.insert("Reshape", shuffle::convert_reshape);
    registry.insert("MatMul", matmul::convert_matmul);
    registry
}

/// Maps a graph data type onto an engine element type.
pub(crate) fn elem_type(dtype: DataType) -> Result<ElemType> {
    match dtype {
        DataType::Float32 => Ok(ElemType::Float32),
        DataType::Float16 => Ok(ElemType::Float16),
        DataType::Int32 => Ok(ElemType::Int32),
        DataType::Int8 => Ok(ElemType::Int8),
        other => Err(ConversionError::InvalidArgument(format!(
            "unsupported data type {other}"
        ))),
    }
}

/// Materialized network id of a tensor value.
///
/// Weights and validation stand-ins have none; reaching one here means a
/// converter skipped its kind checks.
pub(crate) fn tensor_id(value: &TensorOrWeights) -> Result<TensorId> {
    value
        .tensor_id()
        .ok_or_else(|| ConversionError::Internal("value has no network tensor".to_string()))
}

/// Reads and parses the `data_format` attribute.
pub(crate) fn data_format(node: &NodeDef) -> Result<DataFormat> {
    let raw = node.attr_string("data_format")?;
    raw.parse().map_err(|_| {
        ConversionError::Unimplemented(format!(
            "data format {raw} is not supported, at {}",
            node.name
        ))
    })
}

/// Reads and parses the `padding` attribute.
pub(crate) fn padding_scheme(node: &NodeDef) -> Result<PaddingScheme> {
    let raw = node.attr_string("padding")?;
    raw.parse().map_err(|_| {
        ConversionError::Unimplemented(format!(
            "unsupported padding type {raw}, at {}",
            node.name
        ))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use kiln_graph::NodeDef;

    use crate::converter::OpConverterParams;
    use crate::error::Result;
    use crate::network::{Dims, ElemType, Network};
    use crate::value::{TensorOrWeights, WeightBuf, WeightStore};

    /// Drives single catalog entries against a real network and arena.
    pub(crate) struct OpHarness {
        pub network: Network,
        pub store: WeightStore,
        pub fp16: bool,
    }

    impl OpHarness {
        pub fn new() -> Self {
            Self {
                network: Network::new(),
                store: WeightStore::new(),
                fp16: false,
            }
        }

        pub fn fp16() -> Self {
            Self {
                fp16: true,
                ..Self::new()
            }
        }

        /// Declares a float network input and wraps it as a converter value.
        pub fn input(&mut self, name: &str, dims: Vec<i64>) -> TensorOrWeights {
            self.input_typed(name, ElemType::Float32, dims)
        }

        pub fn input_typed(
            &mut self,
            name: &str,
            dtype: ElemType,
            dims: Vec<i64>,
        ) -> TensorOrWeights {
            let id = self.network.add_input(name, dtype, Dims::new(dims)).unwrap();
            TensorOrWeights::from_network(&self.network, id)
        }

        pub fn weights_f32(&mut self, dims: Vec<i64>, values: Vec<f32>) -> TensorOrWeights {
            TensorOrWeights::Weights(self.store.insert(Dims::new(dims), WeightBuf::F32(values)))
        }

        pub fn weights_i32(&mut self, dims: Vec<i64>, values: Vec<i32>) -> TensorOrWeights {
            TensorOrWeights::Weights(self.store.insert(Dims::new(dims), WeightBuf::I32(values)))
        }

        /// Converts `node` through its registered catalog entry.
        pub fn convert(
            &mut self,
            node: &NodeDef,
            inputs: Vec<TensorOrWeights>,
        ) -> Result<Vec<TensorOrWeights>> {
            let converter = super::register_op_converters()[node.op.as_str()];
            let mut params = OpConverterParams::new(
                node,
                inputs,
                false,
                Some(&mut self.network),
                &mut self.store,
                self.fp16,
            );
            converter(&mut params)?;
            Ok(params.outputs)
        }

        /// Validates `node` without a network, like the node validator does.
        pub fn validate(&mut self, node: &NodeDef, inputs: Vec<TensorOrWeights>) -> Result<()> {
            let converter = super::register_op_converters()[node.op.as_str()];
            let mut params =
                OpConverterParams::new(node, inputs, true, None, &mut self.store, self.fp16);
            converter(&mut params)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_supported_ops() {
        let registry = register_op_converters();
        assert_eq!(registry.len(), 38);
        for op in ["Conv2D", "Relu", "ConcatV2", "FusedBatchNormV2", "TopKV2"] {
            assert!(registry.contains_key(op), "missing converter for {op}");
        }
        assert!(!registry.contains_key("Erf"));
    }

    #[test]
    fn test_validator_registry_is_a_subset() {
        let converters = register_op_converters();
        let validators = register_op_validators();
        assert_eq!(validators.len(), 4);
        for op in validators.keys() {
            assert!(converters.contains_key(op), "validator without converter: {op}");
        }
    }

    #[test]
    fn test_elem_type_mapping() {
        assert_eq!(elem_type(DataType::Float32).unwrap(), ElemType::Float32);
        assert_eq!(elem_type(DataType::Int8).unwrap(), ElemType::Int8);
        let err = elem_type(DataType::Float64).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument: unsupported data type Float64"
        );
    }

    #[test]
    fn test_layout_attribute_parsing() {
        assert_eq!("NHWC".parse::<DataFormat>().unwrap(), DataFormat::Nhwc);
        assert_eq!("SAME".parse::<PaddingScheme>().unwrap(), PaddingScheme::Same);
        assert!("NCWH".parse::<DataFormat>().is_err());
    }
}
