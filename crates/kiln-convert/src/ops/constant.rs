use half::f16;
use kiln_graph::{DataType, LiteralData, NodeDef, TensorLiteral};

use crate::converter::OpConverterParams;
use crate::error::{ConversionError, Result};
use crate::network::Dims;
use crate::ops;
use crate::value::{ShapedWeights, TensorOrWeights, WeightBuf, WeightStore};

/// Decodes a `Const` node's tensor literal into arena weights.
///
/// Narrow integer dtypes widen to int32. Decoding happens before the
/// validation gate so that validation runs see the weights of constant
/// inputs; only the output registration is skipped.
pub(crate) fn convert_const(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if !params.inputs.is_empty() {
        return Err(ConversionError::InvalidArgument(format!(
            "constant node is expected to have empty input list: {}",
            node.name
        )));
    }
    let literal = node.attr_tensor("value")?;
    let dtype = node.attr_dtype("dtype")?;
    let converted_dtype = match dtype {
        DataType::Int16 | DataType::Int8 | DataType::Uint8 => DataType::Int32,
        other => other,
    };
    let elem = ops::elem_type(converted_dtype)?;

    let weights = if literal.num_elements() == 0 {
        params.weight_store.allocate(elem, Dims::default())
    } else {
        decode_literal(params.weight_store, node, literal, dtype)?
    };
    if !params.validation_only {
        params.outputs.push(TensorOrWeights::Weights(weights));
    }
    Ok(())
}

fn decode_literal(
    store: &mut WeightStore,
    node: &NodeDef,
    literal: &TensorLiteral,
    dtype: DataType,
) -> Result<ShapedWeights> {
    let payload_len = match &literal.data {
        LiteralData::Floats(values) => values.len(),
        LiteralData::Ints(values) => values.len(),
        LiteralData::Halves(values) => values.len(),
        LiteralData::Raw(bytes) => bytes.len(),
    };
    if payload_len == 0 {
        return Err(ConversionError::Unimplemented(format!(
            "not supported constant type, at {}",
            node.name
        )));
    }
    match &literal.data {
        LiteralData::Floats(values) => {
            let dims = weight_dims(literal, values.len())?;
            let count = dims.num_elements().max(0) as usize;
            let buf = if values.len() == 1 {
                vec![values[0]; count]
            } else {
                values.clone()
            };
            Ok(store.insert(dims, WeightBuf::F32(buf)))
        }
        LiteralData::Ints(values) => {
            let dims = weight_dims(literal, values.len())?;
            let count = dims.num_elements().max(0) as usize;
            let buf = if values.len() == 1 {
                vec![values[0]; count]
            } else {
                values.clone()
            };
            Ok(store.insert(dims, WeightBuf::I32(buf)))
        }
        LiteralData::Halves(_) => Err(ConversionError::Unimplemented(format!(
            "fp16 constant is not supported yet, at {}",
            node.name
        ))),
        LiteralData::Raw(bytes) => decode_raw(store, node, literal, dtype, bytes),
    }
}

fn decode_raw(
    store: &mut WeightStore,
    node: &NodeDef,
    literal: &TensorLiteral,
    dtype: DataType,
    bytes: &[u8],
) -> Result<ShapedWeights> {
    let dtype_size = dtype.size_of() as i64;
    if bytes.len() as i64 % dtype_size != 0 {
        return Err(ConversionError::FailedPrecondition(format!(
            "tensor content size {} is not a multiple of {dtype_size}",
            bytes.len()
        )));
    }
    let array_len = bytes.len() as i64 / dtype_size;
    if literal.num_elements() != array_len {
        return Err(ConversionError::FailedPrecondition(format!(
            "tensor elements count and content size mismatch: {} vs {array_len}",
            literal.num_elements()
        )));
    }
    let dims = weight_dims(literal, array_len as usize)?;
    let size_bytes = dims.num_elements() * dtype_size;
    if bytes.len() as i64 != size_bytes {
        return Err(ConversionError::FailedPrecondition(format!(
            "tensor size and content size mismatch: {size_bytes} vs {}",
            bytes.len()
        )));
    }
    let buf = match dtype {
        DataType::Float32 => WeightBuf::F32(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DataType::Float16 => WeightBuf::F16(
            bytes
                .chunks_exact(2)
                .map(|c| f16::from_ne_bytes([c[0], c[1]]))
                .collect(),
        ),
        DataType::Int32 => WeightBuf::I32(
            bytes
                .chunks_exact(4)
                .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DataType::Int16 => WeightBuf::I32(
            bytes
                .chunks_exact(2)
                .map(|c| i32::from(i16::from_ne_bytes([c[0], c[1]])))
                .collect(),
        ),
        DataType::Int8 => WeightBuf::I32(bytes.iter().map(|b| i32::from(*b as i8)).collect()),
        DataType::Uint8 => WeightBuf::I32(bytes.iter().map(|b| i32::from(*b)).collect()),
        other => {
            return Err(ConversionError::FailedPrecondition(format!(
                "unexpected data type {other}, at {}",
                node.name
            )));
        }
    };
    Ok(store.insert(dims, buf))
}

/// Shape of the weights holding `array_len` decoded elements.
///
/// A declared shape must either hold exactly `array_len` elements or the
/// payload must be a repeated scalar. A scalar literal flattens to rank 1.
fn weight_dims(literal: &TensorLiteral, array_len: usize) -> Result<Dims> {
    if literal.shape.is_empty() {
        return Ok(Dims::new(vec![array_len as i64]));
    }
    let dims = Dims::new(literal.shape.clone());
    if dims.num_elements() != array_len as i64 && array_len != 1 {
        return Err(ConversionError::InvalidArgument(
            "broadcast on weights only supports channel and uniform".to_string(),
        ));
    }
    Ok(dims)
}
