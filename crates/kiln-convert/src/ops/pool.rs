use crate::converter::{self, layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::PoolingType;
use crate::ops::{self, DataFormat, PaddingScheme};
use crate::shape;
use crate::value::TensorOrWeights;

/// Converts the 2D window pooling ops.
///
/// Shares the convolution layout handling: NHWC inputs get a transpose
/// pair and asymmetric same-padding becomes an explicit padding layer.
pub(crate) fn convert_pool(params: &mut OpConverterParams) -> Result<()> {
    let node = params.node;
    if params.inputs.len() != 1 || !params.inputs[0].is_tensor() {
        return Err(ConversionError::Unimplemented(format!(
            "pooling expects a single tensor input, at {}",
            node.name
        )));
    }
    let dims = params.inputs[0].dims().clone();
    if dims.rank() != 3 {
        return Err(ConversionError::InvalidArgument(format!(
            "pooling expects a tensor with rank 3, at {}",
            node.name
        )));
    }
    let pool = match node.op.as_str() {
        "MaxPool" => PoolingType::Max,
        "AvgPool" => PoolingType::Average,
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "unsupported pool type: {other}, at {}",
                node.name
            )));
        }
    };
    let data_format = ops::data_format(node)?;
    let padding_scheme = ops::padding_scheme(node)?;
    let ksize = node.attr_ints("ksize")?;
    if ksize.len() != 4 {
        return Err(ConversionError::InvalidArgument(format!(
            "pooling window must have four values, at {}",
            node.name
        )));
    }
    let strides = node.attr_ints("strides")?;
    if strides.len() != 4 {
        return Err(ConversionError::InvalidArgument(format!(
            "pooling strides must have four values, at {}",
            node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let (h_index, w_index) = match data_format {
        DataFormat::Nchw => (2, 3),
        DataFormat::Nhwc => (1, 2),
    };
    let window = (ksize[h_index], ksize[w_index]);
    let stride = (strides[h_index], strides[w_index]);

    let mut tensor = ops::tensor_id(&params.inputs[0])?;
    if data_format == DataFormat::Nhwc {
        tensor = converter::transpose_tensor(params.network()?, tensor, &[0, 3, 1, 2], node)?;
    }
    let chw = params.network()?.tensor_dims(tensor).clone();
    let mut padding = match padding_scheme {
        PaddingScheme::Same => shape::create_same_padding(
            &[stride.0, stride.1],
            &[window.0, window.1],
            &[chw.d[1], chw.d[2]],
        ),
        PaddingScheme::Valid => vec![(0, 0), (0, 0)],
    };
    if padding[0].0 != padding[0].1 || padding[1].0 != padding[1].1 {
        log::trace!(
            "asymmetric padding {:?} handled by an explicit layer, at {}",
            padding,
            node.name
        );
        let network = params.network()?;
        tensor = network
            .add_padding(
                tensor,
                (padding[0].0, padding[1].0),
                (padding[0].1, padding[1].1),
            )
            .ok_or_else(|| layer_failure(node))?;
        padding = vec![(0, 0), (0, 0)];
    }

    let network = params.network()?;
    let mut out = network
        .add_pooling(
            tensor,
            pool,
            window,
            stride,
            (padding[0].0, padding[1].0),
            &node.name,
        )
        .ok_or_else(|| layer_failure(node))?;
    if data_format == DataFormat::Nhwc {
        out = converter::transpose_tensor(params.network()?, out, &[0, 2, 3, 1], node)?;
    }
    let value = TensorOrWeights::from_network(params.network()?, out);
    params.outputs.push(value);
    Ok(())
}
