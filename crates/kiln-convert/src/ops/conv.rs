use crate::converter::{self, layer_failure, OpConverterParams};
use crate::error::{ConversionError, Result};
use crate::network::ElemType;
use crate::ops::{self, DataFormat, PaddingScheme};
use crate::shape;
use crate::value::TensorOrWeights;
use crate::weights;

/// Standard 2D convolution, one group.
pub(crate) fn convert_conv2d(params: &mut OpConverterParams) -> Result<()> {
    convert_conv2d_helper(params, 1)
}

/// Depthwise convolution, one group per input channel.
pub(crate) fn convert_conv2d_depthwise(params: &mut OpConverterParams) -> Result<()> {
    convert_conv2d_helper(params, 0)
}

/// Shared body of the convolution converters.
///
/// `group` of zero selects the depthwise flavor, where the group count is
/// the channel count of the input. The network runs CHW, so NHWC inputs are
/// wrapped in a transpose pair. Kernels arrive RSCK and are reordered to
/// the KCRS layout the convolution layer expects. Same-padding that comes
/// out asymmetric is peeled into an explicit padding layer, since the
/// convolution itself only takes one symmetric amount per axis.
fn convert_conv2d_helper(params: &mut OpConverterParams, group: i64) -> Result<()> {
    let node = params.node;
    let unsupported = || {
        ConversionError::Unimplemented(format!(
            "convolution expects a tensor input and constant kernel, at {}",
            node.name
        ))
    };
    if params.inputs.len() != 2 || !params.inputs[0].is_tensor() {
        return Err(unsupported());
    }
    let Some(kernel_rsck) = params.inputs[1].as_weights().cloned() else {
        return Err(unsupported());
    };
    let dims = params.inputs[0].dims().clone();
    if dims.rank() != 3 {
        return Err(ConversionError::InvalidArgument(format!(
            "convolution expects a tensor with rank 3, at {}",
            node.name
        )));
    }
    if kernel_rsck.dims.rank() != 4 {
        return Err(ConversionError::Internal(format!(
            "convolution expects kernel of dimension 4, at: {}",
            node.name
        )));
    }
    if kernel_rsck.dtype != ElemType::Float32 && kernel_rsck.dtype != ElemType::Float16 {
        return Err(ConversionError::Unimplemented(format!(
            "only float32 or float16 kernel data type is supported, for node {} got {}",
            node.name, kernel_rsck.dtype
        )));
    }
    let data_format = ops::data_format(node)?;
    let padding_scheme = ops::padding_scheme(node)?;
    let strides = node.attr_ints("strides")?;
    if strides.len() != 4 {
        return Err(ConversionError::InvalidArgument(format!(
            "convolution strides must have four values, at {}",
            node.name
        )));
    }
    let (h_index, w_index) = match data_format {
        DataFormat::Nchw => (2, 3),
        DataFormat::Nhwc => (1, 2),
    };
    let channels = match data_format {
        DataFormat::Nchw => dims.d[0],
        DataFormat::Nhwc => dims.d[2],
    };
    let num_groups = if group == 0 { channels } else { group };
    if num_groups < 1 || kernel_rsck.dims.d[2] % num_groups != 0 {
        return Err(ConversionError::InvalidArgument(format!(
            "convolution kernel channels must be divisible by the group count, at {}",
            node.name
        )));
    }
    if params.validation_only {
        return Ok(());
    }

    let mut tensor = ops::tensor_id(&params.inputs[0])?;
    if data_format == DataFormat::Nhwc {
        tensor = converter::transpose_tensor(params.network()?, tensor, &[0, 3, 1, 2], node)?;
    }

    let mut kernel_rsck = kernel_rsck;
    if params.fp16 && kernel_rsck.dtype == ElemType::Float32 {
        kernel_rsck = weights::convert_fp32_to_fp16(params.weight_store, &kernel_rsck);
    }
    let kernel = weights::reorder_rsck_to_kcrs(params.weight_store, &kernel_rsck, num_groups);
    let noutput = kernel.dims.d[0] * num_groups;
    let kernel_size = (kernel.dims.d[2], kernel.dims.d[3]);
    let stride = (strides[h_index], strides[w_index]);

    let chw = params.network()?.tensor_dims(tensor).clone();
    let mut padding = match padding_scheme {
        PaddingScheme::Same => shape::create_same_padding(
            &[stride.0, stride.1],
            &[kernel_size.0, kernel_size.1],
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
        .add_convolution(
            tensor,
            noutput,
            kernel_size,
            stride,
            (padding[0].0, padding[1].0),
            num_groups,
            kernel,
            None,
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
