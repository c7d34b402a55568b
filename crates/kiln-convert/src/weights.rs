//! Weight layout transforms.
//!
//! Kernels arrive from the graph in RSCK order (height, width, input
//! channel, output channel) while the engine consumes KCRS, and fully
//! connected kernels arrive CK instead of KC. The reorders here gather
//! through explicit strides so grouped and depthwise kernels fall out of
//! the same loop.
//!
//! Buffer-type violations in these routines are translator bugs, not user
//! errors, and panic.

use half::f16;

use crate::error::ConversionError;
use crate::network::Dims;
use crate::value::{ShapedWeights, WeightBuf, WeightStore};
use crate::Result;

/// Constant-folding op applied to a weight buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOp {
    /// Negation.
    Neg,
    /// Reciprocal.
    Recip,
}

fn reorder2<T: Copy>(
    shape: (usize, usize),
    idata: &[T],
    istrides: (usize, usize),
    odata: &mut [T],
    ostrides: (usize, usize),
) {
    for h in 0..shape.0 {
        for w in 0..shape.1 {
            odata[h * ostrides.0 + w * ostrides.1] = idata[h * istrides.0 + w * istrides.1];
        }
    }
}

fn reorder4<T: Copy>(
    shape: [usize; 4],
    idata: &[T],
    istrides: [usize; 4],
    odata: &mut [T],
    ostrides: [usize; 4],
) {
    for n in 0..shape[0] {
        for c in 0..shape[1] {
            for h in 0..shape[2] {
                for w in 0..shape[3] {
                    odata[n * ostrides[0] + c * ostrides[1] + h * ostrides[2] + w * ostrides[3]] =
                        idata
                            [n * istrides[0] + c * istrides[1] + h * istrides[2] + w * istrides[3]];
                }
            }
        }
    }
}

/// Transposes rank-2 weights from CK to KC layout.
///
/// # Panics
///
/// Panics for integer buffers; only fp32 and fp16 kernels are reordered.
pub fn reorder_ck_to_kc(store: &mut WeightStore, iweights: &ShapedWeights) -> ShapedWeights {
    debug_assert_eq!(iweights.dims.rank(), 2);
    let c = iweights.dims.d[0] as usize;
    let k = iweights.dims.d[1] as usize;
    let odims = Dims::new(vec![k as i64, c as i64]);
    let istrides = (1, k);
    let ostrides = (c, 1);

    let values = match store.values(iweights) {
        WeightBuf::F32(idata) => {
            let mut odata = vec![0f32; idata.len()];
            reorder2((k, c), idata, istrides, &mut odata, ostrides);
            WeightBuf::F32(odata)
        }
        WeightBuf::F16(idata) => {
            let mut odata = vec![f16::ZERO; idata.len()];
            reorder2((k, c), idata, istrides, &mut odata, ostrides);
            WeightBuf::F16(odata)
        }
        other => panic!(
            "unsupported type in reorder, expected fp32 or fp16 but got {}",
            other.elem_type()
        ),
    };
    store.insert(odims, values)
}

/// Reorders rank-4 convolution kernels from RSCK to (grouped) KCRS layout.
///
/// With `num_groups == 1` this is a plain RSCK to KCRS transpose. Grouped
/// and depthwise kernels fold the group count into the channel axes: the
/// output shape is `(K / g, C * g, R, S)` where `C = d[2] / g` and
/// `K = d[3] * g`.
///
/// # Panics
///
/// Panics for integer buffers; only fp32 and fp16 kernels are reordered.
pub fn reorder_rsck_to_kcrs(
    store: &mut WeightStore,
    iweights: &ShapedWeights,
    num_groups: i64,
) -> ShapedWeights {
    debug_assert_eq!(iweights.dims.rank(), 4);
    debug_assert!(num_groups >= 1 && iweights.dims.d[2] % num_groups == 0);
    let r = iweights.dims.d[0] as usize;
    let s = iweights.dims.d[1] as usize;
    let c = (iweights.dims.d[2] / num_groups) as usize;
    let k = (iweights.dims.d[3] * num_groups) as usize;
    let g = num_groups as usize;
    log::trace!("reordering kernel r={r} s={s} c={c} k={k} with {g} groups");

    let odims = Dims::new(vec![
        (k / g) as i64,
        (c * g) as i64,
        r as i64,
        s as i64,
    ]);
    let shape = [k, c, r, s];
    let istrides = [1, k, s * k * c, c * k];
    let ostrides = [c * r * s, r * s, s, 1];

    let values = match store.values(iweights) {
        WeightBuf::F32(idata) => {
            let mut odata = vec![0f32; idata.len()];
            reorder4(shape, idata, istrides, &mut odata, ostrides);
            WeightBuf::F32(odata)
        }
        WeightBuf::F16(idata) => {
            let mut odata = vec![f16::ZERO; idata.len()];
            reorder4(shape, idata, istrides, &mut odata, ostrides);
            WeightBuf::F16(odata)
        }
        other => panic!(
            "unsupported type in reorder, expected fp32 or fp16 but got {}",
            other.elem_type()
        ),
    };
    store.insert(odims, values)
}

/// Casts fp32 weights to fp16, round to nearest even.
///
/// # Panics
///
/// Panics when the source buffer is not fp32.
pub fn convert_fp32_to_fp16(store: &mut WeightStore, src: &ShapedWeights) -> ShapedWeights {
    let values = match store.values(src) {
        WeightBuf::F32(idata) => idata.iter().map(|v| f16::from_f32(*v)).collect(),
        other => panic!(
            "unsupported type in cast, expected fp32 but got {}",
            other.elem_type()
        ),
    };
    store.insert(src.dims.clone(), WeightBuf::F16(values))
}

/// Folds a pointwise op over a weight buffer into a new buffer.
pub fn unary_compute(
    store: &mut WeightStore,
    iweights: &ShapedWeights,
    op: FoldOp,
) -> Result<ShapedWeights> {
    let apply = |v: f32| match op {
        FoldOp::Neg => -v,
        FoldOp::Recip => 1.0 / v,
    };
    let values = match store.values(iweights) {
        WeightBuf::F32(idata) => WeightBuf::F32(idata.iter().map(|v| apply(*v)).collect()),
        WeightBuf::F16(idata) => WeightBuf::F16(
            idata
                .iter()
                .map(|v| f16::from_f32(apply(v.to_f32())))
                .collect(),
        ),
        other => {
            return Err(ConversionError::Unimplemented(format!(
                "data type not supported: {}",
                other.elem_type()
            )));
        }
    };
    Ok(store.insert(iweights.dims.clone(), values))
}
