//! Engine network model.
//!
//! A [`Network`] is an append-only list of typed layers connected through
//! [`TensorId`]s. Tensor shapes exclude the implicit leading batch axis, so
//! a NCHW image tensor has rank 3 here. Output shapes are computed eagerly
//! when a layer is added; a builder that cannot accept its arguments returns
//! `None` instead of a layer, which callers surface as an internal error.
//!
//! Constant buffers referenced by layers (convolution kernels, scale
//! parameters, ...) live in the caller's weight arena, not in the network.
//! The network only holds [`ShapedWeights`] handles into that arena.

use std::fmt;

use strum::Display;

use crate::value::ShapedWeights;

/// Maximum tensor rank the engine supports, batch axis excluded.
pub const MAX_DIMS: usize = 8;

/// Element type of an engine tensor or weight buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ElemType {
    /// 32-bit float.
    Float32,
    /// 16-bit float.
    Float16,
    /// 32-bit signed integer.
    Int32,
    /// 8-bit signed integer, for quantized engines.
    Int8,
}

impl ElemType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            ElemType::Float32 => 4,
            ElemType::Float16 => 2,
            ElemType::Int32 => 4,
            ElemType::Int8 => 1,
        }
    }
}

/// Tensor dimensions with the batch axis excluded.
///
/// Axis sizes are non-negative except for `-1`, which marks an axis to be
/// inferred in reshape targets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Dims {
    /// Axis sizes.
    pub d: Vec<i64>,
}

impl Dims {
    /// Dims from axis sizes.
    pub fn new(d: Vec<i64>) -> Self {
        Self { d }
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.d.len()
    }

    /// True when every axis size is known (non-negative).
    pub fn is_static(&self) -> bool {
        self.d.iter().all(|d| *d >= 0)
    }

    /// Product of axis sizes. Zero for rank 0.
    pub fn num_elements(&self) -> i64 {
        if self.d.is_empty() {
            return 0;
        }
        self.d.iter().product()
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.d.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Handle to a tensor inside a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub usize);

/// Handle to a layer inside a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(pub usize);

/// Activation function of an activation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ActivationType {
    /// Rectified linear unit.
    Relu,
}

/// Pointwise function of a unary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UnaryOp {
    /// Negation.
    Neg,
    /// Natural exponential.
    Exp,
    /// Natural logarithm.
    Log,
    /// Square root.
    Sqrt,
    /// Absolute value.
    Abs,
    /// Reciprocal.
    Recip,
}

/// Binary function of an elementwise layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ElementWiseOp {
    /// Addition.
    Sum,
    /// Multiplication.
    Prod,
    /// Subtraction, first minus second.
    Sub,
    /// Division, first over second.
    Div,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

/// Window reduction of a pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PoolingType {
    /// Maximum over the window.
    Max,
    /// Average over the window.
    Average,
}

/// Reduction function of a reduce layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ReduceOp {
    /// Sum of elements.
    Sum,
    /// Product of elements.
    Prod,
    /// Maximum element.
    Max,
    /// Minimum element.
    Min,
    /// Arithmetic mean.
    Avg,
}

/// How scale-layer parameters are broadcast over the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ScaleMode {
    /// One parameter for the whole tensor.
    Uniform,
    /// One parameter per leading (channel) axis entry.
    Channel,
    /// One parameter per element.
    ElementWise,
}

/// Selection direction of a top-k layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TopKOp {
    /// Largest k elements.
    Max,
}

/// Parameters of one network layer.
#[derive(Debug, Clone, PartialEq, Display)]
pub enum LayerKind {
    /// Materializes constant weights as a tensor.
    Constant {
        /// Buffer handle in the weight arena.
        weights: ShapedWeights,
    },
    /// Pointwise activation.
    Activation {
        /// Activation function.
        activation: ActivationType,
    },
    /// Pointwise unary function.
    Unary {
        /// Function applied per element.
        op: UnaryOp,
    },
    /// Binary elementwise function with implicit broadcast of size-1 axes.
    ElementWise {
        /// Function applied per element pair.
        op: ElementWiseOp,
    },
    /// 2D convolution over a CHW tensor.
    Convolution {
        /// Number of output feature maps.
        noutput: i64,
        /// Kernel height and width.
        kernel_size: (i64, i64),
        /// Stride per spatial axis.
        stride: (i64, i64),
        /// Symmetric padding per spatial axis.
        padding: (i64, i64),
        /// Number of convolution groups.
        num_groups: i64,
        /// Kernel weights in KCRS layout.
        kernel: ShapedWeights,
        /// Optional per-output-map bias.
        bias: Option<ShapedWeights>,
    },
    /// 2D window pooling over a CHW tensor.
    Pooling {
        /// Window reduction.
        pool: PoolingType,
        /// Window height and width.
        window: (i64, i64),
        /// Stride per spatial axis.
        stride: (i64, i64),
        /// Symmetric padding per spatial axis.
        padding: (i64, i64),
    },
    /// Zero-padding of the two innermost axes.
    Padding {
        /// Leading padding (height, width).
        pre: (i64, i64),
        /// Trailing padding (height, width).
        post: (i64, i64),
    },
    /// Transpose, reshape, transpose, each stage optional.
    Shuffle {
        /// Axis permutation applied first.
        first_transpose: Option<Vec<i64>>,
        /// Reshape target; `0` copies the incoming axis, `-1` is inferred.
        reshape: Option<Dims>,
        /// Axis permutation applied last.
        second_transpose: Option<Vec<i64>>,
    },
    /// Per-element affine transform `(x * scale + shift) ^ power`.
    Scale {
        /// Parameter broadcast mode.
        mode: ScaleMode,
        /// Added after scaling. Absent means zero.
        shift: Option<ShapedWeights>,
        /// Multiplier. Absent means one.
        scale: Option<ShapedWeights>,
        /// Exponent. Absent means one.
        power: Option<ShapedWeights>,
    },
    /// Reduction over an axis bitmask.
    Reduce {
        /// Reduction function.
        op: ReduceOp,
        /// Bitmask of reduced axes, bit `i` for axis `i`.
        axes: u32,
        /// Keep reduced axes with size 1 instead of dropping them.
        keep_dims: bool,
    },
    /// Concatenation along one axis.
    Concatenation {
        /// Concatenation axis.
        axis: usize,
    },
    /// Fully connected layer over a flattened CHW input.
    FullyConnected {
        /// Number of output channels.
        noutput: i64,
        /// Kernel weights in KC layout.
        kernel: ShapedWeights,
        /// Optional per-channel bias.
        bias: Option<ShapedWeights>,
    },
    /// Batched matrix multiplication.
    MatrixMultiply {
        /// Transpose the trailing two axes of the first input.
        transpose_a: bool,
        /// Transpose the trailing two axes of the second input.
        transpose_b: bool,
    },
    /// Softmax over an axis bitmask.
    Softmax {
        /// Bitmask holding exactly one axis.
        axes: u32,
    },
    /// Top-k selection along one axis, producing values and indices.
    TopK {
        /// Selection direction.
        op: TopKOp,
        /// Number of elements kept.
        k: i64,
        /// Bitmask holding exactly one axis.
        axes: u32,
    },
}

/// One layer of the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// Layer parameters.
    pub kind: LayerKind,
    /// Optional layer name, carried for diagnostics.
    pub name: Option<String>,
    /// Input tensors.
    pub inputs: Vec<TensorId>,
    /// Output tensors.
    pub outputs: Vec<TensorId>,
}

#[derive(Debug, Clone)]
struct TensorInfo {
    name: Option<String>,
    dtype: ElemType,
    dims: Dims,
}

/// Engine network under construction.
#[derive(Debug, Clone, Default)]
pub struct Network {
    tensors: Vec<TensorInfo>,
    layers: Vec<Layer>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
}

impl Network {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_tensor(&mut self, dtype: ElemType, dims: Dims) -> TensorId {
        let id = TensorId(self.tensors.len());
        self.tensors.push(TensorInfo {
            name: None,
            dtype,
            dims,
        });
        id
    }

    fn push_layer(
        &mut self,
        kind: LayerKind,
        name: Option<String>,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> LayerId {
        log::trace!("added {} layer #{}", kind, self.layers.len());
        let id = LayerId(self.layers.len());
        self.layers.push(Layer {
            kind,
            name,
            inputs,
            outputs,
        });
        id
    }

    /// Declares a network input of `dims` shape, batch axis excluded.
    ///
    /// Rejects rank 0, ranks above [`MAX_DIMS`], and axes that are unknown
    /// or empty.
    pub fn add_input(&mut self, name: &str, dtype: ElemType, dims: Dims) -> Option<TensorId> {
        if dims.rank() == 0 || dims.rank() > MAX_DIMS {
            return None;
        }
        if dims.d.iter().any(|d| *d < 1) {
            return None;
        }
        let id = self.add_tensor(dtype, dims);
        self.tensors[id.0].name = Some(name.to_string());
        self.inputs.push(id);
        Some(id)
    }

    /// Materializes constant weights as a tensor of `dims` shape.
    pub fn add_constant(&mut self, dims: Dims, weights: ShapedWeights) -> Option<TensorId> {
        if dims.rank() > MAX_DIMS || !dims.is_static() {
            return None;
        }
        if weights.count() != dims.num_elements() {
            return None;
        }
        let out = self.add_tensor(weights.dtype, dims);
        self.push_layer(LayerKind::Constant { weights }, None, vec![], vec![out]);
        Some(out)
    }

    /// Adds a pointwise activation layer.
    pub fn add_activation(
        &mut self,
        input: TensorId,
        activation: ActivationType,
    ) -> Option<TensorId> {
        let out = self.add_tensor(self.tensor_dtype(input), self.tensor_dims(input).clone());
        self.push_layer(
            LayerKind::Activation { activation },
            None,
            vec![input],
            vec![out],
        );
        Some(out)
    }

    /// Adds a pointwise unary layer.
    pub fn add_unary(&mut self, input: TensorId, op: UnaryOp) -> Option<TensorId> {
        let out = self.add_tensor(self.tensor_dtype(input), self.tensor_dims(input).clone());
        self.push_layer(LayerKind::Unary { op }, None, vec![input], vec![out]);
        Some(out)
    }

    /// Adds a binary elementwise layer.
    ///
    /// Inputs must have equal rank and dtype; per axis the sizes must match
    /// or one of them must be 1, which broadcasts.
    pub fn add_elementwise(
        &mut self,
        first: TensorId,
        second: TensorId,
        op: ElementWiseOp,
    ) -> Option<TensorId> {
        let dtype = self.tensor_dtype(first);
        if dtype != self.tensor_dtype(second) {
            return None;
        }
        let lhs = self.tensor_dims(first).clone();
        let rhs = self.tensor_dims(second).clone();
        if lhs.rank() != rhs.rank() {
            return None;
        }
        let mut out = Vec::with_capacity(lhs.rank());
        for (l, r) in lhs.d.iter().zip(rhs.d.iter()) {
            if l == r || *r == 1 {
                out.push(*l);
            } else if *l == 1 {
                out.push(*r);
            } else {
                return None;
            }
        }
        let out = self.add_tensor(dtype, Dims::new(out));
        self.push_layer(
            LayerKind::ElementWise { op },
            None,
            vec![first, second],
            vec![out],
        );
        Some(out)
    }

    /// Adds a 2D convolution over a CHW input.
    ///
    /// `kernel` is expected in KCRS layout with `kernel.dims.d[0] * num_groups
    /// == noutput`. Padding is symmetric per spatial axis.
    pub fn add_convolution(
        &mut self,
        input: TensorId,
        noutput: i64,
        kernel_size: (i64, i64),
        stride: (i64, i64),
        padding: (i64, i64),
        num_groups: i64,
        kernel: ShapedWeights,
        bias: Option<ShapedWeights>,
        name: &str,
    ) -> Option<TensorId> {
        let dims = self.tensor_dims(input).clone();
        if dims.rank() != 3 {
            return None;
        }
        let (c, h, w) = (dims.d[0], dims.d[1], dims.d[2]);
        if num_groups < 1 || c % num_groups != 0 || noutput % num_groups != 0 {
            return None;
        }
        if stride.0 < 1 || stride.1 < 1 || kernel_size.0 < 1 || kernel_size.1 < 1 {
            return None;
        }
        if kernel.count() != noutput * (c / num_groups) * kernel_size.0 * kernel_size.1 {
            return None;
        }
        if let Some(bias) = &bias {
            if bias.count() != noutput {
                return None;
            }
        }
        let h_out = (h + 2 * padding.0 - kernel_size.0) / stride.0 + 1;
        let w_out = (w + 2 * padding.1 - kernel_size.1) / stride.1 + 1;
        if h_out < 1 || w_out < 1 {
            return None;
        }
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, Dims::new(vec![noutput, h_out, w_out]));
        self.push_layer(
            LayerKind::Convolution {
                noutput,
                kernel_size,
                stride,
                padding,
                num_groups,
                kernel,
                bias,
            },
            Some(name.to_string()),
            vec![input],
            vec![out],
        );
        Some(out)
    }

    /// Adds a 2D pooling layer over a CHW input.
    pub fn add_pooling(
        &mut self,
        input: TensorId,
        pool: PoolingType,
        window: (i64, i64),
        stride: (i64, i64),
        padding: (i64, i64),
        name: &str,
    ) -> Option<TensorId> {
        let dims = self.tensor_dims(input).clone();
        if dims.rank() != 3 {
            return None;
        }
        if stride.0 < 1 || stride.1 < 1 || window.0 < 1 || window.1 < 1 {
            return None;
        }
        let h_out = (dims.d[1] + 2 * padding.0 - window.0) / stride.0 + 1;
        let w_out = (dims.d[2] + 2 * padding.1 - window.1) / stride.1 + 1;
        if h_out < 1 || w_out < 1 {
            return None;
        }
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, Dims::new(vec![dims.d[0], h_out, w_out]));
        self.push_layer(
            LayerKind::Pooling {
                pool,
                window,
                stride,
                padding,
            },
            Some(name.to_string()),
            vec![input],
            vec![out],
        );
        Some(out)
    }

    /// Adds zero-padding of the two innermost axes.
    pub fn add_padding(
        &mut self,
        input: TensorId,
        pre: (i64, i64),
        post: (i64, i64),
    ) -> Option<TensorId> {
        let mut dims = self.tensor_dims(input).clone();
        let rank = dims.rank();
        if rank < 2 {
            return None;
        }
        if pre.0 < 0 || pre.1 < 0 || post.0 < 0 || post.1 < 0 {
            return None;
        }
        dims.d[rank - 2] += pre.0 + post.0;
        dims.d[rank - 1] += pre.1 + post.1;
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, dims);
        self.push_layer(LayerKind::Padding { pre, post }, None, vec![input], vec![out]);
        Some(out)
    }

    /// Adds a shuffle layer: optional transpose, reshape, transpose.
    ///
    /// In the reshape target a `0` copies the axis size coming out of the
    /// first transpose and a single `-1` is inferred from the remaining
    /// element count.
    pub fn add_shuffle(
        &mut self,
        input: TensorId,
        first_transpose: Option<Vec<i64>>,
        reshape: Option<Dims>,
        second_transpose: Option<Vec<i64>>,
    ) -> Option<TensorId> {
        let mut dims = self.tensor_dims(input).clone();
        if let Some(perm) = &first_transpose {
            dims = apply_permutation(&dims, perm)?;
        }
        if let Some(target) = &reshape {
            dims = apply_reshape(&dims, target)?;
        }
        if let Some(perm) = &second_transpose {
            dims = apply_permutation(&dims, perm)?;
        }
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, dims);
        self.push_layer(
            LayerKind::Shuffle {
                first_transpose,
                reshape,
                second_transpose,
            },
            None,
            vec![input],
            vec![out],
        );
        Some(out)
    }

    /// Adds a per-element affine layer over a rank-3 (CHW) input.
    ///
    /// Parameter counts must match `mode`: 1 for uniform, the channel size
    /// for channel, the element count for elementwise.
    pub fn add_scale(
        &mut self,
        input: TensorId,
        mode: ScaleMode,
        shift: Option<ShapedWeights>,
        scale: Option<ShapedWeights>,
        power: Option<ShapedWeights>,
    ) -> Option<TensorId> {
        let dims = self.tensor_dims(input).clone();
        if dims.rank() != 3 {
            return None;
        }
        let expected = match mode {
            ScaleMode::Uniform => 1,
            ScaleMode::Channel => dims.d[0],
            ScaleMode::ElementWise => dims.num_elements(),
        };
        for weights in [&shift, &scale, &power].into_iter().flatten() {
            if weights.count() != expected {
                return None;
            }
        }
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, dims);
        self.push_layer(
            LayerKind::Scale {
                mode,
                shift,
                scale,
                power,
            },
            None,
            vec![input],
            vec![out],
        );
        Some(out)
    }

    /// Adds a reduction over the axes set in `axes` (bit `i` is axis `i`).
    pub fn add_reduce(
        &mut self,
        input: TensorId,
        op: ReduceOp,
        axes: u32,
        keep_dims: bool,
    ) -> Option<TensorId> {
        let dims = self.tensor_dims(input).clone();
        let rank = dims.rank();
        if axes == 0 || rank == 0 {
            return None;
        }
        if axes >> rank != 0 {
            return None;
        }
        let mut out = Vec::with_capacity(rank);
        for (i, d) in dims.d.iter().enumerate() {
            if axes & (1 << i) != 0 {
                if keep_dims {
                    out.push(1);
                }
            } else {
                out.push(*d);
            }
        }
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, Dims::new(out));
        self.push_layer(
            LayerKind::Reduce { op, axes, keep_dims },
            None,
            vec![input],
            vec![out],
        );
        Some(out)
    }

    /// Adds concatenation of `inputs` along `axis`.
    ///
    /// All inputs must share dtype, rank, and every non-`axis` dimension.
    pub fn add_concatenation(&mut self, inputs: &[TensorId], axis: usize) -> Option<TensorId> {
        let first = *inputs.first()?;
        let dtype = self.tensor_dtype(first);
        let mut dims = self.tensor_dims(first).clone();
        if axis >= dims.rank() {
            return None;
        }
        let mut total = 0;
        for input in inputs {
            if self.tensor_dtype(*input) != dtype {
                return None;
            }
            let other = self.tensor_dims(*input);
            if other.rank() != dims.rank() {
                return None;
            }
            for (i, (a, b)) in dims.d.iter().zip(other.d.iter()).enumerate() {
                if i != axis && a != b {
                    return None;
                }
            }
            total += other.d[axis];
        }
        dims.d[axis] = total;
        let out = self.add_tensor(dtype, dims);
        self.push_layer(
            LayerKind::Concatenation { axis },
            None,
            inputs.to_vec(),
            vec![out],
        );
        Some(out)
    }

    /// Adds a fully connected layer over a rank-3 input.
    ///
    /// The input is flattened; `kernel.count()` must equal `noutput` times
    /// the flattened size. The output shape is `(noutput, 1, 1)`.
    pub fn add_fully_connected(
        &mut self,
        input: TensorId,
        noutput: i64,
        kernel: ShapedWeights,
        bias: Option<ShapedWeights>,
    ) -> Option<TensorId> {
        let dims = self.tensor_dims(input).clone();
        if dims.rank() != 3 || noutput < 1 {
            return None;
        }
        if kernel.count() != noutput * dims.num_elements() {
            return None;
        }
        if let Some(bias) = &bias {
            if bias.count() != noutput {
                return None;
            }
        }
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, Dims::new(vec![noutput, 1, 1]));
        self.push_layer(
            LayerKind::FullyConnected {
                noutput,
                kernel,
                bias,
            },
            None,
            vec![input],
            vec![out],
        );
        Some(out)
    }

    /// Adds a batched matrix multiplication of the trailing two axes.
    ///
    /// Inputs must have equal rank (at least 2) and equal leading axes.
    pub fn add_matrix_multiply(
        &mut self,
        first: TensorId,
        transpose_a: bool,
        second: TensorId,
        transpose_b: bool,
    ) -> Option<TensorId> {
        let lhs = self.tensor_dims(first).clone();
        let rhs = self.tensor_dims(second).clone();
        let dtype = self.tensor_dtype(first);
        if dtype != self.tensor_dtype(second) {
            return None;
        }
        let rank = lhs.rank();
        if rank < 2 || rhs.rank() != rank {
            return None;
        }
        if lhs.d[..rank - 2] != rhs.d[..rank - 2] {
            return None;
        }
        let (m, ka) = if transpose_a {
            (lhs.d[rank - 1], lhs.d[rank - 2])
        } else {
            (lhs.d[rank - 2], lhs.d[rank - 1])
        };
        let (kb, n) = if transpose_b {
            (rhs.d[rank - 1], rhs.d[rank - 2])
        } else {
            (rhs.d[rank - 2], rhs.d[rank - 1])
        };
        if ka != kb {
            return None;
        }
        let mut out = lhs.d[..rank - 2].to_vec();
        out.push(m);
        out.push(n);
        let out = self.add_tensor(dtype, Dims::new(out));
        self.push_layer(
            LayerKind::MatrixMultiply {
                transpose_a,
                transpose_b,
            },
            None,
            vec![first, second],
            vec![out],
        );
        Some(out)
    }

    /// Adds softmax over the single axis set in `axes`.
    pub fn add_softmax(&mut self, input: TensorId, axes: u32) -> Option<TensorId> {
        let dims = self.tensor_dims(input).clone();
        if axes.count_ones() != 1 || axes >> dims.rank() != 0 {
            return None;
        }
        let dtype = self.tensor_dtype(input);
        let out = self.add_tensor(dtype, dims);
        self.push_layer(LayerKind::Softmax { axes }, None, vec![input], vec![out]);
        Some(out)
    }

    /// Adds top-k selection along the single axis set in `axes`.
    ///
    /// Returns the values tensor and the `Int32` indices tensor.
    pub fn add_topk(
        &mut self,
        input: TensorId,
        op: TopKOp,
        k: i64,
        axes: u32,
    ) -> Option<(TensorId, TensorId)> {
        let mut dims = self.tensor_dims(input).clone();
        if axes.count_ones() != 1 || axes >> dims.rank() != 0 {
            return None;
        }
        let axis = axes.trailing_zeros() as usize;
        if k < 1 || k > dims.d[axis] {
            return None;
        }
        dims.d[axis] = k;
        let dtype = self.tensor_dtype(input);
        let values = self.add_tensor(dtype, dims.clone());
        let indices = self.add_tensor(ElemType::Int32, dims);
        self.push_layer(
            LayerKind::TopK { op, k, axes },
            None,
            vec![input],
            vec![values, indices],
        );
        Some((values, indices))
    }

    /// Marks a tensor as a network output.
    pub fn mark_output(&mut self, id: TensorId) {
        self.outputs.push(id);
    }

    /// Shape of a tensor.
    pub fn tensor_dims(&self, id: TensorId) -> &Dims {
        &self.tensors[id.0].dims
    }

    /// Element type of a tensor.
    pub fn tensor_dtype(&self, id: TensorId) -> ElemType {
        self.tensors[id.0].dtype
    }

    /// Name bound to a tensor, if any.
    pub fn tensor_name(&self, id: TensorId) -> Option<&str> {
        self.tensors[id.0].name.as_deref()
    }

    /// Binds or replaces the name of a tensor.
    pub fn set_tensor_name(&mut self, id: TensorId, name: &str) {
        self.tensors[id.0].name = Some(name.to_string());
    }

    /// Finds a tensor by bound name.
    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.tensors
            .iter()
            .position(|t| t.name.as_deref() == Some(name))
            .map(TensorId)
    }

    /// Network input tensors, in declaration order.
    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    /// Network output tensors, in marking order.
    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// All layers, in insertion order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// One layer by handle.
    pub fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

fn apply_permutation(dims: &Dims, perm: &[i64]) -> Option<Dims> {
    if perm.len() != dims.rank() {
        return None;
    }
    let mut seen = vec![false; perm.len()];
    let mut out = Vec::with_capacity(perm.len());
    for &axis in perm {
        if axis < 0 || axis as usize >= dims.rank() {
            return None;
        }
        let axis = axis as usize;
        if seen[axis] {
            return None;
        }
        seen[axis] = true;
        out.push(dims.d[axis]);
    }
    Some(Dims::new(out))
}

fn apply_reshape(dims: &Dims, target: &Dims) -> Option<Dims> {
    if target.rank() > MAX_DIMS {
        return None;
    }
    let mut out = vec![0i64; target.rank()];
    let mut infer_index = None;
    let mut known_product = 1i64;
    for (i, &d) in target.d.iter().enumerate() {
        if d == 0 {
            let copied = *dims.d.get(i)?;
            out[i] = copied;
            known_product *= copied;
        } else if d == -1 {
            if infer_index.is_some() {
                return None;
            }
            infer_index = Some(i);
        } else if d > 0 {
            out[i] = d;
            known_product *= d;
        } else {
            return None;
        }
    }
    let total = dims.num_elements();
    match infer_index {
        Some(i) => {
            if known_product == 0 || total % known_product != 0 {
                return None;
            }
            out[i] = total / known_product;
        }
        None => {
            if known_product != total {
                return None;
            }
        }
    }
    Some(Dims::new(out))
}
