//! Values flowing through a conversion.
//!
//! Every bound name resolves to a [`TensorOrWeights`]: either a runtime
//! tensor living in the engine [`Network`], or [`ShapedWeights`], a handle
//! to a constant buffer in the [`WeightStore`] arena. The arena owns all
//! buffers for the lifetime of the network so layers can reference them by
//! handle.

use half::f16;

use crate::network::{Dims, ElemType, Network, TensorId};

/// Typed constant buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightBuf {
    /// 32-bit floats.
    F32(Vec<f32>),
    /// 16-bit floats.
    F16(Vec<f16>),
    /// 32-bit integers.
    I32(Vec<i32>),
}

impl WeightBuf {
    /// Element type of the buffer.
    pub fn elem_type(&self) -> ElemType {
        match self {
            WeightBuf::F32(_) => ElemType::Float32,
            WeightBuf::F16(_) => ElemType::Float16,
            WeightBuf::I32(_) => ElemType::Int32,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            WeightBuf::F32(v) => v.len(),
            WeightBuf::F16(v) => v.len(),
            WeightBuf::I32(v) => v.len(),
        }
    }

    /// True when the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Float view, if this is an `F32` buffer.
    pub fn as_f32s(&self) -> Option<&[f32]> {
        match self {
            WeightBuf::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Half view, if this is an `F16` buffer.
    pub fn as_f16s(&self) -> Option<&[f16]> {
        match self {
            WeightBuf::F16(v) => Some(v),
            _ => None,
        }
    }

    /// Integer view, if this is an `I32` buffer.
    pub fn as_i32s(&self) -> Option<&[i32]> {
        match self {
            WeightBuf::I32(v) => Some(v),
            _ => None,
        }
    }
}

/// Handle to a constant buffer in a [`WeightStore`], plus its shape.
///
/// The handle stays valid for the lifetime of the store; buffers are never
/// removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedWeights {
    /// Element type of the buffer.
    pub dtype: ElemType,
    /// Shape of the constant. Rank 0 means an empty buffer.
    pub dims: Dims,
    pub(crate) id: usize,
}

impl ShapedWeights {
    /// Number of elements, per the shape.
    pub fn count(&self) -> i64 {
        self.dims.num_elements()
    }

    /// Total size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.count().max(0) as usize * self.dtype.size_of()
    }
}

/// Arena owning every constant buffer of a conversion.
#[derive(Debug, Default)]
pub struct WeightStore {
    store: Vec<WeightBuf>,
}

impl WeightStore {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zero-initialized buffer of the given type and shape.
    ///
    /// # Panics
    ///
    /// Panics for [`ElemType::Int8`]; quantized buffers are never built by
    /// the translator.
    pub fn allocate(&mut self, dtype: ElemType, dims: Dims) -> ShapedWeights {
        let count = dims.num_elements().max(0) as usize;
        let values = match dtype {
            ElemType::Float32 => WeightBuf::F32(vec![0.0; count]),
            ElemType::Float16 => WeightBuf::F16(vec![f16::ZERO; count]),
            ElemType::Int32 => WeightBuf::I32(vec![0; count]),
            ElemType::Int8 => panic!("int8 weight buffers are not supported"),
        };
        self.insert(dims, values)
    }

    /// Freezes a locally built buffer into the arena.
    pub fn insert(&mut self, dims: Dims, values: WeightBuf) -> ShapedWeights {
        debug_assert_eq!(values.len() as i64, dims.num_elements().max(0));
        let id = self.store.len();
        let dtype = values.elem_type();
        self.store.push(values);
        ShapedWeights { dtype, dims, id }
    }

    /// Buffer behind a handle.
    pub fn values(&self, weights: &ShapedWeights) -> &WeightBuf {
        &self.store[weights.id]
    }

    /// Number of buffers held.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// True when the arena holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// A runtime tensor or a constant, the two kinds of value a conversion
/// handles.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorOrWeights {
    /// Runtime tensor in the engine network.
    ///
    /// `id` is absent only for shape-only stand-ins used during
    /// validation, which never reach a network.
    Tensor {
        /// Network tensor handle.
        id: Option<TensorId>,
        /// Shape, batch axis excluded.
        dims: Dims,
        /// Batch size this tensor implies, `-1` when unknown.
        batch_size: i64,
    },
    /// Constant weights.
    Weights(ShapedWeights),
}

impl TensorOrWeights {
    /// Value wrapping a network tensor.
    pub fn tensor(id: TensorId, dims: Dims, batch_size: i64) -> Self {
        Self::Tensor {
            id: Some(id),
            dims,
            batch_size,
        }
    }

    /// Value wrapping `id` with the shape recorded in `network`.
    pub fn from_network(network: &Network, id: TensorId) -> Self {
        Self::tensor(id, network.tensor_dims(id).clone(), -1)
    }

    /// Shape-only tensor stand-in for validation, with no network behind
    /// it.
    pub fn shape_only(dims: Dims, batch_size: i64) -> Self {
        Self::Tensor {
            id: None,
            dims,
            batch_size,
        }
    }

    /// True for a runtime tensor.
    pub fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor { .. })
    }

    /// True for constant weights.
    pub fn is_weights(&self) -> bool {
        matches!(self, Self::Weights(_))
    }

    /// Network handle of a runtime tensor. `None` for weights and for
    /// shape-only stand-ins.
    pub fn tensor_id(&self) -> Option<TensorId> {
        match self {
            Self::Tensor { id, .. } => *id,
            Self::Weights(_) => None,
        }
    }

    /// Constant weights, if that is what this value holds.
    pub fn as_weights(&self) -> Option<&ShapedWeights> {
        match self {
            Self::Tensor { .. } => None,
            Self::Weights(weights) => Some(weights),
        }
    }

    /// Shape of the value, batch axis excluded for tensors.
    pub fn dims(&self) -> &Dims {
        match self {
            Self::Tensor { dims, .. } => dims,
            Self::Weights(weights) => &weights.dims,
        }
    }

    /// Batch size implied by the value. Weights imply none (`-1`).
    pub fn batch_size(&self) -> i64 {
        match self {
            Self::Tensor { batch_size, .. } => *batch_size,
            Self::Weights(_) => -1,
        }
    }

    pub(crate) fn set_batch_size(&mut self, batch: i64) {
        if let Self::Tensor { batch_size, .. } = self {
            *batch_size = batch;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zero_initialized() {
        let mut store = WeightStore::new();
        let weights = store.allocate(ElemType::Float32, Dims::new(vec![2, 3]));
        assert_eq!(weights.count(), 6);
        assert_eq!(weights.size_bytes(), 24);
        assert_eq!(store.values(&weights).as_f32s().unwrap(), &[0.0; 6]);
    }

    #[test]
    fn test_allocate_rank_zero_is_empty() {
        let mut store = WeightStore::new();
        let weights = store.allocate(ElemType::Float16, Dims::new(vec![]));
        assert_eq!(weights.count(), 0);
        assert_eq!(weights.size_bytes(), 0);
        assert!(store.values(&weights).is_empty());
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut store = WeightStore::new();
        let weights = store.insert(Dims::new(vec![3]), WeightBuf::I32(vec![7, 8, 9]));
        assert_eq!(weights.dtype, ElemType::Int32);
        assert_eq!(store.values(&weights).as_i32s().unwrap(), &[7, 8, 9]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    #[should_panic(expected = "int8 weight buffers are not supported")]
    fn test_allocate_int8_panics() {
        let mut store = WeightStore::new();
        store.allocate(ElemType::Int8, Dims::new(vec![1]));
    }

    #[test]
    fn test_tensor_or_weights_accessors() {
        let mut store = WeightStore::new();
        let weights = store.insert(Dims::new(vec![2]), WeightBuf::F32(vec![1.0, 2.0]));
        let value = TensorOrWeights::Weights(weights);
        assert!(value.is_weights());
        assert!(!value.is_tensor());
        assert_eq!(value.batch_size(), -1);
        assert_eq!(value.dims(), &Dims::new(vec![2]));
        assert!(value.tensor_id().is_none());

        let stand_in = TensorOrWeights::shape_only(Dims::new(vec![1, 3]), 8);
        assert!(stand_in.is_tensor());
        assert!(stand_in.tensor_id().is_none());
        assert_eq!(stand_in.batch_size(), 8);
    }
}
