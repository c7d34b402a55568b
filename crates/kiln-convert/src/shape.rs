//! Shape algebra around the implicit batch axis.
//!
//! Engine tensors carry their shape without the leading batch axis while
//! constants carry every axis explicitly, so broadcasting the two against
//! each other has to reason about a dimension only one side can see.

use crate::network::{Dims, MAX_DIMS};

/// Resolves broadcast shapes for a binary op between two operands.
///
/// Tensor operands count one extra implicit batch axis; constant operands
/// are taken verbatim. Both sides are padded on the left with 1s to a
/// common rank, the batch slot is excluded from comparison, and every
/// remaining axis pair must be equal or contain a 1.
///
/// Returns the batch-stripped shapes both operands must be reshaped to, or
/// `None` when the broadcast is infeasible, in particular when it would
/// have to extend a tensor beyond its batch axis.
pub fn broadcast_shapes(
    operand_l: &Dims,
    operand_l_is_tensor: bool,
    operand_r: &Dims,
    operand_r_is_tensor: bool,
) -> Option<(Dims, Dims)> {
    let max_nb_dims = MAX_DIMS + 1;
    if operand_l.rank() + 1 > max_nb_dims || operand_r.rank() + 1 > max_nb_dims {
        return None;
    }

    // Effective ranks, counting one implicit batch axis per tensor.
    let l_d = if operand_l_is_tensor {
        operand_l.rank() + 1
    } else {
        operand_l.rank()
    };
    let r_d = if operand_r_is_tensor {
        operand_r.rank() + 1
    } else {
        operand_r.rank()
    };
    let max_d = l_d.max(r_d);

    let mut l_s = vec![1i64; max_d];
    l_s[max_d - operand_l.rank()..].copy_from_slice(&operand_l.d);
    let mut r_s = vec![1i64; max_d];
    r_s[max_d - operand_r.rank()..].copy_from_slice(&operand_r.d);

    // The batch axis itself is never broadcast. A tensor whose padded rank
    // falls short of the common rank would need exactly that.
    if operand_l_is_tensor {
        if max_d != l_d {
            return None;
        }
        l_s[0] = -1;
    }
    if operand_r_is_tensor {
        if max_d != r_d {
            return None;
        }
        r_s[0] = -1;
    }

    for (l, r) in l_s.iter().zip(r_s.iter()) {
        if l != r && *l != 1 && *r != 1 {
            log::trace!("broadcast infeasible on axis pair {l}, {r}");
            return None;
        }
    }

    // The leading slot was only there to guard the batch axis.
    Some((Dims::new(l_s[1..].to_vec()), Dims::new(r_s[1..].to_vec())))
}

/// Computes per-axis `(pre, post)` padding replicating "same" semantics:
/// with stride 1 the output keeps the input size, trailing padding gets the
/// extra element when the total is odd.
///
/// `stride`, `kernel`, and `input_dims` must agree in length; a mismatch is
/// a caller bug.
pub fn create_same_padding(
    stride: &[i64],
    kernel: &[i64],
    input_dims: &[i64],
) -> Vec<(i64, i64)> {
    assert_eq!(stride.len(), input_dims.len());
    assert_eq!(kernel.len(), input_dims.len());

    let mut padding = Vec::with_capacity(input_dims.len());
    for i in 0..input_dims.len() {
        let p = ((input_dims[i] - 1) / stride[i]) * stride[i] + kernel[i] - input_dims[i];
        let p = p.max(0);

        let left = p / 2;
        let right = p - left;
        log::trace!(
            "padding axis {i}: pre {left}, post {right} (input {}, stride {}, kernel {})",
            input_dims[i],
            stride[i],
            kernel[i]
        );
        padding.push((left, right));
    }
    padding
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_tensor_against_weights() {
        // Tensor (1,3,5) with implicit batch, constant (1,1,3,1).
        let (l, r) = broadcast_shapes(
            &Dims::new(vec![1, 3, 5]),
            true,
            &Dims::new(vec![1, 1, 3, 1]),
            false,
        )
        .unwrap();
        assert_eq!(l, Dims::new(vec![1, 3, 5]));
        assert_eq!(r, Dims::new(vec![1, 3, 1]));
    }

    #[test]
    fn test_broadcast_is_symmetric() {
        let (l, r) = broadcast_shapes(
            &Dims::new(vec![1, 1, 3, 1]),
            false,
            &Dims::new(vec![1, 3, 5]),
            true,
        )
        .unwrap();
        assert_eq!(l, Dims::new(vec![1, 3, 1]));
        assert_eq!(r, Dims::new(vec![1, 3, 5]));
    }

    #[test]
    fn test_broadcast_beyond_batch_fails() {
        // The constant has more axes than the tensor plus its batch axis,
        // so broadcasting would have to touch the batch slot.
        assert!(
            broadcast_shapes(
                &Dims::new(vec![3, 5, 1]),
                true,
                &Dims::new(vec![1, 1, 1, 1, 3, 5, 1]),
                false,
            )
            .is_none()
        );
        assert!(
            broadcast_shapes(
                &Dims::new(vec![3, 5]),
                true,
                &Dims::new(vec![1, 1, 3, 1]),
                false,
            )
            .is_none()
        );
    }

    #[test]
    fn test_broadcast_incompatible_axis_fails() {
        assert!(
            broadcast_shapes(
                &Dims::new(vec![3, 5]),
                true,
                &Dims::new(vec![2, 5]),
                false,
            )
            .is_none()
        );
    }

    #[test]
    fn test_broadcast_two_tensors_requires_equal_rank() {
        let (l, r) = broadcast_shapes(
            &Dims::new(vec![3, 1]),
            true,
            &Dims::new(vec![1, 5]),
            true,
        )
        .unwrap();
        assert_eq!(l, Dims::new(vec![3, 1]));
        assert_eq!(r, Dims::new(vec![1, 5]));

        assert!(
            broadcast_shapes(
                &Dims::new(vec![3, 1]),
                true,
                &Dims::new(vec![2, 1, 5]),
                true,
            )
            .is_none()
        );
    }

    #[test]
    fn test_same_padding_stride_one() {
        let padding = create_same_padding(&[1, 1], &[3, 3], &[5, 5]);
        assert_eq!(padding, vec![(1, 1), (1, 1)]);
    }

    #[test]
    fn test_same_padding_strided() {
        // ((5-1)/2)*2 + 3 - 5 = 2, split symmetrically.
        let padding = create_same_padding(&[2, 2], &[3, 3], &[5, 5]);
        assert_eq!(padding, vec![(1, 1), (1, 1)]);
    }

    #[test]
    fn test_same_padding_odd_total_prefers_post() {
        // Kernel 2 on size 5 needs one padding element, placed after.
        let padding = create_same_padding(&[1], &[2], &[5]);
        assert_eq!(padding, vec![(0, 1)]);
    }

    #[test]
    fn test_same_padding_never_negative() {
        let padding = create_same_padding(&[1], &[1], &[5]);
        assert_eq!(padding, vec![(0, 0)]);
    }
}
