//! Tensor layout transforms between framework conventions
//!
//! The source framework stores convolution kernels as (kh, kw, in, out) and
//! dense kernels as (in, out); the destination wants (out, in, kh, kw) and
//! (out, in). These are pure integer axis permutations, so a transform
//! composed with its inverse reproduces the input bit for bit.

use anyhow::{bail, Result};
use ndarray::ArrayD;

/// (kh, kw, in, out) -> (out, in, kh, kw)
pub fn convolutional_kernel(kernel: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if kernel.ndim() != 4 {
        bail!(
            "Convolutional kernel must be rank 4, got rank {} with shape {:?}",
            kernel.ndim(),
            kernel.shape()
        );
    }
    Ok(kernel
        .view()
        .permuted_axes(vec![3, 2, 0, 1])
        .as_standard_layout()
        .to_owned())
}

/// (out, in, kh, kw) -> (kh, kw, in, out); exact inverse of [`convolutional_kernel`]
pub fn convolutional_kernel_inverse(kernel: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if kernel.ndim() != 4 {
        bail!(
            "Convolutional kernel must be rank 4, got rank {} with shape {:?}",
            kernel.ndim(),
            kernel.shape()
        );
    }
    Ok(kernel
        .view()
        .permuted_axes(vec![2, 3, 1, 0])
        .as_standard_layout()
        .to_owned())
}

/// (in, out) -> (out, in)
pub fn dense_kernel(kernel: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if kernel.ndim() != 2 {
        bail!(
            "Dense kernel must be rank 2, got rank {} with shape {:?}",
            kernel.ndim(),
            kernel.shape()
        );
    }
    Ok(kernel
        .view()
        .permuted_axes(vec![1, 0])
        .as_standard_layout()
        .to_owned())
}

/// Squeeze extraneous singleton dimensions down to rank 1.
///
/// Normalization statistics are logically rank-1 vectors; some source
/// representations carry them as (1, n) or (n, 1). Anything with more than
/// one non-singleton dimension is a genuine rank mismatch.
pub fn normalization_vector(stats: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let non_singleton = stats.shape().iter().filter(|&&d| d != 1).count();
    if stats.ndim() == 0 || non_singleton > 1 {
        bail!(
            "Normalization statistics must flatten to rank 1, got shape {:?}",
            stats.shape()
        );
    }
    let len = stats.len();
    ArrayD::from_shape_vec(vec![len], stats.iter().copied().collect()).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn counting(shape: &[usize]) -> ArrayD<f32> {
        let len: usize = shape.iter().product();
        Array::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_conv_kernel_permutation() {
        let kernel = counting(&[3, 3, 2, 4]);
        let out = convolutional_kernel(&kernel).unwrap();
        assert_eq!(out.shape(), &[4, 2, 3, 3]);
        // element (ky, kx, ic, oc) must land at (oc, ic, ky, kx)
        assert_eq!(out[[1, 0, 2, 2]], kernel[[2, 2, 0, 1]]);
        assert_eq!(out[[3, 1, 0, 2]], kernel[[0, 2, 1, 3]]);
    }

    #[test]
    fn test_conv_kernel_round_trip() {
        let kernel = counting(&[3, 3, 8, 16]);
        let restored =
            convolutional_kernel_inverse(&convolutional_kernel(&kernel).unwrap()).unwrap();
        assert_eq!(restored, kernel);
    }

    #[test]
    fn test_conv_kernel_rank_check() {
        let err = convolutional_kernel(&counting(&[3, 3, 2])).unwrap_err();
        assert!(err.to_string().contains("rank 4"));
        assert!(convolutional_kernel_inverse(&counting(&[4, 4])).is_err());
    }

    #[test]
    fn test_dense_kernel_transpose() {
        let kernel = counting(&[5, 3]);
        let out = dense_kernel(&kernel).unwrap();
        assert_eq!(out.shape(), &[3, 5]);
        assert_eq!(out[[2, 4]], kernel[[4, 2]]);
        // transpose twice restores
        assert_eq!(dense_kernel(&out).unwrap(), kernel);
    }

    #[test]
    fn test_dense_kernel_rank_check() {
        assert!(dense_kernel(&counting(&[5])).is_err());
        assert!(dense_kernel(&counting(&[5, 3, 1])).is_err());
    }

    #[test]
    fn test_normalization_vector_squeeze() {
        let stats = counting(&[1, 6]);
        let out = normalization_vector(&stats).unwrap();
        assert_eq!(out.shape(), &[6]);
        let already = counting(&[4]);
        assert_eq!(normalization_vector(&already).unwrap(), already);
    }

    #[test]
    fn test_normalization_vector_rejects_matrices() {
        let err = normalization_vector(&counting(&[2, 3])).unwrap_err();
        assert!(err.to_string().contains("rank 1"));
    }
}
