//! Shared helpers for kernel implementations.

use anyhow::{bail, Result};
use ndarray::ArrayView2;

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

/// Largest absolute element-wise difference, computed in `f64`.
pub fn max_abs_error(lhs: &[f32], rhs: &[f32]) -> f64 {
    lhs.iter()
        .zip(rhs)
        .fold(0.0_f64, |acc, (a, b)| acc.max((*a as f64 - *b as f64).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn mismatched_inner_dimension_is_rejected() {
        let lhs = Array2::<f32>::zeros((2, 3));
        let rhs = Array2::<f32>::zeros((2, 2));
        assert!(validate_matmul_inputs(&lhs.view(), &rhs.view()).is_err());
    }

    #[test]
    fn max_abs_error_picks_largest_gap() {
        assert_eq!(max_abs_error(&[1.0, 2.0, 3.0], &[1.0, 2.5, 2.0]), 1.0);
        assert_eq!(max_abs_error(&[], &[]), 0.0);
    }
}
