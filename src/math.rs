use ndarray::{Array, Array1, Array2};
use ndarray_linalg::{Inverse, Scalar};

use crate::{Error, Result};

/// Generate the Vandermode matrix of `degree` for observations `x`
///
/// The Vandermonde matrix is a (n x degree + 1) matrix. Each row of the matrix is a geometric
/// progression for an individual observation `x` from power `0` to `degree` inclusive. For
/// `degree = 1` this is the design matrix of a straight line.
///
/// # Errors
/// Returns an error if `degree` does not fit in an `i32`.
///
/// # Examples
///
/// ```
/// use isochron::math::vandermonde;
/// use ndarray::arr2;
///
/// let observations: Vec<f64> = vec![2., 3.];
/// let vander = vandermonde(&observations, 2).unwrap();
///
/// let expected = arr2(&[[1., 2., 4.], [1., 3., 9.]]);
/// assert_eq!(vander, expected);
/// ```
pub fn vandermonde<T: Copy + Scalar>(x: &[T], degree: usize) -> Result<Array2<T>> {
    let degree_i32 = i32::try_from(degree)
        .map_err(|_| Error::invalid(format!("{degree} doesn't fit in `i32`")))?;
    let vals = x
        .iter()
        .flat_map(|xi| (0..=degree_i32).map(|i| xi.powi(i)));

    Array::from_iter(vals)
        .into_shape((x.len(), degree + 1))
        .map_err(|e| Error::invalid(e.to_string()))
}

/// Invert a square matrix, mapping failure to [`Error::SingularSystem`]
pub(crate) fn invert(matrix: &Array2<f64>, what: &str) -> Result<Array2<f64>> {
    let inverse = matrix
        .inv()
        .map_err(|e| Error::singular(format!("{what} is not invertible: {e}")))?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(Error::singular(format!("{what} is not invertible")));
    }
    Ok(inverse)
}

/// Compute `vᵗ · M · v`
pub(crate) fn quadratic_form(v: &Array1<f64>, m: &Array2<f64>) -> f64 {
    v.dot(&m.dot(v))
}

/// Average a matrix with its transpose to remove rounding asymmetry
pub(crate) fn symmetrise(m: Array2<f64>) -> Array2<f64> {
    let transpose = m.t().to_owned();
    (m + transpose) * 0.5
}

/// Place `blocks` along the diagonal of a square matrix
pub(crate) fn block_diagonal(blocks: &[&Array2<f64>]) -> Array2<f64> {
    let dim = blocks.iter().map(|b| b.nrows()).sum();
    let mut out = Array2::zeros((dim, dim));
    let mut offset = 0;
    for block in blocks {
        let n = block.nrows();
        out.slice_mut(ndarray::s![offset..offset + n, offset..offset + n])
            .assign(block);
        offset += n;
    }
    out
}
