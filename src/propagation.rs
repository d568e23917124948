use argmin::core::{Jacobian, Operator};
use ndarray::{s, Array1, Array2};

use crate::margin::Measurement;
use crate::math::symmetrise;
use crate::{Error, Result};

/// The value of a function at its inputs, and the covariance of that value
#[derive(Clone, Debug, PartialEq)]
pub struct Propagated {
    pub value: Array1<f64>,
    pub covariance: Array2<f64>,
}

impl Propagated {
    /// The first output with its standard error
    pub fn scalar(&self) -> Measurement {
        Measurement::new_unchecked(self.value[0], self.covariance[[0, 0]].max(0.).sqrt())
    }
}

/// Propagate the covariance of `x` through `function` to first order, `Σy = J Σx Jᵗ`
///
/// `function` supplies its partial derivatives through argmin's [`Jacobian`]; functions without
/// closed-form partials can be wrapped in [`Numerical`].
///
/// # Errors
/// Returns [`Error::InvalidInput`] if the covariance does not match the length of `x`, has a
/// negative diagonal, or the Jacobian has the wrong number of columns. Errors from evaluating the
/// function are passed through.
pub fn propagate<F>(function: &F, x: &Array1<f64>, covariance: &Array2<f64>) -> Result<Propagated>
where
    F: Operator<Param = Array1<f64>, Output = Array1<f64>>
        + Jacobian<Param = Array1<f64>, Jacobian = Array2<f64>>,
{
    let n = x.len();
    if covariance.dim() != (n, n) {
        return Err(Error::invalid(format!(
            "covariance of shape {:?} does not match {n} inputs",
            covariance.dim()
        )));
    }
    if covariance.diag().iter().any(|v| *v < 0. || !v.is_finite()) {
        return Err(Error::invalid("input variances must be finite and non-negative"));
    }

    let value = function.apply(x)?;
    let jacobian = function.jacobian(x)?;
    if jacobian.dim() != (value.len(), n) {
        return Err(Error::invalid(format!(
            "jacobian of shape {:?} for {} outputs and {n} inputs",
            jacobian.dim(),
            value.len()
        )));
    }

    let covariance = sandwich(&jacobian, covariance)?;
    Ok(Propagated { value, covariance })
}

/// Compute `J · Σ · Jᵗ` for a Jacobian obtained by other means
///
/// # Errors
/// Returns [`Error::InvalidInput`] if the shapes of `jacobian` and `covariance` disagree.
pub fn sandwich(jacobian: &Array2<f64>, covariance: &Array2<f64>) -> Result<Array2<f64>> {
    let n = covariance.nrows();
    if jacobian.ncols() != n || covariance.ncols() != n {
        return Err(Error::invalid(format!(
            "jacobian of shape {:?} cannot be applied to covariance of shape {:?}",
            jacobian.dim(),
            covariance.dim()
        )));
    }
    Ok(symmetrise(jacobian.dot(covariance).dot(&jacobian.t())))
}

/// Partial derivatives of the roots `t_k` of `g(t, p) = 0` with respect to `p`
///
/// No closed form exists for the root location, so the implicit function theorem
/// `∂t/∂p_j = -(∂g/∂p_j) / (∂g/∂t)` is applied with both partials of `g` estimated by central
/// differences. Row `k` of the result belongs to `roots[k]`.
///
/// # Errors
/// Returns [`Error::SingularSystem`] if `g` is stationary in `t` at a root, where the root location
/// is not differentiable.
pub fn implicit_jacobian<G: Fn(f64, &Array1<f64>) -> f64>(
    g: &G,
    roots: &[f64],
    p: &Array1<f64>,
    relative_step: f64,
) -> Result<Array2<f64>> {
    let step_for = |v: f64| {
        if v == 0. {
            relative_step
        } else {
            relative_step * v.abs()
        }
    };

    let mut jacobian = Array2::zeros((roots.len(), p.len()));
    for (kk, &t) in roots.iter().enumerate() {
        let h = step_for(t);
        let dg_dt = (g(t + h, p) - g(t - h, p)) / (2. * h);
        if dg_dt == 0. || !dg_dt.is_finite() {
            return Err(Error::singular(format!(
                "root at {t} is stationary, its location cannot be differentiated"
            )));
        }
        for jj in 0..p.len() {
            let h = step_for(p[jj]);
            let mut plus = p.clone();
            plus[jj] += h;
            let mut minus = p.clone();
            minus[jj] -= h;
            let dg_dp = (g(t, &plus) - g(t, &minus)) / (2. * h);
            jacobian[[kk, jj]] = -dg_dp / dg_dt;
        }
    }
    Ok(jacobian)
}

/// Estimate the Jacobian of `function` at `x` by central differences
///
/// The step for input `j` is `relative_step · |x_j|`, or `relative_step` itself when `x_j` is zero.
///
/// # Errors
/// Passes through errors from evaluating `function`.
pub fn numerical_jacobian<F>(function: &F, x: &Array1<f64>, relative_step: f64) -> Result<Array2<f64>>
where
    F: Operator<Param = Array1<f64>, Output = Array1<f64>>,
{
    finite_differences(function, x, relative_step, &[])
}

/// As [`numerical_jacobian`], with forward differences for the inputs listed in `forward`
fn finite_differences<F>(
    function: &F,
    x: &Array1<f64>,
    relative_step: f64,
    forward: &[usize],
) -> Result<Array2<f64>>
where
    F: Operator<Param = Array1<f64>, Output = Array1<f64>>,
{
    let mut columns = Vec::with_capacity(x.len());
    let centre = if forward.is_empty() {
        None
    } else {
        Some(function.apply(x)?)
    };
    for jj in 0..x.len() {
        let step = if x[jj] == 0. {
            relative_step
        } else {
            relative_step * x[jj].abs()
        };
        let mut plus = x.clone();
        plus[jj] += step;
        let column = if let (true, Some(value)) = (forward.contains(&jj), &centre) {
            (function.apply(&plus)? - value) / step
        } else {
            let mut minus = x.clone();
            minus[jj] -= step;
            (function.apply(&plus)? - function.apply(&minus)?) / (2. * step)
        };
        columns.push(column);
    }

    let m = columns.first().map_or(0, Array1::len);
    let mut jacobian = Array2::zeros((m, x.len()));
    for (jj, column) in columns.into_iter().enumerate() {
        jacobian.slice_mut(s![.., jj]).assign(&column);
    }
    Ok(jacobian)
}

/// Wraps a function so its Jacobian is estimated numerically
///
/// Central differences are used unless an input sits on the boundary of the function's domain,
/// where [`Numerical::forward_at`] switches that input to a forward difference.
pub struct Numerical<'a, F> {
    function: &'a F,
    relative_step: f64,
    forward: Vec<usize>,
}

impl<'a, F> Numerical<'a, F> {
    pub const fn new(function: &'a F, relative_step: f64) -> Self {
        Self {
            function,
            relative_step,
            forward: Vec::new(),
        }
    }

    /// Differentiate the listed inputs with forward differences
    #[must_use]
    pub fn forward_at(mut self, inputs: impl IntoIterator<Item = usize>) -> Self {
        self.forward.extend(inputs);
        self
    }
}

impl<F> Operator for Numerical<'_, F>
where
    F: Operator<Param = Array1<f64>, Output = Array1<f64>>,
{
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        self.function.apply(p)
    }
}

impl<F> Jacobian for Numerical<'_, F>
where
    F: Operator<Param = Array1<f64>, Output = Array1<f64>>,
{
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        Ok(finite_differences(
            self.function,
            p,
            self.relative_step,
            &self.forward,
        )?)
    }
}

/// Build a diagonal covariance matrix from independent measurements
pub fn diagonal_covariance(inputs: &[Measurement]) -> Array2<f64> {
    Array2::from_diag(&inputs.iter().map(Measurement::variance).collect::<Array1<f64>>())
}
