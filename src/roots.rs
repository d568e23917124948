use argmin::core::{CostFunction, Executor, State};
use argmin::solver::brent::BrentRoot;
use itertools::Itertools;

use crate::config::SolverSettings;
use crate::{Error, Result};

/// A root of a scalar equation
///
/// Running out of iterations is reported through `converged` rather than treated as a failure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Root {
    pub value: f64,
    pub iterations: u64,
    pub converged: bool,
}

impl Root {
    const fn exact(value: f64) -> Self {
        Self {
            value,
            iterations: 0,
            converged: true,
        }
    }
}

/// Adapter exposing a closure as an argmin cost function
struct Equation<'a, F> {
    function: &'a F,
}

impl<F: Fn(f64) -> f64> CostFunction for Equation<'_, F> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok((self.function)(*param))
    }
}

/// Find the root of `function` inside `[lower, upper]`
///
/// # Errors
/// Returns [`Error::InvalidInput`] if the interval does not bracket a sign change, and
/// [`Error::Solver`] if argmin fails for any other reason.
pub fn brent<F: Fn(f64) -> f64>(
    function: &F,
    lower: f64,
    upper: f64,
    settings: &SolverSettings,
) -> Result<Root> {
    let f_lower = function(lower);
    let f_upper = function(upper);
    if f_lower == 0. {
        return Ok(Root::exact(lower));
    }
    if f_upper == 0. {
        return Ok(Root::exact(upper));
    }
    if !f_lower.is_finite() || !f_upper.is_finite() || f_lower.signum() == f_upper.signum() {
        return Err(Error::invalid(format!(
            "interval [{lower}, {upper}] does not bracket a root"
        )));
    }

    let solver = BrentRoot::new(lower, upper, settings.root_tolerance);
    let res = Executor::new(Equation { function }, solver)
        .configure(|state| state.max_iters(settings.max_iterations))
        .run()?;

    let iterations = res.state().get_iter();
    let mut state = res.state().clone();
    let value = state
        .take_param()
        .ok_or_else(|| Error::Solver("brent solver returned no parameter".into()))?;
    let converged = iterations < settings.max_iterations;
    if converged {
        tracing::debug!(root = value, iterations, "brent solver converged");
    } else {
        tracing::warn!(
            root = value,
            iterations,
            "brent solver exhausted its iteration budget"
        );
    }

    Ok(Root {
        value,
        iterations,
        converged,
    })
}

/// Double `upper` until `function` changes sign between `lower` and `upper`
///
/// # Errors
/// Returns [`Error::InvalidInput`] if no sign change is found within the iteration budget.
pub fn expand_upper<F: Fn(f64) -> f64>(
    function: &F,
    lower: f64,
    upper: f64,
    settings: &SolverSettings,
) -> Result<f64> {
    let f_lower = function(lower);
    let mut upper = upper;
    for _ in 0..settings.max_iterations {
        let f_upper = function(upper);
        if f_upper == 0. || f_upper.signum() != f_lower.signum() {
            return Ok(upper);
        }
        upper *= 2.;
    }
    Err(Error::invalid(format!(
        "no root found above {lower} within {} doublings",
        settings.max_iterations
    )))
}

/// Split `[lower, upper]` into `cells` equal cells and return those in which `function` changes
/// sign. A grid node where `function` vanishes is returned as a degenerate cell.
pub fn scan<F: Fn(f64) -> f64>(
    function: &F,
    lower: f64,
    upper: f64,
    cells: usize,
) -> Vec<(f64, f64)> {
    #[allow(clippy::cast_precision_loss)]
    let nodes = (0..=cells)
        .map(|ii| lower + (upper - lower) * ii as f64 / cells as f64)
        .map(|t| (t, function(t)))
        .collect::<Vec<_>>();

    let mut brackets = vec![];
    if let Some(&(t, f)) = nodes.first() {
        if f == 0. {
            brackets.push((t, t));
        }
    }
    for ((t0, f0), (t1, f1)) in nodes.into_iter().tuple_windows() {
        if f1 == 0. {
            brackets.push((t1, t1));
        } else if f0 != 0. && f0.signum() != f1.signum() && f0.is_finite() && f1.is_finite() {
            brackets.push((t0, t1));
        }
    }
    brackets
}

/// Solve for every root of `function` on `[lower, upper]`, in ascending order
///
/// # Errors
/// Passes through errors from [`brent`].
pub fn all_roots<F: Fn(f64) -> f64>(
    function: &F,
    lower: f64,
    upper: f64,
    settings: &SolverSettings,
) -> Result<Vec<Root>> {
    scan(function, lower, upper, settings.grid_size)
        .into_iter()
        .map(|(a, b)| {
            if a == b {
                Ok(Root::exact(a))
            } else {
                brent(function, a, b, settings)
            }
        })
        .collect()
}
