use ndarray::{Array1, Array2};

use crate::margin::Measurement;
use crate::propagation::Propagated;
use crate::{Error, Result};

/// Whether the iterative parts of a computation reached their tolerance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Convergence {
    pub iterations: u64,
    pub converged: bool,
}

impl Default for Convergence {
    fn default() -> Self {
        Self {
            iterations: 0,
            converged: true,
        }
    }
}

impl Convergence {
    /// Combine the convergence of two steps of one computation
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        Self {
            iterations: self.iterations + other.iterations,
            converged: self.converged && other.converged,
        }
    }
}

impl From<crate::roots::Root> for Convergence {
    fn from(root: crate::roots::Root) -> Self {
        Self {
            iterations: root.iterations,
            converged: root.converged,
        }
    }
}

/// One or more ages in Ma with their covariance
#[derive(Clone, Debug, PartialEq)]
pub struct AgeEstimate {
    pub value: Array1<f64>,
    pub covariance: Array2<f64>,
    pub convergence: Convergence,
}

impl AgeEstimate {
    pub(crate) fn from_propagated(propagated: Propagated, convergence: Convergence) -> Self {
        Self {
            value: propagated.value,
            covariance: propagated.covariance,
            convergence,
        }
    }

    /// The first (or only) age
    pub fn age(&self) -> f64 {
        self.value[0]
    }

    /// Standard error of the first (or only) age
    pub fn standard_error(&self) -> f64 {
        self.covariance[[0, 0]].max(0.).sqrt()
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.covariance.diag().mapv(|v| v.max(0.).sqrt())
    }

    pub fn as_measurement(&self) -> Measurement {
        Measurement::new_unchecked(self.age(), self.standard_error())
    }

    /// Turn a flagged non-converged estimate into an error
    ///
    /// # Errors
    /// Returns [`Error::NonConvergence`] carrying the best available age if any solver ran out of
    /// iterations.
    pub fn ensure_converged(self) -> Result<Self> {
        if self.convergence.converged {
            Ok(self)
        } else {
            Err(Error::NonConvergence {
                iterations: self.convergence.iterations,
                best_estimate: self.age(),
            })
        }
    }
}
