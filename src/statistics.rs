use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::{Error, Result};

/// Mean of the squared weighted deviates
///
/// `residuals` are deviations already scaled by their standard errors.
///
/// # Errors
/// Returns [`Error::UndefinedStatistic`] when `degrees_of_freedom` is zero.
pub fn mswd(residuals: &[f64], degrees_of_freedom: usize) -> Result<f64> {
    let chi_square = residuals.iter().map(|r| r.powi(2)).sum::<f64>();
    reduced_chi_square(chi_square, degrees_of_freedom)
}

/// A chi-square statistic divided by its degrees of freedom
///
/// # Errors
/// - [`Error::UndefinedStatistic`] when `degrees_of_freedom` is zero
/// - [`Error::SingularSystem`] when `chi_square` is NaN, as left by degenerate weights
pub fn reduced_chi_square(chi_square: f64, degrees_of_freedom: usize) -> Result<f64> {
    if degrees_of_freedom == 0 {
        return Err(Error::UndefinedStatistic { degrees_of_freedom });
    }
    if chi_square.is_nan() {
        return Err(Error::singular("chi-square statistic is not a number"));
    }
    #[allow(clippy::cast_precision_loss)]
    Ok(chi_square.max(0.) / degrees_of_freedom as f64)
}

/// Probability of observing an MSWD at least this large, the upper tail of the chi-square
/// distribution evaluated at `mswd · degrees_of_freedom`
///
/// # Errors
/// - [`Error::UndefinedStatistic`] when `degrees_of_freedom` is zero
/// - [`Error::InvalidInput`] when `mswd` is NaN
pub fn p_value(mswd: f64, degrees_of_freedom: usize) -> Result<f64> {
    if degrees_of_freedom == 0 {
        return Err(Error::UndefinedStatistic { degrees_of_freedom });
    }
    if mswd.is_nan() {
        return Err(Error::invalid("MSWD is not a number"));
    }
    #[allow(clippy::cast_precision_loss)]
    let dof = degrees_of_freedom as f64;
    let distribution = ChiSquared::new(dof)?;
    Ok(distribution.sf((mswd * dof).max(0.)).clamp(0., 1.))
}

/// Reduced chi-square and its p-value
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fit {
    pub mswd: f64,
    pub p_value: f64,
    pub degrees_of_freedom: usize,
}

impl Fit {
    /// # Errors
    /// Returns [`Error::UndefinedStatistic`] when `degrees_of_freedom` is zero.
    pub fn from_chi_square(chi_square: f64, degrees_of_freedom: usize) -> Result<Self> {
        let mswd = reduced_chi_square(chi_square, degrees_of_freedom)?;
        Ok(Self {
            mswd,
            p_value: p_value(mswd, degrees_of_freedom)?,
            degrees_of_freedom,
        })
    }

    /// As [`Fit::from_chi_square`], but zero degrees of freedom yields `None`
    pub(crate) fn optional(chi_square: f64, degrees_of_freedom: usize) -> Result<Option<Self>> {
        match Self::from_chi_square(chi_square, degrees_of_freedom) {
            Ok(fit) => Ok(Some(fit)),
            Err(Error::UndefinedStatistic { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Surface a missing fit statistic as [`Error::UndefinedStatistic`]
pub(crate) fn require(fit: Option<&Fit>, degrees_of_freedom: usize) -> Result<&Fit> {
    fit.ok_or(Error::UndefinedStatistic { degrees_of_freedom })
}
