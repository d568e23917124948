use std::ops::Deref;

use ndarray::{arr1, arr2, Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A measured value with its 1σ standard error
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Measurement {
    pub value: f64,
    pub uncertainty: f64,
}

impl Measurement {
    /// # Errors
    /// Returns [`Error::InvalidInput`] if either field is not finite, or the uncertainty is
    /// negative.
    pub fn new(value: f64, uncertainty: f64) -> Result<Self> {
        if !value.is_finite() || !uncertainty.is_finite() {
            return Err(Error::invalid(format!(
                "measurement {value} ± {uncertainty} is not finite"
            )));
        }
        if uncertainty < 0. {
            return Err(Error::invalid(format!(
                "standard error {uncertainty} is negative"
            )));
        }
        Ok(Self { value, uncertainty })
    }

    pub(crate) const fn new_unchecked(value: f64, uncertainty: f64) -> Self {
        Self { value, uncertainty }
    }

    /// A point value with no reported uncertainty. Its standard error is exactly zero.
    pub const fn from_centroid(value: f64) -> Self {
        Self {
            value,
            uncertainty: 0.,
        }
    }

    pub fn variance(&self) -> f64 {
        self.uncertainty.powi(2)
    }
}

/// A bivariate measurement with correlated errors, such as one point on an isochron
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pair {
    pub x: Measurement,
    pub y: Measurement,
    /// Error correlation coefficient between `x` and `y`
    pub correlation: f64,
}

impl Pair {
    /// # Errors
    /// Returns [`Error::InvalidInput`] if the correlation lies outside [-1, 1].
    pub fn new(x: Measurement, y: Measurement, correlation: f64) -> Result<Self> {
        if !(-1.0..=1.0).contains(&correlation) {
            return Err(Error::invalid(format!(
                "correlation coefficient {correlation} outside [-1, 1]"
            )));
        }
        Ok(Self { x, y, correlation })
    }

    pub fn uncorrelated(x: Measurement, y: Measurement) -> Self {
        Self {
            x,
            y,
            correlation: 0.,
        }
    }

    pub(crate) fn from_moments(mean: &Array1<f64>, covariance: &Array2<f64>) -> Self {
        let sx = covariance[[0, 0]].max(0.).sqrt();
        let sy = covariance[[1, 1]].max(0.).sqrt();
        let correlation = if sx > 0. && sy > 0. {
            (covariance[[0, 1]] / (sx * sy)).clamp(-1., 1.)
        } else {
            0.
        };
        Self {
            x: Measurement::new_unchecked(mean[0], sx),
            y: Measurement::new_unchecked(mean[1], sy),
            correlation,
        }
    }

    pub fn covariance_xy(&self) -> f64 {
        self.correlation * self.x.uncertainty * self.y.uncertainty
    }
}

/// Anything contributing a mean vector and covariance matrix to a multivariate average
pub trait Multivariate {
    fn mean(&self) -> Array1<f64>;
    fn covariance(&self) -> Array2<f64>;
}

impl Multivariate for Pair {
    fn mean(&self) -> Array1<f64> {
        arr1(&[self.x.value, self.y.value])
    }

    fn covariance(&self) -> Array2<f64> {
        let cov = self.covariance_xy();
        arr2(&[[self.x.variance(), cov], [cov, self.y.variance()]])
    }
}

/// One U-Pb analysis in Wetherill form: Pb207/U235 against Pb206/U238
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UPb(pub Pair);

impl UPb {
    /// # Errors
    /// Returns [`Error::InvalidInput`] for negative ratios or an out of range correlation.
    pub fn new(pb207_u235: Measurement, pb206_u238: Measurement, correlation: f64) -> Result<Self> {
        if pb207_u235.value < 0. || pb206_u238.value < 0. {
            return Err(Error::invalid("U-Pb ratios must be non-negative"));
        }
        Ok(Self(Pair::new(pb207_u235, pb206_u238, correlation)?))
    }

    pub const fn pb207_u235(&self) -> Measurement {
        self.0.x
    }

    pub const fn pb206_u238(&self) -> Measurement {
        self.0.y
    }
}

impl Multivariate for UPb {
    fn mean(&self) -> Array1<f64> {
        self.0.mean()
    }

    fn covariance(&self) -> Array2<f64> {
        self.0.covariance()
    }
}

/// Helium, uranium, thorium and optionally samarium abundances of one aliquot, in molar units
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Helium {
    pub he: Measurement,
    pub u: Measurement,
    pub th: Measurement,
    pub sm: Option<Measurement>,
}

impl Helium {
    /// # Errors
    /// Returns [`Error::InvalidInput`] for negative abundances.
    pub fn new(he: Measurement, u: Measurement, th: Measurement) -> Result<Self> {
        Self::check(&[he, u, th])?;
        Ok(Self {
            he,
            u,
            th,
            sm: None,
        })
    }

    /// # Errors
    /// Returns [`Error::InvalidInput`] for negative abundances.
    pub fn with_samarium(he: Measurement, u: Measurement, th: Measurement, sm: Measurement) -> Result<Self> {
        Self::check(&[he, u, th, sm])?;
        Ok(Self {
            he,
            u,
            th,
            sm: Some(sm),
        })
    }

    fn check(abundances: &[Measurement]) -> Result<()> {
        if abundances.iter().any(|abundance| abundance.value < 0.) {
            return Err(Error::invalid("U-Th-He abundances must be non-negative"));
        }
        Ok(())
    }

    /// Abundances ordered He, U, Th[, Sm]
    pub(crate) fn values(&self) -> Vec<Measurement> {
        let mut values = vec![self.he, self.u, self.th];
        values.extend(self.sm);
        values
    }
}

/// A single analysis for one of the supported geochronometers
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Analysis {
    Pb207U235(Measurement),
    Pb206U238(Measurement),
    Pb207Pb206(Measurement),
    /// Radiogenic Ar40/Ar39 with the irradiation parameter J
    ArAr { ar40_ar39: Measurement, j: Measurement },
    UThHe(Helium),
}

/// An ordered, non-empty collection of analyses of the same kind
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisSet<A>(Vec<A>);

impl<A> AnalysisSet<A> {
    /// # Errors
    /// Returns [`Error::InvalidInput`] if `analyses` is empty.
    pub fn new(analyses: Vec<A>) -> Result<Self> {
        if analyses.is_empty() {
            return Err(Error::invalid("an analysis set needs at least one member"));
        }
        Ok(Self(analyses))
    }
}

impl<A> Deref for AnalysisSet<A> {
    type Target = [A];

    fn deref(&self) -> &[A] {
        &self.0
    }
}
