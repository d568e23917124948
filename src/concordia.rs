use argmin::core::{Jacobian, Operator};
use ndarray::{arr1, arr2, Array1, Array2};

use crate::config::DecayConstants;
use crate::margin::{Multivariate, Pair, UPb};
use crate::propagation::propagate;
use crate::Result;

/// Coordinate system of a U-Pb diagram
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Concordia {
    /// Pb207/U235 on x, Pb206/U238 on y
    Wetherill,
    /// U238/Pb206 on x, Pb207/Pb206 on y
    TeraWasserburg,
}

/// The constants parametrising the curve. Kept separate from [`DecayConstants`] so that they can
/// be perturbed when differentiating with respect to them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CurveConstants {
    pub(crate) lambda235: f64,
    pub(crate) lambda238: f64,
    pub(crate) u238_u235: f64,
}

impl From<&DecayConstants> for CurveConstants {
    fn from(decay: &DecayConstants) -> Self {
        Self {
            lambda235: decay.u235.value,
            lambda238: decay.u238.value,
            u238_u235: decay.u238_u235.value,
        }
    }
}

impl Concordia {
    /// The point on the curve at age `t` (Ma)
    pub(crate) fn point(self, t: f64, c: &CurveConstants) -> [f64; 2] {
        let a = (c.lambda235 * t).exp_m1();
        let b = (c.lambda238 * t).exp_m1();
        match self {
            Self::Wetherill => [a, b],
            Self::TeraWasserburg => [1. / b, a / (c.u238_u235 * b)],
        }
    }

    /// The derivative of [`Concordia::point`] with respect to age
    pub(crate) fn tangent(self, t: f64, c: &CurveConstants) -> [f64; 2] {
        let ea = (c.lambda235 * t).exp();
        let eb = (c.lambda238 * t).exp();
        match self {
            Self::Wetherill => [c.lambda235 * ea, c.lambda238 * eb],
            Self::TeraWasserburg => {
                let a = (c.lambda235 * t).exp_m1();
                let b = (c.lambda238 * t).exp_m1();
                [
                    -c.lambda238 * eb / b.powi(2),
                    (c.lambda235 * ea * b - a * c.lambda238 * eb) / (c.u238_u235 * b.powi(2)),
                ]
            }
        }
    }
}

/// Maps a Wetherill pair onto Tera-Wasserburg coordinates
struct WetherillToTeraWasserburg {
    u238_u235: f64,
}

impl Operator for WetherillToTeraWasserburg {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        let (r75, r68) = (p[0], p[1]);
        Ok(arr1(&[1. / r68, r75 / (r68 * self.u238_u235)]))
    }
}

impl Jacobian for WetherillToTeraWasserburg {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        let (r75, r68) = (p[0], p[1]);
        let u = self.u238_u235;
        Ok(arr2(&[
            [0., -1. / r68.powi(2)],
            [1. / (r68 * u), -r75 / (r68.powi(2) * u)],
        ]))
    }
}

impl UPb {
    /// Express this analysis as U238/Pb206 against Pb207/Pb206, propagating its covariance
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidInput`] if Pb206/U238 is zero.
    pub fn to_tera_wasserburg(&self, decay: &DecayConstants) -> Result<Pair> {
        if self.pb206_u238().value <= 0. {
            return Err(crate::Error::invalid(
                "Pb206/U238 must be positive to invert into Tera-Wasserburg space",
            ));
        }
        let transform = WetherillToTeraWasserburg {
            u238_u235: decay.u238_u235.value,
        };
        let propagated = propagate(&transform, &self.mean(), &self.covariance())?;
        Ok(Pair::from_moments(&propagated.value, &propagated.covariance))
    }
}

#[cfg(test)]
mod tests {
    use super::{Concordia, CurveConstants};
    use crate::config::DecayConstants;
    use crate::margin::{Measurement, Multivariate, UPb};
    use crate::Result;

    #[test]
    fn tangents_match_finite_differences() {
        let constants = CurveConstants::from(&DecayConstants::default());
        for kind in [Concordia::Wetherill, Concordia::TeraWasserburg] {
            for t in [10., 250., 1000., 3500.] {
                let h = t * 1e-6;
                let plus = kind.point(t + h, &constants);
                let minus = kind.point(t - h, &constants);
                let tangent = kind.tangent(t, &constants);
                for ii in 0..2 {
                    approx::assert_relative_eq!(
                        tangent[ii],
                        (plus[ii] - minus[ii]) / (2. * h),
                        max_relative = 1e-6
                    );
                }
            }
        }
    }

    #[test]
    fn concordant_points_map_between_coordinate_systems() -> Result<()> {
        let decay = DecayConstants::default();
        let constants = CurveConstants::from(&decay);
        let t = 800.;
        let [x, y] = Concordia::Wetherill.point(t, &constants);
        let analysis = UPb::new(Measurement::new(x, x * 0.01)?, Measurement::new(y, y * 0.01)?, 0.8)?;
        let tw = analysis.to_tera_wasserburg(&decay)?;
        let expected = Concordia::TeraWasserburg.point(t, &constants);
        approx::assert_relative_eq!(tw.x.value, expected[0], max_relative = 1e-12);
        approx::assert_relative_eq!(tw.y.value, expected[1], max_relative = 1e-12);
        // x = 1 / r68 so its relative error is that of r68
        approx::assert_relative_eq!(tw.x.uncertainty / tw.x.value, 0.01, max_relative = 1e-12);
        assert!(tw.covariance()[[0, 1]].is_finite());
        Ok(())
    }
}
