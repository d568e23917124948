use ndarray::{arr2, Array1, Array2};

use crate::config::SolverSettings;
use crate::estimate::Convergence;
use crate::margin::{Measurement, Pair};
use crate::math::{invert, symmetrise, vandermonde};
use crate::statistics::{require, Fit};
use crate::{Error, Result};

/// Estimator used by [`regress`]
///
/// Both agree when `x` carries no error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegressionMethod {
    /// Errors in both coordinates with their correlation ignored
    ///
    /// Closed-form weighted least squares on the `y` errors when every `x` is exact, otherwise
    /// the York iteration with the correlation of every point set to zero.
    Uncorrelated,
    /// York et al. (2004) regression with correlated errors in both coordinates
    ///
    /// The effective weight of each point depends on the slope, so the fit is repeated from the
    /// ordinary least squares slope until the slope settles.
    CorrelatedIterative,
}

/// A line `y = intercept + slope · x`
#[derive(Clone, Debug, PartialEq)]
pub struct RegressionFit {
    pub intercept: f64,
    pub slope: f64,
    /// Covariance of `[intercept, slope]`
    pub covariance: Array2<f64>,
    /// `n - 2`
    pub degrees_of_freedom: usize,
    pub convergence: Convergence,
    fit: Option<Fit>,
}

impl RegressionFit {
    /// MSWD and p-value of the points about the line
    ///
    /// # Errors
    /// Returns [`Error::UndefinedStatistic`] for a line through two points.
    pub fn goodness_of_fit(&self) -> Result<&Fit> {
        require(self.fit.as_ref(), self.degrees_of_freedom)
    }

    /// `[intercept, slope]`
    pub fn parameters(&self) -> Array1<f64> {
        Array1::from(vec![self.intercept, self.slope])
    }

    pub fn intercept_measurement(&self) -> Measurement {
        Measurement::new_unchecked(self.intercept, self.covariance[[0, 0]].max(0.).sqrt())
    }

    pub fn slope_measurement(&self) -> Measurement {
        Measurement::new_unchecked(self.slope, self.covariance[[1, 1]].max(0.).sqrt())
    }

    /// Turn a flagged non-converged fit into an error
    ///
    /// # Errors
    /// Returns [`Error::NonConvergence`] carrying the last slope if the iteration budget ran out.
    pub fn ensure_converged(self) -> Result<Self> {
        if self.convergence.converged {
            Ok(self)
        } else {
            Err(Error::NonConvergence {
                iterations: self.convergence.iterations,
                best_estimate: self.slope,
            })
        }
    }
}

/// Fit a straight line through `points`
///
/// Points without any uncertainty are fitted by ordinary least squares; the fit has zero
/// covariance and is accepted only if the points are collinear.
///
/// # Errors
/// - [`Error::InvalidInput`] for fewer than two points
/// - [`Error::SingularSystem`] if all `x` coincide, a point has zero effective variance among
///   points that do not, or exact points are not collinear
pub fn regress(
    points: &[Pair],
    method: RegressionMethod,
    settings: &SolverSettings,
) -> Result<RegressionFit> {
    if points.len() < 2 {
        return Err(Error::invalid(format!(
            "a line needs at least two points, got {}",
            points.len()
        )));
    }

    if points
        .iter()
        .all(|p| p.x.uncertainty == 0. && p.y.uncertainty == 0.)
    {
        return exact(points);
    }

    match method {
        RegressionMethod::Uncorrelated if points.iter().all(|p| p.x.uncertainty == 0.) => {
            weighted_least_squares(points)
        }
        RegressionMethod::Uncorrelated => {
            let decorrelated = points
                .iter()
                .map(|p| Pair::uncorrelated(p.x, p.y))
                .collect::<Vec<_>>();
            york(&decorrelated, settings)
        }
        RegressionMethod::CorrelatedIterative => york(points, settings),
    }
}

fn coordinates(points: &[Pair]) -> (Vec<f64>, Array1<f64>) {
    let x = points.iter().map(|p| p.x.value).collect();
    let y = points.iter().map(|p| p.y.value).collect();
    (x, y)
}

/// Solve the weighted normal equations, returning `[intercept, slope]` and their covariance
fn normal_equations(
    x: &[f64],
    y: &Array1<f64>,
    weights: &Array1<f64>,
) -> Result<(Array1<f64>, Array2<f64>)> {
    let design = vandermonde(x, 1)?;
    let weighted = &design.t() * weights;
    let covariance = invert(&weighted.dot(&design), "regression normal matrix")?;
    let parameters = covariance.dot(&weighted.dot(y));
    Ok((parameters, symmetrise(covariance)))
}

fn exact(points: &[Pair]) -> Result<RegressionFit> {
    let (x, y) = coordinates(points);
    let (parameters, _) = normal_equations(&x, &y, &Array1::ones(points.len()))?;
    let residuals = &y - &vandermonde(&x, 1)?.dot(&parameters);
    let scale = y.iter().fold(1f64, |acc, v| acc.max(v.abs()));
    if residuals.iter().any(|r| r.abs() > 1e-12 * scale) {
        return Err(Error::singular(
            "points without uncertainty are not collinear",
        ));
    }

    let degrees_of_freedom = points.len() - 2;
    Ok(RegressionFit {
        intercept: parameters[0],
        slope: parameters[1],
        covariance: Array2::zeros((2, 2)),
        degrees_of_freedom,
        convergence: Convergence::default(),
        fit: Fit::optional(0., degrees_of_freedom)?,
    })
}

fn weighted_least_squares(points: &[Pair]) -> Result<RegressionFit> {
    if points.iter().any(|p| p.y.uncertainty == 0.) {
        return Err(Error::singular(
            "a point without y uncertainty has infinite weight",
        ));
    }
    let (x, y) = coordinates(points);
    let weights = points
        .iter()
        .map(|p| p.y.variance().recip())
        .collect::<Array1<f64>>();
    let (parameters, covariance) = normal_equations(&x, &y, &weights)?;

    let residuals = &y - &vandermonde(&x, 1)?.dot(&parameters);
    let chi_square = (&residuals * &residuals * &weights).sum();
    let degrees_of_freedom = points.len() - 2;
    Ok(RegressionFit {
        intercept: parameters[0],
        slope: parameters[1],
        covariance,
        degrees_of_freedom,
        convergence: Convergence::default(),
        fit: Fit::optional(chi_square, degrees_of_freedom)?,
    })
}

/// Quantities of one York iteration at a trial slope
struct YorkStep {
    weights: Array1<f64>,
    x_bar: f64,
    y_bar: f64,
    /// Offsets of the adjusted `x` from `x_bar`
    beta: Array1<f64>,
    /// The refined slope
    slope: f64,
}

impl YorkStep {
    fn new(points: &[Pair], slope: f64) -> Result<Self> {
        let weights = points
            .iter()
            .map(|p| {
                let variance = p.y.variance() + slope.powi(2) * p.x.variance()
                    - 2. * slope * p.covariance_xy();
                if variance > 0. {
                    Ok(variance.recip())
                } else {
                    Err(Error::singular(format!(
                        "point ({}, {}) has no effective variance at slope {slope}",
                        p.x.value, p.y.value
                    )))
                }
            })
            .collect::<Result<Array1<f64>>>()?;

        let total = weights.sum();
        let x_bar = points
            .iter()
            .zip(&weights)
            .map(|(p, w)| w * p.x.value)
            .sum::<f64>()
            / total;
        let y_bar = points
            .iter()
            .zip(&weights)
            .map(|(p, w)| w * p.y.value)
            .sum::<f64>()
            / total;

        let beta = points
            .iter()
            .zip(&weights)
            .map(|(p, w)| {
                let u = p.x.value - x_bar;
                let v = p.y.value - y_bar;
                w * (u * p.y.variance() + slope * v * p.x.variance()
                    - (slope * u + v) * p.covariance_xy())
            })
            .collect::<Array1<f64>>();

        let (numerator, denominator) = points.iter().zip(&weights).zip(&beta).fold(
            (0., 0.),
            |(num, den), ((p, w), b)| {
                (
                    num + w * b * (p.y.value - y_bar),
                    den + w * b * (p.x.value - x_bar),
                )
            },
        );
        if denominator == 0. || !denominator.is_finite() {
            return Err(Error::singular("all points share the same x"));
        }

        Ok(Self {
            weights,
            x_bar,
            y_bar,
            beta,
            slope: numerator / denominator,
        })
    }
}

fn york(points: &[Pair], settings: &SolverSettings) -> Result<RegressionFit> {
    let (x, y) = coordinates(points);
    let (initial, _) = normal_equations(&x, &y, &Array1::ones(points.len()))?;
    let mut slope = initial[1];

    let mut convergence = Convergence {
        iterations: 0,
        converged: false,
    };
    for iteration in 1..=settings.max_iterations {
        let next = YorkStep::new(points, slope)?.slope;
        let change = (next - slope).abs();
        slope = next;
        convergence.iterations = iteration;
        tracing::trace!(iteration, slope, change, "york iteration");
        if change <= settings.regression_tolerance * slope.abs().max(f64::MIN_POSITIVE) {
            convergence.converged = true;
            break;
        }
    }
    if !convergence.converged {
        tracing::warn!(
            iterations = convergence.iterations,
            slope,
            "york regression did not converge"
        );
    }

    let step = YorkStep::new(points, slope)?;
    let intercept = step.y_bar - slope * step.x_bar;
    let total = step.weights.sum();
    let adjusted = &step.beta + step.x_bar;
    let adjusted_mean = step.weights.dot(&adjusted) / total;
    let spread = step
        .weights
        .iter()
        .zip(&adjusted)
        .map(|(w, a)| w * (a - adjusted_mean).powi(2))
        .sum::<f64>();
    if spread <= 0. {
        return Err(Error::singular("adjusted points share the same x"));
    }
    let slope_variance = spread.recip();
    let intercept_variance = total.recip() + adjusted_mean.powi(2) * slope_variance;
    let covariance = -adjusted_mean * slope_variance;

    let chi_square = points
        .iter()
        .zip(&step.weights)
        .map(|(p, w)| w * (p.y.value - intercept - slope * p.x.value).powi(2))
        .sum::<f64>();
    let degrees_of_freedom = points.len() - 2;
    tracing::debug!(
        iterations = convergence.iterations,
        slope,
        intercept,
        chi_square,
        "fitted york regression"
    );

    Ok(RegressionFit {
        intercept,
        slope,
        covariance: arr2(&[
            [intercept_variance, covariance],
            [covariance, slope_variance],
        ]),
        degrees_of_freedom,
        convergence,
        fit: Fit::optional(chi_square, degrees_of_freedom)?,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;
    use ndarray_rand::rand::{Rng, SeedableRng};
    use ndarray_rand::rand_distr::{StandardNormal, Uniform};
    use ndarray_rand::RandomExt;
    use rand_isaac::Isaac64Rng;

    use super::{regress, RegressionMethod};
    use crate::config::SolverSettings;
    use crate::margin::{Measurement, Pair};
    use crate::{Error, Result};

    /// Pearson's data with York's weights, the standard benchmark for errors-in-variables fits
    fn pearson_york() -> Result<Vec<Pair>> {
        let x = [0.0, 0.9, 1.8, 2.6, 3.3, 4.4, 5.2, 6.1, 6.5, 7.4];
        let y = [5.9, 5.4, 4.4, 4.6, 3.5, 3.7, 2.8, 2.8, 2.4, 1.5];
        let wx = [1000., 1000., 500., 800., 200., 80., 60., 20., 1.8, 1.];
        let wy = [1., 1.8, 4., 8., 20., 20., 70., 70., 100., 500.];
        (0..x.len())
            .map(|ii| {
                Pair::new(
                    Measurement::new(x[ii], 1. / f64::sqrt(wx[ii]))?,
                    Measurement::new(y[ii], 1. / f64::sqrt(wy[ii]))?,
                    0.,
                )
            })
            .collect()
    }

    #[test]
    fn exact_collinear_points_are_recovered_with_zero_mswd() -> Result<()> {
        let settings = SolverSettings::default();
        let points = [0., 1., 2., 3.]
            .iter()
            .map(|x| {
                Pair::uncorrelated(
                    Measurement::from_centroid(*x),
                    Measurement::from_centroid(0.5 + 2. * x),
                )
            })
            .collect::<Vec<_>>();

        for method in [RegressionMethod::Uncorrelated, RegressionMethod::CorrelatedIterative] {
            let fit = regress(&points, method, &settings)?;
            approx::assert_relative_eq!(fit.intercept, 0.5, max_relative = 1e-12);
            approx::assert_relative_eq!(fit.slope, 2., max_relative = 1e-12);
            let statistics = fit.goodness_of_fit()?;
            approx::assert_abs_diff_eq!(statistics.mswd, 0.);
            assert_eq!(statistics.degrees_of_freedom, 2);
            assert!(fit.covariance.iter().all(|v| *v == 0.));
        }
        Ok(())
    }

    #[test]
    fn exact_points_off_a_line_are_singular() -> Result<()> {
        let points = [(0., 0.), (1., 1.), (2., 5.)]
            .iter()
            .map(|(x, y)| {
                Pair::uncorrelated(Measurement::from_centroid(*x), Measurement::from_centroid(*y))
            })
            .collect::<Vec<_>>();
        assert!(matches!(
            regress(&points, RegressionMethod::CorrelatedIterative, &SolverSettings::default()),
            Err(Error::SingularSystem(_))
        ));
        Ok(())
    }

    #[test]
    fn york_regression_matches_the_pearson_benchmark() -> Result<()> {
        let fit = regress(
            &pearson_york()?,
            RegressionMethod::CorrelatedIterative,
            &SolverSettings::default(),
        )?;
        assert!(fit.convergence.converged);
        approx::assert_relative_eq!(fit.slope, -0.480_533, max_relative = 1e-5);
        approx::assert_relative_eq!(fit.intercept, 5.479_910, max_relative = 1e-5);
        assert!(fit.covariance[[0, 1]] < 0.);
        assert_eq!(fit.goodness_of_fit()?.degrees_of_freedom, 8);
        Ok(())
    }

    #[test]
    fn exhausted_iterations_are_flagged_not_fatal() -> Result<()> {
        let settings = SolverSettings {
            max_iterations: 1,
            ..SolverSettings::default()
        };
        let fit = regress(&pearson_york()?, RegressionMethod::CorrelatedIterative, &settings)?;
        assert!(!fit.convergence.converged);
        assert_eq!(fit.convergence.iterations, 1);
        assert!(fit.slope.is_finite());
        assert!(matches!(
            fit.ensure_converged(),
            Err(Error::NonConvergence { iterations: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn methods_agree_when_x_is_exact() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let settings = SolverSettings::default();
        let x = Array1::random_using(20, Uniform::new(0., 10.), &mut rng);

        let points = x
            .iter()
            .map(|x| {
                let sigma = rng.gen_range(0.05..0.2);
                let noise: f64 = rng.sample(StandardNormal);
                Pair::new(
                    Measurement::from_centroid(*x),
                    Measurement::new(1. + 0.3 * x + sigma * noise, sigma)?,
                    0.,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let wls = regress(&points, RegressionMethod::Uncorrelated, &settings)?;
        let york = regress(&points, RegressionMethod::CorrelatedIterative, &settings)?;
        approx::assert_relative_eq!(wls.slope, york.slope, max_relative = 1e-9);
        approx::assert_relative_eq!(wls.intercept, york.intercept, max_relative = 1e-9);
        for (a, b) in wls.covariance.iter().zip(york.covariance.iter()) {
            approx::assert_relative_eq!(a, b, max_relative = 1e-6);
        }
        approx::assert_relative_eq!(
            wls.goodness_of_fit()?.mswd,
            york.goodness_of_fit()?.mswd,
            max_relative = 1e-6
        );
        Ok(())
    }

    #[test]
    fn correlated_scatter_gives_plausible_statistics() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let settings = SolverSettings::default();
        let (a, b) = (0.2, 1.5);
        let (sx, sy, rho) = (0.05, 0.08, 0.6);

        let points = (0..50)
            .map(|_| {
                let x: f64 = rng.gen_range(1.0..5.0);
                let z1: f64 = rng.sample(StandardNormal);
                let z2: f64 = rng.sample(StandardNormal);
                let dx = sx * z1;
                let dy = sy * (rho * z1 + (1. - rho * rho).sqrt() * z2);
                Pair::new(
                    Measurement::new(x + dx, sx)?,
                    Measurement::new(a + b * x + dy, sy)?,
                    rho,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let fit = regress(&points, RegressionMethod::CorrelatedIterative, &settings)?;
        assert!(fit.convergence.converged);
        let slope = fit.slope_measurement();
        assert!((slope.value - b).abs() < 4. * slope.uncertainty);
        let statistics = fit.goodness_of_fit()?;
        assert!(statistics.mswd > 0.5 && statistics.mswd < 1.6);
        Ok(())
    }

    #[test]
    fn two_points_leave_the_fit_statistic_undefined() -> Result<()> {
        let points = vec![
            Pair::uncorrelated(Measurement::new(1., 0.1)?, Measurement::new(2., 0.1)?),
            Pair::uncorrelated(Measurement::new(2., 0.1)?, Measurement::new(3., 0.1)?),
        ];
        let fit = regress(&points, RegressionMethod::CorrelatedIterative, &SolverSettings::default())?;
        approx::assert_relative_eq!(fit.slope, 1., max_relative = 1e-10);
        assert!(matches!(
            fit.goodness_of_fit(),
            Err(Error::UndefinedStatistic {
                degrees_of_freedom: 0
            })
        ));
        assert!(matches!(
            regress(&points[..1], RegressionMethod::Uncorrelated, &SolverSettings::default()),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }

    /// Five points whose last `x` is much less certain than the others
    fn uncertain_last_x(correlation: f64) -> Result<Vec<Pair>> {
        let x = [1., 2., 3., 4., 5.];
        let y = [2.1, 2.9, 4.2, 4.8, 6.3];
        let sx = [0.05, 0.05, 0.05, 0.05, 0.5];
        (0..x.len())
            .map(|ii| {
                Pair::new(
                    Measurement::new(x[ii], sx[ii])?,
                    Measurement::new(y[ii], 0.1)?,
                    correlation,
                )
            })
            .collect()
    }

    #[test]
    fn uncorrelated_fit_weighs_points_by_their_x_errors() -> Result<()> {
        let settings = SolverSettings::default();
        let points = uncertain_last_x(0.)?;
        let fit = regress(&points, RegressionMethod::Uncorrelated, &settings)?;
        let york = regress(&points, RegressionMethod::CorrelatedIterative, &settings)?;

        // ignoring the x errors would give the ordinary least squares slope of 1.03
        approx::assert_relative_eq!(fit.slope, 0.955_419, max_relative = 1e-5);
        approx::assert_relative_eq!(fit.intercept, 1.116_690, max_relative = 1e-5);
        approx::assert_relative_eq!(fit.slope, york.slope, max_relative = 1e-10);
        for (a, b) in fit.covariance.iter().zip(york.covariance.iter()) {
            approx::assert_relative_eq!(a, b, max_relative = 1e-8);
        }
        assert!(fit.convergence.converged);
        Ok(())
    }

    #[test]
    fn uncorrelated_fit_ignores_the_error_correlation() -> Result<()> {
        let settings = SolverSettings::default();
        let correlated = uncertain_last_x(0.8)?;
        let fit = regress(&correlated, RegressionMethod::Uncorrelated, &settings)?;
        let independent = regress(&uncertain_last_x(0.)?, RegressionMethod::Uncorrelated, &settings)?;
        approx::assert_relative_eq!(fit.slope, independent.slope, max_relative = 1e-12);

        let york = regress(&correlated, RegressionMethod::CorrelatedIterative, &settings)?;
        approx::assert_relative_eq!(york.slope, 0.942_279, max_relative = 1e-5);
        Ok(())
    }

    #[test]
    fn an_exact_point_among_uncertain_ones_is_singular() -> Result<()> {
        let mut points = pearson_york()?;
        points[3] = Pair::uncorrelated(
            Measurement::from_centroid(points[3].x.value),
            Measurement::from_centroid(points[3].y.value),
        );
        for method in [RegressionMethod::Uncorrelated, RegressionMethod::CorrelatedIterative] {
            assert!(matches!(
                regress(&points, method, &SolverSettings::default()),
                Err(Error::SingularSystem(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn a_point_without_y_error_is_singular_when_x_is_exact() -> Result<()> {
        let points = [(0., 0.1), (1., 0.1), (2., 0.), (3., 0.1)]
            .iter()
            .map(|(x, sy)| {
                Ok(Pair::uncorrelated(
                    Measurement::from_centroid(*x),
                    Measurement::new(1. + x, *sy)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        assert!(matches!(
            regress(&points, RegressionMethod::Uncorrelated, &SolverSettings::default()),
            Err(Error::SingularSystem(_))
        ));
        Ok(())
    }
}
