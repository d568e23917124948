use ndarray::{Array1, Array2};

use crate::concordia::{Concordia, CurveConstants};
use crate::config::{Config, Nuclide};
use crate::estimate::{AgeEstimate, Convergence};
use crate::margin::{AnalysisSet, Multivariate, UPb};
use crate::math::{block_diagonal, invert, quadratic_form, symmetrise};
use crate::propagation::{implicit_jacobian, sandwich};
use crate::roots::all_roots;
use crate::statistics::{require, Fit};
use crate::{Error, Result};

/// The maximum likelihood composition common to a set of analyses
#[derive(Clone, Debug, PartialEq)]
pub struct Composition {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
    /// Degrees of freedom of the equivalence test, `d·(n - 1)`
    pub degrees_of_freedom: usize,
    equivalence: Option<Fit>,
}

impl Composition {
    /// MSWD and p-value of the hypothesis that all analyses share the mean composition
    ///
    /// # Errors
    /// Returns [`Error::UndefinedStatistic`] for a single analysis.
    pub fn equivalence(&self) -> Result<&Fit> {
        require(self.equivalence.as_ref(), self.degrees_of_freedom)
    }
}

/// Compute the generalised least squares mean of `analyses`
///
/// Minimises `Σᵢ (xᵢ − μ)ᵗ Σᵢ⁻¹ (xᵢ − μ)` in closed form:
///
/// $$
///     \hat\mu = \left(\sum_i \Sigma_i^{-1}\right)^{-1} \sum_i \Sigma_i^{-1} x_i
/// $$
///
/// with covariance `(Σᵢ Σᵢ⁻¹)⁻¹`. Contributions are accumulated in input order.
///
/// Analyses that all carry an exactly zero covariance are accepted only if they coincide, in which
/// case the mean is exact and the equivalence MSWD is zero.
///
/// # Errors
/// - [`Error::InvalidInput`] if the analyses differ in dimension
/// - [`Error::SingularSystem`] if a covariance matrix, or their summed inverse, is singular
pub fn weighted_mean<A: Multivariate>(analyses: &AnalysisSet<A>) -> Result<Composition> {
    let means = analyses.iter().map(Multivariate::mean).collect::<Vec<_>>();
    let covariances = analyses
        .iter()
        .map(Multivariate::covariance)
        .collect::<Vec<_>>();

    let dim = means[0].len();
    if means.iter().any(|m| m.len() != dim)
        || covariances.iter().any(|c| c.dim() != (dim, dim))
    {
        return Err(Error::invalid(
            "all analyses in a set must have the same dimension",
        ));
    }
    let degrees_of_freedom = dim * (analyses.len() - 1);

    if covariances.iter().all(|c| c.iter().all(|v| *v == 0.)) {
        return exact_mean(&means, degrees_of_freedom);
    }

    let mut information: Array2<f64> = Array2::zeros((dim, dim));
    let mut weighted: Array1<f64> = Array1::zeros(dim);
    let mut weights = Vec::with_capacity(analyses.len());
    for (ii, (mean, covariance)) in means.iter().zip(&covariances).enumerate() {
        if covariance.iter().all(|v| *v == 0.) {
            return Err(Error::singular(format!(
                "analysis {ii} has no uncertainty but others do, so its weight is infinite"
            )));
        }
        let weight = invert(covariance, &format!("covariance of analysis {ii}"))?;
        information += &weight;
        weighted += &weight.dot(mean);
        weights.push(weight);
    }

    let covariance = symmetrise(invert(&information, "summed information matrix")?);
    let mean = covariance.dot(&weighted);

    let chi_square = means
        .iter()
        .zip(&weights)
        .map(|(x, weight)| quadratic_form(&(x - &mean), weight))
        .sum::<f64>();
    let equivalence = Fit::optional(chi_square, degrees_of_freedom)?;
    tracing::debug!(
        analyses = analyses.len(),
        chi_square,
        degrees_of_freedom,
        "computed weighted mean composition"
    );

    Ok(Composition {
        mean,
        covariance,
        degrees_of_freedom,
        equivalence,
    })
}

fn exact_mean(means: &[Array1<f64>], degrees_of_freedom: usize) -> Result<Composition> {
    let first = &means[0];
    if means.iter().any(|m| m != first) {
        return Err(Error::singular(
            "analyses without uncertainty disagree, their mean is undefined",
        ));
    }
    let dim = first.len();
    Ok(Composition {
        mean: first.clone(),
        covariance: Array2::zeros((dim, dim)),
        degrees_of_freedom,
        equivalence: Fit::optional(0., degrees_of_freedom)?,
    })
}

/// A concordia age and the weighted mean composition it was derived from
#[derive(Clone, Debug, PartialEq)]
pub struct ConcordiaAge {
    /// Mean Pb207/U235 and Pb206/U238
    pub composition: Composition,
    pub age: AgeEstimate,
    /// MSWD and p-value of the mean composition about the concordia curve, one degree of freedom
    pub concordance: Fit,
}

/// Compute the concordia age of a set of U-Pb analyses
///
/// The age is the point on the Wetherill concordia closest to the weighted mean composition under
/// the inverse covariance metric: the root of `dS/dt` where
/// `S(t) = (μ̂ − c(t))ᵗ Σ_μ⁻¹ (μ̂ − c(t))`. Its uncertainty follows from implicit
/// differentiation of that root with respect to the composition and, with
/// `decay_uncertainty`, both uranium decay constants.
///
/// # Errors
/// - [`Error::SingularSystem`] if the mean composition has a singular covariance
/// - [`Error::InvalidInput`] if the mean composition is not positive or no age minimises `S`
pub fn concordia_age(
    analyses: &AnalysisSet<UPb>,
    decay_uncertainty: bool,
    config: &Config,
) -> Result<ConcordiaAge> {
    let composition = weighted_mean(analyses)?;
    let omega = invert(&composition.covariance, "covariance of the mean composition")?;
    let mu = composition.mean.clone();
    if mu.iter().any(|v| *v <= 0.) {
        return Err(Error::invalid(
            "mean composition must be positive to define a concordia age",
        ));
    }

    let constants = CurveConstants::from(&config.decay);
    let params = Array1::from(vec![mu[0], mu[1], constants.lambda235, constants.lambda238]);

    // stationarity of S(t): tangentᵗ Ω (μ − c(t)) = 0
    let stationarity = |t: f64, p: &Array1<f64>| {
        let c = CurveConstants {
            lambda235: p[2],
            lambda238: p[3],
            ..constants
        };
        let point = Concordia::Wetherill.point(t, &c);
        let tangent = Array1::from(Concordia::Wetherill.tangent(t, &c).to_vec());
        let residual = Array1::from(vec![p[0] - point[0], p[1] - point[1]]);
        tangent.dot(&omega.dot(&residual))
    };
    let misfit = |t: f64| {
        let point = Concordia::Wetherill.point(t, &constants);
        let residual = Array1::from(vec![mu[0] - point[0], mu[1] - point[1]]);
        quadratic_form(&residual, &omega)
    };

    let t75 = mu[0].ln_1p() / constants.lambda235;
    let t68 = mu[1].ln_1p() / constants.lambda238;
    let upper = 2. * t75.max(t68) + 1.;
    let roots = all_roots(&|t| stationarity(t, &params), 0., upper, &config.solver)?;
    let root = roots
        .into_iter()
        .min_by(|a, b| misfit(a.value).total_cmp(&misfit(b.value)))
        .ok_or_else(|| Error::invalid("no age minimises the concordance misfit"))?;
    let t = root.value;

    let jacobian = implicit_jacobian(&stationarity, &[t], &params, config.solver.relative_step)?;
    let decay = &config.decay;
    let constant_covariance = Array2::from_diag(&Array1::from(vec![
        decay.variance(Nuclide::U235, decay_uncertainty),
        decay.variance(Nuclide::U238, decay_uncertainty),
    ]));
    let input_covariance = block_diagonal(&[&composition.covariance, &constant_covariance]);
    let covariance = sandwich(&jacobian, &input_covariance)?;

    let concordance = Fit::from_chi_square(misfit(t), 1)?;
    tracing::debug!(age = t, mswd = concordance.mswd, "computed concordia age");

    Ok(ConcordiaAge {
        composition,
        age: AgeEstimate {
            value: Array1::from(vec![t]),
            covariance,
            convergence: Convergence::from(root),
        },
        concordance,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array1, Array2};
    use ndarray_rand::rand::{Rng, SeedableRng};
    use ndarray_rand::rand_distr::StandardNormal;
    use rand_isaac::Isaac64Rng;

    use super::{concordia_age, weighted_mean};
    use crate::concordia::{Concordia, CurveConstants};
    use crate::config::Config;
    use crate::margin::{AnalysisSet, Measurement, Multivariate, Pair, UPb};
    use crate::{Error, Result};

    fn concordant(t: f64, relative_error: f64, correlation: f64, config: &Config) -> Result<UPb> {
        let [x, y] = Concordia::Wetherill.point(t, &CurveConstants::from(&config.decay));
        UPb::new(
            Measurement::new(x, x * relative_error)?,
            Measurement::new(y, y * relative_error)?,
            correlation,
        )
    }

    #[test]
    fn mean_of_univariate_analyses_is_inverse_variance_weighted() -> Result<()> {
        struct Scalar(f64, f64);
        impl Multivariate for Scalar {
            fn mean(&self) -> Array1<f64> {
                arr1(&[self.0])
            }
            fn covariance(&self) -> Array2<f64> {
                arr2(&[[self.1.powi(2)]])
            }
        }

        let set = AnalysisSet::new(vec![Scalar(10., 1.), Scalar(12., 2.)])?;
        let composition = weighted_mean(&set)?;
        // weights 1 and 1/4
        approx::assert_relative_eq!(composition.mean[0], (10. + 12. / 4.) / 1.25, max_relative = 1e-12);
        approx::assert_relative_eq!(composition.covariance[[0, 0]], 1. / 1.25, max_relative = 1e-12);
        let fit = composition.equivalence()?;
        assert_eq!(fit.degrees_of_freedom, 1);
        // (10 - 10.4)² + (12 - 10.4)² / 4
        approx::assert_relative_eq!(fit.mswd, 0.16 + 0.64, max_relative = 1e-10);
        Ok(())
    }

    #[test]
    fn an_exact_analysis_among_uncertain_ones_is_singular() -> Result<()> {
        let exact = Pair::uncorrelated(Measurement::from_centroid(1.2), Measurement::from_centroid(0.2));
        let uncertain = Pair::new(Measurement::new(1.21, 0.01)?, Measurement::new(0.2, 0.002)?, 0.3)?;
        assert!(matches!(
            weighted_mean(&AnalysisSet::new(vec![uncertain, exact, uncertain])?),
            Err(Error::SingularSystem(_))
        ));
        Ok(())
    }

    #[test]
    fn identical_exact_analyses_have_zero_mswd_and_unit_p_value() -> Result<()> {
        let pair = Pair::uncorrelated(Measurement::from_centroid(1.2), Measurement::from_centroid(0.2));
        let composition = weighted_mean(&AnalysisSet::new(vec![pair, pair])?)?;
        let fit = composition.equivalence()?;
        approx::assert_abs_diff_eq!(fit.mswd, 0.);
        approx::assert_relative_eq!(fit.p_value, 1.);
        assert!(composition.covariance.iter().all(|v| *v == 0.));
        Ok(())
    }

    #[test]
    fn disagreeing_exact_analyses_are_singular() -> Result<()> {
        let a = Pair::uncorrelated(Measurement::from_centroid(1.2), Measurement::from_centroid(0.2));
        let b = Pair::uncorrelated(Measurement::from_centroid(1.3), Measurement::from_centroid(0.2));
        assert!(matches!(
            weighted_mean(&AnalysisSet::new(vec![a, b])?),
            Err(Error::SingularSystem(_))
        ));
        Ok(())
    }

    #[test]
    fn a_single_analysis_has_undefined_equivalence() -> Result<()> {
        let config = Config::default();
        let set = AnalysisSet::new(vec![concordant(400., 0.01, 0.5, &config)?])?;
        let composition = weighted_mean(&set)?;
        assert_eq!(composition.degrees_of_freedom, 0);
        assert!(matches!(
            composition.equivalence(),
            Err(Error::UndefinedStatistic {
                degrees_of_freedom: 0
            })
        ));

        // concordance still has one degree of freedom
        let result = concordia_age(&set, false, &config)?;
        approx::assert_relative_eq!(result.age.age(), 400., max_relative = 1e-8);
        assert_eq!(result.concordance.degrees_of_freedom, 1);
        Ok(())
    }

    #[test]
    fn concordant_analyses_recover_their_age_with_the_fisher_uncertainty() -> Result<()> {
        let config = Config::default();
        let t = 1200.;
        let set = AnalysisSet::new(
            (0..5)
                .map(|_| concordant(t, 0.005, 0.8, &config))
                .collect::<Result<Vec<_>>>()?,
        )?;

        let result = concordia_age(&set, false, &config)?;
        assert!(result.age.convergence.converged);
        approx::assert_relative_eq!(result.age.age(), t, max_relative = 1e-8);
        approx::assert_abs_diff_eq!(result.concordance.mswd, 0., epsilon = 1e-10);
        approx::assert_abs_diff_eq!(result.composition.equivalence()?.mswd, 0., epsilon = 1e-10);

        // σ_t² = 1 / (c'ᵗ Σ⁻¹ c') when the mean lies on the curve
        let constants = CurveConstants::from(&config.decay);
        let tangent = Array1::from(Concordia::Wetherill.tangent(t, &constants).to_vec());
        let omega = crate::math::invert(&result.composition.covariance, "test")?;
        let expected = 1. / crate::math::quadratic_form(&tangent, &omega);
        approx::assert_relative_eq!(result.age.covariance[[0, 0]], expected, max_relative = 1e-4);

        let with_decay = concordia_age(&set, true, &config)?;
        assert!(with_decay.age.standard_error() > result.age.standard_error());
        Ok(())
    }

    #[test]
    fn scattered_analyses_give_plausible_fit_statistics() -> Result<()> {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let config = Config::default();
        let t = 600.;
        let relative_error = 0.01;
        let [x, y] = Concordia::Wetherill.point(t, &CurveConstants::from(&config.decay));

        let analyses = (0..30)
            .map(|_| {
                let dx: f64 = rng.sample(StandardNormal);
                let dy: f64 = rng.sample(StandardNormal);
                UPb::new(
                    Measurement::new(x * (1. + relative_error * dx), x * relative_error)?,
                    Measurement::new(y * (1. + relative_error * dy), y * relative_error)?,
                    0.,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let result = concordia_age(&AnalysisSet::new(analyses)?, false, &config)?;

        assert!((result.age.age() - t).abs() < 4. * result.age.standard_error());
        let equivalence = result.composition.equivalence()?;
        assert_eq!(equivalence.degrees_of_freedom, 58);
        assert!(equivalence.mswd > 0.5 && equivalence.mswd < 1.6);
        assert!((0. ..=1.).contains(&result.concordance.p_value));
        Ok(())
    }

    #[test]
    fn analyses_of_mixed_dimension_are_rejected() -> Result<()> {
        struct Vector(Vec<f64>);
        impl Multivariate for Vector {
            fn mean(&self) -> Array1<f64> {
                Array1::from(self.0.clone())
            }
            fn covariance(&self) -> Array2<f64> {
                Array2::eye(self.0.len())
            }
        }
        let set = AnalysisSet::new(vec![Vector(vec![1., 2.]), Vector(vec![1., 2., 3.])])?;
        assert!(matches!(weighted_mean(&set), Err(Error::InvalidInput(_))));
        Ok(())
    }
}
