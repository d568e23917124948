use ndarray::{Array1, Array2};

use crate::concordia::Concordia;
use crate::config::{Config, Nuclide};
use crate::estimate::{AgeEstimate, Convergence};
use crate::margin::Measurement;
use crate::math::block_diagonal;
use crate::propagation::{implicit_jacobian, sandwich};
use crate::regression::RegressionFit;
use crate::roots::all_roots;
use crate::{Error, Result};

/// Concordia intercept ages of a discordia line
#[derive(Clone, Debug, PartialEq)]
pub struct Intercepts {
    /// Lower, then (in Wetherill space, if the line crosses twice) upper intercept age
    pub ages: AgeEstimate,
    /// Pb207/Pb206 of the common lead component, the y-intercept of a Tera-Wasserburg line
    pub common_lead: Option<Measurement>,
}

impl Intercepts {
    pub fn lower(&self) -> Measurement {
        self.ages.as_measurement()
    }

    /// The upper intercept, if the line crosses the curve twice
    pub fn upper(&self) -> Option<Measurement> {
        (self.ages.value.len() > 1).then(|| {
            Measurement::new_unchecked(
                self.ages.value[1],
                self.ages.covariance[[1, 1]].max(0.).sqrt(),
            )
        })
    }
}

/// Signed distance between the line and the curve at age `t`, inputs `[a, b, λ235, λ238, U238/U235]`
fn misfit(diagram: Concordia, t: f64, p: &Array1<f64>) -> f64 {
    let (a, b) = (p[0], p[1]);
    let e5 = (p[2] * t).exp_m1();
    let e8 = (p[3] * t).exp_m1();
    match diagram {
        Concordia::Wetherill => a + b * e5 - e8,
        // y = a + b·x with x = 1 / e8 and y = e5 / (U·e8), multiplied through by e8
        Concordia::TeraWasserburg => a * e8 + b - e5 / p[4],
    }
}

/// Find where the line `fit` crosses the concordia curve of `diagram`
///
/// Roots are bracketed on `[0, max_age]` and their covariance is propagated from the covariance of
/// the line and, with `decay_uncertainty`, from the uranium decay constants and isotope ratio, by
/// implicit differentiation of the crossing condition.
///
/// In Tera-Wasserburg space only the lower intercept is returned, together with the common lead
/// composition.
///
/// # Errors
/// - [`Error::InvalidInput`] if the line does not cross the curve within `max_age`
/// - [`Error::SingularSystem`] if the line is tangent to the curve at an intercept
pub fn discordia_intercepts(
    fit: &RegressionFit,
    diagram: Concordia,
    decay_uncertainty: bool,
    config: &Config,
) -> Result<Intercepts> {
    let decay = &config.decay;
    let settings = &config.solver;
    let p = Array1::from(vec![
        fit.intercept,
        fit.slope,
        decay.u235.value,
        decay.u238.value,
        decay.u238_u235.value,
    ]);

    let g = |t: f64, p: &Array1<f64>| misfit(diagram, t, p);
    let roots = all_roots(&|t| g(t, &p), 0., settings.max_age, settings)?;
    let roots = match diagram {
        Concordia::Wetherill => match roots.as_slice() {
            [] => vec![],
            [only] => vec![*only],
            [lower, .., upper] => vec![*lower, *upper],
        },
        Concordia::TeraWasserburg => roots.into_iter().take(1).collect(),
    };
    if roots.is_empty() {
        return Err(Error::invalid(format!(
            "line does not intersect the {diagram:?} concordia between 0 and {} Ma",
            settings.max_age
        )));
    }
    let ages = roots.iter().map(|root| root.value).collect::<Vec<_>>();
    let convergence = roots
        .iter()
        .map(|root| Convergence::from(*root))
        .fold(Convergence::default(), Convergence::and);

    let jacobian = implicit_jacobian(&g, &ages, &p, settings.relative_step)?;
    let constant_covariance = Array2::from_diag(&Array1::from(vec![
        decay.variance(Nuclide::U235, decay_uncertainty),
        decay.variance(Nuclide::U238, decay_uncertainty),
        decay.ratio_variance(decay_uncertainty),
    ]));
    let covariance = sandwich(
        &jacobian,
        &block_diagonal(&[&fit.covariance, &constant_covariance]),
    )?;
    tracing::debug!(?ages, ?diagram, "computed concordia intercepts");

    Ok(Intercepts {
        ages: AgeEstimate {
            value: Array1::from(ages),
            covariance,
            convergence,
        },
        common_lead: match diagram {
            Concordia::Wetherill => None,
            Concordia::TeraWasserburg => Some(fit.intercept_measurement()),
        },
    })
}
