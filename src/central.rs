use argmin::core::{Jacobian, Operator};
use ndarray::{Array1, Array2};

use crate::config::{Config, Nuclide};
use crate::estimate::AgeEstimate;
use crate::margin::{AnalysisSet, Helium, Multivariate};
use crate::math::block_diagonal;
use crate::multi::{weighted_mean, Composition};
use crate::propagation::{diagonal_covariance, propagate, Numerical, Propagated};
use crate::single::HeliumAge;
use crate::{Error, Result};

/// Parent to helium log-ratios, inputs `[He, U, Th(, Sm)]`
struct LogRatio;

impl Operator for LogRatio {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        let he = p[0].ln();
        Ok(p.iter().skip(1).map(|parent| parent.ln() - he).collect())
    }
}

impl Jacobian for LogRatio {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        let parents = p.len() - 1;
        let mut jacobian = Array2::zeros((parents, p.len()));
        for ii in 0..parents {
            jacobian[[ii, 0]] = -1. / p[0];
            jacobian[[ii, ii + 1]] = 1. / p[ii + 1];
        }
        Ok(jacobian)
    }
}

/// One aliquot expressed as log-ratios
struct LogComposition(Propagated);

impl LogComposition {
    fn new(helium: &Helium) -> Result<Self> {
        let abundances = helium.values();
        if abundances.iter().any(|abundance| abundance.value <= 0.) {
            return Err(Error::invalid(
                "central ages need strictly positive abundances to take log-ratios",
            ));
        }
        let x = abundances.iter().map(|m| m.value).collect::<Array1<f64>>();
        Ok(Self(propagate(&LogRatio, &x, &diagonal_covariance(&abundances))?))
    }
}

impl Multivariate for LogComposition {
    fn mean(&self) -> Array1<f64> {
        self.0.value.clone()
    }

    fn covariance(&self) -> Array2<f64> {
        self.0.covariance.clone()
    }
}

/// Helium age of the central composition, inputs `[ln(U/He), ln(Th/He)(, ln(Sm/He)), λ238, λ235,
/// λ232, λ147]`
struct CentralHeliumAge<'a> {
    age: HeliumAge<'a>,
    samarium: bool,
}

impl CentralHeliumAge<'_> {
    /// Inputs of [`HeliumAge`] for one unit of helium
    fn helium_inputs(&self, p: &Array1<f64>) -> Array1<f64> {
        let (sm, constants) = if self.samarium {
            (p[2].exp(), 3)
        } else {
            (0., 2)
        };
        let mut inputs = vec![1., p[0].exp(), p[1].exp(), sm];
        inputs.extend(p.iter().skip(constants));
        Array1::from(inputs)
    }
}

impl Operator for CentralHeliumAge<'_> {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        self.age.apply(&self.helium_inputs(p))
    }
}

/// The central composition of a set of aliquots and the age it implies
#[derive(Clone, Debug, PartialEq)]
pub struct CentralAge {
    /// Mean log-ratios ln(U/He), ln(Th/He)[, ln(Sm/He)]
    pub composition: Composition,
    pub age: AgeEstimate,
}

impl CentralAge {
    /// The standard error of the age inflated by `sqrt(MSWD)` when the aliquots are overdispersed
    ///
    /// # Errors
    /// Returns [`Error::UndefinedStatistic`] for a single aliquot.
    pub fn overdispersed_standard_error(&self) -> Result<f64> {
        let mswd = self.composition.equivalence()?.mswd;
        Ok(self.age.standard_error() * mswd.max(1.).sqrt())
    }
}

/// Compute the central U-Th(-Sm)-He age of a set of aliquots
///
/// Each aliquot is mapped onto the log-ratios `ln(U/He)`, `ln(Th/He)` and, when samarium was
/// measured, `ln(Sm/He)`. The central age is the helium age of one unit of helium with parents
/// `exp(μ̂)`, where `μ̂` is the weighted mean of those log-ratios.
///
/// # Errors
/// - [`Error::InvalidInput`] for non-positive abundances, or if only some aliquots report samarium
/// - [`Error::SingularSystem`] if the aliquot log-ratio covariances cannot be inverted
pub fn central_age(
    aliquots: &AnalysisSet<Helium>,
    decay_uncertainty: bool,
    config: &Config,
) -> Result<CentralAge> {
    let with_samarium = aliquots.iter().filter(|aliquot| aliquot.sm.is_some()).count();
    if with_samarium != 0 && with_samarium != aliquots.len() {
        return Err(Error::invalid(
            "samarium must be reported for all aliquots of a set or for none",
        ));
    }

    let compositions = aliquots
        .iter()
        .map(LogComposition::new)
        .collect::<Result<Vec<_>>>()?;
    let composition = weighted_mean(&AnalysisSet::new(compositions)?)?;

    let decay = &config.decay;
    let constants = [Nuclide::U238, Nuclide::U235, Nuclide::Th232, Nuclide::Sm147];
    let x = composition
        .mean
        .iter()
        .copied()
        .chain(constants.iter().map(|nuclide| decay.get(*nuclide).value))
        .collect::<Array1<f64>>();
    let constant_covariance = Array2::from_diag(
        &constants
            .iter()
            .map(|nuclide| decay.variance(*nuclide, decay_uncertainty))
            .collect::<Array1<f64>>(),
    );
    let covariance = block_diagonal(&[&composition.covariance, &constant_covariance]);

    let function = CentralHeliumAge {
        age: HeliumAge {
            u238_u235: decay.u238_u235.value,
            settings: &config.solver,
        },
        samarium: with_samarium != 0,
    };
    let root = function.age.solve(&function.helium_inputs(&x))?;
    let propagated = propagate(
        &Numerical::new(&function, config.solver.relative_step),
        &x,
        &covariance,
    )?;
    tracing::debug!(
        age = root.value,
        aliquots = aliquots.len(),
        "computed central U-Th-He age"
    );

    Ok(CentralAge {
        composition,
        age: AgeEstimate::from_propagated(propagated, root.into()),
    })
}
