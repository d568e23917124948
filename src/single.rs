use argmin::core::{Jacobian, Operator};
use ndarray::{arr1, arr2, Array1, Array2};

use crate::config::{Config, DecayConstants, Nuclide, SolverSettings};
use crate::estimate::{AgeEstimate, Convergence};
use crate::margin::{Analysis, Helium, Measurement};
use crate::propagation::{diagonal_covariance, propagate, Numerical};
use crate::roots::{brent, expand_upper, Root};
use crate::{Error, Result};

/// Compute the age of a single analysis
///
/// With `decay_uncertainty` the uncertainties of the decay constants (and, where it enters, the
/// U-238/U-235 ratio) are folded into the result; otherwise only analytical uncertainty is
/// propagated. Closed-form ages carry analytic partial derivatives, while U-Th-He ages, defined
/// only implicitly, are differentiated numerically.
///
/// # Errors
/// Returns [`Error::InvalidInput`] for ratios outside the physical range of the decay system.
pub fn age(analysis: &Analysis, decay_uncertainty: bool, config: &Config) -> Result<AgeEstimate> {
    let decay = &config.decay;
    let settings = &config.solver;
    match analysis {
        Analysis::Pb207U235(ratio) => {
            log_decay_age(*ratio, decay.get(Nuclide::U235), decay_uncertainty)
        }
        Analysis::Pb206U238(ratio) => {
            log_decay_age(*ratio, decay.get(Nuclide::U238), decay_uncertainty)
        }
        Analysis::Pb207Pb206(ratio) => lead_lead_age(*ratio, decay, decay_uncertainty, settings),
        Analysis::ArAr { ar40_ar39, j } => {
            argon_age(*ar40_ar39, *j, decay.get(Nuclide::K40), decay_uncertainty)
        }
        Analysis::UThHe(helium) => helium_age(helium, decay, decay_uncertainty, settings),
    }
}

fn constant_input(constant: Measurement, decay_uncertainty: bool) -> Measurement {
    if decay_uncertainty {
        constant
    } else {
        Measurement::from_centroid(constant.value)
    }
}

/// t = ln(1 + r) / λ, inputs `[r, λ]`
pub(crate) struct LogDecay;

impl Operator for LogDecay {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(arr1(&[p[0].ln_1p() / p[1]]))
    }
}

impl Jacobian for LogDecay {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        let (r, lambda) = (p[0], p[1]);
        Ok(arr2(&[[
            1. / (lambda * (1. + r)),
            -r.ln_1p() / lambda.powi(2),
        ]]))
    }
}

fn log_decay_age(
    ratio: Measurement,
    lambda: Measurement,
    decay_uncertainty: bool,
) -> Result<AgeEstimate> {
    if ratio.value < 0. {
        return Err(Error::invalid(format!(
            "daughter/parent ratio {} is negative",
            ratio.value
        )));
    }
    let inputs = [ratio, constant_input(lambda, decay_uncertainty)];
    let x: Array1<f64> = inputs.iter().map(|m| m.value).collect();
    let propagated = propagate(&LogDecay, &x, &diagonal_covariance(&inputs))?;
    Ok(AgeEstimate::from_propagated(
        propagated,
        Convergence::default(),
    ))
}

/// t = ln(1 + J·R) / λ, inputs `[R, J, λ]`
pub(crate) struct ArgonAge;

impl Operator for ArgonAge {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(arr1(&[(p[1] * p[0]).ln_1p() / p[2]]))
    }
}

impl Jacobian for ArgonAge {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        let (ratio, j, lambda) = (p[0], p[1], p[2]);
        let denominator = lambda * (1. + j * ratio);
        Ok(arr2(&[[
            j / denominator,
            ratio / denominator,
            -(j * ratio).ln_1p() / lambda.powi(2),
        ]]))
    }
}

fn argon_age(
    ar40_ar39: Measurement,
    j: Measurement,
    lambda: Measurement,
    decay_uncertainty: bool,
) -> Result<AgeEstimate> {
    if ar40_ar39.value < 0. || j.value <= 0. {
        return Err(Error::invalid(
            "Ar40/Ar39 must be non-negative and J positive",
        ));
    }
    let inputs = [ar40_ar39, j, constant_input(lambda, decay_uncertainty)];
    let x: Array1<f64> = inputs.iter().map(|m| m.value).collect();
    let propagated = propagate(&ArgonAge, &x, &diagonal_covariance(&inputs))?;
    Ok(AgeEstimate::from_propagated(
        propagated,
        Convergence::default(),
    ))
}

/// Radiogenic Pb207/Pb206 at age `t` for constants `λ235`, `λ238` and U238/U235 ratio `u`
pub(crate) fn radiogenic_lead_ratio(t: f64, lambda235: f64, lambda238: f64, u: f64) -> f64 {
    if t == 0. {
        // limit as t → 0
        return lambda235 / (lambda238 * u);
    }
    (lambda235 * t).exp_m1() / (u * (lambda238 * t).exp_m1())
}

/// The Pb207/Pb206 age, defined implicitly. Inputs `[r, λ235, λ238, U238/U235]`
pub(crate) struct LeadLeadAge<'a> {
    pub(crate) settings: &'a SolverSettings,
}

impl LeadLeadAge<'_> {
    pub(crate) fn solve(&self, p: &Array1<f64>) -> Result<Root> {
        let (ratio, lambda235, lambda238, u) = (p[0], p[1], p[2], p[3]);
        let lower_limit = radiogenic_lead_ratio(0., lambda235, lambda238, u);
        if ratio <= lower_limit {
            return Err(Error::invalid(format!(
                "Pb207/Pb206 ratio {ratio} is at or below its zero-age value {lower_limit}"
            )));
        }
        let misfit = |t: f64| radiogenic_lead_ratio(t, lambda235, lambda238, u) - ratio;
        let upper = expand_upper(&misfit, 0., 1000., self.settings)?;
        brent(&misfit, 0., upper, self.settings)
    }
}

impl Operator for LeadLeadAge<'_> {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(arr1(&[self.solve(p)?.value]))
    }
}

impl Jacobian for LeadLeadAge<'_> {
    type Param = Array1<f64>;
    type Jacobian = Array2<f64>;

    /// Partials from the implicit function theorem applied to `m(t) - r = 0`
    fn jacobian(
        &self,
        p: &Self::Param,
    ) -> ::std::result::Result<Self::Jacobian, argmin::core::Error> {
        let t = self.solve(p)?.value;
        let (lambda235, lambda238, u) = (p[1], p[2], p[3]);
        let a = (lambda235 * t).exp_m1();
        let b = (lambda238 * t).exp_m1();
        let ea = (lambda235 * t).exp();
        let eb = (lambda238 * t).exp();
        let ratio = a / (u * b);

        let dm_dt = (lambda235 * ea * b - a * lambda238 * eb) / (u * b.powi(2));
        let dm_dlambda235 = t * ea / (u * b);
        let dm_dlambda238 = -a * t * eb / (u * b.powi(2));
        let dm_du = -ratio / u;

        Ok(arr2(&[[
            1. / dm_dt,
            -dm_dlambda235 / dm_dt,
            -dm_dlambda238 / dm_dt,
            -dm_du / dm_dt,
        ]]))
    }
}

fn lead_lead_age(
    ratio: Measurement,
    decay: &DecayConstants,
    decay_uncertainty: bool,
    settings: &SolverSettings,
) -> Result<AgeEstimate> {
    let inputs = [
        ratio,
        constant_input(decay.u235, decay_uncertainty),
        constant_input(decay.u238, decay_uncertainty),
        constant_input(decay.u238_u235, decay_uncertainty),
    ];
    let x: Array1<f64> = inputs.iter().map(|m| m.value).collect();
    let function = LeadLeadAge { settings };
    let root = function.solve(&x)?;
    let propagated = propagate(&function, &x, &diagonal_covariance(&inputs))?;
    Ok(AgeEstimate::from_propagated(propagated, root.into()))
}

/// Helium produced after `t` Ma by the given parent abundances. Inputs are
/// `[He, U, Th, Sm, λ238, λ235, λ232, λ147]`; the helium entry is ignored.
pub(crate) fn helium_production(t: f64, p: &Array1<f64>, u238_u235: f64) -> f64 {
    let (u, th, sm) = (p[1], p[2], p[3]);
    let (lambda238, lambda235, lambda232, lambda147) = (p[4], p[5], p[6], p[7]);
    let u238 = u * u238_u235 / (1. + u238_u235);
    let u235 = u / (1. + u238_u235);
    8. * u238 * (lambda238 * t).exp_m1()
        + 7. * u235 * (lambda235 * t).exp_m1()
        + 6. * th * (lambda232 * t).exp_m1()
        + 0.1499 * sm * (lambda147 * t).exp_m1()
}

/// The U-Th(-Sm)-He age, the non-negative root of `He(t) - He_observed`
pub(crate) struct HeliumAge<'a> {
    pub(crate) u238_u235: f64,
    pub(crate) settings: &'a SolverSettings,
}

impl HeliumAge<'_> {
    pub(crate) fn solve(&self, p: &Array1<f64>) -> Result<Root> {
        let observed = p[0];
        if observed <= 0. {
            return Ok(Root {
                value: 0.,
                iterations: 0,
                converged: true,
            });
        }
        let misfit = |t: f64| helium_production(t, p, self.u238_u235) - observed;
        let upper = expand_upper(&misfit, 0., 100., self.settings)?;
        brent(&misfit, 0., upper, self.settings)
    }

    /// Inputs in the order expected by [`helium_production`]
    pub(crate) fn inputs(
        helium: &Helium,
        decay: &DecayConstants,
        decay_uncertainty: bool,
    ) -> [Measurement; 8] {
        [
            helium.he,
            helium.u,
            helium.th,
            helium.sm.unwrap_or(Measurement::from_centroid(0.)),
            constant_input(decay.u238, decay_uncertainty),
            constant_input(decay.u235, decay_uncertainty),
            constant_input(decay.th232, decay_uncertainty),
            constant_input(decay.sm147, decay_uncertainty),
        ]
    }
}

impl Operator for HeliumAge<'_> {
    type Param = Array1<f64>;
    type Output = Array1<f64>;

    fn apply(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        Ok(arr1(&[self.solve(p)?.value]))
    }
}

fn helium_age(
    helium: &Helium,
    decay: &DecayConstants,
    decay_uncertainty: bool,
    settings: &SolverSettings,
) -> Result<AgeEstimate> {
    let inputs = HeliumAge::inputs(helium, decay, decay_uncertainty);
    let x: Array1<f64> = inputs.iter().map(|m| m.value).collect();
    let function = HeliumAge {
        u238_u235: decay.u238_u235.value,
        settings,
    };
    let root = function.solve(&x)?;
    let numerical = Numerical::new(&function, settings.relative_step);
    // ages are clamped at zero helium, so only the upper side of that input is informative
    let numerical = if x[0] <= 0. {
        numerical.forward_at([0])
    } else {
        numerical
    };
    let propagated = propagate(&numerical, &x, &diagonal_covariance(&inputs))?;
    Ok(AgeEstimate::from_propagated(propagated, root.into()))
}
