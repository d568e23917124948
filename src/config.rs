use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::margin::Measurement;
use crate::Result;

/// Parent nuclides whose decay constants enter the age equations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Nuclide {
    U238,
    U235,
    Th232,
    Sm147,
    K40,
}

/// Decay constants in Ma⁻¹ with their 1σ uncertainties
///
/// The table is read-only reference data: it is passed explicitly into every computation and never
/// mutated. Defaults are the conventional values of Jaffey et al. (1971) for uranium, Hiess et al.
/// (2012) for the present day U-238/U-235 ratio, Le Roux & Glendenin (1963) for Th-232, Lugmair &
/// Marti (1978) for Sm-147 and Steiger & Jäger (1977) for K-40.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DecayConstants {
    pub u238: Measurement,
    pub u235: Measurement,
    pub th232: Measurement,
    pub sm147: Measurement,
    pub k40: Measurement,
    /// Present day U-238/U-235 abundance ratio
    pub u238_u235: Measurement,
}

impl Default for DecayConstants {
    fn default() -> Self {
        Self {
            u238: Measurement::new_unchecked(1.55125e-4, 8.3e-8),
            u235: Measurement::new_unchecked(9.8485e-4, 6.7e-7),
            th232: Measurement::new_unchecked(4.9475e-5, 1.7e-7),
            sm147: Measurement::new_unchecked(6.54e-6, 2.4e-8),
            k40: Measurement::new_unchecked(5.543e-4, 1.0e-6),
            u238_u235: Measurement::new_unchecked(137.818, 0.0225),
        }
    }
}

impl DecayConstants {
    pub const fn get(&self, nuclide: Nuclide) -> Measurement {
        match nuclide {
            Nuclide::U238 => self.u238,
            Nuclide::U235 => self.u235,
            Nuclide::Th232 => self.th232,
            Nuclide::Sm147 => self.sm147,
            Nuclide::K40 => self.k40,
        }
    }

    /// Variance of a constant, or zero when decay constant uncertainty is switched off
    pub(crate) fn variance(&self, nuclide: Nuclide, decay_uncertainty: bool) -> f64 {
        if decay_uncertainty {
            self.get(nuclide).variance()
        } else {
            0.
        }
    }

    pub(crate) fn ratio_variance(&self, decay_uncertainty: bool) -> f64 {
        if decay_uncertainty {
            self.u238_u235.variance()
        } else {
            0.
        }
    }

    fn validate(&self) -> Result<()> {
        for nuclide in [
            Nuclide::U238,
            Nuclide::U235,
            Nuclide::Th232,
            Nuclide::Sm147,
            Nuclide::K40,
        ] {
            let constant = self.get(nuclide);
            Measurement::new(constant.value, constant.uncertainty)?;
            if constant.value <= 0. {
                return Err(crate::Error::invalid(format!(
                    "decay constant for {nuclide:?} must be positive"
                )));
            }
        }
        Measurement::new(self.u238_u235.value, self.u238_u235.uncertainty)?;
        if self.u238_u235.value <= 0. {
            return Err(crate::Error::invalid("U238/U235 ratio must be positive"));
        }
        Ok(())
    }
}

/// Iteration budgets and tolerances shared by the iterative solvers
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Upper bound on iterations for root-finding and iterative regression
    pub max_iterations: u64,
    /// Absolute tolerance in Ma for roots of the age equations
    pub root_tolerance: f64,
    /// Relative change in slope at which the iterative regression stops
    pub regression_tolerance: f64,
    /// Step, relative to the magnitude of each input, for central differences
    pub relative_step: f64,
    /// Oldest age in Ma considered when scanning for concordia intercepts
    pub max_age: f64,
    /// Number of grid cells used to bracket intercepts
    pub grid_size: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            root_tolerance: 1e-10,
            regression_tolerance: 1e-12,
            relative_step: 1e-6,
            max_age: 5000.,
            grid_size: 1000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub decay: DecayConstants,
    pub solver: SolverSettings,
}

impl Config {
    /// Parse a configuration from TOML. Missing tables and keys take their defaults.
    ///
    /// # Errors
    /// Returns an error if the TOML is malformed or describes negative uncertainties,
    /// non-positive decay constants or isotope ratio, or a zero iteration budget or grid size.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.decay.validate()?;
        if config.solver.max_iterations == 0 || config.solver.grid_size == 0 {
            return Err(crate::Error::invalid(
                "iteration budget and grid size must be non-zero",
            ));
        }
        Ok(config)
    }

    /// Read a configuration from a TOML file on disk
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, or as [`Config::from_toml_str`].
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(crate::Error::Config(format!(
                "requested file {} not found",
                path.display()
            )));
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
