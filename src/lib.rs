#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod central;
pub mod concordia;
pub mod config;
pub mod error;
pub mod estimate;
pub mod intercepts;
pub mod margin;
pub mod math;
pub mod multi;
pub mod propagation;
pub mod regression;
pub mod roots;
pub mod single;
pub mod statistics;

pub use central::{central_age, CentralAge};
pub use concordia::Concordia;
pub use config::{Config, DecayConstants, Nuclide, SolverSettings};
pub use error::Error;
pub use estimate::{AgeEstimate, Convergence};
pub use intercepts::{discordia_intercepts, Intercepts};
pub use margin::{Analysis, AnalysisSet, Helium, Measurement, Multivariate, Pair, UPb};
pub use multi::{concordia_age, weighted_mean, Composition, ConcordiaAge};
pub use regression::{regress, RegressionFit, RegressionMethod};
pub use single::age;
pub use statistics::Fit;

pub type Result<T> = ::std::result::Result<T, Error>;
