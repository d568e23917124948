use thiserror::Error;

/// Errors that can occur while computing ages and aggregate estimates
#[derive(Error, Debug)]
pub enum Error {
    /// Wrong dimensionality, negative variance or a non-physical ratio
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An iterative solver ran out of iterations before reaching tolerance
    #[error("no convergence after {iterations} iterations (best estimate {best_estimate})")]
    NonConvergence { iterations: u64, best_estimate: f64 },

    /// A normal-equations or covariance matrix could not be inverted
    #[error("singular system: {0}")]
    SingularSystem(String),

    /// A goodness-of-fit statistic was requested with zero degrees of freedom
    #[error("statistic undefined for {degrees_of_freedom} degrees of freedom")]
    UndefinedStatistic { degrees_of_freedom: usize },

    /// The optimisation framework failed for a reason not covered above
    #[error("solver error: {0}")]
    Solver(String),

    /// A probability distribution rejected its parameters
    #[error("distribution error: {0}")]
    Distribution(#[from] statrs::StatsError),

    /// A configuration file could not be read or parsed
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn singular(message: impl Into<String>) -> Self {
        Self::SingularSystem(message.into())
    }
}

// Errors raised inside argmin callbacks are boxed into `argmin::core::Error`. Recover the original
// kind where there is one.
impl From<argmin::core::Error> for Error {
    fn from(error: argmin::core::Error) -> Self {
        match error.downcast::<Self>() {
            Ok(error) => error,
            Err(other) => Self::Solver(other.to_string()),
        }
    }
}

impl From<ndarray_linalg::error::LinalgError> for Error {
    fn from(error: ndarray_linalg::error::LinalgError) -> Self {
        Self::SingularSystem(error.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Self::Config(error.to_string())
    }
}
