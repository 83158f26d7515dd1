use thiserror::Error;

#[derive(Error, Debug)]
/// Errors raised by the library.
pub enum MomentError {
    #[error("The following error occurred: {0}")]
    Generic(String),
    #[error("The {0} array has shape {1:?}, but shape {2:?} was expected")]
    ShapeMismatch(String, Vec<usize>, Vec<usize>),
    #[error("The population index {0} does not exist on a spectrum with {1} populations")]
    NonExistingPopulation(usize, usize),
    #[error("The parameter '{0}' is invalid: {1}")]
    InvalidParameter(String, String),
    #[error("The sample size {0} is too small for {1}")]
    SampleSizeTooSmall(usize, String),
    #[error("The spectrum contains non-finite entries after {0}")]
    NonFiniteSpectrum(String),
    #[error("The operator '{0}' has dimension {1}, but {2} was expected")]
    OperatorDimension(String, usize, usize),
    #[error("The spectrum is not folded")]
    NotFolded,
    #[error("Cannot combine a folded and an unfolded spectrum")]
    FoldingMismatch,
    #[error("An error occurred while reading a spectrum file: {0}")]
    FileRead(String),
    #[error("An error occurred while writing a spectrum file: {0}")]
    FileWrite(String),
    #[error("An error occurred in the linear solver: {0}")]
    LinearSolver(String),
    #[error("The statistic named '{0}' does not exist for {1} populations")]
    NonExistingStatistic(String, usize),
}
