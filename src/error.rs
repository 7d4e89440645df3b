use thiserror::Error;

/// Failure classes for the analysis engine.
///
/// Quality problems that do not invalidate a computation (an over-threshold
/// residual, a circular sum outside tolerance) are not errors; they are
/// recorded as [`crate::collate::QualityWarning`] metadata and downgrade an
/// acceptance flag instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or insufficient raw readings: wrong array shape, fewer
    /// cycles than the fitted drift order supports, too few accepted runs.
    #[error("weighing data error: {0}")]
    Data(String),

    /// A design matrix without full column rank: an unknown mass that no
    /// comparison observes, or more unknowns than independent comparisons.
    #[error("singular system: {0}")]
    SingularSystem(String),

    /// A weight ID referenced by a scheme entry or comparison that is absent
    /// from every supplied mass set, or an inconsistent set definition.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}
