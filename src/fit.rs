use ndarray::{Array1, Array2, ScalarOperand};
use ndarray_linalg::{Inverse, Lapack, Scalar};
use num_traits::Float;

use crate::{Error, Result};

/// Outcome of one ordinary-least-squares fit.
///
/// Immutable: each drift order produces its own instance and later stages
/// only read from it.
#[derive(Clone, Debug)]
pub struct FitResult<E> {
    coefficients: Array1<E>,
    residuals: Array1<E>,
    standard_deviation: E,
    covariance: Array2<E>,
    degrees_of_freedom: usize,
}

impl<E: Copy> FitResult<E> {
    #[must_use]
    pub fn coefficients(&self) -> &Array1<E> {
        &self.coefficients
    }

    #[must_use]
    pub fn residuals(&self) -> &Array1<E> {
        &self.residuals
    }

    /// Residual standard deviation, `√(rᵗr / (n - k))`.
    #[must_use]
    pub const fn standard_deviation(&self) -> E {
        self.standard_deviation
    }

    /// Covariance of the fitted coefficients, `s² (XᵗX)⁻¹`.
    #[must_use]
    pub fn covariance(&self) -> &Array2<E> {
        &self.covariance
    }

    #[must_use]
    pub const fn degrees_of_freedom(&self) -> usize {
        self.degrees_of_freedom
    }
}

/// Ordinary least squares: solve `y ≈ X b` for `b = (XᵗX)⁻¹ Xᵗ y`.
///
/// # Errors
/// - [`Error::Data`] when observations do not match the design matrix rows,
///   or there are no degrees of freedom left.
/// - [`Error::SingularSystem`] when `XᵗX` cannot be inverted (too few
///   independent rows for the requested columns).
pub fn ols<E: Float + Lapack + Scalar + ScalarOperand>(
    design: &Array2<E>,
    observations: &Array1<E>,
) -> Result<FitResult<E>> {
    let (rows, columns) = design.dim();
    if observations.len() != rows {
        return Err(Error::Data(format!(
            "{} observations for a design matrix of {rows} rows",
            observations.len()
        )));
    }
    if rows <= columns {
        return Err(Error::Data(format!(
            "{rows} readings cannot constrain {columns} parameters with residual freedom"
        )));
    }

    let xtx = design.t().dot(design);
    let xtx_inverse = xtx.inv().map_err(|_| {
        Error::SingularSystem(format!(
            "normal matrix of a {rows}x{columns} design is not invertible"
        ))
    })?;

    let coefficients = xtx_inverse.dot(&design.t().dot(observations));
    let residuals = observations - &design.dot(&coefficients);

    let degrees_of_freedom = rows - columns;
    let variance = residuals.dot(&residuals)
        / E::from_usize(degrees_of_freedom).expect("degrees of freedom must fit in `E`");
    let standard_deviation = Scalar::sqrt(variance);
    let covariance = xtx_inverse * variance;

    Ok(FitResult {
        coefficients,
        residuals,
        standard_deviation,
        covariance,
        degrees_of_freedom,
    })
}
