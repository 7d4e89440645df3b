use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which set a weight belongs to; fixed solver ordering is Client, Check,
/// Standard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum SetClass {
    Client,
    Check,
    Standard,
}

impl std::fmt::Display for SetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Client => "Client",
            Self::Check => "Check",
            Self::Standard => "Standard",
        })
    }
}

/// A customer weight being calibrated.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientWeight {
    pub id: String,
    pub nominal_g: f64,
    /// Uncertainty contribution from magnetic susceptibility, µg, when
    /// measured for this weight.
    pub magnetic_uncertainty_ug: Option<f64>,
}

/// A weight with a previous calibration: a check or standard.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReferenceWeight {
    pub id: String,
    pub nominal_g: f64,
    /// Calibrated mass value, grams.
    pub mass_g: f64,
    /// Standard uncertainty of the calibrated value, µg.
    pub uncertainty_ug: f64,
}

/// A set of weights tagged by its role.
///
/// Each variant carries only the fields its role requires; validity is
/// checked once at construction, not defensively at every use.
#[derive(Clone, Debug)]
pub enum MassSet {
    Client {
        weights: Vec<ClientWeight>,
    },
    Check {
        weights: Vec<ReferenceWeight>,
    },
    Standard {
        weights: Vec<ReferenceWeight>,
        /// Pairwise correlations between the standards' calibrated values,
        /// for standards sharing a calibration history. Unit diagonal.
        correlations: Option<Array2<f64>>,
    },
}

impl MassSet {
    /// Build a client set.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on duplicate or empty IDs.
    pub fn client(weights: Vec<ClientWeight>) -> Result<Self> {
        validate_ids(weights.iter().map(|w| w.id.as_str()))?;
        Ok(Self::Client { weights })
    }

    /// Build a check set.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on duplicate/empty IDs or
    /// non-positive uncertainties.
    pub fn check(weights: Vec<ReferenceWeight>) -> Result<Self> {
        validate_ids(weights.iter().map(|w| w.id.as_str()))?;
        validate_uncertainties(&weights)?;
        Ok(Self::Check { weights })
    }

    /// Build a standard set, optionally with a correlation matrix.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on duplicate/empty IDs, non-positive
    /// uncertainties, or a correlation matrix whose shape or diagonal does
    /// not match the set.
    pub fn standard(
        weights: Vec<ReferenceWeight>,
        correlations: Option<Array2<f64>>,
    ) -> Result<Self> {
        validate_ids(weights.iter().map(|w| w.id.as_str()))?;
        validate_uncertainties(&weights)?;
        if let Some(correlations) = &correlations {
            if correlations.dim() != (weights.len(), weights.len()) {
                return Err(Error::Configuration(format!(
                    "correlation matrix is {:?} for {} standards",
                    correlations.dim(),
                    weights.len()
                )));
            }
            if correlations.diag().iter().any(|&c| (c - 1.0).abs() > 1e-12) {
                return Err(Error::Configuration(
                    "correlation matrix must have a unit diagonal".into(),
                ));
            }
        }
        Ok(Self::Standard {
            weights,
            correlations,
        })
    }

    #[must_use]
    pub const fn class(&self) -> SetClass {
        match self {
            Self::Client { .. } => SetClass::Client,
            Self::Check { .. } => SetClass::Check,
            Self::Standard { .. } => SetClass::Standard,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Client { weights } => weights.len(),
            Self::Check { weights } | Self::Standard { weights, .. } => weights.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            Self::Client { weights } => Box::new(weights.iter().map(|w| w.id.as_str())),
            Self::Check { weights } | Self::Standard { weights, .. } => {
                Box::new(weights.iter().map(|w| w.id.as_str()))
            }
        }
    }
}

fn validate_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(Error::Configuration("weight with an empty ID".into()));
        }
        if !seen.insert(id) {
            return Err(Error::Configuration(format!("duplicate weight ID {id}")));
        }
    }
    Ok(())
}

fn validate_uncertainties(weights: &[ReferenceWeight]) -> Result<()> {
    for weight in weights {
        if !(weight.uncertainty_ug > 0.0) {
            return Err(Error::Configuration(format!(
                "weight {} has non-positive uncertainty {}",
                weight.id, weight.uncertainty_ug
            )));
        }
    }
    Ok(())
}

/// Nominal display label for a weight, grams trimmed of trailing zeros
/// (`1000.0` → `"1000"`, `0.5` → `"0.5"`).
#[must_use]
pub fn nominal_label(nominal_g: f64) -> String {
    let text = format!("{nominal_g:.6}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    text.to_owned()
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Array2};

    use super::{nominal_label, ClientWeight, MassSet, ReferenceWeight, SetClass};

    fn reference(id: &str) -> ReferenceWeight {
        ReferenceWeight {
            id: id.into(),
            nominal_g: 1000.0,
            mass_g: 1000.000_1,
            uncertainty_ug: 50.0,
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let weights = vec![
            ClientWeight {
                id: "1000".into(),
                nominal_g: 1000.0,
                magnetic_uncertainty_ug: None,
            },
            ClientWeight {
                id: "1000".into(),
                nominal_g: 1000.0,
                magnetic_uncertainty_ug: None,
            },
        ];
        assert!(MassSet::client(weights).is_err());
    }

    #[test]
    fn zero_uncertainty_references_are_rejected() {
        let mut weight = reference("1000MA");
        weight.uncertainty_ug = 0.0;
        assert!(MassSet::check(vec![weight]).is_err());
    }

    #[test]
    fn correlation_matrices_must_match_the_set() {
        let weights = vec![reference("1000MA"), reference("500MA")];
        let wrong_shape: Array2<f64> = Array2::eye(3);
        assert!(MassSet::standard(weights.clone(), Some(wrong_shape)).is_err());

        let bad_diagonal = arr2(&[[1.0, 0.3], [0.3, 0.9]]);
        assert!(MassSet::standard(weights.clone(), Some(bad_diagonal)).is_err());

        let good = arr2(&[[1.0, 0.3], [0.3, 1.0]]);
        let set = MassSet::standard(weights, Some(good)).unwrap();
        assert_eq!(set.class(), SetClass::Standard);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn nominal_labels_trim_trailing_zeros() {
        assert_eq!(nominal_label(1000.0), "1000");
        assert_eq!(nominal_label(0.5), "0.5");
        assert_eq!(nominal_label(200.0), "200");
        assert_eq!(nominal_label(0.01), "0.01");
    }
}
