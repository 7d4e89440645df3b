use std::collections::HashMap;

use log::{debug, warn};
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use serde::{Deserialize, Serialize};

use crate::collate::{CollatedObservation, QualityWarning};
use crate::math::outer_product;
use crate::weights::{nominal_label, MassSet, SetClass};
use crate::{Error, Result};

/// Column contract of the summary table; downstream reporting reads it by
/// position and name.
pub const SUMMARY_COLUMNS: [&str; 9] = [
    "Nominal",
    "Weight ID",
    "Set",
    "Mass value",
    "Uncertainty",
    "95% CI",
    "Coverage factor",
    "Reference value",
    "Shift",
];

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SolverConfig {
    /// Relative uncertainty (ppm) covering the omitted buoyancy correction,
    /// applied to each solved client/check mass. The ppm→fraction factor is
    /// applied exactly once.
    pub rel_unc_no_buoyancy_ppm: f64,
    /// Expansion factor for the confidence interval.
    pub coverage_factor: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            rel_unc_no_buoyancy_ppm: 0.1,
            coverage_factor: 2.0,
        }
    }
}

/// One unknown mass in solver order: clients, then checks, then standards.
#[derive(Clone, Debug)]
struct Unknown {
    id: String,
    nominal_g: f64,
    class: SetClass,
    /// Previously calibrated (value g, uncertainty µg) for checks and
    /// standards.
    reference: Option<(f64, f64)>,
    magnetic_uncertainty_ug: Option<f64>,
}

/// The assembled weighted-least-squares problem.
///
/// `design` has one row per collated comparison plus one identity row per
/// standard; `covariance` is the correlation-masked Hadamard expansion of
/// the per-observation uncertainties, in grams².
#[derive(Clone, Debug)]
pub struct LeastSquaresProblem {
    pub design: Array2<f64>,
    pub observations: Array1<f64>,
    pub covariance: Array2<f64>,
    unknowns: Vec<Unknown>,
    /// (plus, minus) labels per row, identity rows labelled against the
    /// calibrated value.
    row_labels: Vec<(String, String)>,
    comparison_rows: usize,
}

/// Solver diagnostics: dimensions, residual quality, and any warnings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SolverDiagnostics {
    pub observations: usize,
    pub unknowns: usize,
    pub degrees_of_freedom: usize,
    pub rel_unc_no_buoyancy_ppm: f64,
    pub sum_of_squared_residuals_ug2: f64,
    pub warnings: Vec<QualityWarning>,
}

/// One row of the summary table (see [`SUMMARY_COLUMNS`]).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SummaryRow {
    pub nominal: String,
    pub weight_id: String,
    pub set: SetClass,
    /// Solved mass, grams; reported to 9 decimal places.
    pub mass_value_g: f64,
    /// Total standard uncertainty (measurement + buoyancy + magnetic), µg.
    pub uncertainty_ug: f64,
    /// Expanded uncertainty at the configured coverage factor, µg.
    pub ci95_ug: f64,
    pub coverage_factor: f64,
    /// A priori calibrated value for checks and standards, grams.
    pub reference_value_g: Option<f64>,
    /// Solved minus reference, µg, for checks and standards.
    pub shift_ug: Option<f64>,
}

impl SummaryRow {
    /// Render the row in the fixed column order of [`SUMMARY_COLUMNS`].
    #[must_use]
    pub fn cells(&self) -> [String; 9] {
        [
            self.nominal.clone(),
            self.weight_id.clone(),
            self.set.to_string(),
            format!("{:.9}", self.mass_value_g),
            format!("{:.3}", self.uncertainty_ug),
            format!("{:.3}", self.ci95_ug),
            format!("{}", self.coverage_factor),
            self.reference_value_g
                .map_or_else(String::new, |v| format!("{v:.9}")),
            self.shift_ug
                .map_or_else(String::new, |s| format!("{s:.3}")),
        ]
    }
}

/// Final output of the global solve.
#[derive(Clone, Debug)]
pub struct MassSolution {
    /// Solved masses in solver order, grams.
    pub values_g: Array1<f64>,
    /// Measurement covariance of the solved masses, grams².
    pub covariance_g2: Array2<f64>,
    /// Residuals per observation row, µg.
    pub residuals_ug: Array1<f64>,
    pub diagnostics: SolverDiagnostics,
    pub summary: Vec<SummaryRow>,
}

fn expect_class(set: &MassSet, class: SetClass) -> Result<()> {
    if set.class() == class {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "expected a {class} set, got {}",
            set.class()
        )))
    }
}

/// Flatten the three sets into solver order: clients, checks, standards.
fn assemble_unknowns(
    client: &MassSet,
    check: &MassSet,
    standard: &MassSet,
) -> Result<Vec<Unknown>> {
    expect_class(client, SetClass::Client)?;
    expect_class(check, SetClass::Check)?;
    expect_class(standard, SetClass::Standard)?;
    if standard.is_empty() {
        return Err(Error::Configuration(
            "at least one standard mass is required to anchor the solve".into(),
        ));
    }

    let mut unknowns = vec![];
    if let MassSet::Client { weights } = client {
        for w in weights {
            unknowns.push(Unknown {
                id: w.id.clone(),
                nominal_g: w.nominal_g,
                class: SetClass::Client,
                reference: None,
                magnetic_uncertainty_ug: w.magnetic_uncertainty_ug,
            });
        }
    }
    if let MassSet::Check { weights } = check {
        for w in weights {
            unknowns.push(Unknown {
                id: w.id.clone(),
                nominal_g: w.nominal_g,
                class: SetClass::Check,
                reference: Some((w.mass_g, w.uncertainty_ug)),
                magnetic_uncertainty_ug: None,
            });
        }
    }
    if let MassSet::Standard { weights, .. } = standard {
        for w in weights {
            unknowns.push(Unknown {
                id: w.id.clone(),
                nominal_g: w.nominal_g,
                class: SetClass::Standard,
                reference: Some((w.mass_g, w.uncertainty_ug)),
                magnetic_uncertainty_ug: None,
            });
        }
    }

    let mut seen = std::collections::HashSet::new();
    for unknown in &unknowns {
        if !seen.insert(unknown.id.as_str()) {
            return Err(Error::Configuration(format!(
                "weight ID {} appears in more than one set",
                unknown.id
            )));
        }
    }
    Ok(unknowns)
}

/// Build the design matrix, observation vector, and observation covariance
/// from the collated comparisons and the three mass sets.
///
/// # Errors
/// - [`Error::Configuration`] when a comparison names a weight ID absent
///   from every set, or the sets themselves are inconsistent.
/// - [`Error::Data`] when there are no comparisons or an uncertainty is not
///   positive.
pub fn build_problem(
    comparisons: &[CollatedObservation],
    client: &MassSet,
    check: &MassSet,
    standard: &MassSet,
) -> Result<LeastSquaresProblem> {
    if comparisons.is_empty() {
        return Err(Error::Data("no collated comparisons to solve".into()));
    }

    let unknowns = assemble_unknowns(client, check, standard)?;
    let index_of: HashMap<&str, usize> = unknowns
        .iter()
        .enumerate()
        .map(|(index, unknown)| (unknown.id.as_str(), index))
        .collect();

    let standards = standard.len();
    let rows = comparisons.len() + standards;
    let columns = unknowns.len();
    let standard_offset = columns - standards;

    let mut design: Array2<f64> = Array2::zeros((rows, columns));
    let mut observations: Array1<f64> = Array1::zeros(rows);
    let mut uncertainties_g: Array1<f64> = Array1::zeros(rows);
    let mut row_labels = vec![];

    for (row, comparison) in comparisons.iter().enumerate() {
        for id in comparison.plus.weight_ids() {
            let column = *index_of.get(id).ok_or_else(|| {
                Error::Configuration(format!(
                    "weight ID {id} in comparison {row} is absent from every mass set"
                ))
            })?;
            design[[row, column]] += 1.0;
        }
        for id in comparison.minus.weight_ids() {
            let column = *index_of.get(id).ok_or_else(|| {
                Error::Configuration(format!(
                    "weight ID {id} in comparison {row} is absent from every mass set"
                ))
            })?;
            design[[row, column]] -= 1.0;
        }
        observations[row] = comparison.difference_g;
        if !(comparison.uncertainty_ug > 0.0) {
            return Err(Error::Data(format!(
                "comparison {row} has non-positive uncertainty {}",
                comparison.uncertainty_ug
            )));
        }
        uncertainties_g[row] = comparison.uncertainty_ug * 1e-6;
        row_labels.push((comparison.plus.0.clone(), comparison.minus.0.clone()));
    }

    // Every unknown must be touched by at least one comparison; a standard
    // that only appears in its identity row is as unmeasured as a client.
    for (column, unknown) in unknowns.iter().enumerate() {
        let connected = (0..comparisons.len()).any(|row| design[[row, column]] != 0.0);
        if !connected {
            return Err(Error::SingularSystem(format!(
                "mass {} never appears in any comparison",
                unknown.id
            )));
        }
    }

    // Direct observations of the standards' calibrated values.
    if let MassSet::Standard { weights, .. } = standard {
        for (offset, weight) in weights.iter().enumerate() {
            let row = comparisons.len() + offset;
            design[[row, standard_offset + offset]] = 1.0;
            observations[row] = weight.mass_g;
            uncertainties_g[row] = weight.uncertainty_ug * 1e-6;
            row_labels.push((weight.id.clone(), "calibrated value".to_owned()));
        }
    }

    // Hadamard expansion of the uncertainties, masked by the correlation
    // matrix. Entries with zero correlation are set to exactly zero rather
    // than trusting a float product to cancel.
    let mut correlation: Array2<f64> = Array2::eye(rows);
    if let MassSet::Standard {
        correlations: Some(correlations),
        ..
    } = standard
    {
        for ii in 0..standards {
            for jj in 0..standards {
                correlation[[comparisons.len() + ii, comparisons.len() + jj]] =
                    correlations[[ii, jj]];
            }
        }
    }
    let mut covariance = outer_product(&uncertainties_g, &uncertainties_g)?;
    for ((ii, jj), value) in covariance.indexed_iter_mut() {
        let mask = correlation[[ii, jj]];
        *value = if mask == 0.0 { 0.0 } else { *value * mask };
    }

    Ok(LeastSquaresProblem {
        design,
        observations,
        covariance,
        unknowns,
        row_labels,
        comparison_rows: comparisons.len(),
    })
}

impl LeastSquaresProblem {
    /// Solve for the masses: `b = Ψ_b Xᵗ Ψ_y⁻¹ y` with
    /// `Ψ_b = (Xᵗ Ψ_y⁻¹ X)⁻¹`, the best linear unbiased estimator under the
    /// supplied covariance, then propagate the buoyancy and magnetic
    /// variance-inflation terms and summarize.
    ///
    /// # Errors
    /// Returns [`Error::SingularSystem`] if either covariance inversion
    /// fails; no placeholder values are produced.
    pub fn solve(&self, config: &SolverConfig) -> Result<MassSolution> {
        let rows = self.observations.len();
        let columns = self.unknowns.len();

        let psi_y_inverse = self.covariance.inv().map_err(|_| {
            Error::SingularSystem("observation covariance is not invertible".into())
        })?;

        let psi_b_inverse = self.design.t().dot(&psi_y_inverse).dot(&self.design);
        let psi_b = psi_b_inverse.inv().map_err(|_| {
            Error::SingularSystem(
                "normal matrix is not invertible; comparisons do not connect the unknowns".into(),
            )
        })?;

        let values_g = psi_b
            .dot(&self.design.t())
            .dot(&psi_y_inverse)
            .dot(&self.observations);
        debug!("solved {columns} masses from {rows} observation rows");

        let residuals_g = &self.observations - &self.design.dot(&values_g);
        let residuals_ug = residuals_g.mapv(|r| r * 1e6);
        let sum_of_squared_residuals_ug2 = residuals_ug.dot(&residuals_ug);

        let mut warnings = vec![];
        for (row, residual_g) in residuals_g.iter().enumerate() {
            let uncertainty_g = self.covariance[[row, row]].sqrt();
            if residual_g.abs() > 2.0 * uncertainty_g {
                let (plus, minus) = &self.row_labels[row];
                warn!("residual for {plus} - {minus} exceeds twice its uncertainty");
                warnings.push(QualityWarning::ResidualOverThreshold {
                    plus: plus.clone(),
                    minus: minus.clone(),
                    residual_ug: residual_g * 1e6,
                    uncertainty_ug: uncertainty_g * 1e6,
                });
            }
        }

        // Variance inflation: omitted buoyancy correction scales with each
        // solved client/check mass (ppm applied once); magnetic terms are
        // per-client where supplied.
        let rel_unc = config.rel_unc_no_buoyancy_ppm * 1e-6;
        let mut total_variances_g2 = psi_b.diag().to_owned();
        for (index, unknown) in self.unknowns.iter().enumerate() {
            if unknown.class != SetClass::Standard {
                total_variances_g2[index] += (rel_unc * values_g[index]).powi(2);
            }
            if let Some(magnetic_ug) = unknown.magnetic_uncertainty_ug {
                total_variances_g2[index] += (magnetic_ug * 1e-6).powi(2);
            }
        }

        let summary = self
            .unknowns
            .iter()
            .enumerate()
            .map(|(index, unknown)| {
                let uncertainty_ug = total_variances_g2[index].sqrt() * 1e6;
                let shift_ug = unknown
                    .reference
                    .map(|(mass_g, _)| (values_g[index] - mass_g) * 1e6);
                SummaryRow {
                    nominal: nominal_label(unknown.nominal_g),
                    weight_id: unknown.id.clone(),
                    set: unknown.class,
                    mass_value_g: values_g[index],
                    uncertainty_ug,
                    ci95_ug: config.coverage_factor * uncertainty_ug,
                    coverage_factor: config.coverage_factor,
                    reference_value_g: unknown.reference.map(|(mass_g, _)| mass_g),
                    shift_ug,
                }
            })
            .collect();

        let diagnostics = SolverDiagnostics {
            observations: rows,
            unknowns: columns,
            degrees_of_freedom: rows - columns,
            rel_unc_no_buoyancy_ppm: config.rel_unc_no_buoyancy_ppm,
            sum_of_squared_residuals_ug2,
            warnings,
        };

        Ok(MassSolution {
            values_g,
            covariance_g2: psi_b,
            residuals_ug,
            diagnostics,
            summary,
        })
    }

    /// Number of comparison rows (identity rows excluded).
    #[must_use]
    pub const fn comparison_rows(&self) -> usize {
        self.comparison_rows
    }
}

/// Convenience wrapper: build the problem and solve it.
///
/// # Errors
/// Propagates every failure from [`build_problem`] and
/// [`LeastSquaresProblem::solve`].
pub fn solve(
    comparisons: &[CollatedObservation],
    client: &MassSet,
    check: &MassSet,
    standard: &MassSet,
    config: &SolverConfig,
) -> Result<MassSolution> {
    build_problem(comparisons, client, check, standard)?.solve(config)
}
