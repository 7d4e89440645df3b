use std::collections::BTreeMap;

use log::debug;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::fit::{ols, FitResult};
use crate::math::time_powers;
use crate::run::{MassUnit, WeighingMode, WeighingRun};
use crate::scheme::{GroupLabel, SchemeEntry};
use crate::{Error, Result};

/// Degree of the polynomial-in-time model for balance zero drift.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum DriftOrder {
    #[serde(rename = "no drift")]
    None,
    #[serde(rename = "linear drift")]
    Linear,
    #[serde(rename = "quadratic drift")]
    Quadratic,
    #[serde(rename = "cubic drift")]
    Cubic,
}

impl DriftOrder {
    pub const ALL: [Self; 4] = [Self::None, Self::Linear, Self::Quadratic, Self::Cubic];

    /// Number of polynomial time terms this order adds to a design matrix.
    #[must_use]
    pub const fn terms(self) -> usize {
        match self {
            Self::None => 0,
            Self::Linear => 1,
            Self::Quadratic => 2,
            Self::Cubic => 3,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "no drift",
            Self::Linear => "linear drift",
            Self::Quadratic => "quadratic drift",
            Self::Cubic => "cubic drift",
        }
    }
}

impl std::fmt::Display for DriftOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the drift polynomial is expressed per minute of elapsed time or
/// per reading index (the fallback when the balance recorded no usable
/// times).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBasis {
    Minutes,
    Readings,
}

/// The fit of one drift order to one weighing run.
#[derive(Clone, Debug)]
pub struct DriftFit {
    order: DriftOrder,
    fit: FitResult<f64>,
}

impl DriftFit {
    #[must_use]
    pub const fn order(&self) -> DriftOrder {
        self.order
    }

    #[must_use]
    pub const fn fit(&self) -> &FitResult<f64> {
        &self.fit
    }
}

/// One fitted drift-polynomial coefficient with its display form.
///
/// The display convention is fixed: value to 5 significant figures, standard
/// deviation to 3, as `"<value> (<stdev>)"`. Downstream reports rely on it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DriftCoefficient {
    /// Power of time this coefficient multiplies (1 = linear, ...).
    pub power: usize,
    pub value: f64,
    pub standard_deviation: f64,
    pub display: String,
}

/// A group-to-group mass difference extracted from a drift fit.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MassDifference {
    pub plus: GroupLabel,
    pub minus: GroupLabel,
    /// Difference in the run's raw unit.
    pub value: f64,
    pub standard_deviation: f64,
}

/// Completed analysis of one circular weighing run.
///
/// This is the record handed to the collator and persisted to disk; it
/// carries everything downstream consumers read and nothing they mutate.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WeighingAnalysis {
    pub unit: MassUnit,
    pub nominal_g: f64,
    pub balance_id: String,
    pub time_basis: TimeBasis,
    pub selected_order: DriftOrder,
    /// Selected-order standard deviation fell below the balance maximum
    /// (or, on an automatic balance, the looser allowed threshold).
    pub accepted: bool,
    /// Accepted only through the looser allowed threshold.
    pub flagged: bool,
    /// Operator exclusion; never set by the engine.
    pub excluded: bool,
    pub scheme: SchemeEntry,
    /// Residual standard deviation of every fitted order, keyed by order
    /// name, in the run's raw unit.
    pub standard_deviations: BTreeMap<String, f64>,
    /// Selected-order drift coefficients (empty when `no drift` is selected).
    pub drift_coefficients: Vec<DriftCoefficient>,
    pub differences: Vec<MassDifference>,
}

impl WeighingAnalysis {
    /// Selected-order standard deviation converted to micrograms.
    #[must_use]
    pub fn standard_deviation_ug(&self) -> f64 {
        self.standard_deviations
            .get(self.selected_order.name())
            .copied()
            .unwrap_or(f64::NAN)
            * self.unit.to_micrograms()
    }
}

/// Build the drift design matrix for `groups` weight groups read at `times`.
///
/// Shape is `(times.len(), groups + order.terms())`: the first `groups`
/// columns are the cycle-repeated group indicator, the rest hold
/// `time^1..time^h`.
///
/// # Errors
/// Returns an error if the reading count is not a whole number of cycles.
pub fn design_matrix(groups: usize, times: &[f64], order: DriftOrder) -> Result<Array2<f64>> {
    let readings = times.len();
    if groups == 0 || readings % groups != 0 {
        return Err(Error::Data(format!(
            "{readings} readings do not divide into cycles of {groups} groups"
        )));
    }

    let mut design = Array2::zeros((readings, groups + order.terms()));
    for reading in 0..readings {
        design[[reading, reading % groups]] = 1.0;
    }
    if order.terms() > 0 {
        design
            .slice_mut(ndarray::s![.., groups..])
            .assign(&time_powers(times, order.terms())?);
    }
    Ok(design)
}

/// Reading times in measurement order, falling back to the reading index
/// when the run recorded fewer times than readings.
fn reading_times(run: &WeighingRun) -> (Vec<f64>, TimeBasis) {
    let readings = run.scheme().readings();
    match run.times_flat() {
        Some(times) if times.len() >= readings => (times, TimeBasis::Minutes),
        _ => ((0..readings).map(|r| r as f64).collect(), TimeBasis::Readings),
    }
}

/// Fit a single drift order to a run.
///
/// # Errors
/// Propagates [`Error::Data`] / [`Error::SingularSystem`] from the
/// underlying least-squares fit.
pub fn fit_order(run: &WeighingRun, order: DriftOrder) -> Result<DriftFit> {
    let (times, _) = reading_times(run);
    let design = design_matrix(run.scheme().group_count(), &times, order)?;
    let observations = Array1::from(run.readings_flat());
    let fit = ols(&design, &observations)?;
    Ok(DriftFit { order, fit })
}

/// Fit all four drift orders to a run.
///
/// # Errors
/// Fails if any order cannot be fitted; a run too short for the cubic model
/// is malformed under the fixed cycle policy, so nothing is salvaged.
pub fn fit_all_orders(run: &WeighingRun) -> Result<Vec<DriftFit>> {
    DriftOrder::ALL
        .into_iter()
        .map(|order| fit_order(run, order))
        .collect()
}

/// Pick the drift order with the lowest residual standard deviation.
///
/// Orders are compared with an absolute tolerance scaled to the reading
/// magnitude, so fits that agree to within numerical noise resolve to the
/// lowest order: a higher order must *meaningfully* reduce the residual to
/// be selected.
#[must_use]
pub fn determine_drift<'a>(fits: &'a [DriftFit], readings: &[f64]) -> &'a DriftFit {
    let scale = readings.iter().fold(0.0f64, |acc, r| acc.max(r.abs()));
    let tolerance = 1e-9 * (1.0 + scale);

    let mut selected = &fits[0];
    for candidate in &fits[1..] {
        if candidate.fit.standard_deviation() < selected.fit.standard_deviation() - tolerance {
            selected = candidate;
        }
    }
    selected
}

/// Format `value` to `figures` significant figures in plain decimal notation.
fn to_sig_figs(value: f64, figures: i32) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value}");
    }
    #[allow(clippy::cast_possible_truncation)]
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = usize::try_from((figures - 1 - magnitude).max(0)).unwrap_or(0);
    format!("{value:.decimals$}")
}

/// Extract the drift-polynomial coefficients of a fit, with the fixed
/// `"<value> (<stdev>)"` display convention (5 / 3 significant figures).
///
/// Returns an empty list for the `no drift` order.
#[must_use]
pub fn drift_coefficients(drift_fit: &DriftFit, groups: usize) -> Vec<DriftCoefficient> {
    let covariance = drift_fit.fit.covariance();
    (0..drift_fit.order.terms())
        .map(|term| {
            let index = groups + term;
            let value = drift_fit.fit.coefficients()[index];
            let standard_deviation = covariance[[index, index]].sqrt();
            DriftCoefficient {
                power: term + 1,
                value,
                standard_deviation,
                display: format!(
                    "{} ({})",
                    to_sig_figs(value, 5),
                    to_sig_figs(standard_deviation, 3)
                ),
            }
        })
        .collect()
}

/// The cyclic selector matrix: `+1` at `(i, i)`, `−1` at `(i, (i+1) mod q)`.
///
/// Its rows sum (telescope) to the zero vector, so the differences it
/// extracts sum to exactly zero for any coefficient vector.
fn selector_matrix(groups: usize, columns: usize) -> Array2<f64> {
    let mut selector = Array2::zeros((groups, columns));
    for row in 0..groups {
        selector[[row, row]] += 1.0;
        selector[[row, (row + 1) % groups]] -= 1.0;
    }
    selector
}

/// Extract consecutive group-pair mass differences from a drift fit.
#[must_use]
pub fn item_differences(drift_fit: &DriftFit, scheme: &SchemeEntry) -> Vec<MassDifference> {
    let groups = scheme.group_count();
    let selector = selector_matrix(groups, groups + drift_fit.order.terms());

    let values = selector.dot(drift_fit.fit.coefficients());
    let covariance = selector.dot(drift_fit.fit.covariance()).dot(&selector.t());
    let standard_deviations = covariance.diag().mapv(f64::sqrt);

    (0..groups)
        .map(|row| MassDifference {
            plus: scheme.groups()[row].clone(),
            minus: scheme.groups()[(row + 1) % groups].clone(),
            value: values[row],
            standard_deviation: standard_deviations[row],
        })
        .collect()
}

/// Analyse one weighing run end to end: fit all four drift orders, select
/// one, extract coefficients and differences, and apply the balance's
/// acceptance thresholds.
///
/// # Errors
/// Fails on malformed runs or a singular fit; no partial record is produced.
pub fn analyse(run: &WeighingRun) -> Result<WeighingAnalysis> {
    let readings = run.readings_flat();
    let (_, time_basis) = reading_times(run);

    let fits = fit_all_orders(run)?;
    let selected = determine_drift(&fits, &readings);
    debug!(
        "selected {} for {} readings on {}",
        selected.order(),
        readings.len(),
        run.metadata().balance.id
    );

    let standard_deviations: BTreeMap<String, f64> = fits
        .iter()
        .map(|f| (f.order.name().to_owned(), f.fit.standard_deviation()))
        .collect();

    let metadata = run.metadata();
    let stdev_ug = selected.fit.standard_deviation() * metadata.unit.to_micrograms();
    let within_maximum = stdev_ug <= metadata.balance.max_stdev_ug;
    let within_allowed = metadata.balance.mode == WeighingMode::Automatic
        && stdev_ug <= metadata.balance.allowed_stdev_ug;

    Ok(WeighingAnalysis {
        scheme: run.scheme().clone(),
        unit: metadata.unit,
        nominal_g: metadata.nominal_g,
        balance_id: metadata.balance.id.clone(),
        time_basis,
        selected_order: selected.order,
        standard_deviations,
        drift_coefficients: drift_coefficients(selected, run.scheme().group_count()),
        differences: item_differences(selected, run.scheme()),
        accepted: within_maximum || within_allowed,
        flagged: !within_maximum && within_allowed,
        excluded: false,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{Array2, Axis};
    use proptest::prelude::*;

    use crate::run::tests::test_metadata;
    use crate::run::WeighingRun;
    use crate::scheme::SchemeEntry;

    use super::{
        analyse, design_matrix, determine_drift, drift_coefficients, fit_all_orders,
        item_differences, to_sig_figs, DriftOrder, TimeBasis,
    };

    fn scheme(groups: usize) -> SchemeEntry {
        SchemeEntry::new((0..groups).map(|ii| format!("w{ii}"))).unwrap()
    }

    /// A run whose readings are group offsets plus a polynomial drift in the
    /// reading index, with no noise.
    fn synthetic_run(groups: usize, offsets: &[f64], drift: impl Fn(f64) -> f64) -> WeighingRun {
        let entry = scheme(groups);
        let cycles = entry.cycles();
        let readings = Array2::from_shape_fn((cycles, groups), |(cycle, group)| {
            let t = (cycle * groups + group) as f64;
            offsets[group] + drift(t)
        });
        let times = Array2::from_shape_fn((cycles, groups), |(cycle, group)| {
            (cycle * groups + group) as f64
        });
        WeighingRun::new(entry, readings, Some(times), test_metadata()).unwrap()
    }

    #[test]
    fn design_matrices_have_identity_group_blocks() {
        for groups in 1..=7 {
            let entry = scheme(groups);
            let times: Vec<f64> = (0..entry.readings()).map(|r| r as f64).collect();
            for order in DriftOrder::ALL {
                let design = design_matrix(groups, &times, order).unwrap();
                assert_eq!(design.dim(), (entry.readings(), groups + order.terms()));

                for (cycle, block) in design
                    .slice(ndarray::s![.., ..groups])
                    .axis_chunks_iter(Axis(0), groups)
                    .enumerate()
                {
                    assert_eq!(block, Array2::eye(groups), "cycle {cycle}");
                }
            }
        }
    }

    #[test]
    fn time_columns_hold_powers_of_the_reading_time() {
        let times: Vec<f64> = (0..12).map(|r| 0.5 * r as f64).collect();
        let design = design_matrix(3, &times, DriftOrder::Cubic).unwrap();
        for (row, time) in times.iter().enumerate() {
            approx::assert_relative_eq!(design[[row, 3]], time);
            approx::assert_relative_eq!(design[[row, 4]], time * time);
            approx::assert_relative_eq!(design[[row, 5]], time * time * time);
        }
    }

    #[test]
    fn pure_linear_drift_selects_the_linear_order() {
        let run = synthetic_run(3, &[100.0, 250.0, 375.0], |t| 2.5 * t);
        let analysis = analyse(&run).unwrap();
        assert_eq!(analysis.selected_order, DriftOrder::Linear);
        assert_eq!(analysis.selected_order.name(), "linear drift");
    }

    #[test]
    fn noisy_data_never_panics_the_selection() {
        // Deterministic pseudo-noise; only checks the pipeline completes
        let run = synthetic_run(4, &[0.0, 10.0, 20.0, 30.0], |t| (t * 17.0).sin() * 3.0);
        let analysis = analyse(&run).unwrap();
        assert_eq!(analysis.differences.len(), 4);
    }

    #[test]
    fn linear_coefficient_is_recovered_with_display_form() {
        let run = synthetic_run(3, &[100.0, 250.0, 375.0], |t| 2.5 * t);
        let fits = fit_all_orders(&run).unwrap();
        let linear = &fits[1];
        let coefficients = drift_coefficients(linear, 3);
        assert_eq!(coefficients.len(), 1);
        assert_eq!(coefficients[0].power, 1);
        approx::assert_relative_eq!(coefficients[0].value, 2.5, max_relative = 1e-9);
        assert!(coefficients[0].display.starts_with("2.5000 ("));
    }

    #[test]
    fn differences_recover_group_offsets_without_noise() {
        let offsets = [1000.0, 277.92, -2059.78];
        let run = synthetic_run(3, &offsets, |t| 1.25 * t);
        let fits = fit_all_orders(&run).unwrap();
        let differences = item_differences(&fits[1], run.scheme());

        approx::assert_relative_eq!(
            differences[0].value,
            offsets[0] - offsets[1],
            max_relative = 1e-9
        );
        approx::assert_relative_eq!(
            differences[1].value,
            offsets[1] - offsets[2],
            max_relative = 1e-9
        );
        approx::assert_relative_eq!(
            differences[2].value,
            offsets[2] - offsets[0],
            max_relative = 1e-9
        );
    }

    #[test]
    fn missing_times_fall_back_to_reading_indices() {
        let entry = scheme(2);
        let readings = Array2::from_shape_fn((5, 2), |(cycle, group)| {
            (cycle * 2 + group) as f64 * 0.1 + 50.0 * group as f64
        });
        let run = WeighingRun::new(entry, readings, None, test_metadata()).unwrap();
        let analysis = analyse(&run).unwrap();
        assert_eq!(analysis.time_basis, TimeBasis::Readings);
    }

    #[test]
    fn sig_fig_formatting_matches_the_display_convention() {
        assert_eq!(to_sig_figs(-722.0815, 5), "-722.08");
        assert_eq!(to_sig_figs(0.343_21, 3), "0.343");
        assert_eq!(to_sig_figs(3983.81, 5), "3983.8");
        assert_eq!(to_sig_figs(12345.6, 3), "12346");
    }

    proptest! {
        /// The selector rows telescope to zero, so extracted differences sum
        /// to zero for any data, any drift order.
        #[test]
        fn differences_sum_to_zero_for_any_readings(
            values in proptest::collection::vec(-1.0e3..1.0e3f64, 12),
        ) {
            let entry = scheme(3);
            let readings = Array2::from_shape_vec((4, 3), values).unwrap();
            let run = WeighingRun::new(entry, readings, None, test_metadata()).unwrap();

            for drift_fit in fit_all_orders(&run).unwrap() {
                let differences = item_differences(&drift_fit, run.scheme());
                let sum: f64 = differences.iter().map(|d| d.value).sum();
                prop_assert!(sum.abs() < 1e-9, "order {:?}: sum {sum}", drift_fit.order());
            }
        }
    }

    #[test]
    fn selection_prefers_the_lowest_order_on_ties() {
        // Zero-noise linear data fits orders 1..3 equally well; the lowest
        // must win.
        let run = synthetic_run(4, &[0.0, 5.0, 10.0, 15.0], |t| 0.5 * t);
        let fits = fit_all_orders(&run).unwrap();
        let selected = determine_drift(&fits, &run.readings_flat());
        assert_eq!(selected.order(), DriftOrder::Linear);
    }
}
