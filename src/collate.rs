use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::drift::WeighingAnalysis;
use crate::run::{BalanceConfig, WeighingMode};
use crate::scheme::GroupLabel;
use crate::{Error, Result};

/// A non-fatal quality problem recorded during collation or solving.
///
/// Warnings downgrade acceptance flags; they never abort a computation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityWarning {
    /// A run's cyclic differences did not sum to zero within tolerance;
    /// the readings are corrupted or mis-ordered and the run is dropped.
    CircularSumNonZero {
        run: usize,
        sum: f64,
        tolerance: f64,
    },
    /// A run passed only the looser allowed threshold of an automatic
    /// balance.
    StdevWithinAllowed { run: usize, stdev_ug: f64 },
    /// A solved residual exceeded twice its uncertainty.
    ResidualOverThreshold {
        plus: String,
        minus: String,
        residual_ug: f64,
        uncertainty_ug: f64,
    },
}

/// One comparison ready for the global solver: grams for the difference,
/// micrograms for the balance uncertainty.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CollatedObservation {
    pub plus: GroupLabel,
    pub minus: GroupLabel,
    pub difference_g: f64,
    pub uncertainty_ug: f64,
}

/// Result of collating every run for one scheme entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Collation {
    pub observations: Vec<CollatedObservation>,
    pub warnings: Vec<QualityWarning>,
    /// Runs that survived acceptance and the circular-sum check.
    pub used_runs: usize,
}

/// Tolerance for the circular-sum consistency check.
///
/// The cyclic differences sum to zero algebraically, so anything beyond
/// float rounding scaled to the difference magnitude means bad data.
fn circular_tolerance(analysis: &WeighingAnalysis) -> f64 {
    let scale = analysis
        .differences
        .iter()
        .fold(0.0f64, |acc, d| acc.max(d.value.abs()));
    f64::EPSILON.sqrt() * (1.0 + scale)
}

/// Collate the accepted runs of one scheme entry into global observations.
///
/// Manual balances pass every accepted run through; automatic balances skip
/// the first accepted run (settling) and average the rest per group pair,
/// reporting the cross-run sample standard deviation as the uncertainty.
///
/// # Errors
/// - [`Error::Configuration`] when the analyses do not all share one scheme
///   and balance.
/// - [`Error::Data`] when an automatic balance has fewer than two accepted
///   runs after the settling run.
pub fn collate(analyses: &[WeighingAnalysis], balance: &BalanceConfig) -> Result<Collation> {
    let mut warnings = vec![];

    if let Some(first) = analyses.first() {
        for analysis in analyses {
            if analysis.scheme != first.scheme || analysis.balance_id != balance.id {
                return Err(Error::Configuration(format!(
                    "collation mixes schemes or balances (run on {}, expected {})",
                    analysis.balance_id, balance.id
                )));
            }
        }
    }

    let mut usable: Vec<&WeighingAnalysis> = vec![];
    for (index, analysis) in analyses.iter().enumerate() {
        if analysis.excluded || !analysis.accepted {
            debug!("run {index} excluded or not accepted");
            continue;
        }
        if analysis.flagged {
            warnings.push(QualityWarning::StdevWithinAllowed {
                run: index,
                stdev_ug: analysis.standard_deviation_ug(),
            });
        }

        let sum: f64 = analysis.differences.iter().map(|d| d.value).sum();
        let tolerance = circular_tolerance(analysis);
        if sum.abs() > tolerance {
            warn!("run {index} circular sum {sum} exceeds tolerance {tolerance}");
            warnings.push(QualityWarning::CircularSumNonZero {
                run: index,
                sum,
                tolerance,
            });
            continue;
        }

        usable.push(analysis);
    }

    let observations = match balance.mode {
        WeighingMode::Manual => pass_through(&usable),
        WeighingMode::Automatic => averaged(&usable)?,
    };

    Ok(Collation {
        observations,
        warnings,
        used_runs: usable.len(),
    })
}

fn pass_through(runs: &[&WeighingAnalysis]) -> Vec<CollatedObservation> {
    runs.iter()
        .flat_map(|analysis| {
            analysis.differences.iter().map(|difference| {
                CollatedObservation {
                    plus: difference.plus.clone(),
                    minus: difference.minus.clone(),
                    difference_g: difference.value * analysis.unit.to_grams(),
                    uncertainty_ug: difference.standard_deviation
                        * analysis.unit.to_micrograms(),
                }
            })
        })
        .collect()
}

fn averaged(runs: &[&WeighingAnalysis]) -> Result<Vec<CollatedObservation>> {
    // The first accepted run settles the exchange mechanism and is dropped.
    let runs = runs.get(1..).unwrap_or_default();
    if runs.len() < 2 {
        return Err(Error::Data(format!(
            "automatic collation needs at least two accepted runs after the settling run, got {}",
            runs.len()
        )));
    }

    let values_per_pair = runs
        .iter()
        .flat_map(|analysis| {
            analysis
                .differences
                .iter()
                .enumerate()
                .map(|(pair, difference)| (pair, difference.value * analysis.unit.to_grams()))
        })
        .into_group_map();

    let template = runs[0];
    let count = runs.len() as f64;
    let mut observations = vec![];
    for (pair, difference) in template.differences.iter().enumerate() {
        let values = &values_per_pair[&pair];
        let mean: f64 = values.iter().sum::<f64>() / count;
        let sample_variance: f64 =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1.0);

        observations.push(CollatedObservation {
            plus: difference.plus.clone(),
            minus: difference.minus.clone(),
            difference_g: mean,
            uncertainty_ug: sample_variance.sqrt() * 1e6,
        });
    }
    Ok(observations)
}
