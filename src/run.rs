use std::fs;
use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::scheme::SchemeEntry;
use crate::{Error, Result};

/// Unit the balance reports readings in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum MassUnit {
    #[serde(rename = "g")]
    Gram,
    #[serde(rename = "mg")]
    Milligram,
    #[serde(rename = "ug")]
    Microgram,
}

impl MassUnit {
    #[must_use]
    pub const fn to_grams(self) -> f64 {
        match self {
            Self::Gram => 1.0,
            Self::Milligram => 1e-3,
            Self::Microgram => 1e-6,
        }
    }

    #[must_use]
    pub const fn to_micrograms(self) -> f64 {
        match self {
            Self::Gram => 1e6,
            Self::Milligram => 1e3,
            Self::Microgram => 1.0,
        }
    }
}

/// How a balance is loaded, which decides how the collator treats its runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WeighingMode {
    /// An operator loads each group by hand; every accepted run stands alone.
    Manual,
    /// A weight-exchange mechanism loads groups; runs are averaged and the
    /// first run is treated as settling.
    Automatic,
}

/// Per-balance identity and acceptance thresholds.
///
/// Loadable from TOML alongside the rest of the lab configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BalanceConfig {
    pub id: String,
    pub mode: WeighingMode,
    /// A run whose selected-order standard deviation (in µg) exceeds this is
    /// not accepted outright.
    pub max_stdev_ug: f64,
    /// Looser bound for automatic balances: a run between `max_stdev_ug` and
    /// this is accepted but flagged.
    pub allowed_stdev_ug: f64,
}

impl BalanceConfig {
    /// Read a balance configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file is missing or does not match the schema.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Metadata carried with one weighing run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RunMetadata {
    pub unit: MassUnit,
    /// Nominal mass of the loads, grams.
    pub nominal_g: f64,
    pub balance: BalanceConfig,
}

/// Raw data of one circular weighing: `cycles × groups` balance readings
/// with, when the balance records them, elapsed times in minutes.
///
/// Immutable once constructed; the analyzer never mutates a run.
#[derive(Clone, Debug)]
pub struct WeighingRun {
    scheme: SchemeEntry,
    readings: Array2<f64>,
    times: Option<Array2<f64>>,
    metadata: RunMetadata,
}

impl WeighingRun {
    /// Build a run from separate reading and time matrices, both
    /// `cycles × groups` in cycle order.
    ///
    /// # Errors
    /// Returns [`Error::Data`] when the matrix shapes do not match the
    /// scheme's required `cycles × groups`.
    pub fn new(
        scheme: SchemeEntry,
        readings: Array2<f64>,
        times: Option<Array2<f64>>,
        metadata: RunMetadata,
    ) -> Result<Self> {
        let expected = (scheme.cycles(), scheme.group_count());
        if readings.dim() != expected {
            return Err(Error::Data(format!(
                "readings have shape {:?}, scheme requires {expected:?}",
                readings.dim()
            )));
        }
        if let Some(times) = &times {
            if times.dim() != expected {
                return Err(Error::Data(format!(
                    "times have shape {:?}, scheme requires {expected:?}",
                    times.dim()
                )));
            }
        }
        Ok(Self {
            scheme,
            readings,
            times,
            metadata,
        })
    }

    /// Build a run from the balance's native `cycles × groups × 2` array of
    /// (elapsed-time, reading) pairs.
    ///
    /// # Errors
    /// Returns [`Error::Data`] when the array shape does not match the
    /// scheme.
    pub fn from_pairs(
        scheme: SchemeEntry,
        data: &Array3<f64>,
        metadata: RunMetadata,
    ) -> Result<Self> {
        if data.dim().2 != 2 {
            return Err(Error::Data(format!(
                "expected (time, reading) pairs on the last axis, got {}",
                data.dim().2
            )));
        }
        let times = data.index_axis(Axis(2), 0).to_owned();
        let readings = data.index_axis(Axis(2), 1).to_owned();
        Self::new(scheme, readings, Some(times), metadata)
    }

    /// Read a run from a CSV file of `time,reading` rows in cycle order
    /// (all groups of cycle 0, then cycle 1, ...).
    ///
    /// # Errors
    /// Returns an error on IO or parse failure, or when the row count does
    /// not equal the scheme's `cycles × groups`.
    pub fn from_csv(scheme: SchemeEntry, path: &Path, metadata: RunMetadata) -> Result<Self> {
        #[derive(Deserialize)]
        struct Row(f64, f64);

        let file = fs::read(path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(&file[..]);

        let mut times = vec![];
        let mut readings = vec![];
        for result in rdr.deserialize() {
            let row: Row = result?;
            times.push(row.0);
            readings.push(row.1);
        }

        let (cycles, groups) = (scheme.cycles(), scheme.group_count());
        if readings.len() != cycles * groups {
            return Err(Error::Data(format!(
                "{} rows in {path:?}, scheme requires {}",
                readings.len(),
                cycles * groups
            )));
        }
        let times = Array2::from_shape_vec((cycles, groups), times)?;
        let readings = Array2::from_shape_vec((cycles, groups), readings)?;
        Self::new(scheme, readings, Some(times), metadata)
    }

    #[must_use]
    pub fn scheme(&self) -> &SchemeEntry {
        &self.scheme
    }

    #[must_use]
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Readings flattened to measurement order (cycle-major).
    #[must_use]
    pub fn readings_flat(&self) -> Vec<f64> {
        self.readings.iter().copied().collect()
    }

    /// Elapsed times flattened to measurement order, if recorded.
    #[must_use]
    pub fn times_flat(&self) -> Option<Vec<f64>> {
        self.times
            .as_ref()
            .map(|times| times.iter().copied().collect())
    }
}
