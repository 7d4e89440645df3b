use std::fs;
use std::path::Path;

use log::info;

use crate::drift::WeighingAnalysis;
use crate::Result;

/// Write a completed analysis record to a TOML file.
///
/// The record is schema-checked on the way back in by serde; nothing is
/// round-tripped through printable literals.
///
/// # Errors
/// Returns an error on serialization or IO failure.
pub fn save_analysis(path: &Path, analysis: &WeighingAnalysis) -> Result<()> {
    let text = toml::to_string(analysis)?;
    fs::write(path, text)?;
    info!("saved analysis for {} to {path:?}", analysis.balance_id);
    Ok(())
}

/// Read an analysis record back from a TOML file.
///
/// # Errors
/// Returns an error on IO failure or when the file does not match the
/// record schema.
pub fn load_analysis(path: &Path) -> Result<WeighingAnalysis> {
    let text = fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}
