use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A weight-group label as it appears in a scheme entry.
///
/// A group may be composite, joining several physical weight IDs with `+`
/// (e.g. `"500+500MA"` is one load made of two weights).
#[derive(Clone, Hash, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct GroupLabel(pub String);

impl GroupLabel {
    /// The physical weight IDs making up this group.
    pub fn weight_ids(&self) -> impl Iterator<Item = &str> {
        self.0.split('+').map(str::trim).filter(|id| !id.is_empty())
    }
}

impl std::fmt::Display for GroupLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for GroupLabel {
    fn from(label: &str) -> Self {
        Self(label.to_owned())
    }
}

/// Number of cycles a circular weighing runs for a given group count.
///
/// Fixed protocol constants: fewer groups per cycle are compensated by more
/// cycles so every weighing carries comparable statistical weight.
#[must_use]
pub const fn required_cycles(groups: usize) -> Option<usize> {
    match groups {
        1 => Some(10),
        2 => Some(5),
        3 => Some(4),
        4..=7 => Some(3),
        _ => None,
    }
}

/// The ordered list of weight groups loaded in one circular weighing.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SchemeEntry {
    groups: Vec<GroupLabel>,
}

impl SchemeEntry {
    /// Build a scheme entry from group labels.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the group count is outside the
    /// supported range 1..=7 or any label is empty.
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups: Vec<GroupLabel> = labels
            .into_iter()
            .map(|label| GroupLabel(label.into()))
            .collect();

        if required_cycles(groups.len()).is_none() {
            return Err(Error::Configuration(format!(
                "a scheme entry must name between 1 and 7 groups, got {}",
                groups.len()
            )));
        }
        if groups.iter().any(|g| g.weight_ids().count() == 0) {
            return Err(Error::Configuration(
                "scheme entry contains an empty group label".into(),
            ));
        }

        Ok(Self { groups })
    }

    #[must_use]
    pub fn groups(&self) -> &[GroupLabel] {
        &self.groups
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Cycles this entry's weighing must run for.
    #[must_use]
    pub fn cycles(&self) -> usize {
        // `new` rejected unsupported group counts
        required_cycles(self.groups.len()).unwrap_or(0)
    }

    /// Total readings in one complete weighing of this entry.
    #[must_use]
    pub fn readings(&self) -> usize {
        self.group_count() * self.cycles()
    }
}

#[cfg(test)]
mod tests {
    use super::{required_cycles, GroupLabel, SchemeEntry};

    #[test]
    fn cycle_counts_follow_the_protocol_table() {
        assert_eq!(required_cycles(1), Some(10));
        assert_eq!(required_cycles(2), Some(5));
        assert_eq!(required_cycles(3), Some(4));
        for groups in 4..=7 {
            assert_eq!(required_cycles(groups), Some(3));
        }
        assert_eq!(required_cycles(0), None);
        assert_eq!(required_cycles(8), None);
    }

    #[test]
    fn composite_groups_split_on_plus() {
        let label = GroupLabel("500+500MA+200".into());
        let ids: Vec<&str> = label.weight_ids().collect();
        assert_eq!(ids, vec!["500", "500MA", "200"]);
    }

    #[test]
    fn single_weight_groups_are_their_own_id() {
        let label = GroupLabel("1000MB".into());
        let ids: Vec<&str> = label.weight_ids().collect();
        assert_eq!(ids, vec!["1000MB"]);
    }

    #[test]
    fn oversized_scheme_entries_are_rejected() {
        let labels = (0..8).map(|ii| format!("w{ii}"));
        assert!(SchemeEntry::new(labels).is_err());
    }

    #[test]
    fn three_group_entries_run_four_cycles() {
        let entry = SchemeEntry::new(["1000", "1000MA", "1000MB"]).unwrap();
        assert_eq!(entry.cycles(), 4);
        assert_eq!(entry.readings(), 12);
    }
}
