//! Channel filtering
//!
//! Each configured channel owns one `FilterBlock`: a predicate, an
//! auto-complete policy and the set of stocks the channel accepted before.
//! `FilterBlocksHandler` runs every block against an alert and aggregates the
//! accepting verdicts into an `IngestSelection`.

pub mod block;
pub mod handler;
pub mod predicate;

use crate::error::FilterError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub use block::{BlockState, FilterBlock};
pub use handler::FilterBlocksHandler;
pub use predicate::{FilterOutcome, Predicate, PredicateRegistry};

/// What a channel does with a rejection of a stock it accepted before
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoComplete {
    Off,
    /// Predicate still runs; its rejection is overruled
    #[default]
    Overrule,
    /// Predicate is skipped entirely
    Bypass,
}

#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub channel: String,
    pub outcome: FilterOutcome,
    pub auto_completed: bool,
    /// The predicate's own rejection when auto-complete forced an accept
    pub overruled: Option<FilterOutcome>,
    /// First acceptance of a stock that already has earlier detections
    pub retro_complete: bool,
    /// Predicate failure; the outcome then counts as a rejection
    pub error: Option<FilterError>,
}

impl FilterVerdict {
    pub fn new(channel: impl Into<String>, outcome: FilterOutcome) -> Self {
        Self {
            channel: channel.into(),
            outcome,
            auto_completed: false,
            overruled: None,
            retro_complete: false,
            error: None,
        }
    }

    pub fn is_accept(&self) -> bool {
        self.outcome.is_accept()
    }

    /// Rejection code of the predicate, also when it was overruled
    pub fn predicate_rejection_code(&self) -> Option<u8> {
        match self.overruled {
            Some(FilterOutcome::Reject { code }) => code,
            _ => self.rejection_code(),
        }
    }

    pub fn rejection_code(&self) -> Option<u8> {
        match self.outcome {
            FilterOutcome::Reject { code } => code,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Groups(BTreeSet<u32>),
}

impl Selection {
    /// Whether a directive restricted to `groups` (empty = every group) applies
    pub fn admits(&self, groups: &BTreeSet<u32>) -> bool {
        match self {
            Selection::All => true,
            Selection::Groups(selected) => {
                groups.is_empty() || !groups.is_disjoint(selected)
            }
        }
    }
}

/// Accepting channels of one alert, in configured channel order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSelection {
    entries: Vec<(String, Selection)>,
    retro: BTreeSet<String>,
}

impl IngestSelection {
    /// Requests the stock's earlier states for an accepting channel
    pub fn mark_retro(&mut self, channel: &str) {
        if self.get(channel).is_some() {
            self.retro.insert(channel.to_string());
        }
    }

    pub fn is_retro(&self, channel: &str) -> bool {
        self.retro.contains(channel)
    }

    pub fn insert(&mut self, channel: &str, selection: Selection) {
        match self.entries.iter_mut().find(|(c, _)| c == channel) {
            Some((_, existing)) => {
                let merged = match (&*existing, selection) {
                    (Selection::All, _) | (_, Selection::All) => Selection::All,
                    (Selection::Groups(a), Selection::Groups(b)) => {
                        Selection::Groups(a.union(&b).copied().collect())
                    }
                };
                *existing = merged;
            }
            None => self.entries.push((channel.to_string(), selection)),
        }
    }

    pub fn get(&self, channel: &str) -> Option<&Selection> {
        self.entries
            .iter()
            .find(|(c, _)| c == channel)
            .map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Selection)> {
        self.entries.iter().map(|(c, s)| (c.as_str(), s))
    }

    pub fn channels(&self) -> BTreeSet<String> {
        self.entries.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_union() {
        let mut selection = IngestSelection::default();
        selection.insert("A", Selection::Groups([1].into()));
        selection.insert("B", Selection::All);
        selection.insert("A", Selection::Groups([2].into()));

        assert_eq!(selection.len(), 2);
        assert_eq!(selection.get("A"), Some(&Selection::Groups([1, 2].into())));
        assert_eq!(
            selection.iter().map(|(c, _)| c).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
    }

    #[test]
    fn test_group_admission() {
        let groups = Selection::Groups([2].into());
        assert!(groups.admits(&BTreeSet::new()));
        assert!(groups.admits(&[1, 2].into()));
        assert!(!groups.admits(&[1].into()));
        assert!(Selection::All.admits(&[5].into()));
    }

    #[test]
    fn test_retro_needs_an_accepting_channel() {
        let mut selection = IngestSelection::default();
        selection.insert("A", Selection::All);
        selection.mark_retro("A");
        selection.mark_retro("B");

        assert!(selection.is_retro("A"));
        assert!(!selection.is_retro("B"));
    }

    #[test]
    fn test_overruled_code_survives_forced_accept() {
        let mut verdict = FilterVerdict::new("A", FilterOutcome::AcceptAll);
        assert_eq!(verdict.predicate_rejection_code(), None);

        verdict.overruled = Some(FilterOutcome::Reject { code: Some(4) });
        assert_eq!(verdict.predicate_rejection_code(), Some(4));
        assert_eq!(verdict.rejection_code(), None);
    }
}
