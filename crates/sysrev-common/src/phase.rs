//! The fixed, totally ordered set of workflow phases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ParseError;

/// A named stage of a review workflow.
///
/// Phases are compile-time constants. Their order is the order of the
/// variants, and it is the only order the orchestrator will advance in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Search,
    Screening,
    Extraction,
    Synthesis,
    Writing,
    Finalize,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Search,
        Phase::Screening,
        Phase::Extraction,
        Phase::Synthesis,
        Phase::Writing,
        Phase::Finalize,
    ];

    pub fn first() -> Self {
        Self::ALL[0]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Screening => "screening",
            Self::Extraction => "extraction",
            Self::Synthesis => "synthesis",
            Self::Writing => "writing",
            Self::Finalize => "finalize",
        }
    }

    /// Zero-based position in the phase order.
    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|p| p == self)
            .unwrap_or_default()
    }

    pub fn next(&self) -> Option<Self> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(&self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// All phases strictly before this one.
    pub fn predecessors(&self) -> &'static [Phase] {
        &Self::ALL[..self.index()]
    }

    /// Phases whose work is split into individually persisted items.
    pub fn is_item_phase(&self) -> bool {
        matches!(self, Self::Screening | Self::Extraction)
    }

    /// Name of the per-stage outcome table, for item phases only.
    pub fn outcome_table(&self) -> Option<&'static str> {
        match self {
            Self::Screening => Some("outcomes_screening"),
            Self::Extraction => Some("outcomes_extraction"),
            _ => None,
        }
    }

    /// The item phase that consumes this phase's accepted items.
    pub fn downstream_item_phase(&self) -> Option<Self> {
        match self {
            Self::Search => Some(Self::Screening),
            Self::Screening => Some(Self::Extraction),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ParseError::UnknownPhase(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_total() {
        for pair in Phase::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert_eq!(pair[1].previous(), Some(pair[0]));
        }
        assert_eq!(Phase::Finalize.next(), None);
        assert_eq!(Phase::Search.previous(), None);
    }

    #[test]
    fn test_predecessors() {
        assert!(Phase::Search.predecessors().is_empty());
        assert_eq!(
            Phase::Extraction.predecessors(),
            &[Phase::Search, Phase::Screening]
        );
    }

    #[test]
    fn test_parse_round_trip_and_unknown() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert_eq!(
            "meta_analysis".parse::<Phase>(),
            Err(ParseError::UnknownPhase("meta_analysis".to_string()))
        );
    }

    #[test]
    fn test_only_item_phases_have_outcome_tables() {
        for phase in Phase::ALL {
            assert_eq!(phase.is_item_phase(), phase.outcome_table().is_some());
        }
    }
}
