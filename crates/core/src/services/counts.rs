//! Ballot choices and aggregate counts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tally_common::AppError;

/// One side of a yes/no vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    Yes,
    No,
}

impl Choice {
    /// Stored form of the choice.
    #[must_use]
    pub const fn as_bool(self) -> bool {
        matches!(self, Self::Yes)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl From<bool> for Choice {
    fn from(value: bool) -> Self {
        if value { Self::Yes } else { Self::No }
    }
}

impl FromStr for Choice {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            other => Err(AppError::Validation(format!("unknown choice: {other}"))),
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Yes/no totals of a room as of some fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub yes: u64,
    pub no: u64,
}

/// Share of each side in whole percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Percentages {
    pub yes: u8,
    pub no: u8,
}

impl AggregateCounts {
    #[must_use]
    pub const fn new(yes: u64, no: u64) -> Self {
        Self { yes, no }
    }

    /// Reduce a room's ballots to totals.
    pub fn from_choices<I>(choices: I) -> Self
    where
        I: IntoIterator<Item = Choice>,
    {
        choices.into_iter().fold(Self::default(), |mut counts, choice| {
            counts.record(choice);
            counts
        })
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.yes + self.no
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Count one more ballot for `choice`.
    pub const fn record(&mut self, choice: Choice) {
        match choice {
            Choice::Yes => self.yes += 1,
            Choice::No => self.no += 1,
        }
    }

    /// Take back one ballot for `choice`. Never goes below zero.
    pub const fn retract(&mut self, choice: Choice) {
        match choice {
            Choice::Yes => self.yes = self.yes.saturating_sub(1),
            Choice::No => self.no = self.no.saturating_sub(1),
        }
    }

    /// Combine two sets of totals.
    #[must_use]
    pub const fn plus(self, other: Self) -> Self {
        Self {
            yes: self.yes.saturating_add(other.yes),
            no: self.no.saturating_add(other.no),
        }
    }

    /// Rounded share of each side. An empty room is 0% / 0%.
    #[must_use]
    pub fn percentages(&self) -> Percentages {
        let total = self.total();
        if total == 0 {
            return Percentages::default();
        }
        let share = |n: u64| ((n as f64 / total as f64) * 100.0).round() as u8;
        Percentages {
            yes: share(self.yes),
            no: share(self.no),
        }
    }
}
