//! Buyout-rate calculation.
//!
//! Two formulas exist for the same metric. Exactly one is active per
//! deployment, selected through [`BuyoutFormula`]:
//!
//! * [`BuyoutFormula::ReturnAware`] (default): returns negate completions and
//!   the result is capped at 100.
//! * [`BuyoutFormula::Ratio`]: completions divided by cancellations (returns
//!   counted as cancellations), uncapped.
//!
//! Both round up: any non-zero remainder raises the reported percentage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuyoutFormula {
    #[default]
    ReturnAware,
    Ratio,
}

impl BuyoutFormula {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReturnAware => "return-aware",
            Self::Ratio => "ratio",
        }
    }
}

impl fmt::Display for BuyoutFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuyoutFormula {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "return-aware" | "return_aware" | "three-bucket" => Ok(Self::ReturnAware),
            "ratio" | "two-bucket" => Ok(Self::Ratio),
            other => Err(format!("unknown buyout formula `{other}` (expected return-aware or ratio)")),
        }
    }
}

/// Bucket counts collected from one customer's order history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderTally {
    pub completed: u32,
    pub canceled: u32,
    pub returned: u32,
    /// Every order seen, including ones with irrelevant statuses.
    pub total_fetched: u32,
}

impl OrderTally {
    pub fn record(&mut self, status: &OrderStatus) {
        self.total_fetched = self.total_fetched.saturating_add(1);
        match status {
            OrderStatus::Completed => self.completed = self.completed.saturating_add(1),
            OrderStatus::CancelOther => self.canceled = self.canceled.saturating_add(1),
            OrderStatus::ReturnToSender => self.returned = self.returned.saturating_add(1),
            OrderStatus::Other(_) => {}
        }
    }

    pub fn relevant(&self) -> u32 {
        self.completed
            .saturating_add(self.canceled)
            .saturating_add(self.returned)
    }

    pub fn has_relevant_history(&self) -> bool {
        self.relevant() > 0
    }

    pub fn metric(&self, formula: BuyoutFormula) -> BuyoutMetric {
        BuyoutMetric {
            completed: self.completed,
            canceled: self.canceled,
            returned: self.returned,
            percent: compute_percent(formula, self.completed, self.canceled, self.returned),
        }
    }
}

impl<'a> FromIterator<&'a OrderStatus> for OrderTally {
    fn from_iter<I: IntoIterator<Item = &'a OrderStatus>>(iter: I) -> Self {
        let mut tally = Self::default();
        for status in iter {
            tally.record(status);
        }
        tally
    }
}

/// Derived metric; discarded after the write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyoutMetric {
    pub completed: u32,
    pub canceled: u32,
    pub returned: u32,
    pub percent: u32,
}

pub fn compute_percent(formula: BuyoutFormula, completed: u32, canceled: u32, returned: u32) -> u32 {
    match formula {
        BuyoutFormula::ReturnAware => return_aware_percent(completed, canceled, returned),
        BuyoutFormula::Ratio => ratio_percent(completed, canceled.saturating_add(returned)),
    }
}

/// `ceil(completed / canceled * 100)`; 100 with no cancellations, 0 with no
/// history. Not capped.
pub fn ratio_percent(completed: u32, canceled: u32) -> u32 {
    if canceled > 0 {
        let percent = ceil_div(u64::from(completed) * 100, u64::from(canceled));
        u32::try_from(percent).unwrap_or(u32::MAX)
    } else if completed > 0 {
        100
    } else {
        0
    }
}

/// `min(100, ceil(max(0, completed - returned) / relevant * 100))`.
pub fn return_aware_percent(completed: u32, canceled: u32, returned: u32) -> u32 {
    let relevant = u64::from(completed) + u64::from(canceled) + u64::from(returned);
    if relevant == 0 {
        return 0;
    }
    let purchased = u64::from(completed.saturating_sub(returned));
    // purchased <= relevant, so the quotient never exceeds 100
    ceil_div(purchased * 100, relevant).min(100) as u32
}

fn ceil_div(numerator: u64, denominator: u64) -> u64 {
    numerator.div_ceil(denominator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_rounds_up_and_is_uncapped() {
        assert_eq!(ratio_percent(7, 3), 234);
        assert_eq!(ratio_percent(1, 3), 34);
        assert_eq!(ratio_percent(3, 3), 100);
        assert_eq!(ratio_percent(0, 4), 0);
    }

    #[test]
    fn ratio_edge_cases() {
        assert_eq!(ratio_percent(0, 0), 0);
        assert_eq!(ratio_percent(5, 0), 100);
    }

    #[test]
    fn return_aware_caps_and_negates_returns() {
        assert_eq!(return_aware_percent(7, 3, 0), 70);
        assert_eq!(return_aware_percent(6, 2, 1), 56);
        assert_eq!(return_aware_percent(1, 0, 2), 0);
        assert_eq!(return_aware_percent(2, 1, 0), 67);
    }

    #[test]
    fn return_aware_edge_cases() {
        assert_eq!(return_aware_percent(0, 0, 0), 0);
        assert_eq!(return_aware_percent(5, 0, 0), 100);
        assert_eq!(return_aware_percent(0, 3, 0), 0);
    }

    #[test]
    fn return_aware_stays_in_range() {
        for completed in 0..30 {
            for canceled in 0..10 {
                for returned in 0..10 {
                    let p = return_aware_percent(completed, canceled, returned);
                    assert!(p <= 100, "({completed},{canceled},{returned}) -> {p}");
                }
            }
        }
    }

    #[test]
    fn ratio_formula_merges_returns_into_cancellations() {
        assert_eq!(compute_percent(BuyoutFormula::Ratio, 6, 2, 1), 200);
        assert_eq!(compute_percent(BuyoutFormula::ReturnAware, 6, 2, 1), 56);
    }

    #[test]
    fn tally_classifies_statuses() {
        let statuses: Vec<OrderStatus> = [
            "completed", "completed", "completed", "completed", "completed", "completed",
            "cancel-other", "cancel-other", "vozvrat-im", "new",
        ]
        .into_iter()
        .map(OrderStatus::from)
        .collect();

        let tally: OrderTally = statuses.iter().collect();
        assert_eq!(tally.completed, 6);
        assert_eq!(tally.canceled, 2);
        assert_eq!(tally.returned, 1);
        assert_eq!(tally.total_fetched, 10);
        assert_eq!(tally.relevant(), 9);
    }

    #[test]
    fn formula_parses_aliases() {
        assert_eq!("ratio".parse::<BuyoutFormula>(), Ok(BuyoutFormula::Ratio));
        assert_eq!("Return-Aware".parse::<BuyoutFormula>(), Ok(BuyoutFormula::ReturnAware));
        assert!("median".parse::<BuyoutFormula>().is_err());
    }
}
