//! Summary statistics over a user's stress history.
//!
//! Entries are expected newest first, the order the store returns them in.
//! The trend compares the average of the latest seven entries with the seven
//! before them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::StressEntry;

/// Entries per trend window.
pub const TREND_WINDOW: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    pub fn from_delta(delta: f64) -> Self {
        if delta > 0.0 {
            Trend::Increasing
        } else if delta < 0.0 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trend::Increasing => "Increasing",
            Trend::Decreasing => "Decreasing",
            Trend::Stable => "Stable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StressStats {
    pub total: usize,
    /// Mean score, rounded to one decimal.
    pub average: f64,
    /// Entries scored 4 or 5.
    pub high_stress: usize,
    /// Entries scored 1 or 2.
    pub low_stress: usize,
    /// Recent window average minus the previous window average, one decimal.
    pub trend: f64,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn mean(entries: &[StressEntry]) -> f64 {
    if entries.is_empty() {
        return 0.0;
    }
    let sum: u32 = entries.iter().map(|e| e.stress_score.get() as u32).sum();
    sum as f64 / entries.len() as f64
}

impl StressStats {
    /// `None` when there is no history.
    pub fn from_entries(entries: &[StressEntry]) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        let recent = &entries[..entries.len().min(TREND_WINDOW)];
        let previous = entries
            .get(TREND_WINDOW..entries.len().min(2 * TREND_WINDOW))
            .unwrap_or_default();
        Some(Self {
            total: entries.len(),
            average: round1(mean(entries)),
            high_stress: entries.iter().filter(|e| e.stress_score.get() >= 4).count(),
            low_stress: entries.iter().filter(|e| e.stress_score.get() <= 2).count(),
            trend: round1(mean(recent) - mean(previous)),
        })
    }

    pub fn direction(&self) -> Trend {
        Trend::from_delta(self.trend)
    }

    /// Share of entries in `count`, as a percentage.
    pub fn percent(&self, count: usize) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        round1(count as f64 * 100.0 / self.total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StressLevel;

    fn entries(scores: &[i64]) -> Vec<StressEntry> {
        scores
            .iter()
            .map(|s| StressEntry::new("u", StressLevel::new(*s).unwrap(), None))
            .collect()
    }

    #[test]
    fn test_empty_history_has_no_stats() {
        assert!(StressStats::from_entries(&[]).is_none());
    }

    #[test]
    fn test_counts_and_average() {
        let stats = StressStats::from_entries(&entries(&[5, 4, 3, 2, 1, 1])).unwrap();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.average, 2.7);
        assert_eq!(stats.high_stress, 2);
        assert_eq!(stats.low_stress, 3);
        assert_eq!(stats.percent(stats.high_stress), 33.3);
    }

    #[test]
    fn test_trend_compares_recent_window_with_previous() {
        // Newest first: the last week averages 2, the week before 4.
        let mut scores = vec![2; TREND_WINDOW];
        scores.extend(vec![4; TREND_WINDOW]);
        scores.push(5);
        let stats = StressStats::from_entries(&entries(&scores)).unwrap();
        assert_eq!(stats.trend, -2.0);
        assert_eq!(stats.direction(), Trend::Decreasing);
    }

    #[test]
    fn test_short_history_trend_is_recent_average() {
        let stats = StressStats::from_entries(&entries(&[3, 3])).unwrap();
        assert_eq!(stats.trend, 3.0);
        assert_eq!(stats.direction(), Trend::Increasing);
    }
}
