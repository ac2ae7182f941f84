//! Logical queries and aggregate results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::UnixSeconds;

/// A logical message query spanning every shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQuery {
    /// Conversation identifiers; at least one is required.
    pub talkers: Vec<String>,
    /// Sender user names; empty means any sender.
    #[serde(default)]
    pub senders: Vec<String>,
    pub start: UnixSeconds,
    pub end: UnixSeconds,
    /// Regular expression matched against the rendered text.
    #[serde(default)]
    pub keyword: Option<String>,
    /// 0 means no limit.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl MessageQuery {
    /// Query covering all time for the given conversations.
    pub fn new<I, S>(talkers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            talkers: talkers.into_iter().map(Into::into).collect(),
            senders: Vec::new(),
            start: 0,
            end: UnixSeconds::MAX,
            keyword: None,
            limit: 0,
            offset: 0,
        }
    }

    pub fn between(mut self, start: UnixSeconds, end: UnixSeconds) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.senders = senders.into_iter().map(Into::into).collect();
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Message totals across every conversation table of every shard.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total: u64,
    pub sent: u64,
    pub received: u64,
    pub earliest_time: Option<UnixSeconds>,
    pub latest_time: Option<UnixSeconds>,
    /// Message counts keyed by [`crate::MessageKind::label`].
    #[serde(default)]
    pub by_kind: BTreeMap<String, u64>,
}

impl GlobalStats {
    /// Fold another partial result into this one.
    pub fn merge(&mut self, other: &GlobalStats) {
        self.total += other.total;
        self.sent += other.sent;
        self.received += other.received;
        self.earliest_time = match (self.earliest_time, other.earliest_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.latest_time = match (self.latest_time, other.latest_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        for (kind, count) in &other.by_kind {
            *self.by_kind.entry(kind.clone()).or_default() += count;
        }
    }
}

/// Sent/received counts for one calendar month (UTC).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyTrend {
    /// `YYYY-MM`.
    pub month: String,
    pub sent: u64,
    pub received: u64,
}

/// Message counts by hour of day and day of week (UTC).
///
/// Rows are hours `0..24`, columns are weekdays `0..7` starting on Sunday.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heatmap {
    pub counts: [[u64; 7]; 24],
}

impl Heatmap {
    /// Add `count` to a cell; out-of-range cells are ignored.
    pub fn add(&mut self, hour: i64, weekday: i64, count: u64) {
        let (Ok(hour), Ok(weekday)) = (usize::try_from(hour), usize::try_from(weekday)) else {
            return;
        };
        if let Some(cell) = self.counts.get_mut(hour).and_then(|row| row.get_mut(weekday)) {
            *cell += count;
        }
    }

    pub fn get(&self, hour: usize, weekday: usize) -> u64 {
        self.counts
            .get(hour)
            .and_then(|row| row.get(weekday))
            .copied()
            .unwrap_or_default()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn merge(&mut self, other: &Heatmap) {
        for (row, other_row) in self.counts.iter_mut().zip(&other.counts) {
            for (cell, other_cell) in row.iter_mut().zip(other_row) {
                *cell += other_cell;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" alice, ,bob,"), vec!["alice", "bob"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_builder() {
        let q = MessageQuery::new(["alice"]).between(10, 20).page(5, 2).keyword("hi");
        assert_eq!(q.talkers, vec!["alice"]);
        assert_eq!((q.start, q.end, q.limit, q.offset), (10, 20, 5, 2));
        assert_eq!(q.keyword.as_deref(), Some("hi"));
    }

    #[test]
    fn test_stats_merge() {
        let mut a = GlobalStats {
            total: 2,
            sent: 1,
            received: 1,
            earliest_time: Some(50),
            latest_time: Some(60),
            by_kind: BTreeMap::from([("text".to_string(), 2)]),
        };
        let b = GlobalStats {
            total: 3,
            sent: 0,
            received: 3,
            earliest_time: Some(10),
            latest_time: Some(40),
            by_kind: BTreeMap::from([("text".to_string(), 1), ("image".to_string(), 2)]),
        };
        a.merge(&b);
        assert_eq!(a.total, 5);
        assert_eq!(a.by_kind.get("text"), Some(&3));
        assert_eq!(a.by_kind.get("image"), Some(&2));
        assert_eq!(a.earliest_time, Some(10));
        assert_eq!(a.latest_time, Some(60));
        let mut empty = GlobalStats::default();
        empty.merge(&a);
        assert_eq!(empty, a);
    }

    #[test]
    fn test_heatmap_ignores_out_of_range() {
        let mut grid = Heatmap::default();
        grid.add(23, 6, 2);
        grid.add(24, 0, 5);
        grid.add(0, 7, 5);
        grid.add(-1, 0, 5);
        assert_eq!(grid.get(23, 6), 2);
        assert_eq!(grid.total(), 2);

        let mut other = Heatmap::default();
        other.add(23, 6, 1);
        other.add(0, 0, 4);
        grid.merge(&other);
        assert_eq!(grid.get(23, 6), 3);
        assert_eq!(grid.get(0, 0), 4);
        assert_eq!(grid.get(99, 99), 0);
    }
}
