//! Model usage accounting.

use std::ops::Add;

use serde::{Deserialize, Serialize};

/// Monotonically accumulating model usage counters.
///
/// One value travels through a whole call tree: a subroutine starts from a copy of
/// its caller's counters and the caller takes the final counters back with
/// [`ApiStats::replace`], so the root ends up with the sum over every query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiStats {
    pub total_cost: f64,
    pub instance_cost: f64,
    pub tokens_sent: u64,
    pub tokens_received: u64,
    pub api_calls: u64,
}

impl ApiStats {
    /// Account for one model query.
    pub fn record(&mut self, tokens_sent: u64, tokens_received: u64, cost: f64) {
        self.total_cost += cost;
        self.instance_cost += cost;
        self.tokens_sent += tokens_sent;
        self.tokens_received += tokens_received;
        self.api_calls += 1;
    }

    /// Overwrite every counter with `other`'s.
    pub fn replace(&mut self, other: &ApiStats) {
        *self = other.clone();
    }
}

impl Add for ApiStats {
    type Output = ApiStats;

    fn add(self, rhs: ApiStats) -> ApiStats {
        ApiStats {
            total_cost: self.total_cost + rhs.total_cost,
            instance_cost: self.instance_cost + rhs.instance_cost,
            tokens_sent: self.tokens_sent + rhs.tokens_sent,
            tokens_received: self.tokens_received + rhs.tokens_received,
            api_calls: self.api_calls + rhs.api_calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_every_counter() {
        let mut stats = ApiStats::default();
        stats.record(10, 4, 0.5);
        stats.record(3, 1, 0.25);
        assert_eq!(stats.api_calls, 2);
        assert_eq!(stats.tokens_sent, 13);
        assert_eq!(stats.tokens_received, 5);
        assert!((stats.instance_cost - 0.75).abs() < f64::EPSILON);
        assert!((stats.total_cost - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn replace_takes_child_counters() {
        let mut parent = ApiStats::default();
        parent.record(1, 1, 0.1);
        let mut child = parent.clone();
        child.record(2, 2, 0.2);
        parent.replace(&child);
        assert_eq!(parent, child);
        assert_eq!(parent.api_calls, 2);
    }

    #[test]
    fn add_sums_fieldwise() {
        let mut a = ApiStats::default();
        a.record(1, 2, 1.0);
        let mut b = ApiStats::default();
        b.record(3, 4, 2.0);
        let sum = a + b;
        assert_eq!(sum.tokens_sent, 4);
        assert_eq!(sum.tokens_received, 6);
        assert_eq!(sum.api_calls, 2);
    }
}
