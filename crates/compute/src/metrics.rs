use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-node compute statistics for this process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComputeMetrics {
    /// Successful computes by node name.
    pub computes: HashMap<String, u64>,
    /// Failed computes by node name.
    pub failures: HashMap<String, u64>,
    /// Average successful compute duration by node name.
    pub avg_duration: HashMap<String, Duration>,
    /// Records written by the last successful compute.
    pub last_records_written: HashMap<String, u64>,
    pub last_run: HashMap<String, DateTime<Utc>>,
}

impl ComputeMetrics {
    pub fn record_success(&mut self, node: &str, duration: Duration, records_written: u64) {
        *self.computes.entry(node.to_string()).or_default() += 1;
        self.last_run.insert(node.to_string(), Utc::now());
        self.last_records_written
            .insert(node.to_string(), records_written);

        let count = self.computes[node];
        let prev_avg = self.avg_duration.get(node).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_duration.insert(node.to_string(), new_avg);
    }

    pub fn record_failure(&mut self, node: &str) {
        *self.failures.entry(node.to_string()).or_default() += 1;
        self.last_run.insert(node.to_string(), Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_successful_runs() {
        let mut m = ComputeMetrics::default();
        m.record_success("join", Duration::from_millis(100), 10);
        m.record_success("join", Duration::from_millis(200), 12);

        assert_eq!(m.computes["join"], 2);
        assert_eq!(m.last_records_written["join"], 12);
        let avg = m.avg_duration["join"].as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn failures_do_not_touch_averages() {
        let mut m = ComputeMetrics::default();
        m.record_failure("join");
        assert_eq!(m.failures["join"], 1);
        assert!(m.avg_duration.is_empty());
        assert!(m.last_run.contains_key("join"));
    }
}
