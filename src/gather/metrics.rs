use std::ops::AddAssign;

use serde::Serialize;

use crate::topology::{throughput_gb_s, GB};

/// Counters for one source class (local, remote or cpu).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub rows: u64,
    pub bytes: u64,
    /// Wall-clock time spent in the read.
    pub time_s: f64,
    /// Time the interconnect model charges for the same bytes.
    pub modeled_time_s: f64,
}

impl AddAssign<&SourceStats> for SourceStats {
    fn add_assign(&mut self, other: &SourceStats) {
        self.rows = self.rows.saturating_add(other.rows);
        self.bytes = self.bytes.saturating_add(other.bytes);
        self.time_s += other.time_s;
        self.modeled_time_s += other.modeled_time_s;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepMetrics {
    pub local: SourceStats,
    pub remote: SourceStats,
    pub cpu: SourceStats,
    pub steps: u64,
    pub step_time_s: f64,
    pub modeled_step_time_s: f64,
}

impl AddAssign<&StepMetrics> for StepMetrics {
    fn add_assign(&mut self, other: &StepMetrics) {
        self.local += &other.local;
        self.remote += &other.remote;
        self.cpu += &other.cpu;
        self.steps = self.steps.saturating_add(other.steps);
        self.step_time_s += other.step_time_s;
        self.modeled_step_time_s += other.modeled_step_time_s;
    }
}

impl StepMetrics {
    pub fn total_rows(&self) -> u64 {
        self.local
            .rows
            .saturating_add(self.remote.rows)
            .saturating_add(self.cpu.rows)
    }

    pub fn total_bytes(&self) -> u64 {
        self.local
            .bytes
            .saturating_add(self.remote.bytes)
            .saturating_add(self.cpu.bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceReport {
    pub size_bytes: u64,
    pub size_gb: f64,
    pub time_s: f64,
    pub modeled_time_s: f64,
    pub throughput_gb_s: f64,
    /// Share of all gathered bytes, in percent.
    pub weight_pct: f64,
}

impl SourceReport {
    fn new(stats: &SourceStats, total_bytes: u64) -> Self {
        Self {
            size_bytes: stats.bytes,
            size_gb: stats.bytes as f64 / GB,
            time_s: stats.time_s,
            modeled_time_s: stats.modeled_time_s,
            throughput_gb_s: throughput_gb_s(stats.bytes, stats.time_s),
            weight_pct: ratio(stats.bytes, total_bytes) * 100.0,
        }
    }
}

/// Serializable view of accumulated [`StepMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub local: SourceReport,
    pub remote: SourceReport,
    pub cpu: SourceReport,
    pub local_cache_rate: f64,
    pub remote_cache_rate: f64,
    pub cpu_rate: f64,
    pub global_cache_rate: f64,
    pub steps: u64,
    pub aborted_steps: u64,
    pub step_time_s: f64,
    pub modeled_step_time_s: f64,
}

impl MetricsSnapshot {
    pub fn new(metrics: &StepMetrics, aborted_steps: u64) -> Self {
        let rows = metrics.total_rows();
        let bytes = metrics.total_bytes();
        let cpu_rate = ratio(metrics.cpu.rows, rows);
        Self {
            local: SourceReport::new(&metrics.local, bytes),
            remote: SourceReport::new(&metrics.remote, bytes),
            cpu: SourceReport::new(&metrics.cpu, bytes),
            local_cache_rate: ratio(metrics.local.rows, rows),
            remote_cache_rate: ratio(metrics.remote.rows, rows),
            cpu_rate,
            global_cache_rate: if rows == 0 { 0.0 } else { 1.0 - cpu_rate },
            steps: metrics.steps,
            aborted_steps,
            step_time_s: metrics.step_time_s,
            modeled_step_time_s: metrics.modeled_step_time_s,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(rows: u64, bytes: u64) -> SourceStats {
        SourceStats { rows, bytes, time_s: 0.5, modeled_time_s: 0.25 }
    }

    #[test]
    fn add_assign_accumulates() {
        let mut total = StepMetrics::default();
        let step = StepMetrics {
            local: stats(2, 16),
            remote: stats(1, 8),
            cpu: stats(1, 8),
            steps: 1,
            step_time_s: 0.5,
            modeled_step_time_s: 0.25,
        };
        total += &step;
        total += &step;
        assert_eq!(total.steps, 2);
        assert_eq!(total.local.rows, 4);
        assert_eq!(total.total_bytes(), 64);
        assert_eq!(total.cpu.time_s, 1.0);
    }

    #[test]
    fn counters_saturate() {
        let mut a = SourceStats { rows: u64::MAX, ..SourceStats::default() };
        a += &stats(5, 5);
        assert_eq!(a.rows, u64::MAX);
    }

    #[test]
    fn snapshot_rates() {
        let metrics = StepMetrics {
            local: stats(6, 48),
            remote: stats(3, 24),
            cpu: stats(1, 8),
            steps: 2,
            ..StepMetrics::default()
        };
        let snap = MetricsSnapshot::new(&metrics, 1);
        assert!((snap.local_cache_rate - 0.6).abs() < 1e-12);
        assert!((snap.remote_cache_rate - 0.3).abs() < 1e-12);
        assert!((snap.cpu_rate - 0.1).abs() < 1e-12);
        assert!((snap.global_cache_rate - 0.9).abs() < 1e-12);
        assert!((snap.local.weight_pct - 60.0).abs() < 1e-9);
        assert_eq!(snap.cpu.size_bytes, 8);
        assert_eq!(snap.aborted_steps, 1);
        assert!((snap.remote.throughput_gb_s - 24.0 / GB / 0.5).abs() < 1e-18);
    }

    #[test]
    fn empty_snapshot_has_no_rates() {
        let snap = MetricsSnapshot::new(&StepMetrics::default(), 0);
        assert_eq!(snap.global_cache_rate, 0.0);
        assert_eq!(snap.cpu_rate, 0.0);
        assert!(snap.local.throughput_gb_s.is_nan());
    }
}
