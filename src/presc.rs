//! Prescan: per-worker access frequency estimation.
//!
//! The driver replays `presc_epoch` epochs of representative batches
//! through a [`Prescan`] before the measurement window, then calls
//! [`Prescan::finish`] once to obtain the [`FrequencyTable`] the placement
//! optimizer consumes.

use log::debug;

use crate::error::{CacheError, NodeId, Result};
use crate::topology::WorkerId;

/// Node-major access counts: `counts[node * num_workers + worker]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyTable {
    num_nodes: usize,
    num_workers: usize,
    counts: Vec<u32>,
}

impl FrequencyTable {
    pub fn zeroed(num_nodes: usize, num_workers: usize) -> Self {
        Self {
            num_nodes,
            num_workers,
            counts: vec![0; num_nodes * num_workers],
        }
    }

    /// Build from per-node rows, one count per worker.
    pub fn from_rows(rows: &[Vec<u32>]) -> Result<Self> {
        let num_workers = rows.first().map(|r| r.len()).unwrap_or(0);
        if num_workers == 0 {
            return Err(CacheError::config("frequency rows must name at least one worker"));
        }
        if let Some(node) = rows.iter().position(|r| r.len() != num_workers) {
            return Err(CacheError::config(format!(
                "frequency row {node} has {} workers, expected {num_workers}",
                rows[node].len()
            )));
        }
        Ok(Self {
            num_nodes: rows.len(),
            num_workers,
            counts: rows.iter().flatten().copied().collect(),
        })
    }

    /// Every node accessed once by every worker.
    pub fn uniform(num_nodes: usize, num_workers: usize) -> Self {
        Self {
            num_nodes,
            num_workers,
            counts: vec![1; num_nodes * num_workers],
        }
    }

    /// Degree used as a stand-in for access frequency at every worker.
    pub fn from_degree(degrees: &[u32], num_workers: usize) -> Self {
        let counts = degrees
            .iter()
            .flat_map(|&d| std::iter::repeat(d).take(num_workers))
            .collect();
        Self {
            num_nodes: degrees.len(),
            num_workers,
            counts,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn count(&self, node: NodeId, worker: WorkerId) -> u32 {
        self.counts[node as usize * self.num_workers + worker]
    }

    pub fn row(&self, node: NodeId) -> &[u32] {
        let start = node as usize * self.num_workers;
        &self.counts[start..start + self.num_workers]
    }

    pub fn total(&self, node: NodeId) -> u64 {
        self.row(node).iter().map(|&c| c as u64).sum()
    }

    pub fn total_accesses(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    pub fn worker_accesses(&self, worker: WorkerId) -> u64 {
        self.counts
            .iter()
            .skip(worker)
            .step_by(self.num_workers.max(1))
            .map(|&c| c as u64)
            .sum()
    }

    fn bump(&mut self, node: NodeId, worker: WorkerId) {
        let slot = &mut self.counts[node as usize * self.num_workers + worker];
        *slot = slot.saturating_add(1);
    }
}

#[derive(Debug)]
pub struct Prescan {
    table: FrequencyTable,
    batches: u64,
}

impl Prescan {
    pub fn new(num_nodes: usize, num_workers: usize) -> Self {
        Self {
            table: FrequencyTable::zeroed(num_nodes, num_workers),
            batches: 0,
        }
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Count one access per ID in `ids` for `worker`.
    ///
    /// The batch is validated before any counter moves, so a rejected batch
    /// leaves the estimate untouched.
    pub fn observe(&mut self, worker: WorkerId, ids: &[NodeId]) -> Result<()> {
        if worker >= self.table.num_workers {
            return Err(CacheError::config(format!(
                "worker {worker} out of range (num_workers = {})",
                self.table.num_workers
            )));
        }
        let num_nodes = self.table.num_nodes;
        if let Some(&node) = ids.iter().find(|&&id| id as usize >= num_nodes) {
            return Err(CacheError::NodeOutOfRange { node, num_nodes });
        }
        for &id in ids {
            self.table.bump(id, worker);
        }
        self.batches = self.batches.saturating_add(1);
        Ok(())
    }

    pub fn finish(self) -> Result<FrequencyTable> {
        let total = self.table.total_accesses();
        if self.batches == 0 || total == 0 {
            return Err(CacheError::Estimation(format!(
                "prescan saw {} batches and {} accesses",
                self.batches, total
            )));
        }
        debug!(
            "prescan done: {} batches, {} accesses over {} nodes",
            self.batches, total, self.table.num_nodes
        );
        Ok(self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_counts_per_worker() {
        let mut presc = Prescan::new(4, 2);
        presc.observe(0, &[0, 1, 1]).unwrap();
        presc.observe(1, &[1, 3]).unwrap();
        let table = presc.finish().unwrap();
        assert_eq!(table.row(1), &[2, 1]);
        assert_eq!(table.count(3, 1), 1);
        assert_eq!(table.count(2, 0), 0);
        assert_eq!(table.total(1), 3);
        assert_eq!(table.total_accesses(), 5);
        assert_eq!(table.worker_accesses(0), 3);
        assert_eq!(table.worker_accesses(1), 2);
    }

    #[test]
    fn empty_prescan_is_an_estimation_error() {
        let presc = Prescan::new(4, 2);
        assert!(matches!(presc.finish(), Err(CacheError::Estimation(_))));
    }

    #[test]
    fn empty_batches_are_an_estimation_error() {
        let mut presc = Prescan::new(4, 2);
        presc.observe(0, &[]).unwrap();
        presc.observe(1, &[]).unwrap();
        assert!(matches!(presc.finish(), Err(CacheError::Estimation(_))));
    }

    #[test]
    fn out_of_range_batch_is_rejected_whole() {
        let mut presc = Prescan::new(4, 1);
        let err = presc.observe(0, &[0, 9, 1]).unwrap_err();
        assert_eq!(err, CacheError::NodeOutOfRange { node: 9, num_nodes: 4 });
        presc.observe(0, &[2]).unwrap();
        let table = presc.finish().unwrap();
        assert_eq!(table.count(0, 0), 0);
        assert_eq!(table.count(2, 0), 1);
    }

    #[test]
    fn bad_worker_is_a_config_error() {
        let mut presc = Prescan::new(4, 2);
        assert!(matches!(presc.observe(2, &[0]), Err(CacheError::Config(_))));
    }

    #[test]
    fn degree_fallback_repeats_per_worker() {
        let table = FrequencyTable::from_degree(&[3, 0, 7], 2);
        assert_eq!(table.row(0), &[3, 3]);
        assert_eq!(table.row(2), &[7, 7]);
        assert_eq!(table.num_nodes(), 3);
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        assert!(FrequencyTable::from_rows(&[vec![1, 2], vec![3]]).is_err());
        let table = FrequencyTable::from_rows(&[vec![10, 0], vec![0, 10]]).unwrap();
        assert_eq!(table.num_workers(), 2);
        assert_eq!(table.count(1, 1), 10);
    }
}
