//! Synthetic node-ID batches for driving the engine.
//!
//! Node popularity follows a seeded permutation of ranks; `power_law`
//! weights rank `r` by `1 / (r + 1)^alpha`, and `affinity` additionally
//! shifts each worker toward its own slice of the ranking so workers see
//! different hot sets.

use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::{CacheError, NodeId, Result};
use crate::sim::config::Config;
use crate::topology::WorkerId;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Uniform,
    #[default]
    PowerLaw,
    Affinity,
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "uniform" => Ok(Self::Uniform),
            "power_law" => Ok(Self::PowerLaw),
            "affinity" => Ok(Self::Affinity),
            _ => Err(format!(
                "unsupported workload kind '{}', expected one of: uniform, power_law, affinity",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkloadConfig {
    pub num_nodes: usize,
    pub feat_dim: usize,
    pub kind: WorkloadKind,
    pub alpha: f64,
    /// Share of each worker's draws taken from its own hot slice.
    pub affinity: f64,
    pub seed: u64,
}

impl Config for WorkloadConfig {}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_nodes: 100_000,
            feat_dim: 128,
            kind: WorkloadKind::PowerLaw,
            alpha: 1.1,
            affinity: 0.5,
            seed: 0x5eed,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 || self.num_nodes > NodeId::MAX as usize {
            return Err(CacheError::config(format!(
                "num_nodes {} outside 1..={}",
                self.num_nodes,
                NodeId::MAX
            )));
        }
        if self.feat_dim == 0 {
            return Err(CacheError::config("feat_dim must be > 0"));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(CacheError::config(format!("alpha {} must be >= 0", self.alpha)));
        }
        if !(0.0..=1.0).contains(&self.affinity) {
            return Err(CacheError::config(format!(
                "affinity {} outside [0, 1]",
                self.affinity
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Workload {
    config: WorkloadConfig,
    num_workers: usize,
    /// `by_rank[r]` is the node with popularity rank `r`.
    by_rank: Vec<NodeId>,
    /// Cumulative rank weights, last entry 1.0.
    cdf: Vec<f64>,
    degrees: Arc<[u32]>,
}

impl Workload {
    pub fn new(config: &WorkloadConfig, num_workers: usize) -> Result<Self> {
        config.validate()?;
        if num_workers == 0 {
            return Err(CacheError::config("workload needs at least one worker"));
        }
        let n = config.num_nodes;
        let mut by_rank: Vec<NodeId> = (0..n as NodeId).collect();
        by_rank.shuffle(&mut StdRng::seed_from_u64(config.seed));

        let alpha = match config.kind {
            WorkloadKind::Uniform => 0.0,
            WorkloadKind::PowerLaw | WorkloadKind::Affinity => config.alpha,
        };
        let weights: Vec<f64> = (0..n).map(|r| ((r + 1) as f64).powf(-alpha)).collect();
        let total: f64 = weights.iter().sum();
        let mut acc = 0.0;
        let mut cdf: Vec<f64> = weights
            .iter()
            .map(|w| {
                acc += w / total;
                acc
            })
            .collect();
        if let Some(last) = cdf.last_mut() {
            *last = 1.0;
        }

        let mut degrees = vec![0u32; n];
        for (rank, &node) in by_rank.iter().enumerate() {
            let d = (n as f64 / (rank + 1) as f64).powf(alpha.min(1.0)).round();
            degrees[node as usize] = (d as u32).max(1);
        }

        Ok(Self {
            config: config.clone(),
            num_workers,
            by_rank,
            cdf,
            degrees: Arc::from(degrees),
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.config.num_nodes
    }

    pub fn feat_dim(&self) -> usize {
        self.config.feat_dim
    }

    /// Graph degree stand-in; higher for more popular nodes.
    pub fn degrees(&self) -> Arc<[u32]> {
        Arc::clone(&self.degrees)
    }

    /// The node IDs `worker` requests at (`epoch`, `step`). The same inputs
    /// always give the same batch.
    pub fn batch(
        &self,
        worker: WorkerId,
        epoch: usize,
        step: usize,
        batch_size: usize,
    ) -> Vec<NodeId> {
        let key = self.config.seed
            ^ ((worker as u64) << 48)
            ^ ((epoch as u64) << 32)
            ^ step as u64;
        let mut rng = StdRng::seed_from_u64(mix64(key));
        let n = self.num_nodes();
        (0..batch_size)
            .map(|_| match self.config.kind {
                WorkloadKind::Uniform => rng.gen_range(0..n as NodeId),
                WorkloadKind::PowerLaw => self.by_rank[self.draw_rank(&mut rng)],
                WorkloadKind::Affinity => {
                    let rank = self.draw_rank(&mut rng);
                    if rng.gen_bool(self.config.affinity) {
                        let shift = worker * n / self.num_workers;
                        self.by_rank[(rank + shift) % n]
                    } else {
                        self.by_rank[rank]
                    }
                }
            })
            .collect()
    }

    fn draw_rank(&self, rng: &mut StdRng) -> usize {
        let u: f64 = rng.gen();
        self.cdf
            .partition_point(|&c| c < u)
            .min(self.num_nodes() - 1)
    }
}

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: WorkloadKind) -> WorkloadConfig {
        WorkloadConfig {
            num_nodes: 1000,
            feat_dim: 8,
            kind,
            alpha: 1.2,
            affinity: 0.9,
            seed: 42,
        }
    }

    #[test]
    fn batches_are_deterministic_and_in_range() {
        for kind in [WorkloadKind::Uniform, WorkloadKind::PowerLaw, WorkloadKind::Affinity] {
            let workload = Workload::new(&config(kind), 4).unwrap();
            let a = workload.batch(1, 0, 7, 256);
            let b = workload.batch(1, 0, 7, 256);
            assert_eq!(a, b);
            assert_eq!(a.len(), 256);
            assert!(a.iter().all(|&id| (id as usize) < 1000));
            assert_ne!(a, workload.batch(1, 0, 8, 256));
        }
    }

    #[test]
    fn power_law_concentrates_on_hot_ranks() {
        let workload = Workload::new(&config(WorkloadKind::PowerLaw), 1).unwrap();
        let hot: Vec<NodeId> = workload.by_rank[..10].to_vec();
        let ids: Vec<NodeId> = (0..20).flat_map(|s| workload.batch(0, 0, s, 500)).collect();
        let hits = ids.iter().filter(|&id| hot.contains(id)).count();
        // 1% of the nodes draws far more than 1% of the accesses
        assert!(hits * 5 > ids.len(), "{hits} of {}", ids.len());
    }

    #[test]
    fn affinity_gives_workers_different_hot_sets() {
        let workload = Workload::new(&config(WorkloadKind::Affinity), 2).unwrap();
        let hottest = |worker| {
            let mut counts = vec![0u32; 1000];
            for step in 0..20 {
                for id in workload.batch(worker, 0, step, 500) {
                    counts[id as usize] += 1;
                }
            }
            (0..1000).max_by_key(|&v| (counts[v], std::cmp::Reverse(v))).unwrap()
        };
        assert_ne!(hottest(0), hottest(1));
    }

    #[test]
    fn degrees_follow_popularity() {
        let workload = Workload::new(&config(WorkloadKind::PowerLaw), 1).unwrap();
        let degrees = workload.degrees();
        assert_eq!(degrees.len(), 1000);
        let top = workload.by_rank[0] as usize;
        let bottom = workload.by_rank[999] as usize;
        assert!(degrees[top] > degrees[bottom]);
        assert!(degrees.iter().all(|&d| d >= 1));
    }

    #[test]
    fn rejects_bad_config() {
        let mut cfg = config(WorkloadKind::Affinity);
        cfg.affinity = 2.0;
        assert!(Workload::new(&cfg, 2).is_err());
        assert!(Workload::new(&config(WorkloadKind::Uniform), 0).is_err());
        assert!("zipf".parse::<WorkloadKind>().is_err());
    }
}
