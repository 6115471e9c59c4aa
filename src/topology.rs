//! GPU set and interconnect model.
//!
//! `bandwidth(i, j)` is the throughput worker `i` sees when it reads rows
//! held in worker `j`'s cache. The matrix may be asymmetric, both by
//! direction and by pair. An off-diagonal zero means the pair has no peer
//! path and never serves remote reads.
//!
//! Bandwidth reference (per direction):
//!   V100 NVLink 2.0   ~24 GB/s per link, bonded pairs ~48 GB/s
//!   PCIe 3.0 x16      ~12 GB/s host to device
//!   V100 HBM2         ~900 GB/s

use std::str::FromStr;

use serde::Deserialize;

use crate::error::{CacheError, Result};
use crate::sim::config::Config;

pub type WorkerId = usize;

/// 2^30 bytes, the unit all GB and GB/s figures in this crate use.
pub const GB: f64 = (1u64 << 30) as f64;

/// Fixed setup cost of one link transfer, in microseconds.
pub const LINK_LATENCY_US: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    capacity: Vec<usize>,
    bandwidth: Vec<Vec<f64>>,
    cpu_bandwidth: Vec<f64>,
    local_bandwidth: f64,
}

impl Topology {
    pub fn new(
        capacity: Vec<usize>,
        bandwidth: Vec<Vec<f64>>,
        cpu_bandwidth: Vec<f64>,
    ) -> Result<Self> {
        let n = capacity.len();
        if n == 0 {
            return Err(CacheError::config("topology has no workers"));
        }
        if let Some(w) = capacity.iter().position(|&c| c == 0) {
            return Err(CacheError::config(format!(
                "capacity of worker {w} must be > 0"
            )));
        }
        if bandwidth.len() != n || bandwidth.iter().any(|row| row.len() != n) {
            return Err(CacheError::config(format!(
                "bandwidth matrix must be {n}x{n}"
            )));
        }
        for (i, row) in bandwidth.iter().enumerate() {
            for (j, &bw) in row.iter().enumerate() {
                if !bw.is_finite() || bw < 0.0 {
                    return Err(CacheError::config(format!(
                        "bandwidth[{i}][{j}] = {bw} is not a non-negative number"
                    )));
                }
            }
        }
        if cpu_bandwidth.len() != n {
            return Err(CacheError::config(format!(
                "expected {n} cpu bandwidth entries, got {}",
                cpu_bandwidth.len()
            )));
        }
        if let Some(w) = cpu_bandwidth
            .iter()
            .position(|&bw| !bw.is_finite() || bw <= 0.0)
        {
            return Err(CacheError::config(format!(
                "cpu bandwidth of worker {w} must be > 0"
            )));
        }
        Ok(Self {
            capacity,
            bandwidth,
            cpu_bandwidth,
            local_bandwidth: 900.0,
        })
    }

    /// All pairs connected at `link_gb_s`.
    pub fn uniform(
        num_workers: usize,
        capacity: usize,
        link_gb_s: f64,
        cpu_gb_s: f64,
    ) -> Result<Self> {
        let bandwidth = (0..num_workers)
            .map(|i| {
                (0..num_workers)
                    .map(|j| if i == j { 0.0 } else { link_gb_s })
                    .collect()
            })
            .collect();
        Self::new(
            vec![capacity; num_workers],
            bandwidth,
            vec![cpu_gb_s; num_workers],
        )
    }

    /// DGX-1 (V100) hybrid cube-mesh: two fully connected quads with a
    /// mix of single and bonded NVLinks, plus one link between GPU `i`
    /// and `i + 4`. Pairs without NVLink have no peer path.
    pub fn dgx1_hybrid_cube_mesh(capacity: usize) -> Result<Self> {
        const NV1: f64 = 24.0;
        const NV2: f64 = 48.0;
        const SYS: f64 = 0.0;
        let bandwidth = vec![
            vec![0.0, NV1, NV1, NV2, NV2, SYS, SYS, SYS],
            vec![NV1, 0.0, NV2, NV1, SYS, NV2, SYS, SYS],
            vec![NV1, NV2, 0.0, NV2, SYS, SYS, NV1, SYS],
            vec![NV2, NV1, NV2, 0.0, SYS, SYS, SYS, NV1],
            vec![NV2, SYS, SYS, SYS, 0.0, NV1, NV1, NV2],
            vec![SYS, NV2, SYS, SYS, NV1, 0.0, NV2, NV1],
            vec![SYS, SYS, NV1, SYS, NV1, NV2, 0.0, NV2],
            vec![SYS, SYS, SYS, NV1, NV2, NV1, NV2, 0.0],
        ];
        Self::new(vec![capacity; 8], bandwidth, vec![12.0; 8])
    }

    pub fn with_local_bandwidth(mut self, gb_s: f64) -> Self {
        if gb_s.is_finite() && gb_s > 0.0 {
            self.local_bandwidth = gb_s;
        }
        self
    }

    /// Keep only the first `n` workers.
    pub fn truncated(&self, n: usize) -> Result<Self> {
        if n == 0 || n > self.num_workers() {
            return Err(CacheError::config(format!(
                "cannot take {n} workers from a {}-worker topology",
                self.num_workers()
            )));
        }
        let bandwidth = self.bandwidth[..n]
            .iter()
            .map(|row| row[..n].to_vec())
            .collect();
        Ok(Self::new(
            self.capacity[..n].to_vec(),
            bandwidth,
            self.cpu_bandwidth[..n].to_vec(),
        )?
        .with_local_bandwidth(self.local_bandwidth))
    }

    pub fn num_workers(&self) -> usize {
        self.capacity.len()
    }

    pub fn capacity(&self, worker: WorkerId) -> usize {
        self.capacity[worker]
    }

    pub fn capacities(&self) -> &[usize] {
        &self.capacity
    }

    /// Link bandwidth seen by `reader` when fetching from `owner`, GB/s.
    pub fn bandwidth(&self, reader: WorkerId, owner: WorkerId) -> f64 {
        if reader == owner {
            f64::INFINITY
        } else {
            self.bandwidth[reader][owner]
        }
    }

    pub fn cpu_bandwidth(&self, worker: WorkerId) -> f64 {
        self.cpu_bandwidth[worker]
    }

    pub fn local_bandwidth(&self) -> f64 {
        self.local_bandwidth
    }

    pub fn has_link(&self, reader: WorkerId, owner: WorkerId) -> bool {
        reader == owner || self.bandwidth[reader][owner] > 0.0
    }

    /// Marginal cost (seconds per GB) of a remote read; infinite without a link.
    pub fn remote_cost(&self, reader: WorkerId, owner: WorkerId) -> f64 {
        let bw = self.bandwidth(reader, owner);
        if bw.is_infinite() {
            0.0
        } else if bw <= 0.0 {
            f64::INFINITY
        } else {
            1.0 / bw
        }
    }

    pub fn cpu_cost(&self, worker: WorkerId) -> f64 {
        1.0 / self.cpu_bandwidth[worker]
    }

    /// Each pair carries the mean of both directions.
    pub fn symmetrized(&self) -> Self {
        let n = self.num_workers();
        let mut out = self.clone();
        for i in 0..n {
            for j in 0..n {
                out.bandwidth[i][j] = (self.bandwidth[i][j] + self.bandwidth[j][i]) / 2.0;
            }
        }
        out
    }

    pub fn is_uniform(&self) -> bool {
        let mut links = self.off_diagonal();
        match links.next() {
            Some(first) => links.all(|bw| bw == first),
            None => true,
        }
    }

    pub fn max_link(&self) -> f64 {
        self.off_diagonal().fold(0.0, f64::max)
    }

    fn off_diagonal(&self) -> impl Iterator<Item = f64> + '_ {
        self.bandwidth.iter().enumerate().flat_map(|(i, row)| {
            row.iter()
                .enumerate()
                .filter(move |(j, _)| *j != i)
                .map(|(_, &bw)| bw)
        })
    }

    /// Greedy clique grouping. A clique grows from the lowest unassigned
    /// worker and admits a worker only if its links to every member are at
    /// least `threshold * max_link` in both directions.
    pub fn cliques(&self, threshold: f64) -> Vec<Vec<WorkerId>> {
        let n = self.num_workers();
        let cutoff = threshold.clamp(0.0, 1.0) * self.max_link();
        let fast = |a: WorkerId, b: WorkerId| {
            let (ab, ba) = (self.bandwidth[a][b], self.bandwidth[b][a]);
            ab > 0.0 && ba > 0.0 && ab >= cutoff && ba >= cutoff
        };

        let mut assigned = vec![false; n];
        let mut cliques = Vec::new();
        for seed in 0..n {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let mut clique = vec![seed];
            for cand in (seed + 1)..n {
                if !assigned[cand] && clique.iter().all(|&m| fast(m, cand)) {
                    assigned[cand] = true;
                    clique.push(cand);
                }
            }
            cliques.push(clique);
        }
        cliques
    }
}

/// Modeled transfer time in seconds.
///
/// time_s = latency + bytes / bandwidth; an infinite bandwidth costs nothing.
pub fn transfer_time_s(bytes: u64, bandwidth_gb_s: f64, latency_us: f64) -> f64 {
    if bytes == 0 || bandwidth_gb_s.is_infinite() {
        return 0.0;
    }
    if bandwidth_gb_s <= 0.0 {
        return f64::INFINITY;
    }
    latency_us * 1e-6 + bytes as f64 / (bandwidth_gb_s * GB)
}

/// Throughput in GB/s; NaN when no time was spent.
pub fn throughput_gb_s(bytes: u64, time_s: f64) -> f64 {
    if time_s <= 0.0 {
        return f64::NAN;
    }
    bytes as f64 / GB / time_s
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopologyPreset {
    #[default]
    Uniform,
    Dgx1,
    Explicit,
}

impl FromStr for TopologyPreset {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "uniform" => Ok(Self::Uniform),
            "dgx1" => Ok(Self::Dgx1),
            "explicit" => Ok(Self::Explicit),
            _ => Err(format!(
                "unsupported topology preset '{}', expected one of: uniform, dgx1, explicit",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TopologyConfig {
    pub preset: TopologyPreset,
    pub link_gb_s: f64,
    pub cpu_gb_s: f64,
    pub local_gb_s: f64,
    /// Used by the `explicit` preset.
    pub bandwidth: Vec<Vec<f64>>,
    /// Overrides `cpu_gb_s` per worker when non-empty.
    pub cpu_bandwidth: Vec<f64>,
    /// Slots per GPU; unset means the GPU can hold the whole feature table.
    pub capacity: Option<usize>,
    pub clique_threshold: f64,
}

impl Config for TopologyConfig {}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            preset: TopologyPreset::Uniform,
            link_gb_s: 24.0,
            cpu_gb_s: 12.0,
            local_gb_s: 900.0,
            bandwidth: Vec::new(),
            cpu_bandwidth: Vec::new(),
            capacity: None,
            clique_threshold: 0.5,
        }
    }
}

impl TopologyConfig {
    pub fn build(&self, num_workers: usize, num_nodes: usize) -> Result<Topology> {
        let capacity = self.capacity.unwrap_or(num_nodes).max(1);
        let topo = match self.preset {
            TopologyPreset::Uniform => {
                Topology::uniform(num_workers, capacity, self.link_gb_s, self.cpu_gb_s)?
            }
            TopologyPreset::Dgx1 => {
                Topology::dgx1_hybrid_cube_mesh(capacity)?.truncated(num_workers)?
            }
            TopologyPreset::Explicit => {
                if self.bandwidth.len() != num_workers {
                    return Err(CacheError::config(format!(
                        "explicit bandwidth matrix has {} rows, run has {} workers",
                        self.bandwidth.len(),
                        num_workers
                    )));
                }
                Topology::new(
                    vec![capacity; num_workers],
                    self.bandwidth.clone(),
                    vec![self.cpu_gb_s; num_workers],
                )?
            }
        };
        let topo = if self.cpu_bandwidth.is_empty() {
            topo
        } else {
            let bandwidth = (0..topo.num_workers())
                .map(|i| topo.bandwidth[i].clone())
                .collect();
            Topology::new(
                topo.capacities().to_vec(),
                bandwidth,
                self.cpu_bandwidth.clone(),
            )?
        };
        Ok(topo.with_local_bandwidth(self.local_gb_s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_way() -> Topology {
        Topology::new(
            vec![4, 4, 4],
            vec![
                vec![0.0, 10.0, 2.0],
                vec![30.0, 0.0, 10.0],
                vec![2.0, 10.0, 0.0],
            ],
            vec![4.0, 4.0, 4.0],
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = Topology::uniform(2, 0, 10.0, 1.0).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn rejects_non_square_matrix() {
        let err = Topology::new(vec![1, 1], vec![vec![0.0, 1.0]], vec![1.0, 1.0]).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn rejects_negative_bandwidth() {
        let err = Topology::new(
            vec![1, 1],
            vec![vec![0.0, -1.0], vec![1.0, 0.0]],
            vec![1.0, 1.0],
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn rejects_missing_cpu_path() {
        let err = Topology::new(
            vec![1, 1],
            vec![vec![0.0, 1.0], vec![1.0, 0.0]],
            vec![1.0, 0.0],
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn local_bandwidth_is_infinite() {
        let topo = three_way();
        assert!(topo.bandwidth(1, 1).is_infinite());
        assert_eq!(topo.remote_cost(1, 1), 0.0);
        assert_eq!(topo.bandwidth(1, 0), 30.0);
        assert_eq!(topo.bandwidth(0, 1), 10.0);
    }

    #[test]
    fn missing_link_has_infinite_cost() {
        let topo = Topology::new(
            vec![1, 1],
            vec![vec![0.0, 0.0], vec![5.0, 0.0]],
            vec![1.0, 1.0],
        )
        .unwrap();
        assert!(topo.remote_cost(0, 1).is_infinite());
        assert!(!topo.has_link(0, 1));
        assert!(topo.has_link(1, 0));
    }

    #[test]
    fn symmetrized_averages_directions() {
        let sym = three_way().symmetrized();
        assert_eq!(sym.bandwidth(0, 1), 20.0);
        assert_eq!(sym.bandwidth(1, 0), 20.0);
        assert_eq!(sym.bandwidth(0, 2), 2.0);
    }

    #[test]
    fn uniform_topology_is_uniform() {
        assert!(Topology::uniform(4, 1, 10.0, 1.0).unwrap().is_uniform());
        assert!(!three_way().is_uniform());
    }

    #[test]
    fn dgx1_splits_into_quads() {
        let topo = Topology::dgx1_hybrid_cube_mesh(16).unwrap();
        let cliques = topo.cliques(0.4);
        assert_eq!(cliques, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
    }

    #[test]
    fn zero_threshold_still_requires_a_link() {
        let topo = Topology::dgx1_hybrid_cube_mesh(16).unwrap();
        for clique in topo.cliques(0.0) {
            for &a in &clique {
                for &b in &clique {
                    assert!(topo.has_link(a, b));
                }
            }
        }
    }

    #[test]
    fn truncated_keeps_leading_workers() {
        let topo = Topology::dgx1_hybrid_cube_mesh(16).unwrap().truncated(4).unwrap();
        assert_eq!(topo.num_workers(), 4);
        assert_eq!(topo.bandwidth(0, 3), 48.0);
        assert!(Topology::uniform(2, 1, 1.0, 1.0).unwrap().truncated(3).is_err());
    }

    #[test]
    fn transfer_time_includes_latency() {
        let t = transfer_time_s(1 << 30, 1.0, 0.0);
        assert!((t - 1.0).abs() < 1e-12);
        assert_eq!(transfer_time_s(0, 1.0, 5.0), 0.0);
        assert_eq!(transfer_time_s(64, f64::INFINITY, 5.0), 0.0);
        assert!(transfer_time_s(64, 1.0, 5.0) > 5e-6);
    }

    #[test]
    fn config_builds_explicit_topology() {
        let cfg = TopologyConfig {
            preset: TopologyPreset::Explicit,
            bandwidth: vec![vec![0.0, 3.0], vec![7.0, 0.0]],
            cpu_bandwidth: vec![2.0, 5.0],
            capacity: Some(8),
            ..TopologyConfig::default()
        };
        let topo = cfg.build(2, 100).unwrap();
        assert_eq!(topo.bandwidth(1, 0), 7.0);
        assert_eq!(topo.cpu_bandwidth(1), 5.0);
        assert_eq!(topo.capacity(0), 8);
        assert!(cfg.build(3, 100).is_err());
    }

    #[test]
    fn preset_parses_from_str() {
        assert_eq!("dgx1".parse::<TopologyPreset>(), Ok(TopologyPreset::Dgx1));
        assert!("torus".parse::<TopologyPreset>().is_err());
    }
}
