//! Placement optimizer.
//!
//! Every policy name the experiment scripts use maps to one of a closed set
//! of strategies; all of them share the [`PlacementStrategy`] contract of
//! one [`PlacementDecision`] per (node, worker), node-major.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use phf::phf_map;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{CacheError, NodeId, Result};
use crate::presc::FrequencyTable;
use crate::table::{CacheTable, Location, PlacementDecision};
use crate::topology::{Topology, WorkerId};

pub mod clique;
pub mod coll;
pub mod partition;
pub mod rep;


pub use clique::CliquePartition;
pub use coll::CollCache;
pub use partition::Partition;
pub use rep::Replicate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    PreSample,
    CollCache,
    CollIntuitive,
    Partition,
    PartRep,
    Rep,
    CollCacheAsymmLink,
    CliquePart,
    CliquePartByDegree,
}

static POLICY_NAMES: phf::Map<&'static str, CachePolicy> = phf_map! {
    "pre_sample" => CachePolicy::PreSample,
    "coll_cache" => CachePolicy::CollCache,
    "coll_intuitive" => CachePolicy::CollIntuitive,
    "partition" => CachePolicy::Partition,
    "part_rep" => CachePolicy::PartRep,
    "rep" => CachePolicy::Rep,
    "coll_cache_asymm_link" => CachePolicy::CollCacheAsymmLink,
    "clique_part" => CachePolicy::CliquePart,
    "clique_part_by_degree" => CachePolicy::CliquePartByDegree,
};

impl CachePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            CachePolicy::PreSample => "pre_sample",
            CachePolicy::CollCache => "coll_cache",
            CachePolicy::CollIntuitive => "coll_intuitive",
            CachePolicy::Partition => "partition",
            CachePolicy::PartRep => "part_rep",
            CachePolicy::Rep => "rep",
            CachePolicy::CollCacheAsymmLink => "coll_cache_asymm_link",
            CachePolicy::CliquePart => "clique_part",
            CachePolicy::CliquePartByDegree => "clique_part_by_degree",
        }
    }

    pub fn needs_degree(&self) -> bool {
        matches!(self, CachePolicy::CliquePartByDegree)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::CollCacheAsymmLink
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        POLICY_NAMES.get(value).copied().ok_or_else(|| {
            let mut names: Vec<_> = POLICY_NAMES.keys().copied().collect();
            names.sort_unstable();
            format!(
                "unsupported cache policy '{}', expected one of: {}",
                value,
                names.join(", ")
            )
        })
    }
}

pub trait PlacementStrategy: Send + Sync {
    fn optimize(
        &self,
        topology: &Topology,
        frequencies: &FrequencyTable,
        capacities: &[usize],
    ) -> Result<Vec<PlacementDecision>>;

    fn name(&self) -> &'static str;
}

/// Knobs shared by strategy construction.
#[derive(Debug, Clone, Default)]
pub struct StrategyOptions {
    pub no_group: bool,
    pub clique_threshold: f64,
    /// Per-node degree, required by `clique_part_by_degree`.
    pub degrees: Option<Arc<[u32]>>,
}

/// The closed set of placement strategies.
#[derive(Debug, Clone)]
pub enum Strategy {
    Rep(Replicate),
    Partition(Partition),
    Clique(CliquePartition),
    Coll(CollCache),
}

impl Strategy {
    pub fn from_policy(policy: CachePolicy, options: &StrategyOptions) -> Result<Self> {
        let strategy = match policy {
            CachePolicy::Rep | CachePolicy::PreSample => Strategy::Rep(Replicate),
            CachePolicy::Partition | CachePolicy::PartRep => Strategy::Partition(Partition),
            CachePolicy::CliquePart => Strategy::Clique(CliquePartition::by_frequency(
                options.clique_threshold,
                options.no_group,
            )),
            CachePolicy::CliquePartByDegree => {
                let degrees = options.degrees.clone().ok_or_else(|| {
                    CacheError::config("clique_part_by_degree needs node degrees")
                })?;
                Strategy::Clique(CliquePartition::by_degree(
                    degrees,
                    options.clique_threshold,
                    options.no_group,
                ))
            }
            CachePolicy::CollCache | CachePolicy::CollIntuitive => {
                Strategy::Coll(CollCache { asymm_link: false })
            }
            CachePolicy::CollCacheAsymmLink => Strategy::Coll(CollCache { asymm_link: true }),
        };
        Ok(strategy)
    }
}

impl PlacementStrategy for Strategy {
    fn optimize(
        &self,
        topology: &Topology,
        frequencies: &FrequencyTable,
        capacities: &[usize],
    ) -> Result<Vec<PlacementDecision>> {
        match self {
            Strategy::Rep(s) => s.optimize(topology, frequencies, capacities),
            Strategy::Partition(s) => s.optimize(topology, frequencies, capacities),
            Strategy::Clique(s) => s.optimize(topology, frequencies, capacities),
            Strategy::Coll(s) => s.optimize(topology, frequencies, capacities),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Strategy::Rep(s) => s.name(),
            Strategy::Partition(s) => s.name(),
            Strategy::Clique(s) => s.name(),
            Strategy::Coll(s) => s.name(),
        }
    }
}

/// Per-worker slot budget for `cache_percent` of `num_nodes`.
pub fn budget_for(cache_percent: f64, num_nodes: usize, topology: &Topology) -> Vec<usize> {
    let share = (cache_percent.clamp(0.0, 1.0) * num_nodes as f64).floor() as usize;
    topology
        .capacities()
        .iter()
        .map(|&cap| share.min(cap))
        .collect()
}

pub(crate) fn check_inputs(
    topology: &Topology,
    frequencies: &FrequencyTable,
    capacities: &[usize],
) -> Result<()> {
    let n = topology.num_workers();
    if capacities.len() != n {
        return Err(CacheError::config(format!(
            "expected {n} capacities, got {}",
            capacities.len()
        )));
    }
    if frequencies.num_workers() != n {
        return Err(CacheError::config(format!(
            "frequency table covers {} workers, topology has {n}",
            frequencies.num_workers()
        )));
    }
    Ok(())
}

/// Nodes sorted by `key` descending, ties by lowest ID.
pub(crate) fn rank_by(num_nodes: usize, key: impl Fn(NodeId) -> u64) -> Vec<NodeId> {
    let mut order: Vec<NodeId> = (0..num_nodes as NodeId).collect();
    order.sort_by(|&a, &b| key(b).cmp(&key(a)).then(a.cmp(&b)));
    order
}

/// Cheapest holder for `reader` whose link beats `limit`; ties go to the
/// lower worker index.
pub(crate) fn cheapest_holder(
    topology: &Topology,
    reader: WorkerId,
    holders: &[WorkerId],
    limit: f64,
) -> Option<WorkerId> {
    let mut best: Option<(f64, WorkerId)> = None;
    for &owner in holders {
        if owner == reader || !topology.has_link(reader, owner) {
            continue;
        }
        let cost = topology.remote_cost(reader, owner);
        if cost >= limit {
            continue;
        }
        match best {
            Some((c, o)) if c < cost || (c == cost && o < owner) => {}
            _ => best = Some((cost, owner)),
        }
    }
    best.map(|(_, owner)| owner)
}

/// Incremental placement state shared by the strategies.
pub(crate) struct PlacementBuilder {
    num_nodes: usize,
    num_workers: usize,
    remaining: Vec<usize>,
    next_slot: Vec<usize>,
    local_slot: Vec<Option<usize>>,
    holders: Vec<SmallVec<[WorkerId; 4]>>,
}

impl PlacementBuilder {
    pub(crate) fn new(topology: &Topology, num_nodes: usize, capacities: &[usize]) -> Self {
        let num_workers = topology.num_workers();
        let remaining = capacities
            .iter()
            .enumerate()
            .map(|(w, &cap)| cap.min(topology.capacity(w)).min(num_nodes))
            .collect();
        Self {
            num_nodes,
            num_workers,
            remaining,
            next_slot: vec![0; num_workers],
            local_slot: vec![None; num_nodes * num_workers],
            holders: vec![SmallVec::new(); num_nodes],
        }
    }

    pub(crate) fn remaining(&self, worker: WorkerId) -> usize {
        self.remaining[worker]
    }

    pub(crate) fn all_full(&self) -> bool {
        self.remaining.iter().all(|&r| r == 0)
    }

    pub(crate) fn is_local(&self, node: NodeId, worker: WorkerId) -> bool {
        self.local_slot[node as usize * self.num_workers + worker].is_some()
    }

    /// Returns false when the worker is full or already holds the node.
    pub(crate) fn place(&mut self, node: NodeId, worker: WorkerId) -> bool {
        if self.remaining[worker] == 0 || self.is_local(node, worker) {
            return false;
        }
        let slot = self.next_slot[worker];
        self.next_slot[worker] += 1;
        self.remaining[worker] -= 1;
        self.local_slot[node as usize * self.num_workers + worker] = Some(slot);
        let holders = &mut self.holders[node as usize];
        let pos = holders.partition_point(|&w| w < worker);
        holders.insert(pos, worker);
        true
    }

    /// Emit node-major decisions. `source` picks the owner a non-holding
    /// reader fetches from, or `None` for the CPU path.
    pub(crate) fn finish(
        self,
        mut source: impl FnMut(NodeId, WorkerId, &[WorkerId]) -> Option<WorkerId>,
    ) -> Vec<PlacementDecision> {
        let mut decisions = Vec::with_capacity(self.num_nodes * self.num_workers);
        for node in 0..self.num_nodes as NodeId {
            let holders = &self.holders[node as usize];
            for worker in 0..self.num_workers {
                let idx = node as usize * self.num_workers + worker;
                let decision = match self.local_slot[idx] {
                    Some(slot) => PlacementDecision::local(node, worker, slot),
                    None if holders.is_empty() => PlacementDecision::cpu(node, worker),
                    None => match source(node, worker, holders) {
                        Some(owner) => {
                            let slot = self.local_slot[node as usize * self.num_workers + owner]
                                .expect("source must name a holder");
                            PlacementDecision::remote(node, worker, owner, slot)
                        }
                        None => PlacementDecision::cpu(node, worker),
                    },
                };
                decisions.push(decision);
            }
        }
        decisions
    }
}

/// Expected source mix of a placement, weighted by prescan frequency.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlacementSummary {
    pub policy: String,
    pub local_slots: Vec<usize>,
    pub optimal_local_rate: f64,
    pub optimal_remote_rate: f64,
    pub optimal_cpu_rate: f64,
}

impl PlacementSummary {
    pub fn new(policy: &str, table: &CacheTable, frequencies: &FrequencyTable) -> Self {
        let mut weights = [0u64; 3];
        let mut rows = [0u64; 3];
        for d in table.rows() {
            let class = match d.location {
                Location::Local => 0,
                Location::Remote(_) => 1,
                Location::Cpu => 2,
            };
            weights[class] += frequencies.count(d.node_id, d.worker) as u64;
            rows[class] += 1;
        }
        // without any frequency signal fall back to counting rows
        let basis = if weights.iter().sum::<u64>() > 0 { weights } else { rows };
        let total = basis.iter().sum::<u64>().max(1) as f64;
        Self {
            policy: policy.to_string(),
            local_slots: (0..table.num_workers())
                .map(|w| table.local_nodes(w).len())
                .collect(),
            optimal_local_rate: basis[0] as f64 / total,
            optimal_remote_rate: basis[1] as f64 / total,
            optimal_cpu_rate: basis[2] as f64 / total,
        }
    }
}
