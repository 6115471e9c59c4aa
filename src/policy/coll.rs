//! Collaborative placement.
//!
//! Placing node `v` at worker `w` gains `Σ_j f_j(v) · (cost_j(v) − c(j←w))`
//! over every reader `j` whose current cheapest source (CPU, or the best
//! existing copy) is slower than reading from `w`; for `j == w` the new cost
//! is zero, so the placing worker's own frequency is its local value. The
//! first copy of a node therefore goes to the worker minimizing the
//! frequency-weighted fetch cost of everyone else, which is where link
//! asymmetry enters. Gains only shrink as copies accumulate, so a lazy
//! max-heap yields the exact greedy order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::debug;

use crate::error::{NodeId, Result};
use crate::presc::FrequencyTable;
use crate::table::PlacementDecision;
use crate::topology::{Topology, WorkerId};

use super::{check_inputs, cheapest_holder, rank_by, PlacementBuilder, PlacementStrategy};

#[derive(Debug, Clone, Copy)]
pub struct CollCache {
    /// Use the real link matrix; otherwise both directions are averaged.
    pub asymm_link: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    gain: f64,
    rank_pos: usize,
    node: NodeId,
    worker: WorkerId,
    version: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // max-heap: larger gain first, then hotter rank, then lower worker
    fn cmp(&self, other: &Self) -> Ordering {
        self.gain
            .total_cmp(&other.gain)
            .then_with(|| other.rank_pos.cmp(&self.rank_pos))
            .then_with(|| other.worker.cmp(&self.worker))
    }
}

struct CostState<'a> {
    topology: &'a Topology,
    frequencies: &'a FrequencyTable,
    num_workers: usize,
    /// Current cheapest fetch cost per (node, reader).
    cost: Vec<f64>,
}

impl<'a> CostState<'a> {
    fn new(topology: &'a Topology, frequencies: &'a FrequencyTable) -> Self {
        let num_workers = topology.num_workers();
        let cpu: Vec<f64> = (0..num_workers).map(|w| topology.cpu_cost(w)).collect();
        let cost = (0..frequencies.num_nodes())
            .flat_map(|_| cpu.iter().copied())
            .collect();
        Self { topology, frequencies, num_workers, cost }
    }

    fn gain(&self, node: NodeId, owner: WorkerId) -> f64 {
        let base = node as usize * self.num_workers;
        (0..self.num_workers)
            .map(|reader| {
                let current = self.cost[base + reader];
                let via_owner = self.topology.remote_cost(reader, owner);
                if via_owner < current {
                    self.frequencies.count(node, reader) as f64 * (current - via_owner)
                } else {
                    0.0
                }
            })
            .sum()
    }

    fn apply(&mut self, node: NodeId, owner: WorkerId) {
        let base = node as usize * self.num_workers;
        for reader in 0..self.num_workers {
            let via_owner = self.topology.remote_cost(reader, owner);
            let slot = &mut self.cost[base + reader];
            if via_owner < *slot {
                *slot = via_owner;
            }
        }
    }
}

impl CollCache {
    /// Greedy placement scored on `links`; readers are then resolved on the
    /// real `topology`, so a remote read never crosses a missing link.
    fn place(
        &self,
        links: &Topology,
        topology: &Topology,
        frequencies: &FrequencyTable,
        capacities: &[usize],
    ) -> Vec<PlacementDecision> {
        let num_nodes = frequencies.num_nodes();
        let num_workers = topology.num_workers();
        let rank = rank_by(num_nodes, |v| frequencies.total(v));
        let mut builder = PlacementBuilder::new(topology, num_nodes, capacities);
        let mut state = CostState::new(links, frequencies);
        let mut version = vec![0u32; num_nodes];

        let mut heap = BinaryHeap::new();
        if !builder.all_full() {
            heap.reserve(num_nodes * num_workers);
            for (rank_pos, &node) in rank.iter().enumerate() {
                for worker in (0..num_workers).filter(|&w| builder.remaining(w) > 0) {
                    heap.push(Candidate {
                        gain: state.gain(node, worker),
                        rank_pos,
                        node,
                        worker,
                        version: 0,
                    });
                }
            }
        }

        let mut placed = 0usize;
        while let Some(cand) = heap.pop() {
            if builder.remaining(cand.worker) == 0 || builder.is_local(cand.node, cand.worker) {
                continue;
            }
            let current = version[cand.node as usize];
            if cand.version != current {
                heap.push(Candidate {
                    gain: state.gain(cand.node, cand.worker),
                    version: current,
                    ..cand
                });
                continue;
            }
            builder.place(cand.node, cand.worker);
            state.apply(cand.node, cand.worker);
            version[cand.node as usize] = current.wrapping_add(1);
            placed += 1;
            if builder.all_full() {
                break;
            }
        }
        debug!("{}: placed {} replicas", self.name(), placed);

        builder.finish(|_, reader, holders| {
            cheapest_holder(topology, reader, holders, topology.cpu_cost(reader))
        })
    }
}

impl PlacementStrategy for CollCache {
    fn optimize(
        &self,
        topology: &Topology,
        frequencies: &FrequencyTable,
        capacities: &[usize],
    ) -> Result<Vec<PlacementDecision>> {
        check_inputs(topology, frequencies, capacities)?;
        if self.asymm_link {
            Ok(self.place(topology, topology, frequencies, capacities))
        } else {
            let symmetric = topology.symmetrized();
            Ok(self.place(&symmetric, topology, frequencies, capacities))
        }
    }

    fn name(&self) -> &'static str {
        if self.asymm_link {
            "coll_cache_asymm_link"
        } else {
            "coll_cache"
        }
    }
}
