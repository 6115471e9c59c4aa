use std::sync::Arc;

use log::debug;
use smallvec::SmallVec;

use crate::error::{CacheError, Result};
use crate::presc::FrequencyTable;
use crate::table::PlacementDecision;
use crate::topology::{Topology, WorkerId};

use super::{check_inputs, cheapest_holder, rank_by, PlacementBuilder, PlacementStrategy};

/// Partition within cliques of fast-linked workers, replicate across
/// cliques. Readers prefer an owner in their own clique and fall back to
/// the fastest owner elsewhere.
#[derive(Debug, Clone)]
pub struct CliquePartition {
    degrees: Option<Arc<[u32]>>,
    threshold: f64,
    no_group: bool,
}

impl CliquePartition {
    pub fn by_frequency(threshold: f64, no_group: bool) -> Self {
        Self { degrees: None, threshold, no_group }
    }

    pub fn by_degree(degrees: Arc<[u32]>, threshold: f64, no_group: bool) -> Self {
        Self { degrees: Some(degrees), threshold, no_group }
    }

    fn groups(&self, topology: &Topology) -> Vec<Vec<WorkerId>> {
        if self.no_group {
            vec![(0..topology.num_workers()).collect()]
        } else {
            topology.cliques(self.threshold)
        }
    }
}

impl PlacementStrategy for CliquePartition {
    fn optimize(
        &self,
        topology: &Topology,
        frequencies: &FrequencyTable,
        capacities: &[usize],
    ) -> Result<Vec<PlacementDecision>> {
        check_inputs(topology, frequencies, capacities)?;
        let num_nodes = frequencies.num_nodes();
        let rank = match &self.degrees {
            Some(degrees) => {
                if degrees.len() != num_nodes {
                    return Err(CacheError::config(format!(
                        "{} degrees for {} nodes",
                        degrees.len(),
                        num_nodes
                    )));
                }
                rank_by(num_nodes, |v| degrees[v as usize] as u64)
            }
            None => rank_by(num_nodes, |v| frequencies.total(v)),
        };

        let groups = self.groups(topology);
        debug!("{}: cliques {:?}", self.name(), groups);
        let mut clique_of = vec![0; topology.num_workers()];
        for (idx, group) in groups.iter().enumerate() {
            for &w in group {
                clique_of[w] = idx;
            }
        }

        let mut builder = PlacementBuilder::new(topology, num_nodes, capacities);
        for group in &groups {
            let mut cursor = 0;
            for &node in &rank {
                if group.iter().all(|&w| builder.remaining(w) == 0) {
                    break;
                }
                let owner = (0..group.len())
                    .map(|step| group[(cursor + step) % group.len()])
                    .find(|&w| builder.remaining(w) > 0);
                if let Some(owner) = owner {
                    builder.place(node, owner);
                    let pos = group.iter().position(|&w| w == owner).unwrap_or(0);
                    cursor = (pos + 1) % group.len();
                }
            }
        }

        Ok(builder.finish(|_, reader, holders| {
            let own: SmallVec<[WorkerId; 4]> = holders
                .iter()
                .copied()
                .filter(|&h| clique_of[h] == clique_of[reader])
                .collect();
            cheapest_holder(topology, reader, &own, f64::INFINITY)
                .or_else(|| cheapest_holder(topology, reader, holders, f64::INFINITY))
        }))
    }

    fn name(&self) -> &'static str {
        if self.degrees.is_some() {
            "clique_part_by_degree"
        } else {
            "clique_part"
        }
    }
}
