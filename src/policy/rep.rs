use crate::error::Result;
use crate::presc::FrequencyTable;
use crate::table::PlacementDecision;
use crate::topology::Topology;

use super::{check_inputs, rank_by, PlacementBuilder, PlacementStrategy};

/// Every worker caches the globally hottest nodes that fit; no peer reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replicate;

impl PlacementStrategy for Replicate {
    fn optimize(
        &self,
        topology: &Topology,
        frequencies: &FrequencyTable,
        capacities: &[usize],
    ) -> Result<Vec<PlacementDecision>> {
        check_inputs(topology, frequencies, capacities)?;
        let rank = rank_by(frequencies.num_nodes(), |v| frequencies.total(v));
        let mut builder = PlacementBuilder::new(topology, frequencies.num_nodes(), capacities);
        for worker in 0..topology.num_workers() {
            let take = builder.remaining(worker);
            for &node in rank.iter().take(take) {
                builder.place(node, worker);
            }
        }
        Ok(builder.finish(|_, _, _| None))
    }

    fn name(&self) -> &'static str {
        "rep"
    }
}
