use crate::error::Result;
use crate::presc::FrequencyTable;
use crate::table::PlacementDecision;
use crate::topology::Topology;

use super::{check_inputs, cheapest_holder, rank_by, PlacementBuilder, PlacementStrategy};

/// Hot nodes dealt round-robin to workers with room left, one copy each.
/// Other workers read the single copy over any existing peer link.
#[derive(Debug, Clone, Copy, Default)]
pub struct Partition;

impl PlacementStrategy for Partition {
    fn optimize(
        &self,
        topology: &Topology,
        frequencies: &FrequencyTable,
        capacities: &[usize],
    ) -> Result<Vec<PlacementDecision>> {
        check_inputs(topology, frequencies, capacities)?;
        let num_workers = topology.num_workers();
        let rank = rank_by(frequencies.num_nodes(), |v| frequencies.total(v));
        let mut builder = PlacementBuilder::new(topology, frequencies.num_nodes(), capacities);

        let mut cursor = 0;
        for &node in &rank {
            if builder.all_full() {
                break;
            }
            let owner = (0..num_workers)
                .map(|step| (cursor + step) % num_workers)
                .find(|&w| builder.remaining(w) > 0);
            if let Some(owner) = owner {
                builder.place(node, owner);
                cursor = (owner + 1) % num_workers;
            }
        }

        Ok(builder.finish(|_, reader, holders| {
            cheapest_holder(topology, reader, holders, f64::INFINITY)
        }))
    }

    fn name(&self) -> &'static str {
        "partition"
    }
}
