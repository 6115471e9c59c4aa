use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::error::{CacheError, NodeId, Result};
use crate::topology::WorkerId;

/// Where a worker fetches a node's features from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Location {
    Local,
    Remote(WorkerId),
    Cpu,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local => write!(f, "local"),
            Location::Remote(owner) => write!(f, "remote(gpu{owner})"),
            Location::Cpu => write!(f, "cpu"),
        }
    }
}

/// One row of the cache table.
///
/// `slot_offset` is the slot in the worker's own cache for `Local`, the
/// slot in the owner's cache for `Remote`, and the host-table row (the
/// node ID) for `Cpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementDecision {
    pub node_id: NodeId,
    pub worker: WorkerId,
    pub location: Location,
    pub slot_offset: usize,
}

impl PlacementDecision {
    pub fn local(node_id: NodeId, worker: WorkerId, slot: usize) -> Self {
        Self { node_id, worker, location: Location::Local, slot_offset: slot }
    }

    pub fn remote(node_id: NodeId, worker: WorkerId, owner: WorkerId, slot: usize) -> Self {
        Self { node_id, worker, location: Location::Remote(owner), slot_offset: slot }
    }

    pub fn cpu(node_id: NodeId, worker: WorkerId) -> Self {
        Self { node_id, worker, location: Location::Cpu, slot_offset: node_id as usize }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocationCounts {
    pub local: usize,
    pub remote: usize,
    pub cpu: usize,
}

/// Validated, read-only placement for one generation.
#[derive(Debug, Clone)]
pub struct CacheTable {
    num_nodes: usize,
    num_workers: usize,
    rows: Vec<PlacementDecision>,
    local_nodes: Vec<Vec<NodeId>>,
}

impl CacheTable {
    pub fn from_decisions(
        decisions: Vec<PlacementDecision>,
        num_nodes: usize,
        num_workers: usize,
        capacities: &[usize],
    ) -> Result<Self> {
        if capacities.len() != num_workers {
            return Err(CacheError::config(format!(
                "expected {num_workers} capacities, got {}",
                capacities.len()
            )));
        }

        let mut slots: Vec<Option<PlacementDecision>> = vec![None; num_nodes * num_workers];
        for d in decisions {
            if d.node_id as usize >= num_nodes || d.worker >= num_workers {
                return Err(CacheError::invalid_placement(format!(
                    "decision for node {} worker {} is out of range",
                    d.node_id, d.worker
                )));
            }
            let idx = d.node_id as usize * num_workers + d.worker;
            if slots[idx].replace(d).is_some() {
                return Err(CacheError::invalid_placement(format!(
                    "duplicate decision for node {} worker {}",
                    d.node_id, d.worker
                )));
            }
        }
        let mut rows = Vec::with_capacity(slots.len());
        for (idx, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(d) => rows.push(d),
                None => {
                    return Err(CacheError::invalid_placement(format!(
                        "missing decision for node {} worker {}",
                        idx / num_workers,
                        idx % num_workers
                    )))
                }
            }
        }

        let mut by_slot: Vec<Vec<(usize, NodeId)>> = vec![Vec::new(); num_workers];
        for d in rows.iter().filter(|d| d.location == Location::Local) {
            by_slot[d.worker].push((d.slot_offset, d.node_id));
        }
        let mut local_nodes = Vec::with_capacity(num_workers);
        for (worker, mut entries) in by_slot.into_iter().enumerate() {
            if entries.len() > capacities[worker] {
                return Err(CacheError::invalid_placement(format!(
                    "worker {worker} caches {} nodes but has capacity {}",
                    entries.len(),
                    capacities[worker]
                )));
            }
            entries.sort_unstable();
            if let Some((pos, _)) = entries
                .iter()
                .enumerate()
                .find(|(pos, (slot, _))| pos != slot)
            {
                return Err(CacheError::invalid_placement(format!(
                    "worker {worker} local slots are not dense at slot {pos}"
                )));
            }
            local_nodes.push(entries.into_iter().map(|(_, node)| node).collect());
        }

        let table = Self { num_nodes, num_workers, rows, local_nodes };
        for d in &table.rows {
            match d.location {
                Location::Local => {}
                Location::Cpu => {
                    if d.slot_offset != d.node_id as usize {
                        return Err(CacheError::invalid_placement(format!(
                            "cpu row for node {} points at host row {}",
                            d.node_id, d.slot_offset
                        )));
                    }
                }
                Location::Remote(owner) => {
                    let held = owner < num_workers
                        && owner != d.worker
                        && table.local_nodes[owner].get(d.slot_offset) == Some(&d.node_id);
                    if !held {
                        return Err(CacheError::invalid_placement(format!(
                            "worker {} reads node {} from worker {owner} slot {}, which does not hold it",
                            d.worker, d.node_id, d.slot_offset
                        )));
                    }
                }
            }
        }
        Ok(table)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn lookup(&self, node: NodeId, worker: WorkerId) -> &PlacementDecision {
        &self.rows[node as usize * self.num_workers + worker]
    }

    pub fn rows(&self) -> &[PlacementDecision] {
        &self.rows
    }

    /// Nodes cached by `worker`, indexed by slot.
    pub fn local_nodes(&self, worker: WorkerId) -> &[NodeId] {
        &self.local_nodes[worker]
    }

    pub fn counts(&self, worker: WorkerId) -> LocationCounts {
        let mut counts = LocationCounts::default();
        for d in self.rows.iter().skip(worker).step_by(self.num_workers) {
            match d.location {
                Location::Local => counts.local += 1,
                Location::Remote(_) => counts.remote += 1,
                Location::Cpu => counts.cpu += 1,
            }
        }
        counts
    }
}

struct Slot<T> {
    generation: u64,
    value: Arc<T>,
}

/// Copy-then-publish cell. A new value is built off to the side and
/// swapped in whole; readers hold an `Arc` to whichever value was current
/// when they loaded it.
pub struct TableCell<T> {
    slot: RwLock<Slot<T>>,
}

impl<T> TableCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: RwLock::new(Slot { generation: 0, value: Arc::new(value) }),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.snapshot().1
    }

    pub fn snapshot(&self) -> (u64, Arc<T>) {
        // writers only ever assign a complete slot, so a poisoned lock still
        // holds a consistent value
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        (guard.generation, Arc::clone(&guard.value))
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().0
    }

    /// Returns the new generation number.
    pub fn publish(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let generation = guard.generation.saturating_add(1);
        *guard = Slot { generation, value };
        generation
    }
}

impl<T: fmt::Debug> fmt::Debug for TableCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (generation, value) = self.snapshot();
        f.debug_struct("TableCell")
            .field("generation", &generation)
            .field("value", &value)
            .finish()
    }
}
